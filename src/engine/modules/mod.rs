pub mod envelope;
pub mod lfo;
pub mod linear;
pub mod output;
pub mod source;

// Operator modules are a closed set; dispatch is a match, not a vtable.
use crate::engine::decoder::FrameSource;
use crate::engine::frame::{PartialSet, SourceMeta};
use crate::engine::plan::{ModContext, OpConfig, OpSnapshot};

use envelope::EnvelopeModule;
use lfo::LfoModule;
use linear::LinearModule;
use output::OutputModule;
use source::SourceModule;

pub enum Module {
    Source(SourceModule),
    Linear(LinearModule),
    Lfo(LfoModule),
    Envelope(EnvelopeModule),
    Output(OutputModule),
}

impl Module {
    pub fn new(config: &OpConfig, mix_freq: f32, seed: u64) -> Self {
        let mut module = match config {
            OpConfig::Source(_) => Module::Source(SourceModule::new()),
            OpConfig::Linear(_) => Module::Linear(LinearModule::new()),
            OpConfig::Lfo(_) => Module::Lfo(LfoModule::new(mix_freq)),
            OpConfig::Envelope(_) => Module::Envelope(EnvelopeModule::new(mix_freq)),
            OpConfig::Output(_) => Module::Output(OutputModule::new(mix_freq, seed)),
        };
        module.configure(config);
        module
    }

    /// Apply new parameter values. Never allocates.
    pub fn configure(&mut self, config: &OpConfig) {
        match (self, config) {
            (Module::Source(m), OpConfig::Source(c)) => m.configure(c),
            (Module::Linear(m), OpConfig::Linear(c)) => m.configure(c),
            (Module::Lfo(_), OpConfig::Lfo(_)) | (Module::Envelope(_), OpConfig::Envelope(_)) => {}
            (Module::Output(m), OpConfig::Output(c)) => m.configure(c),
            _ => {}
        }
    }

    pub fn release(&mut self) {
        match self {
            Module::Output(m) => m.release(),
            Module::Envelope(m) => m.release(),
            _ => {}
        }
    }

    pub fn kill(&mut self) {
        match self {
            Module::Source(m) => m.reset(),
            Module::Linear(m) => m.reset(),
            Module::Lfo(_) | Module::Envelope(_) => {}
            Module::Output(m) => m.kill(),
        }
    }
}

// Graph traversal. `modules[node]` may only read `modules[..node]`, which
// the topological order guarantees, so the slice is split instead of
// borrowing the whole graph twice.

pub(crate) fn retrigger_node(modules: &mut [Module], ops: &[OpSnapshot], node: usize, channel: u8, freq: f32, velocity: u8) {
    if node >= modules.len() || node >= ops.len() {
        return;
    }
    let (lower, rest) = modules.split_at_mut(node);
    match (&mut rest[0], &ops[node].config) {
        (Module::Source(m), OpConfig::Source(c)) => m.retrigger(c, channel, freq, velocity),
        (Module::Linear(m), OpConfig::Linear(c)) => m.retrigger(c, lower, &ops[..node], channel, freq, velocity),
        _ => {}
    }
}

pub(crate) fn node_meta(modules: &[Module], ops: &[OpSnapshot], node: usize) -> Option<SourceMeta> {
    match (modules.get(node)?, &ops.get(node)?.config) {
        (Module::Source(m), OpConfig::Source(c)) => m.meta(c),
        (Module::Linear(m), OpConfig::Linear(_)) => m.meta(),
        _ => None,
    }
}

pub(crate) fn node_frame(
    modules: &mut [Module],
    ops: &[OpSnapshot],
    node: usize,
    index: usize,
    out: &mut PartialSet,
    ctx: &ModContext,
) -> bool {
    if node >= modules.len() || node >= ops.len() {
        return false;
    }
    let (lower, rest) = modules.split_at_mut(node);
    match (&mut rest[0], &ops[node].config) {
        (Module::Source(m), OpConfig::Source(c)) => m.frame_at(c, index, out, ctx),
        (Module::Linear(m), OpConfig::Linear(c)) => m.frame_at(c, lower, &ops[..node], index, out, ctx),
        _ => false,
    }
}

/// A node of a voice graph seen as a frame source.
pub struct GraphSource<'a, 'c> {
    pub modules: &'a mut [Module],
    pub ops: &'a [OpSnapshot],
    pub node: usize,
    pub ctx: &'a ModContext<'c>,
}

impl FrameSource for GraphSource<'_, '_> {
    fn retrigger(&mut self, channel: u8, freq: f32, velocity: u8) {
        retrigger_node(self.modules, self.ops, self.node, channel, freq, velocity);
    }

    fn meta(&self) -> Option<SourceMeta> {
        node_meta(self.modules, self.ops, self.node)
    }

    fn frame_at(&mut self, index: usize, out: &mut PartialSet) -> bool {
        node_frame(self.modules, self.ops, self.node, index, out, self.ctx)
    }
}
