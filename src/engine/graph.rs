//! One voice's instance of the operator graph.

use super::decoder::FrameSource;
use super::frame::{PartialSet, SourceMeta};
use super::modules::{GraphSource, Module};
use super::params::hash_path;
use super::plan::{ModContext, OpConfig, PlanSnapshot, N_CONTROL_INPUTS};

struct Silence;

impl FrameSource for Silence {
  fn retrigger(&mut self, _channel: u8, _freq: f32, _velocity: u8) {}
  fn meta(&self) -> Option<SourceMeta> { None }
  fn frame_at(&mut self, _index: usize, _out: &mut PartialSet) -> bool { false }
}

/// Modules in the plan's operator order. Every call takes the snapshot the
/// graph was built from; a snapshot of another generation is ignored.
pub struct VoiceGraph {
  generation: u64,
  modules: Vec<Module>,
  values: Vec<f32>,
  active: bool,
}

impl VoiceGraph {
  pub fn build(plan: &PlanSnapshot, mix_freq: f32, seed: u64) -> Self {
    let modules = plan.ops.iter().map(|op| Module::new(&op.config, mix_freq, seed ^ hash_path(&op.id))).collect();
    Self { generation: plan.generation, modules, values: vec![0.0; plan.ops.len()], active: false }
  }

  pub fn generation(&self) -> u64 { self.generation }

  fn fits(&self, plan: &PlanSnapshot) -> bool {
    plan.generation == self.generation && plan.ops.len() == self.modules.len()
  }

  /// Cheap update: same topology, new parameter values.
  pub fn configure(&mut self, plan: &PlanSnapshot) {
    if !self.fits(plan) { return; }
    for (m, op) in self.modules.iter_mut().zip(&plan.ops) {
      m.configure(&op.config);
    }
  }

  // control-rate operators publish one value per block
  fn update_controls(&mut self, plan: &PlanSnapshot) {
    for (i, (m, op)) in self.modules.iter_mut().zip(&plan.ops).enumerate() {
      match (m, &op.config) {
        (Module::Lfo(lfo), OpConfig::Lfo(c)) => self.values[i] = lfo.value(c),
        (Module::Envelope(env), OpConfig::Envelope(c)) => self.values[i] = env.value(c),
        _ => {}
      }
    }
  }

  fn advance_controls(&mut self, plan: &PlanSnapshot, samples: usize) {
    for (m, op) in self.modules.iter_mut().zip(&plan.ops) {
      match (m, &op.config) {
        (Module::Lfo(lfo), OpConfig::Lfo(c)) => lfo.advance(c, samples),
        (Module::Envelope(env), OpConfig::Envelope(c)) => env.advance(c, samples),
        _ => {}
      }
    }
  }

  pub fn retrigger(&mut self, plan: &PlanSnapshot, control: &[f32; N_CONTROL_INPUTS], channel: u8, freq: f32, velocity: u8) {
    self.active = false;
    if !self.fits(plan) || plan.has_cycle { return; }
    let Some(out) = plan.output else { return; };

    for (m, op) in self.modules.iter_mut().zip(&plan.ops) {
      match (m, &op.config) {
        (Module::Lfo(lfo), OpConfig::Lfo(c)) => lfo.note_on(c),
        (Module::Envelope(env), OpConfig::Envelope(_)) => env.note_on(),
        _ => {}
      }
    }
    self.update_controls(plan);

    let ctx = ModContext { control, values: &self.values };
    let (lower, rest) = self.modules.split_at_mut(out);
    if let (Module::Output(m), OpConfig::Output(c)) = (&mut rest[0], &plan.ops[out].config) {
      match c.source {
        Some(node) => {
          let mut src = GraphSource { modules: lower, ops: &plan.ops[..out], node, ctx: &ctx };
          m.retrigger(c, &mut src, channel, freq, velocity, &ctx);
        }
        None => m.retrigger(c, &mut Silence, channel, freq, velocity, &ctx),
      }
      self.active = true;
    }
  }

  /// Legato note change without restarting the graph.
  pub fn glide_to(&mut self, plan: &PlanSnapshot, freq: f32) {
    if let Some(Module::Output(m)) = plan.output.and_then(|i| self.modules.get_mut(i)) {
      m.glide_to(freq);
    }
  }

  pub fn release(&mut self) {
    for m in self.modules.iter_mut() { m.release(); }
  }

  pub fn kill(&mut self) {
    for m in self.modules.iter_mut() { m.kill(); }
    self.active = false;
  }

  pub fn is_done(&self) -> bool {
    if !self.active { return true; }
    self.modules.iter().all(|m| match m {
      Module::Output(o) => o.is_done(),
      _ => true,
    })
  }

  /// Render one block. A cyclic plan, or one from another generation,
  /// renders silence.
  pub fn process(&mut self, plan: &PlanSnapshot, control: &[f32; N_CONTROL_INPUTS], freq_in: Option<&[f32]>, out: &mut [f32]) {
    if !self.active || !self.fits(plan) || plan.has_cycle {
      out.fill(0.0);
      return;
    }
    let Some(node) = plan.output else {
      out.fill(0.0);
      return;
    };

    self.update_controls(plan);
    {
      let ctx = ModContext { control, values: &self.values };
      let (lower, rest) = self.modules.split_at_mut(node);
      match (&mut rest[0], &plan.ops[node].config) {
        (Module::Output(m), OpConfig::Output(c)) => match c.source {
          Some(src_node) => {
            let mut src = GraphSource { modules: lower, ops: &plan.ops[..node], node: src_node, ctx: &ctx };
            m.process(c, &mut src, freq_in, out, &ctx);
          }
          None => m.process(c, &mut Silence, freq_in, out, &ctx),
        },
        _ => out.fill(0.0),
      }
    }
    self.advance_controls(plan, out.len());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::frame::{Instrument, InstrumentRepo, Source};
  use crate::engine::plan::{OpKind, PlanDesc};

  fn repo() -> InstrumentRepo {
    let mut f = PartialSet::new();
    f.push(1.0, 0.5, 0.0);
    let mut r = InstrumentRepo::new();
    r.insert(Instrument::single("tone", Source::new(SourceMeta::default(), vec![f; 2000])));
    r
  }

  fn simple_plan() -> PlanDesc {
    let mut d = PlanDesc::new();
    d.add_op("src", OpKind::Source).add_op("out", OpKind::Output);
    d.params.set_str("src/instrument", "tone");
    d.params.set_str("out/source", "op:src");
    d.params.set_bool("out/noise", false);
    d
  }

  #[test]
  fn test_renders_source_through_output() {
    let plan = PlanSnapshot::build(&simple_plan(), &repo()).unwrap();
    let mut g = VoiceGraph::build(&plan, 48_000.0, 7);
    g.retrigger(&plan, &[0.0; N_CONTROL_INPUTS], 0, 440.0, 127);
    let mut out = vec![0.0; 1024];
    g.process(&plan, &[0.0; N_CONTROL_INPUTS], None, &mut out);
    assert!(out[512..].iter().any(|v| v.abs() > 0.1));
    assert!(!g.is_done());
  }

  #[test]
  fn test_envelope_drives_position_and_releases() {
    let mut d = PlanDesc::new();
    d.add_op("env", OpKind::Envelope).add_op("src", OpKind::Source).add_op("out", OpKind::Output);
    d.params.set_str("src/instrument", "tone");
    d.params.set_str("out/source", "op:src");
    d.params.set_bool("out/noise", false);
    d.params.set_str("src/play_mode", "custom_position");
    d.params.set_str("src/position/control", "op:env");
    d.params.set_f32("env/time", 100.0);
    let plan = PlanSnapshot::build(&d, &repo()).unwrap();
    let env = plan.op_index("env").unwrap();
    let mut g = VoiceGraph::build(&plan, 48_000.0, 7);
    g.retrigger(&plan, &[0.0; N_CONTROL_INPUTS], 0, 440.0, 127);
    assert_eq!(g.values[env], -1.0);

    let mut out = vec![0.0; 480];
    for _ in 0..10 {
      g.process(&plan, &[0.0; N_CONTROL_INPUTS], None, &mut out);
    }
    // 100 ms in: held at the sustain point, 0.7 on the curve
    assert!((g.values[env] - 0.4).abs() < 1e-3, "sustain value {}", g.values[env]);

    g.release();
    for _ in 0..30 {
      g.process(&plan, &[0.0; N_CONTROL_INPUTS], None, &mut out);
    }
    assert_eq!(g.values[env], -1.0);
  }

  #[test]
  fn test_cyclic_plan_is_silent() {
    let mut d = PlanDesc::new();
    d.add_op("m1", OpKind::Linear).add_op("m2", OpKind::Linear).add_op("out", OpKind::Output);
    d.params.set_str("m1/left", "op:m2");
    d.params.set_str("m1/right", "instrument:tone");
    d.params.set_str("m2/left", "op:m1");
    d.params.set_str("out/source", "op:m1");
    let plan = PlanSnapshot::build(&d, &repo()).unwrap();
    assert!(plan.has_cycle);
    let mut g = VoiceGraph::build(&plan, 48_000.0, 7);
    g.retrigger(&plan, &[0.0; N_CONTROL_INPUTS], 0, 440.0, 127);
    let mut out = vec![1.0; 512];
    g.process(&plan, &[0.0; N_CONTROL_INPUTS], None, &mut out);
    assert!(out.iter().all(|&v| v == 0.0));
    assert!(g.is_done());
  }

  #[test]
  fn test_other_generation_is_ignored() {
    let plan = PlanSnapshot::build(&simple_plan(), &repo()).unwrap();
    let mut g = VoiceGraph::build(&plan, 48_000.0, 7);
    let mut newer = PlanSnapshot::build(&simple_plan(), &repo()).unwrap();
    newer.generation = plan.generation + 1;
    g.retrigger(&newer, &[0.0; N_CONTROL_INPUTS], 0, 440.0, 127);
    let mut out = vec![1.0; 256];
    g.process(&newer, &[0.0; N_CONTROL_INPUTS], None, &mut out);
    assert!(out.iter().all(|&v| v == 0.0));
  }
}
