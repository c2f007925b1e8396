use crate::engine::frame::{PartialSet, SourceMeta, MAX_PARTIALS};
use crate::engine::morph::{morph_scale, Matcher};
use crate::engine::plan::{InputRef, LinearConfig, ModContext, OpSnapshot};

use super::source::WaveSelector;
use super::{node_frame, node_meta, retrigger_node, Module};

// Morph output runs on a 1 ms frame grid
const MORPH_STEP_MS: f32 = 1.0;
const MORPH_MIX_FREQ: f32 = 48_000.0;

/// Crossfades two inputs with partial matching.
///
/// Inputs are read on a common time axis: each one is shifted by the
/// difference between its own zero padding and the longest padding of the
/// pair, so attack transients line up.
pub struct LinearModule {
    matcher: Matcher,
    left_buf: PartialSet,
    right_buf: PartialSet,
    left_wave: WaveSelector,
    right_wave: WaveSelector,
    pad_ms: f32,
    left_shift_ms: f32,
    right_shift_ms: f32,
}

fn input_meta(input: &InputRef, wave: &WaveSelector, lower: &[Module], ops: &[OpSnapshot]) -> Option<SourceMeta> {
    match input {
        InputRef::None => None,
        InputRef::Op(i) => node_meta(lower, ops, *i),
        InputRef::Instrument(inst) => wave.source(Some(inst)).map(|s| s.meta),
    }
}

fn input_frame(
    input: &InputRef,
    wave: &WaveSelector,
    lower: &mut [Module],
    ops: &[OpSnapshot],
    time_ms: f32,
    out: &mut PartialSet,
    ctx: &ModContext,
) -> bool {
    let Some(meta) = input_meta(input, wave, lower, ops) else {
        return false;
    };
    if time_ms < 0.0 || meta.frame_step_ms <= 0.0 {
        return false;
    }
    let index = meta.loop_frame_index((time_ms / meta.frame_step_ms).round() as usize);
    match input {
        InputRef::None => false,
        InputRef::Op(i) => node_frame(lower, ops, *i, index, out, ctx),
        InputRef::Instrument(inst) => match wave.source(Some(inst)).and_then(|s| s.frame(index)) {
            Some(frame) => {
                out.assign_bounded(frame);
                true
            }
            None => false,
        },
    }
}

impl LinearModule {
    pub fn new() -> Self {
        Self {
            matcher: Matcher::new(),
            left_buf: PartialSet::with_capacity(MAX_PARTIALS),
            right_buf: PartialSet::with_capacity(MAX_PARTIALS),
            left_wave: WaveSelector::default(),
            right_wave: WaveSelector::default(),
            pad_ms: 0.0,
            left_shift_ms: 0.0,
            right_shift_ms: 0.0,
        }
    }

    pub fn configure(&mut self, cfg: &LinearConfig) {
        for (input, wave) in [(&cfg.left, &mut self.left_wave), (&cfg.right, &mut self.right_wave)] {
            match input {
                InputRef::Instrument(inst) => wave.sync(Some(inst)),
                _ => wave.sync(None),
            }
        }
    }

    pub fn reset(&mut self) {
        self.left_wave.reset();
        self.right_wave.reset();
        self.pad_ms = 0.0;
    }

    pub fn retrigger(&mut self, cfg: &LinearConfig, lower: &mut [Module], ops: &[OpSnapshot], channel: u8, freq: f32, velocity: u8) {
        for (input, wave) in [(&cfg.left, &mut self.left_wave), (&cfg.right, &mut self.right_wave)] {
            match input {
                InputRef::None => wave.reset(),
                InputRef::Op(i) => retrigger_node(lower, ops, *i, channel, freq, velocity),
                InputRef::Instrument(inst) => wave.retrigger(Some(inst), channel, freq, velocity),
            }
        }
        let left_pad = input_meta(&cfg.left, &self.left_wave, lower, ops).map_or(0.0, |m| m.zero_pad_ms());
        let right_pad = input_meta(&cfg.right, &self.right_wave, lower, ops).map_or(0.0, |m| m.zero_pad_ms());
        self.pad_ms = left_pad.max(right_pad);
        self.left_shift_ms = self.pad_ms - left_pad;
        self.right_shift_ms = self.pad_ms - right_pad;
    }

    pub fn meta(&self) -> Option<SourceMeta> {
        Some(SourceMeta {
            fundamental_freq: 440.0,
            mix_freq: MORPH_MIX_FREQ,
            frame_step_ms: MORPH_STEP_MS,
            zero_values_at_start: (self.pad_ms * MORPH_MIX_FREQ / 1000.0).round() as usize,
            ..SourceMeta::default()
        })
    }

    pub fn frame_at(
        &mut self,
        cfg: &LinearConfig,
        lower: &mut [Module],
        ops: &[OpSnapshot],
        index: usize,
        out: &mut PartialSet,
        ctx: &ModContext,
    ) -> bool {
        let t = ((cfg.morphing.value(ctx) + 1.0) * 0.5).clamp(0.0, 1.0);
        let time_ms = index as f32 * MORPH_STEP_MS;
        let have_left = input_frame(&cfg.left, &self.left_wave, lower, ops, time_ms - self.left_shift_ms, &mut self.left_buf, ctx);
        let have_right = input_frame(&cfg.right, &self.right_wave, lower, ops, time_ms - self.right_shift_ms, &mut self.right_buf, ctx);
        match (have_left, have_right) {
            (true, true) => self.matcher.morph(&self.left_buf, &self.right_buf, t, cfg.mode, out),
            (true, false) => morph_scale(out, &self.left_buf, 1.0 - t, cfg.mode),
            (false, true) => morph_scale(out, &self.right_buf, t, cfg.mode),
            (false, false) => return false,
        }
        true
    }
}

impl Default for LinearModule {
    fn default() -> Self {
        Self::new()
    }
}
