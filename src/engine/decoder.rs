//! Phase-vocoder resynthesis of frame streams.

use std::f64::consts::TAU;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use super::dsp::cents_to_ratio;
use super::dsp::noise::NoiseDecoder;
use super::dsp::sines::{add_windowed_sine, fill_hann, wrap_phase};
use super::frame::{db_to_factor, Instrument, PartialSet, Source, SourceMeta, MAX_PARTIALS, NOISE_BANDS};
use super::morph::within_tolerance;

pub const MAX_UNISON_VOICES: usize = 7;
/// Longest analysis step the decoder reserves buffers for.
pub const MAX_FRAME_STEP_MS: f32 = 20.0;

// anti-alias ramp: starts at 18 kHz for 44.1 kHz output, reaches -60 dB just
// below Nyquist, nothing at or above it
const ANTI_ALIAS_START: f32 = 18_000.0 / 44_100.0;
const ANTI_ALIAS_DB: f32 = -60.0;
const MIN_FRAME_STEP: usize = 8;

#[inline]
fn noise_seed(seed: u64) -> u64 { seed ^ 0x9e37_79b9_7f4a_7c15 }

/// Where a decoder takes its frames from.
///
/// `frame_at` returning false means the source has no data for that index,
/// either not yet or not any more; the decoder treats it as silence.
pub trait FrameSource {
  fn retrigger(&mut self, channel: u8, freq: f32, velocity: u8);
  fn meta(&self) -> Option<SourceMeta>;
  fn frame_at(&mut self, index: usize, out: &mut PartialSet) -> bool;
}

/// Plays one instrument directly, picking the best wave per note.
pub struct SourcePlayer {
  instrument: Arc<Instrument>,
  wave: Option<usize>,
}

impl SourcePlayer {
  pub fn new(instrument: Arc<Instrument>) -> Self { Self { instrument, wave: None } }
  pub fn from_source(source: Source) -> Self { Self::new(Arc::new(Instrument::single("source", source))) }
  fn source(&self) -> Option<&Source> { self.wave.and_then(|w| self.instrument.wave(w)) }
}

impl FrameSource for SourcePlayer {
  fn retrigger(&mut self, channel: u8, freq: f32, velocity: u8) {
    self.wave = self.instrument.select(channel, freq, velocity);
  }
  fn meta(&self) -> Option<SourceMeta> { self.source().map(|s| s.meta) }
  fn frame_at(&mut self, index: usize, out: &mut PartialSet) -> bool {
    match self.source().and_then(|s| s.frame(index)) {
      Some(f) => { out.assign_bounded(f); true }
      None => false,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneState {
  Active,
  /// Source ran dry, buffered output still draining.
  AlmostDone,
  Done,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecoderConfig {
  pub sines: bool,
  pub noise: bool,
  pub start_skip: bool,
  pub loop_enabled: bool,
  pub unison_voices: usize,
  pub unison_detune: f32,
  pub vibrato: bool,
  pub vibrato_depth: f32,
  pub vibrato_frequency: f32,
  pub vibrato_attack_ms: f32,
  pub portamento: bool,
  pub glide_ms: f32,
  /// Start reading the source this many ms in.
  pub skip_ms: f32,
}

impl Default for DecoderConfig {
  fn default() -> Self {
    Self {
      sines: true,
      noise: true,
      start_skip: true,
      loop_enabled: true,
      unison_voices: 1,
      unison_detune: 6.0,
      vibrato: false,
      vibrato_depth: 10.0,
      vibrato_frequency: 4.0,
      vibrato_attack_ms: 0.0,
      portamento: false,
      glide_ms: 200.0,
      skip_ms: 0.0,
    }
  }
}

/// Attenuation of a partial at `freq` for output rate `mix_freq`.
#[inline]
pub fn anti_alias_gain(freq: f32, mix_freq: f32) -> f32 {
  let norm = freq / mix_freq;
  if !(0.0..0.5).contains(&norm) {
    0.0
  } else if norm > ANTI_ALIAS_START {
    db_to_factor((norm - ANTI_ALIAS_START) / (0.5 - ANTI_ALIAS_START) * ANTI_ALIAS_DB)
  } else {
    1.0
  }
}

pub struct LiveDecoder {
  mix_freq: f32,
  cfg: DecoderConfig,
  seed: u64,
  rng: Pcg32,

  meta: Option<SourceMeta>,
  step: usize,
  frame_size: usize,
  window: Vec<f32>,
  sine_buf: Vec<f32>,
  read_pos: usize,
  frame_idx: usize,
  frame_offset: usize,
  env_pos: usize,
  skip_samples: usize,
  pad_samples: usize,
  attack_start: f32,
  attack_end: f32,

  frame: PartialSet,
  prev: PartialSet,
  cur: PartialSet,
  prev_unison: Vec<f32>,
  cur_unison: Vec<f32>,
  /// Voices per partial in `prev_unison`.
  prev_voices: usize,
  unison_ratio: [f32; MAX_UNISON_VOICES],
  unison_gain: f32,

  noise: NoiseDecoder,
  noise_env: [f32; NOISE_BANDS],

  note_freq: f32,
  porta_log: f32,
  vibrato_phase: f64,
  vibrato_env: f32,

  done: DoneState,
  empty_steps: usize,
}

impl LiveDecoder {
  pub fn new(mix_freq: f32, seed: u64) -> Self {
    let max_step = (MAX_FRAME_STEP_MS * mix_freq / 1000.0).ceil() as usize;
    let mut dec = Self {
      mix_freq,
      cfg: DecoderConfig::default(),
      seed,
      rng: Pcg32::seed_from_u64(seed),
      meta: None,
      step: MIN_FRAME_STEP,
      frame_size: 2 * MIN_FRAME_STEP,
      window: Vec::with_capacity(2 * max_step),
      sine_buf: Vec::with_capacity(2 * max_step),
      read_pos: 0,
      frame_idx: 0,
      frame_offset: 0,
      env_pos: 0,
      skip_samples: 0,
      pad_samples: 0,
      attack_start: 0.0,
      attack_end: 0.0,
      frame: PartialSet::with_capacity(MAX_PARTIALS),
      prev: PartialSet::with_capacity(MAX_PARTIALS),
      cur: PartialSet::with_capacity(MAX_PARTIALS),
      prev_unison: Vec::with_capacity(MAX_PARTIALS * MAX_UNISON_VOICES),
      cur_unison: Vec::with_capacity(MAX_PARTIALS * MAX_UNISON_VOICES),
      prev_voices: 1,
      unison_ratio: [1.0; MAX_UNISON_VOICES],
      unison_gain: 1.0,
      noise: NoiseDecoder::new(mix_freq, noise_seed(seed)),
      noise_env: [0.0; NOISE_BANDS],
      note_freq: 0.0,
      porta_log: 0.0,
      vibrato_phase: 0.0,
      vibrato_env: 0.0,
      done: DoneState::Done,
      empty_steps: 0,
    };
    dec.set_config(DecoderConfig::default());
    dec
  }

  pub fn mix_freq(&self) -> f32 { self.mix_freq }
  pub fn config(&self) -> &DecoderConfig { &self.cfg }

  pub fn set_config(&mut self, cfg: DecoderConfig) {
    let voices = cfg.unison_voices.clamp(1, MAX_UNISON_VOICES);
    self.cfg = DecoderConfig { unison_voices: voices, ..cfg };
    self.unison_ratio = [1.0; MAX_UNISON_VOICES];
    if voices > 1 {
      let half = (voices - 1) as f32;
      for v in 0..voices {
        // spread symmetrically, outer voices at +/- detune
        let offset = (2.0 * v as f32 - half) / half;
        self.unison_ratio[v] = cents_to_ratio(offset * cfg.unison_detune);
      }
    }
    self.unison_gain = 1.0 / (voices as f32).sqrt();
  }

  pub fn retrigger(&mut self, source: &mut dyn FrameSource, channel: u8, freq: f32, velocity: u8) {
    source.retrigger(channel, freq, velocity);
    self.meta = source.meta();
    self.rng = Pcg32::seed_from_u64(self.seed);
    self.noise.reset(noise_seed(self.seed));
    self.noise_env = [0.0; NOISE_BANDS];
    self.frame_idx = 0;
    self.env_pos = 0;
    self.prev.clear();
    self.prev_unison.clear();
    self.note_freq = freq;
    self.porta_log = 0.0;
    self.vibrato_phase = 0.0;
    self.vibrato_env = 0.0;
    self.empty_steps = 0;

    let meta = match self.meta {
      Some(m) if m.frame_step_ms > 0.0 && m.mix_freq > 0.0 => m,
      _ => {
        self.meta = None;
        self.done = DoneState::Done;
        return;
      }
    };
    let max_step = self.window.capacity() / 2;
    self.step = ((meta.frame_step_ms * self.mix_freq / 1000.0).round() as usize).clamp(MIN_FRAME_STEP, max_step.max(MIN_FRAME_STEP));
    self.frame_size = 2 * self.step;
    fill_hann(&mut self.window, self.frame_size);
    self.sine_buf.clear();
    self.sine_buf.resize(self.frame_size, 0.0);
    self.read_pos = self.step;

    self.pad_samples = (meta.zero_values_at_start as f32 * self.mix_freq / meta.mix_freq).round() as usize;
    self.skip_samples = if self.cfg.start_skip { self.pad_samples } else { 0 };
    self.frame_offset = (self.cfg.skip_ms.max(0.0) / meta.frame_step_ms).round() as usize;
    self.attack_start = meta.attack_start_ms;
    self.attack_end = meta.attack_end_ms;
    self.noise.set_analysis_rate(meta.mix_freq);
    self.done = DoneState::Active;
  }

  /// Legato pitch change: glide from the sounding pitch to `freq` when
  /// portamento is enabled, jump otherwise.
  pub fn glide_to(&mut self, freq: f32) {
    if self.cfg.portamento && self.note_freq > 0.0 && freq > 0.0 {
      self.porta_log = (self.note_freq / freq).log2() + self.porta_log;
    } else {
      self.porta_log = 0.0;
    }
    self.note_freq = freq;
  }

  pub fn note_freq(&self) -> f32 { self.note_freq }
  pub fn done_state(&self) -> DoneState { self.done }
  pub fn is_done(&self) -> bool { self.done == DoneState::Done }

  pub fn reset(&mut self) {
    self.meta = None;
    self.done = DoneState::Done;
    self.prev.clear();
    self.prev_unison.clear();
    self.sine_buf.fill(0.0);
    self.noise.reset(noise_seed(self.seed));
  }

  /// Render `out.len()` samples. `freq_in` is an optional per-sample
  /// playback frequency; without it the retriggered note frequency is used.
  pub fn process(&mut self, source: &mut dyn FrameSource, freq_in: Option<&[f32]>, out: &mut [f32]) {
    out.fill(0.0);
    if self.meta.is_none() || self.done == DoneState::Done { return; }

    let mut o = 0;
    while o < out.len() {
      if self.read_pos >= self.step {
        let base = freq_in.and_then(|f| f.get(o).copied()).unwrap_or(self.note_freq);
        let want = base * self.pitch_ratio();
        self.synth_step(source, want);
        if self.done == DoneState::Done { return; }
      }
      let avail = self.step - self.read_pos;

      if self.env_pos < self.skip_samples {
        let n = avail.min(self.skip_samples - self.env_pos);
        if self.cfg.noise { self.noise.skip(&self.noise_env, n); }
        self.advance(n);
        continue;
      }

      let n = avail.min(out.len() - o);
      let dst = &mut out[o..o + n];
      if self.cfg.sines { dst.copy_from_slice(&self.sine_buf[self.read_pos..self.read_pos + n]); }
      if self.cfg.noise { self.noise.process(&self.noise_env, dst); }
      self.apply_attack(dst);
      self.advance(n);
      o += n;
    }
  }

  fn advance(&mut self, n: usize) {
    self.read_pos += n;
    self.env_pos += n;
    let secs = n as f32 / self.mix_freq;
    if self.cfg.vibrato {
      self.vibrato_phase = (self.vibrato_phase + TAU * (self.cfg.vibrato_frequency * secs) as f64) % TAU;
      self.vibrato_env = if self.cfg.vibrato_attack_ms > 0.0 {
        (self.vibrato_env + secs * 1000.0 / self.cfg.vibrato_attack_ms).min(1.0)
      } else {
        1.0
      };
    }
    if self.porta_log != 0.0 {
      let glide = self.cfg.glide_ms.max(1.0) * 0.001;
      self.porta_log *= (-secs / glide).exp();
      if self.porta_log.abs() < 1e-5 { self.porta_log = 0.0; }
    }
  }

  fn pitch_ratio(&self) -> f32 {
    let mut ratio = 2f32.powf(self.porta_log);
    if self.cfg.vibrato {
      ratio *= cents_to_ratio(self.cfg.vibrato_depth * self.vibrato_phase.sin() as f32 * self.vibrato_env);
    }
    ratio
  }

  // attack times are on the padded time axis, so `t` counts the zero pad
  fn apply_attack(&self, dst: &mut [f32]) {
    if self.attack_end <= 0.0 && self.attack_start <= 0.0 && self.env_pos >= self.pad_samples { return; }
    let ms_per_sample = 1000.0 / self.mix_freq;
    let skip_ms = self.cfg.skip_ms.max(0.0);
    for (i, v) in dst.iter_mut().enumerate() {
      let pos = self.env_pos + i;
      let t = pos as f32 * ms_per_sample + skip_ms;
      let gain = if pos < self.pad_samples || t < self.attack_start {
        0.0
      } else if t < self.attack_end {
        (t - self.attack_start) / (self.attack_end - self.attack_start)
      } else {
        1.0
      };
      *v *= gain;
    }
  }

  fn synth_step(&mut self, source: &mut dyn FrameSource, want_freq: f32) {
    let Some(meta) = self.meta else { return; };
    let (step, size) = (self.step, self.frame_size);
    self.sine_buf.copy_within(step..size, 0);
    self.sine_buf[size - step..].fill(0.0);
    self.read_pos = 0;

    let raw = self.frame_idx + self.frame_offset;
    let index = if self.cfg.loop_enabled { meta.loop_frame_index(raw) } else { raw };
    self.frame_idx += 1;

    if !source.frame_at(index, &mut self.frame) {
      self.empty_steps += 1;
      self.noise_env = [0.0; NOISE_BANDS];
      self.prev.clear();
      self.prev_unison.clear();
      let drain = size + self.noise.block_len();
      self.done = if self.empty_steps * step >= drain { DoneState::Done } else { DoneState::AlmostDone };
      return;
    }
    self.empty_steps = 0;
    self.done = DoneState::Active;
    for (k, e) in self.noise_env.iter_mut().enumerate() {
      *e = self.frame.noise.get(k).copied().unwrap_or(0.0);
    }
    if self.cfg.sines {
      self.render_sines(want_freq);
    }
  }

  fn render_sines(&mut self, want_freq: f32) {
    let voices = self.cfg.unison_voices;
    let r = self.mix_freq;
    let advance = TAU * self.step as f64 / r as f64;
    self.cur.clear();
    self.cur_unison.clear();

    for i in 0..self.frame.len() {
      let freq = self.frame.freqs[i] * want_freq;
      let mag = self.frame.mags[i];
      if mag <= 0.0 || freq <= 0.0 { continue; }
      let matched = closest_partial(&self.prev.freqs, freq);
      let phase = match matched {
        Some(j) => wrap_phase(self.prev.phases[j] as f64 + advance * self.prev.freqs[j] as f64),
        None => self.frame.phases.get(i).copied().unwrap_or(0.0),
      };
      if !self.cur.push_bounded(freq, mag, phase) { break; }

      if voices == 1 {
        let m = mag * anti_alias_gain(freq, r);
        if m > 0.0 { add_windowed_sine(&mut self.sine_buf, &self.window, freq, r, phase, m); }
        continue;
      }
      for v in 0..voices {
        let ratio = self.unison_ratio[v];
        let vphase = match matched.and_then(|j| self.prev_unison_phase(j, v, voices).map(|p| (j, p))) {
          Some((j, p)) => wrap_phase(p as f64 + advance * (self.prev.freqs[j] * ratio) as f64),
          None => self.rng.gen::<f32>() * std::f32::consts::TAU,
        };
        self.cur_unison.push(vphase);
        let vfreq = freq * ratio;
        let m = mag * self.unison_gain * anti_alias_gain(vfreq, r);
        if m > 0.0 { add_windowed_sine(&mut self.sine_buf, &self.window, vfreq, r, vphase, m); }
      }
    }
    std::mem::swap(&mut self.prev, &mut self.cur);
    std::mem::swap(&mut self.prev_unison, &mut self.cur_unison);
    self.prev_voices = voices;
  }

  // None when the previous frame was rendered with a different voice count
  fn prev_unison_phase(&self, j: usize, v: usize, voices: usize) -> Option<f32> {
    if self.prev_voices != voices { return None; }
    self.prev_unison.get(j * voices + v).copied()
  }
}

// Closest frequency within tolerance, frames need not be sorted; lower index
// on ties.
fn closest_partial(freqs: &[f32], freq: f32) -> Option<usize> {
  let mut best: Option<(usize, f32)> = None;
  for (j, &f) in freqs.iter().enumerate() {
    if !within_tolerance(f, freq) { continue; }
    let d = (f - freq).abs();
    if best.map_or(true, |(_, bd)| d < bd) { best = Some((j, d)); }
  }
  best.map(|(j, _)| j)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_anti_alias_gain_regions() {
    let r = 48_000.0;
    assert_eq!(anti_alias_gain(0.4 * r, r), 1.0);
    assert_eq!(anti_alias_gain(0.5 * r, r), 0.0);
    assert_eq!(anti_alias_gain(0.5 * r + 1.0, r), 0.0);
    let edge = anti_alias_gain(0.4999 * r, r);
    assert!(edge > 0.9 * db_to_factor(-60.0) && edge < 1.1 * db_to_factor(-60.0), "edge gain {}", edge);
    assert!(anti_alias_gain(0.45 * r, r) < 1.0);
  }

  #[test]
  fn test_closest_partial_respects_tolerance() {
    let freqs = [100.0, 200.0, 300.0];
    assert_eq!(closest_partial(&freqs, 204.0), Some(1));
    assert_eq!(closest_partial(&freqs, 250.0), None);
    assert_eq!(closest_partial(&freqs, 99.0), Some(0));
    assert_eq!(closest_partial(&[], 99.0), None);
  }

  #[test]
  fn test_closest_partial_scans_unsorted_frames() {
    assert_eq!(closest_partial(&[1000.0, 500.0], 500.0), Some(1));
    assert_eq!(closest_partial(&[300.0, 100.0, 204.0, 200.0], 202.0), Some(2));
    assert_eq!(closest_partial(&[300.0, 100.0], 200.0), None);
  }

  #[test]
  fn test_unison_phases_need_matching_voice_count() {
    let mut dec = LiveDecoder::new(48_000.0, 1);
    dec.prev_unison.extend([0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    dec.prev_voices = 3;
    assert_eq!(dec.prev_unison_phase(1, 2, 3), Some(0.6));
    assert_eq!(dec.prev_unison_phase(2, 0, 3), None);
    // same buffer read with a stride of 2 would land on the wrong voices
    assert_eq!(dec.prev_unison_phase(1, 0, 2), None);
  }

  #[test]
  fn test_reset_reseeds_noise_like_a_fresh_decoder() {
    let env = [0.1; NOISE_BANDS];
    let mut fresh = LiveDecoder::new(48_000.0, 7);
    let mut reused = LiveDecoder::new(48_000.0, 7);
    let mut scratch = vec![0.0; 3000];
    reused.noise.process(&env, &mut scratch);
    reused.reset();

    let mut a = vec![0.0; 4096];
    let mut b = vec![0.0; 4096];
    fresh.noise.process(&env, &mut a);
    reused.noise.process(&env, &mut b);
    assert!(a.iter().any(|&v| v != 0.0));
    assert_eq!(a, b);
  }

  #[test]
  fn test_unison_ratios_symmetric() {
    let mut dec = LiveDecoder::new(48_000.0, 1);
    dec.set_config(DecoderConfig { unison_voices: 3, unison_detune: 10.0, ..DecoderConfig::default() });
    assert!((dec.unison_ratio[0] - cents_to_ratio(-10.0)).abs() < 1e-6);
    assert_eq!(dec.unison_ratio[1], 1.0);
    assert!((dec.unison_ratio[2] - cents_to_ratio(10.0)).abs() < 1e-6);
    assert!((dec.unison_gain - 1.0 / 3f32.sqrt()).abs() < 1e-6);
  }
}
