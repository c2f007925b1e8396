//! Spectral frame and source model.
//!
//! A [`Source`] is a time-ordered list of [`PartialSet`] frames produced by an
//! external analysis stage. Partial frequencies are stored relative to the
//! source's fundamental (1.0 == fundamental) and magnitudes as linear
//! amplitude; [`db_to_factor`] and [`factor_to_db`] convert to and from the
//! dB scale used for interpolation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Number of noise bands carried by every frame.
pub const NOISE_BANDS: usize = 32;
/// Capacity of every real-time scratch frame. Longer frames are truncated.
pub const MAX_PARTIALS: usize = 1024;
/// Magnitude floor for dB interpolation.
pub const MIN_DB: f32 = -96.0;

#[inline]
pub fn db_to_factor(db: f32) -> f32 { 10f32.powf(db / 20.0) }

#[inline]
pub fn factor_to_db(factor: f32) -> f32 {
  if factor > 0.0 { (20.0 * factor.log10()).max(MIN_DB) } else { MIN_DB }
}

/// One analysis frame: parallel partial arrays plus the noise envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialSet {
  pub freqs: Vec<f32>,
  pub mags: Vec<f32>,
  pub phases: Vec<f32>,
  #[serde(default)]
  pub noise: Vec<f32>,
}

impl PartialSet {
  pub fn new() -> Self { Self::default() }

  pub fn with_capacity(partials: usize) -> Self {
    Self {
      freqs: Vec::with_capacity(partials),
      mags: Vec::with_capacity(partials),
      phases: Vec::with_capacity(partials),
      noise: Vec::with_capacity(NOISE_BANDS),
    }
  }

  pub fn len(&self) -> usize { self.freqs.len() }
  pub fn is_empty(&self) -> bool { self.freqs.is_empty() }
  pub fn capacity(&self) -> usize { self.freqs.capacity().min(self.mags.capacity()).min(self.phases.capacity()) }

  pub fn clear(&mut self) {
    self.freqs.clear();
    self.mags.clear();
    self.phases.clear();
    self.noise.clear();
  }

  pub fn push(&mut self, freq: f32, mag: f32, phase: f32) {
    self.freqs.push(freq);
    self.mags.push(mag);
    self.phases.push(phase);
  }

  /// Push without growing; returns false once the frame is full.
  #[inline]
  pub fn push_bounded(&mut self, freq: f32, mag: f32, phase: f32) -> bool {
    if self.len() >= self.capacity() { return false; }
    self.push(freq, mag, phase);
    true
  }

  /// Copy `other` into `self` within the current capacity.
  pub fn assign_bounded(&mut self, other: &PartialSet) {
    self.clear();
    let n = other.len().min(self.capacity());
    self.freqs.extend_from_slice(&other.freqs[..n]);
    self.mags.extend_from_slice(&other.mags[..n]);
    self.phases.extend_from_slice(&other.phases[..n.min(other.phases.len())]);
    self.phases.resize(n, 0.0);
    let nb = other.noise.len().min(self.noise.capacity());
    self.noise.extend_from_slice(&other.noise[..nb]);
  }

  /// Insertion sort of the parallel arrays by ascending frequency. Frames
  /// arrive nearly sorted, and this never allocates.
  pub fn sort_by_freq(&mut self) {
    for i in 1..self.freqs.len() {
      let (f, m, p) = (self.freqs[i], self.mags[i], self.phases[i]);
      let mut j = i;
      while j > 0 && self.freqs[j - 1] > f {
        self.freqs[j] = self.freqs[j - 1];
        self.mags[j] = self.mags[j - 1];
        self.phases[j] = self.phases[j - 1];
        j -= 1;
      }
      self.freqs[j] = f;
      self.mags[j] = m;
      self.phases[j] = p;
    }
  }

  pub fn is_sorted_by_freq(&self) -> bool { self.freqs.windows(2).all(|w| w[0] <= w[1]) }

  /// Sum of squared partial magnitudes.
  pub fn energy(&self) -> f32 { self.mags.iter().map(|m| m * m).sum() }

  pub fn noise_energy(&self) -> f32 { self.noise.iter().map(|n| n * n).sum() }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
  #[default]
  None,
  Sustain,
  FrameForward,
  FramePingPong,
}

/// Per-source metadata needed for playback.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMeta {
  pub fundamental_freq: f32,
  /// Sample rate the source was analyzed at.
  pub mix_freq: f32,
  pub frame_step_ms: f32,
  /// Analysis zero padding in samples at `mix_freq`.
  pub zero_values_at_start: usize,
  pub attack_start_ms: f32,
  pub attack_end_ms: f32,
  pub loop_type: LoopType,
  pub loop_start: usize,
  pub loop_end: usize,
}

impl Default for SourceMeta {
  fn default() -> Self {
    Self {
      fundamental_freq: 440.0,
      mix_freq: 48_000.0,
      frame_step_ms: 1.0,
      zero_values_at_start: 0,
      attack_start_ms: 0.0,
      attack_end_ms: 0.0,
      loop_type: LoopType::None,
      loop_start: 0,
      loop_end: 0,
    }
  }
}

impl SourceMeta {
  pub fn zero_pad_ms(&self) -> f32 {
    if self.mix_freq > 0.0 { self.zero_values_at_start as f32 * 1000.0 / self.mix_freq } else { 0.0 }
  }

  /// Map a running frame index onto the loop region.
  ///
  /// Forward loops cover `[loop_start, loop_end)`, so frame `loop_end + n`
  /// plays frame `loop_start + n % len`. Ping-pong bounces between
  /// `loop_start` and `loop_end` inclusive. Sustain holds `loop_start`.
  pub fn loop_frame_index(&self, index: usize) -> usize {
    let (start, end) = (self.loop_start, self.loop_end);
    match self.loop_type {
      LoopType::None => index,
      LoopType::Sustain => index.min(start),
      LoopType::FrameForward => {
        if index < start { return index; }
        if end <= start { return start; }
        start + (index - start) % (end - start)
      }
      LoopType::FramePingPong => {
        if index < start { return index; }
        if end <= start { return start; }
        let len = end - start;
        let p = (index - start) % (2 * len);
        if p < len { start + p } else { end - (p - len) }
      }
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
  pub meta: SourceMeta,
  pub frames: Vec<PartialSet>,
}

impl Source {
  pub fn new(meta: SourceMeta, frames: Vec<PartialSet>) -> Self { Self { meta, frames } }
  pub fn len(&self) -> usize { self.frames.len() }
  pub fn is_empty(&self) -> bool { self.frames.is_empty() }
  pub fn frame(&self, index: usize) -> Option<&PartialSet> { self.frames.get(index) }
}

/// One source of an instrument, tagged with where it applies.
#[derive(Clone, Debug)]
pub struct InstrumentWave {
  /// `None` plays on every channel.
  pub channel: Option<u8>,
  pub min_velocity: u8,
  pub max_velocity: u8,
  pub source: Arc<Source>,
}

#[derive(Clone, Debug, Default)]
pub struct Instrument {
  pub name: String,
  pub waves: Vec<InstrumentWave>,
}

impl Instrument {
  pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), waves: Vec::new() } }

  pub fn single(name: impl Into<String>, source: Source) -> Self {
    let mut inst = Self::new(name);
    inst.add_wave(None, 0, 127, source);
    inst
  }

  pub fn add_wave(&mut self, channel: Option<u8>, min_velocity: u8, max_velocity: u8, source: Source) {
    self.waves.push(InstrumentWave { channel, min_velocity, max_velocity, source: Arc::new(source) });
  }

  /// Pick the wave whose fundamental is closest to `freq` (in semitones)
  /// among those accepting `channel` and `velocity`. Ties go to the lower index.
  pub fn select(&self, channel: u8, freq: f32, velocity: u8) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, w) in self.waves.iter().enumerate() {
      if w.channel.is_some_and(|c| c != channel) { continue; }
      if velocity < w.min_velocity || velocity > w.max_velocity { continue; }
      let fund = w.source.meta.fundamental_freq;
      if fund <= 0.0 || freq <= 0.0 { continue; }
      let dist = (12.0 * (freq / fund).log2()).abs();
      if best.map_or(true, |(_, d)| dist < d) { best = Some((i, dist)); }
    }
    best.map(|(i, _)| i)
  }

  pub fn wave(&self, index: usize) -> Option<&Source> { self.waves.get(index).map(|w| w.source.as_ref()) }
}

/// Named instruments, shared with every plan that references them.
#[derive(Clone, Debug, Default)]
pub struct InstrumentRepo {
  instruments: HashMap<String, Arc<Instrument>>,
}

impl InstrumentRepo {
  pub fn new() -> Self { Self::default() }
  pub fn insert(&mut self, instrument: Instrument) -> Arc<Instrument> {
    let inst = Arc::new(instrument);
    self.instruments.insert(inst.name.clone(), inst.clone());
    inst
  }
  pub fn get(&self, name: &str) -> Option<Arc<Instrument>> { self.instruments.get(name).cloned() }
  pub fn names(&self) -> impl Iterator<Item = &str> { self.instruments.keys().map(|k| k.as_str()) }
}
