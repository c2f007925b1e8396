//! Resonant filters for the output stage.
//!
//! The ladder runs 2x oversampled through linear-phase halfband FIRs, so it
//! delays the signal by a fixed number of samples; [`Filter::latency`]
//! reports it. The state-variable filter runs at the base rate.

use std::f32::consts::PI;

const HALFBAND_TAPS: usize = 23;
const HALFBAND_CENTER: usize = HALFBAND_TAPS / 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterType {
  #[default]
  Ladder,
  Svf,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LadderMode {
  Lp1,
  Lp2,
  Lp3,
  #[default]
  Lp4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SvfMode {
  #[default]
  Lp,
  Bp,
  Hp,
}

fn halfband_kernel() -> [f32; HALFBAND_TAPS] {
  let mut h = [0.0f32; HALFBAND_TAPS];
  let n = (HALFBAND_TAPS - 1) as f32;
  for (i, tap) in h.iter_mut().enumerate() {
    let j = i as isize - HALFBAND_CENTER as isize;
    let sinc = if j == 0 { 0.5 } else { (PI * j as f32 * 0.5).sin() / (PI * j as f32) };
    let x = i as f32 / n;
    let blackman = 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
    *tap = sinc * blackman;
  }
  let sum: f32 = h.iter().sum();
  for tap in h.iter_mut() { *tap /= sum; }
  h
}

// FIR over a circular history, newest sample at `pos`
#[derive(Clone)]
struct Fir {
  hist: [f32; HALFBAND_TAPS],
  pos: usize,
}

impl Fir {
  fn new() -> Self { Self { hist: [0.0; HALFBAND_TAPS], pos: 0 } }
  fn reset(&mut self) { self.hist = [0.0; HALFBAND_TAPS]; self.pos = 0; }
  #[inline]
  fn push(&mut self, x: f32) {
    self.pos = (self.pos + 1) % HALFBAND_TAPS;
    self.hist[self.pos] = x;
  }
  #[inline]
  fn eval(&self, h: &[f32; HALFBAND_TAPS]) -> f32 {
    let mut acc = 0.0;
    let mut idx = self.pos;
    for tap in h.iter() {
      acc += tap * self.hist[idx];
      idx = if idx == 0 { HALFBAND_TAPS - 1 } else { idx - 1 };
    }
    acc
  }
}

/// Four cascaded zero-delay one-pole stages with saturated feedback.
#[derive(Clone)]
struct Ladder {
  s: [f32; 4],
  y4: f32,
  g: f32,
  k: f32,
}

impl Ladder {
  fn new() -> Self { Self { s: [0.0; 4], y4: 0.0, g: 0.1, k: 0.0 } }
  fn reset(&mut self) { self.s = [0.0; 4]; self.y4 = 0.0; }
  fn set_params(&mut self, cutoff: f32, resonance: f32, sr: f32) {
    let g = (PI * (cutoff / sr)).tan();
    self.g = g / (1.0 + g);
    self.k = 4.0 * resonance.clamp(0.0, 1.0);
  }
  #[inline]
  fn process(&mut self, x: f32, mode: LadderMode) -> f32 {
    let mut u = (x - self.k * self.y4).tanh();
    let mut taps = [0.0f32; 4];
    for (i, s) in self.s.iter_mut().enumerate() {
      let v = (u - *s) * self.g;
      let y = v + *s;
      *s = y + v;
      taps[i] = y;
      u = y;
    }
    self.y4 = taps[3];
    let out = match mode {
      LadderMode::Lp1 => taps[0],
      LadderMode::Lp2 => taps[1],
      LadderMode::Lp3 => taps[2],
      LadderMode::Lp4 => taps[3],
    };
    out * (1.0 + self.k)
  }
}

#[derive(Clone)]
struct Svf {
  ic1eq: f32,
  ic2eq: f32,
  g: f32,
  k: f32,
}

impl Svf {
  fn new() -> Self { Self { ic1eq: 0.0, ic2eq: 0.0, g: 0.1, k: 0.5 } }
  fn reset(&mut self) { self.ic1eq = 0.0; self.ic2eq = 0.0; }
  fn set_params(&mut self, cutoff: f32, resonance: f32, sr: f32) {
    self.g = (PI * (cutoff / sr)).tan();
    // k = 1/q, floored so full resonance rings without blowing up
    self.k = 2.0 - 1.98 * resonance.clamp(0.0, 1.0);
  }
  #[inline]
  fn process(&mut self, x: f32) -> (f32, f32, f32) {
    let g = self.g; let k = self.k;
    let v0 = x;
    let v1 = (self.ic1eq + g * (v0 - self.ic2eq)) / (1.0 + g * (g + k));
    let v2 = self.ic2eq + g * v1;
    self.ic1eq = 2.0 * v1 - self.ic1eq;
    self.ic2eq = 2.0 * v2 - self.ic2eq;
    let lp = v2;
    let bp = v1;
    let hp = v0 - k * bp - lp;
    (lp, bp, hp)
  }
}

pub struct Filter {
  sr: f32,
  ty: FilterType,
  ladder_mode: LadderMode,
  svf_mode: SvfMode,
  drive: f32,
  ladder: Ladder,
  svf: Svf,
  kernel: [f32; HALFBAND_TAPS],
  up: Fir,
  down: Fir,
}

impl Filter {
  pub fn new(sr: f32) -> Self {
    Self {
      sr,
      ty: FilterType::Ladder,
      ladder_mode: LadderMode::Lp4,
      svf_mode: SvfMode::Lp,
      drive: 1.0,
      ladder: Ladder::new(),
      svf: Svf::new(),
      kernel: halfband_kernel(),
      up: Fir::new(),
      down: Fir::new(),
    }
  }

  pub fn set_type(&mut self, ty: FilterType, ladder_mode: LadderMode, svf_mode: SvfMode) {
    if ty != self.ty { self.reset(); }
    self.ty = ty;
    self.ladder_mode = ladder_mode;
    self.svf_mode = svf_mode;
  }

  /// Cutoff in Hz, resonance in [0, 1], drive in dB.
  pub fn set_params(&mut self, cutoff: f32, resonance: f32, drive_db: f32) {
    let cutoff = cutoff.clamp(20.0, 0.45 * self.sr);
    self.drive = 10f32.powf(drive_db / 20.0);
    match self.ty {
      FilterType::Ladder => self.ladder.set_params(cutoff, resonance, 2.0 * self.sr),
      FilterType::Svf => self.svf.set_params(cutoff, resonance, self.sr),
    }
  }

  pub fn reset(&mut self) {
    self.ladder.reset();
    self.svf.reset();
    self.up.reset();
    self.down.reset();
  }

  /// Delay in samples introduced by the current filter type.
  pub fn latency(&self) -> usize {
    match self.ty {
      FilterType::Ladder => HALFBAND_CENTER,
      FilterType::Svf => 0,
    }
  }

  #[inline]
  pub fn process_sample(&mut self, x: f32) -> f32 {
    let x = x * self.drive;
    match self.ty {
      FilterType::Svf => {
        let (lp, bp, hp) = self.svf.process(x);
        let y = match self.svf_mode { SvfMode::Lp => lp, SvfMode::Bp => bp, SvfMode::Hp => hp };
        y.tanh()
      }
      FilterType::Ladder => {
        // zero-stuffed 2x upsampling, both output phases through the ladder
        self.up.push(2.0 * x);
        let a = self.ladder.process(self.up.eval(&self.kernel), self.ladder_mode);
        self.down.push(a);
        let out = self.down.eval(&self.kernel);
        self.up.push(0.0);
        let b = self.ladder.process(self.up.eval(&self.kernel), self.ladder_mode);
        self.down.push(b);
        out
      }
    }
  }

  pub fn process(&mut self, buf: &mut [f32]) {
    for v in buf.iter_mut() { *v = self.process_sample(*v); }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sine_rms(filter: &mut Filter, freq: f32, sr: f32) -> f32 {
    let n = (sr * 0.2) as usize;
    let mut acc = 0.0;
    for i in 0..n {
      let y = filter.process_sample(0.1 * (2.0 * PI * freq * i as f32 / sr).sin());
      if i >= n / 2 { acc += y * y; }
    }
    (acc / (n / 2) as f32).sqrt()
  }

  #[test]
  fn test_halfband_latency_is_exact() {
    let mut f = Filter::new(48_000.0);
    f.set_type(FilterType::Ladder, LadderMode::Lp4, SvfMode::Lp);
    f.set_params(20_000.0, 0.0, 0.0);
    let mut peak = (0, 0.0f32);
    for i in 0..64 {
      let y = f.process_sample(if i == 0 { 0.5 } else { 0.0 });
      if y.abs() > peak.1 { peak = (i, y.abs()); }
    }
    assert!((peak.0 as isize - f.latency() as isize).abs() <= 2, "peak at {}, latency {}", peak.0, f.latency());
  }

  #[test]
  fn test_lowpass_attenuates_above_cutoff() {
    for ty in [FilterType::Ladder, FilterType::Svf] {
      let mut f = Filter::new(48_000.0);
      f.set_type(ty, LadderMode::Lp4, SvfMode::Lp);
      f.set_params(500.0, 0.0, 0.0);
      let low = sine_rms(&mut f, 100.0, 48_000.0);
      f.reset();
      let high = sine_rms(&mut f, 8_000.0, 48_000.0);
      assert!(high < 0.1 * low, "{:?}: low {} high {}", ty, low, high);
    }
  }

  #[test]
  fn test_full_resonance_stays_bounded() {
    for ty in [FilterType::Ladder, FilterType::Svf] {
      let mut f = Filter::new(44_100.0);
      f.set_type(ty, LadderMode::Lp4, SvfMode::Bp);
      f.set_params(2_000.0, 1.0, 12.0);
      for i in 0..20_000 {
        let y = f.process_sample(if i == 0 { 1.0 } else { 0.0 });
        assert!(y.is_finite() && y.abs() < 10.0, "{:?} sample {} = {}", ty, i, y);
      }
    }
  }
}
