//! Partial matching and morph mixing of two frames.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::frame::{db_to_factor, factor_to_db, PartialSet, MAX_PARTIALS, MIN_DB};

/// Maximum relative frequency distance of two matched partials.
pub const MATCH_TOLERANCE: f32 = 0.05;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphMode {
  #[default]
  Linear,
  DbLinear,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
  mag: f32,
  from_b: bool,
  index: u32,
}

/// True when `f2` lies in `[0.95 * f1, 1.05 * f1]`. `f1` is the partial
/// being matched, `f2` the candidate.
#[inline]
pub fn within_tolerance(f1: f32, f2: f32) -> bool {
  f1 > 0.0 && f2 >= f1 * (1.0 - MATCH_TOLERANCE) && f2 <= f1 * (1.0 + MATCH_TOLERANCE)
}

#[inline]
fn snap_floor(db: f32) -> f32 {
  if db <= MIN_DB + 1e-3 { 0.0 } else { db_to_factor(db) }
}

/// Interpolate two magnitudes, `t = 0` gives `a`.
#[inline]
pub fn interp_mag(a: f32, b: f32, t: f32, mode: MorphMode) -> f32 {
  match mode {
    MorphMode::Linear => (1.0 - t) * a + t * b,
    MorphMode::DbLinear => {
      if t <= 0.0 { return a; }
      if t >= 1.0 { return b; }
      snap_floor((1.0 - t) * factor_to_db(a) + t * factor_to_db(b))
    }
  }
}

/// Attenuate a partial that has no counterpart; `weight = 1` keeps it.
#[inline]
pub fn interp_mag_one(mag: f32, weight: f32, mode: MorphMode) -> f32 {
  match mode {
    MorphMode::Linear => weight * mag,
    MorphMode::DbLinear => {
      if weight >= 1.0 { return mag; }
      if weight <= 0.0 { return 0.0; }
      snap_floor(weight * factor_to_db(mag) + (1.0 - weight) * MIN_DB)
    }
  }
}

/// Copy `input` into `out` with magnitudes and noise scaled by `factor`.
/// Used when only one side of a morph has data.
pub fn morph_scale(out: &mut PartialSet, input: &PartialSet, factor: f32, mode: MorphMode) {
  out.assign_bounded(input);
  let factor = factor.clamp(0.0, 1.0);
  for m in out.mags.iter_mut() { *m = interp_mag_one(*m, factor, mode); }
  for n in out.noise.iter_mut() { *n *= factor; }
}

/// Pairs partials of two frames and mixes them.
///
/// All scratch space is reserved up front, so [`Matcher::morph`] can run on
/// the audio thread.
pub struct Matcher {
  order: Vec<Candidate>,
  used_a: Vec<bool>,
  used_b: Vec<bool>,
}

impl Default for Matcher {
  fn default() -> Self { Self::new() }
}

impl Matcher {
  pub fn new() -> Self {
    Self {
      order: Vec::with_capacity(2 * MAX_PARTIALS),
      used_a: Vec::with_capacity(MAX_PARTIALS),
      used_b: Vec::with_capacity(MAX_PARTIALS),
    }
  }

  /// Mix `a` and `b` at `t` (0 = pure `a`, 1 = pure `b`) into `out`, which
  /// ends up sorted by ascending frequency.
  pub fn morph(&mut self, a: &PartialSet, b: &PartialSet, t: f32, mode: MorphMode, out: &mut PartialSet) {
    out.clear();
    let t = t.clamp(0.0, 1.0);
    let na = a.len().min(MAX_PARTIALS);
    let nb = b.len().min(MAX_PARTIALS);

    self.order.clear();
    for i in 0..na { self.order.push(Candidate { mag: a.mags[i], from_b: false, index: i as u32 }); }
    for i in 0..nb { self.order.push(Candidate { mag: b.mags[i], from_b: true, index: i as u32 }); }
    // loudest first; equal magnitudes fall back to side then index so the
    // order is fully determined
    self.order.sort_unstable_by(|x, y| {
      y.mag.partial_cmp(&x.mag).unwrap_or(Ordering::Equal)
        .then(x.from_b.cmp(&y.from_b))
        .then(x.index.cmp(&y.index))
    });

    self.used_a.clear();
    self.used_a.resize(na, false);
    self.used_b.clear();
    self.used_b.resize(nb, false);

    for k in 0..self.order.len() {
      let c = self.order[k];
      let i = c.index as usize;
      let pair = if c.from_b {
        if self.used_b[i] { continue; }
        closest_unused(b.freqs[i], &a.freqs[..na], &self.used_a).map(|j| (j, i))
      } else {
        if self.used_a[i] { continue; }
        closest_unused(a.freqs[i], &b.freqs[..nb], &self.used_b).map(|j| (i, j))
      };
      if let Some((ia, ib)) = pair {
        self.used_a[ia] = true;
        self.used_b[ib] = true;
        push_match(a, ia, b, ib, t, mode, out);
      }
    }

    for i in 0..na {
      if !self.used_a[i] {
        out.push_bounded(a.freqs[i], interp_mag_one(a.mags[i], 1.0 - t, mode), phase_of(a, i));
      }
    }
    for i in 0..nb {
      if !self.used_b[i] {
        out.push_bounded(b.freqs[i], interp_mag_one(b.mags[i], t, mode), phase_of(b, i));
      }
    }

    let bands = a.noise.len().max(b.noise.len()).min(out.noise.capacity());
    for k in 0..bands {
      let na = a.noise.get(k).copied().unwrap_or(0.0);
      let nb = b.noise.get(k).copied().unwrap_or(0.0);
      out.noise.push((1.0 - t) * na + t * nb);
    }

    out.sort_by_freq();
  }
}

#[inline]
fn phase_of(f: &PartialSet, i: usize) -> f32 { f.phases.get(i).copied().unwrap_or(0.0) }

// Nearest unused partial within tolerance; on equal distance the lower index wins.
fn closest_unused(freq: f32, freqs: &[f32], used: &[bool]) -> Option<usize> {
  let mut best: Option<(usize, f32)> = None;
  for (j, &f2) in freqs.iter().enumerate() {
    if used[j] || !within_tolerance(freq, f2) { continue; }
    let diff = (f2 - freq).abs();
    if best.map_or(true, |(_, d)| diff < d) { best = Some((j, diff)); }
  }
  best.map(|(j, _)| j)
}

fn push_match(a: &PartialSet, ia: usize, b: &PartialSet, ib: usize, t: f32, mode: MorphMode, out: &mut PartialSet) {
  let (fa, ma) = (a.freqs[ia], a.mags[ia]);
  let (fb, mb) = (b.freqs[ib], b.mags[ib]);
  // frequency leans towards the louder partial
  let (freq, phase) = if ma > mb {
    (fa + (mb / ma) * t * (fb - fa), phase_of(a, ia))
  } else if mb > 0.0 {
    (fb + (ma / mb) * (1.0 - t) * (fa - fb), phase_of(b, ib))
  } else {
    (fa + t * (fb - fa), phase_of(a, ia))
  };
  out.push_bounded(freq, interp_mag(ma, mb, t, mode), phase);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::frame::NOISE_BANDS;

  fn set(partials: &[(f32, f32)]) -> PartialSet {
    let mut s = PartialSet::with_capacity(MAX_PARTIALS);
    for &(f, m) in partials { s.push(f, m, 0.0); }
    s.noise.extend((0..NOISE_BANDS).map(|k| k as f32 * 0.01));
    s
  }

  fn run(a: &PartialSet, b: &PartialSet, t: f32, mode: MorphMode) -> PartialSet {
    let mut out = PartialSet::with_capacity(MAX_PARTIALS);
    Matcher::new().morph(a, b, t, mode, &mut out);
    out
  }

  #[test]
  fn test_endpoints_preserve_energy() {
    let a = set(&[(1.0, 0.8), (2.0, 0.4), (3.1, 0.2)]);
    let b = set(&[(1.02, 0.3), (2.5, 0.9), (4.0, 0.1)]);
    for mode in [MorphMode::Linear, MorphMode::DbLinear] {
      let at0 = run(&a, &b, 0.0, mode);
      let at1 = run(&a, &b, 1.0, mode);
      assert!((at0.energy() - a.energy()).abs() < 1e-5, "{:?} t=0 {} vs {}", mode, at0.energy(), a.energy());
      assert!((at1.energy() - b.energy()).abs() < 1e-5, "{:?} t=1 {} vs {}", mode, at1.energy(), b.energy());
    }
  }

  #[test]
  fn test_never_matches_outside_tolerance() {
    // 1.0 vs 1.06 must stay unmatched, so both survive at t = 0.5
    let a = set(&[(1.0, 1.0)]);
    let b = set(&[(1.06, 1.0)]);
    let out = run(&a, &b, 0.5, MorphMode::Linear);
    assert_eq!(out.freqs, vec![1.0, 1.06]);
    assert_eq!(out.mags, vec![0.5, 0.5]);
  }

  #[test]
  fn test_matches_at_tolerance_edges() {
    // ratios just inside both ends of [0.95, 1.05] relative to the louder partial
    for f2 in [0.951, 1.0499] {
      let a = set(&[(1.0, 1.0)]);
      let b = set(&[(f2, 0.5)]);
      let out = run(&a, &b, 0.5, MorphMode::Linear);
      assert_eq!(out.len(), 1, "{} stayed unmatched: {:?}", f2, out.freqs);
      assert!((out.mags[0] - 0.75).abs() < 1e-6);
    }
    assert!(within_tolerance(1.0, 0.95));
    assert!(within_tolerance(1.0, 1.05));
    assert!(!within_tolerance(1.0, 0.949));
    assert!(!within_tolerance(0.0, 0.0));
  }

  #[test]
  fn test_louder_partial_dominates_frequency() {
    let a = set(&[(1.0, 1.0)]);
    let b = set(&[(1.04, 0.5)]);
    let out = run(&a, &b, 0.5, MorphMode::Linear);
    assert_eq!(out.len(), 1);
    let expect = 1.0 + 0.5 * 0.5 * 0.04;
    assert!((out.freqs[0] - expect).abs() < 1e-6, "freq {}", out.freqs[0]);
    assert!((out.mags[0] - 0.75).abs() < 1e-6);
  }

  #[test]
  fn test_equal_distance_prefers_lower_index() {
    let a = set(&[(1.0, 1.0)]);
    let b = set(&[(0.96875, 0.2), (1.03125, 0.2)]);
    let out = run(&a, &b, 0.0, MorphMode::Linear);
    // b[0] got matched, b[1] is left over and silent at t = 0
    assert_eq!(out.len(), 2);
    assert_eq!(out.freqs[1], 1.03125);
    assert_eq!(out.mags[1], 0.0);
  }

  #[test]
  fn test_output_sorted_and_noise_crossfaded() {
    let a = set(&[(5.0, 0.1), (1.0, 0.9), (3.0, 0.5)]);
    let mut b = set(&[(2.0, 0.7)]);
    b.noise.iter_mut().for_each(|n| *n = 1.0);
    let out = run(&a, &b, 0.25, MorphMode::DbLinear);
    assert!(out.is_sorted_by_freq());
    assert_eq!(out.noise.len(), NOISE_BANDS);
    assert!((out.noise[4] - (0.75 * 0.04 + 0.25)).abs() < 1e-6);
  }

  #[test]
  fn test_db_linear_midpoint_is_geometric_mean() {
    let m = interp_mag(1.0, 0.01, 0.5, MorphMode::DbLinear);
    assert!((m - 0.1).abs() < 1e-4, "m = {}", m);
    assert_eq!(interp_mag_one(0.5, 0.0, MorphMode::DbLinear), 0.0);
  }

  #[test]
  fn test_scale_single_source() {
    let a = set(&[(1.0, 0.8)]);
    let mut out = PartialSet::with_capacity(MAX_PARTIALS);
    morph_scale(&mut out, &a, 0.5, MorphMode::Linear);
    assert_eq!(out.mags, vec![0.4]);
    assert!((out.noise[2] - 0.01).abs() < 1e-7);
  }
}
