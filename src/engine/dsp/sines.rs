use std::f64::consts::TAU;

// Samples between exact re-evaluations of the rotating phasor
const RESYNC: usize = 256;

/// Fill `out` with a periodic Hann window of `len` samples. With a hop of
/// `len / 2` consecutive windows sum to exactly one.
pub fn fill_hann(out: &mut Vec<f32>, len: usize) {
  out.clear();
  let n = len.max(1) as f64;
  out.extend((0..len).map(|i| (0.5 - 0.5 * (TAU * i as f64 / n).cos()) as f32));
}

/// Add `mag * window[n] * sin(phase + 2π·freq·n/mix_freq)` to `out`.
///
/// Uses a rotating phasor resynchronised every few hundred samples instead
/// of calling `sin` per sample.
pub fn add_windowed_sine(out: &mut [f32], window: &[f32], freq: f32, mix_freq: f32, phase: f32, mag: f32) {
  let inc = TAU * freq as f64 / mix_freq as f64;
  let (sin_inc, cos_inc) = inc.sin_cos();
  let mut s = 0.0f64;
  let mut c = 0.0f64;
  for (n, (o, w)) in out.iter_mut().zip(window).enumerate() {
    if n % RESYNC == 0 {
      let (ps, pc) = (phase as f64 + inc * n as f64).sin_cos();
      s = ps;
      c = pc;
    }
    *o += mag * *w * s as f32;
    let ns = s * cos_inc + c * sin_inc;
    c = c * cos_inc - s * sin_inc;
    s = ns;
  }
}

/// Wrap a phase into `[0, 2π)`.
#[inline]
pub fn wrap_phase(phase: f64) -> f32 { phase.rem_euclid(TAU) as f32 }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hann_overlap_sums_to_one() {
    let mut w = Vec::new();
    fill_hann(&mut w, 96);
    for i in 0..48 {
      let s = w[i] + w[i + 48];
      assert!((s - 1.0).abs() < 1e-6, "sum at {} = {}", i, s);
    }
  }

  #[test]
  fn test_phasor_matches_direct_sine() {
    let window = vec![1.0f32; 1000];
    let mut out = vec![0.0f32; 1000];
    add_windowed_sine(&mut out, &window, 1234.5, 48_000.0, 0.3, 0.7);
    for (n, v) in out.iter().enumerate() {
      let expect = 0.7 * (0.3 + TAU * 1234.5 * n as f64 / 48_000.0).sin();
      assert!((*v as f64 - expect).abs() < 1e-5, "n = {} got {} want {}", n, v, expect);
    }
  }
}
