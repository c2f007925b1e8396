//! Band-shaped noise from a frame's noise envelope.
//!
//! Each block is an inverse FFT of random-phase bins whose magnitude follows
//! the envelope band they fall into. Blocks are sine-windowed and overlapped
//! by half, which keeps the output power constant.

use std::f32::consts::{PI, TAU};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::engine::frame::NOISE_BANDS;

const NO_BAND: u16 = u16::MAX;

pub struct NoiseDecoder {
  mix_freq: f32,
  block: usize,
  hop: usize,
  fft: Arc<dyn Fft<f32>>,
  spectrum: Vec<Complex<f32>>,
  scratch: Vec<Complex<f32>>,
  window: Vec<f32>,
  ola: Vec<f32>,
  read_pos: usize,
  band_of_bin: Vec<u16>,
  bin_scale: Vec<f32>,
  rng: Pcg32,
}

impl NoiseDecoder {
  /// Block size for an output rate: 256 samples at 48 kHz, scaled and
  /// rounded up to a power of two.
  pub fn block_size(mix_freq: f32) -> usize {
    ((256.0 * mix_freq / 48_000.0).ceil() as usize).max(64).next_power_of_two()
  }

  pub fn new(mix_freq: f32, seed: u64) -> Self {
    let block = Self::block_size(mix_freq);
    let fft = FftPlanner::<f32>::new().plan_fft_inverse(block);
    let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
    let window = (0..block).map(|n| (PI * (n as f32 + 0.5) / block as f32).sin()).collect();
    let mut dec = Self {
      mix_freq,
      block,
      hop: block / 2,
      fft,
      spectrum: vec![Complex::new(0.0, 0.0); block],
      scratch,
      window,
      ola: vec![0.0; block],
      read_pos: block / 2,
      band_of_bin: vec![NO_BAND; block / 2 + 1],
      bin_scale: vec![0.0; block / 2 + 1],
      rng: Pcg32::seed_from_u64(seed),
    };
    dec.set_analysis_rate(mix_freq);
    dec
  }

  pub fn hop(&self) -> usize { self.hop }
  pub fn block_len(&self) -> usize { self.block }

  /// Rebuild the bin to band table for a source analyzed at `analysis_mix_freq`.
  /// Bands split the analysis Nyquist range linearly.
  pub fn set_analysis_rate(&mut self, analysis_mix_freq: f32) {
    let band_width = 0.5 * analysis_mix_freq / NOISE_BANDS as f32;
    let mut counts = [0u32; NOISE_BANDS];
    for k in 0..self.band_of_bin.len() {
      let freq = k as f32 * self.mix_freq / self.block as f32;
      let band = if k == 0 || k == self.block / 2 || band_width <= 0.0 { NOISE_BANDS } else { (freq / band_width) as usize };
      if band < NOISE_BANDS {
        self.band_of_bin[k] = band as u16;
        counts[band] += 1;
      } else {
        self.band_of_bin[k] = NO_BAND;
      }
    }
    // a band with k bins at magnitude m has rms m * sqrt(2k)
    for k in 0..self.bin_scale.len() {
      let b = self.band_of_bin[k];
      self.bin_scale[k] = if b == NO_BAND { 0.0 } else { 1.0 / (2.0 * counts[b as usize] as f32).sqrt() };
    }
  }

  pub fn reset(&mut self, seed: u64) {
    self.ola.fill(0.0);
    self.read_pos = self.hop;
    self.rng = Pcg32::seed_from_u64(seed);
  }

  /// Add noise shaped by `envelope` (per-band rms) to `out`.
  pub fn process(&mut self, envelope: &[f32], out: &mut [f32]) {
    for o in out.iter_mut() {
      if self.read_pos >= self.hop { self.next_block(envelope); }
      *o += self.ola[self.read_pos];
      self.read_pos += 1;
    }
  }

  /// Advance by `n` samples without producing output.
  pub fn skip(&mut self, envelope: &[f32], n: usize) {
    for _ in 0..n {
      if self.read_pos >= self.hop { self.next_block(envelope); }
      self.read_pos += 1;
    }
  }

  fn next_block(&mut self, envelope: &[f32]) {
    let (block, hop) = (self.block, self.hop);
    self.ola.copy_within(hop.., 0);
    self.ola[block - hop..].fill(0.0);
    self.read_pos = 0;

    self.spectrum.fill(Complex::new(0.0, 0.0));
    let mut any = false;
    for k in 1..block / 2 {
      let b = self.band_of_bin[k];
      if b == NO_BAND { continue; }
      let e = envelope.get(b as usize).copied().unwrap_or(0.0);
      if e <= 0.0 { continue; }
      let bin = Complex::from_polar(e * self.bin_scale[k], self.rng.gen::<f32>() * TAU);
      self.spectrum[k] = bin;
      self.spectrum[block - k] = bin.conj();
      any = true;
    }
    if !any { return; }
    self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);
    for ((o, s), w) in self.ola.iter_mut().zip(&self.spectrum).zip(&self.window) {
      *o += s.re * w;
    }
  }
}
