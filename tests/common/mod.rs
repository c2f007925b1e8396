//! Synthetic sources and helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;

use specmorph::engine::frame::{LoopType, PartialSet, Source, SourceMeta};

pub const MIX_FREQ: f32 = 48_000.0;

pub fn meta() -> SourceMeta {
    SourceMeta { fundamental_freq: 440.0, mix_freq: MIX_FREQ, frame_step_ms: 1.0, ..SourceMeta::default() }
}

/// One partial at the fundamental with magnitude `mag` in every frame.
pub fn single_partial(mag: f32, frames: usize) -> Source {
    let mut f = PartialSet::new();
    f.push(1.0, mag, 0.0);
    Source::new(meta(), vec![f; frames])
}

/// Frames without partials.
pub fn silence(frames: usize) -> Source {
    Source::new(meta(), vec![PartialSet::new(); frames])
}

/// Harmonics 1..=n with 1/k magnitudes.
pub fn harmonic(n: usize, frames: usize) -> Source {
    let mut f = PartialSet::new();
    for k in 1..=n {
        f.push(k as f32, 0.5 / k as f32, 0.0);
    }
    Source::new(meta(), vec![f; frames])
}

/// Every frame's single partial has magnitude `index + 1`, so a frame can
/// be identified by what it contains.
pub fn numbered(frames: usize, loop_type: LoopType, loop_start: usize, loop_end: usize) -> Source {
    let meta = SourceMeta { loop_type, loop_start, loop_end, ..meta() };
    let frames = (0..frames)
        .map(|i| {
            let mut f = PartialSet::new();
            f.push(1.0, (i + 1) as f32, 0.0);
            f
        })
        .collect();
    Source::new(meta, frames)
}

pub fn rms(buf: &[f32]) -> f32 {
    if buf.is_empty() {
        return 0.0;
    }
    (buf.iter().map(|v| v * v).sum::<f32>() / buf.len() as f32).sqrt()
}

/// Amplitude of the `freq` component of `buf`, which must span whole periods.
pub fn amplitude_at(buf: &[f32], freq: f32, mix_freq: f32) -> f32 {
    let (mut s, mut c) = (0.0f64, 0.0f64);
    for (n, &x) in buf.iter().enumerate() {
        let ph = std::f64::consts::TAU * freq as f64 * n as f64 / mix_freq as f64;
        s += x as f64 * ph.sin();
        c += x as f64 * ph.cos();
    }
    let n = buf.len() as f64;
    ((2.0 * s / n).powi(2) + (2.0 * c / n).powi(2)).sqrt() as f32
}

/// Write a mono render under `target/test-renders` for listening.
pub fn write_wav(name: &str, samples: &[f32]) {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("target").join("test-renders");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let spec = hound::WavSpec { channels: 1, sample_rate: MIX_FREQ as u32, bits_per_sample: 32, sample_format: hound::SampleFormat::Float };
    if let Ok(mut writer) = hound::WavWriter::create(dir.join(name), spec) {
        for &s in samples {
            let _ = writer.write_sample(s);
        }
        let _ = writer.finalize();
    }
}
