use std::f32::consts::TAU;

use crate::engine::plan::{LfoConfig, LfoWave};

/// Per-voice low frequency oscillator, restarted on every note.
pub struct LfoModule {
    mix_freq: f32,
    phase: f32,
}

#[inline]
fn wave_value(wave: LfoWave, phase: f32) -> f32 {
    match wave {
        LfoWave::Sine => (TAU * phase).sin(),
        LfoWave::Triangle => {
            if phase < 0.25 {
                4.0 * phase
            } else if phase < 0.75 {
                2.0 - 4.0 * phase
            } else {
                4.0 * phase - 4.0
            }
        }
        LfoWave::SawUp => 2.0 * phase - 1.0,
        LfoWave::SawDown => 1.0 - 2.0 * phase,
        LfoWave::Square => {
            if phase < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
    }
}

impl LfoModule {
    pub fn new(mix_freq: f32) -> Self {
        Self { mix_freq, phase: 0.0 }
    }

    pub fn note_on(&mut self, cfg: &LfoConfig) {
        self.phase = (cfg.start_phase / 360.0).rem_euclid(1.0);
    }

    /// Output in [-1, 1] at the current phase.
    pub fn value(&self, cfg: &LfoConfig) -> f32 {
        (cfg.center + cfg.depth * wave_value(cfg.wave, self.phase)).clamp(-1.0, 1.0)
    }

    pub fn advance(&mut self, cfg: &LfoConfig, samples: usize) {
        self.phase = (self.phase + cfg.frequency * samples as f32 / self.mix_freq).rem_euclid(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(wave: LfoWave) -> LfoConfig {
        // away from the saw and square edges, so rounding drift cannot cross one
        LfoConfig { wave, frequency: 1.0, depth: 1.0, center: 0.0, start_phase: 45.0 }
    }

    #[test]
    fn test_waves_stay_in_range_and_period() {
        for wave in [LfoWave::Sine, LfoWave::Triangle, LfoWave::SawUp, LfoWave::SawDown, LfoWave::Square] {
            let c = cfg(wave);
            let mut lfo = LfoModule::new(1000.0);
            lfo.note_on(&c);
            let first = lfo.value(&c);
            for _ in 0..1000 {
                let v = lfo.value(&c);
                assert!((-1.0..=1.0).contains(&v), "{:?} out of range: {}", wave, v);
                lfo.advance(&c, 1);
            }
            assert!((lfo.value(&c) - first).abs() < 1e-3, "{:?} not periodic", wave);
        }
    }

    #[test]
    fn test_start_phase_and_center() {
        let c = LfoConfig { start_phase: 90.0, center: 0.5, depth: 0.25, ..cfg(LfoWave::Sine) };
        let mut lfo = LfoModule::new(48_000.0);
        lfo.note_on(&c);
        assert!((lfo.value(&c) - 0.75).abs() < 1e-6);
    }
}
