use crate::engine::plan::{EnvelopeConfig, EnvelopeLoop, EnvelopePoint};

/// Per-voice envelope that plays a breakpoint curve, optionally looping
/// while the note is held.
///
/// Time runs in curve units: `1.0` on the x axis is `cfg.time_ms`.
pub struct EnvelopeModule {
    mix_freq: f32,
    phase: f64,
    direction: f64,
    seen_note_off: bool,
    note_off_pending: bool,
    note_off_segment: Option<(EnvelopePoint, EnvelopePoint)>,
}

/// Wrap `pos` into `[0, len)`.
fn mod_pos(pos: f64, len: f64) -> f64 {
    if len < 1e-12 {
        return 0.0;
    }
    pos.rem_euclid(len)
}

/// Linear interpolation between `p1` and `p2`, constant outside them.
fn segment(x: f64, p1: EnvelopePoint, p2: EnvelopePoint) -> f32 {
    let (x1, x2) = (p1.x as f64, p2.x as f64);
    if x <= x1 {
        p1.y
    } else if x >= x2 || x2 - x1 < 1e-12 {
        p2.y
    } else {
        let t = (x - x1) / (x2 - x1);
        (p1.y as f64 + t * (p2.y - p1.y) as f64) as f32
    }
}

/// Curve value at `x`; before the first point the first y, after the last
/// the last y.
pub fn evaluate(points: &[EnvelopePoint], x: f64) -> f32 {
    let Some(first) = points.first() else {
        return 0.0;
    };
    if x <= first.x as f64 {
        return first.y;
    }
    for w in points.windows(2) {
        if x < w[1].x as f64 {
            return segment(x, w[0], w[1]);
        }
    }
    points.last().map_or(0.0, |p| p.y)
}

impl EnvelopeModule {
    pub fn new(mix_freq: f32) -> Self {
        Self {
            mix_freq,
            phase: 0.0,
            direction: 1.0,
            seen_note_off: false,
            note_off_pending: false,
            note_off_segment: None,
        }
    }

    pub fn note_on(&mut self) {
        self.phase = 0.0;
        self.direction = 1.0;
        self.seen_note_off = false;
        self.note_off_pending = false;
        self.note_off_segment = None;
    }

    /// Takes effect on the next [`EnvelopeModule::value`].
    pub fn release(&mut self) {
        if !self.seen_note_off {
            self.note_off_pending = true;
        }
    }

    // a looping curve leaves its loop at loop_end, starting from the level
    // it had when the note was released
    fn note_off(&mut self, cfg: &EnvelopeConfig) {
        self.note_off_pending = false;
        self.seen_note_off = true;
        self.direction = 1.0;
        if cfg.loop_mode == EnvelopeLoop::None {
            return;
        }
        let y = evaluate(&cfg.points, self.phase);
        let Some(&end) = cfg.points.get(cfg.loop_end) else {
            return;
        };
        self.phase = end.x as f64;
        if let Some(&next) = cfg.points.get(cfg.loop_end + 1) {
            self.note_off_segment = Some((EnvelopePoint { y, ..end }, next));
        }
    }

    /// Keep the phase inside the loop region while the note is held.
    fn constrain(&mut self, cfg: &EnvelopeConfig) {
        let (Some(start), Some(end)) = (cfg.points.get(cfg.loop_start), cfg.points.get(cfg.loop_end)) else {
            return;
        };
        let (loop_start, loop_end) = (start.x as f64, end.x as f64);
        let loop_len = loop_end - loop_start;
        match cfg.loop_mode {
            EnvelopeLoop::Sustain if self.phase > loop_start => self.phase = loop_start,
            EnvelopeLoop::Forward if self.phase > loop_end => {
                self.phase = loop_start + mod_pos(self.phase - loop_start, loop_len);
            }
            EnvelopeLoop::PingPong => {
                let out_fwd = self.phase > loop_end && self.direction > 0.0;
                let out_back = self.phase < loop_start && self.direction < 0.0;
                if out_fwd || out_back {
                    let pos = mod_pos(self.phase - loop_start, 2.0 * loop_len);
                    // past the far end of the doubled loop means playing backwards
                    if pos > loop_len {
                        self.phase = loop_end - (pos - loop_len);
                        self.direction = -self.direction;
                    } else {
                        self.phase = loop_start + pos;
                    }
                }
            }
            _ => {}
        }
    }

    /// Output in [-1, 1] at the current position.
    pub fn value(&mut self, cfg: &EnvelopeConfig) -> f32 {
        if !self.seen_note_off {
            self.constrain(cfg);
        }
        if self.note_off_pending {
            self.note_off(cfg);
        }
        // loop mode switched away from ping-pong mid-note
        if cfg.loop_mode != EnvelopeLoop::PingPong && self.direction < 0.0 {
            self.direction = 1.0;
        }
        let y = match self.note_off_segment {
            Some((p1, p2)) if self.phase <= p2.x as f64 => segment(self.phase, p1, p2),
            _ => evaluate(&cfg.points, self.phase),
        };
        (2.0 * y - 1.0).clamp(-1.0, 1.0)
    }

    pub fn advance(&mut self, cfg: &EnvelopeConfig, samples: usize) {
        let ms = samples as f64 * 1000.0 / self.mix_freq as f64;
        self.phase += ms / cfg.time_ms.max(1.0) as f64 * self.direction;
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32, y: f32) -> EnvelopePoint {
        EnvelopePoint { x, y }
    }

    // rises to 1 at 0.2, loop region 0.2..0.6 falls to 0.5, release to 0 at 1.0
    fn cfg(loop_mode: EnvelopeLoop) -> EnvelopeConfig {
        EnvelopeConfig {
            points: vec![point(0.0, 0.0), point(0.2, 1.0), point(0.6, 0.5), point(1.0, 0.0)],
            loop_mode,
            loop_start: 1,
            loop_end: 2,
            time_ms: 1000.0,
        }
    }

    // value after each of `steps` blocks of 10 ms at 1 kHz
    fn run(env: &mut EnvelopeModule, c: &EnvelopeConfig, steps: usize) -> Vec<f32> {
        (0..steps)
            .map(|_| {
                env.advance(c, 10);
                env.value(c)
            })
            .collect()
    }

    #[test]
    fn test_evaluate_interpolates_and_holds_ends() {
        let c = cfg(EnvelopeLoop::None);
        assert_eq!(evaluate(&c.points, -1.0), 0.0);
        assert!((evaluate(&c.points, 0.1) - 0.5).abs() < 1e-6);
        assert!((evaluate(&c.points, 0.4) - 0.75).abs() < 1e-6);
        assert_eq!(evaluate(&c.points, 5.0), 0.0);
        assert_eq!(evaluate(&[], 0.3), 0.0);
    }

    #[test]
    fn test_no_loop_runs_to_the_end() {
        let c = cfg(EnvelopeLoop::None);
        let mut env = EnvelopeModule::new(1000.0);
        env.note_on();
        assert_eq!(env.value(&c), -1.0);
        let v = run(&mut env, &c, 20);
        // 0.2 curve units is the peak
        assert!((v[19] - 1.0).abs() < 1e-4, "peak {}", v[19]);
        let v = run(&mut env, &c, 100);
        assert_eq!(*v.last().unwrap_or(&0.0), -1.0);
        assert!(v.iter().all(|x| (-1.0..=1.0).contains(x)));
    }

    #[test]
    fn test_sustain_holds_until_release() {
        let c = cfg(EnvelopeLoop::Sustain);
        let mut env = EnvelopeModule::new(1000.0);
        env.note_on();
        let held = run(&mut env, &c, 300);
        assert!(held[50..].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!((env.phase() - 0.2).abs() < 1e-6);

        env.release();
        // note off continues from the held level at loop_end towards the last point
        assert!((env.value(&c) - 1.0).abs() < 1e-6);
        assert!((env.phase() - 0.6).abs() < 1e-6);
        let v = run(&mut env, &c, 20);
        assert!((v[19] - 0.0).abs() < 1e-4, "halfway down {}", v[19]);
        let v = run(&mut env, &c, 30);
        assert_eq!(*v.last().unwrap_or(&0.0), -1.0);
    }

    #[test]
    fn test_forward_loop_repeats_region() {
        let c = cfg(EnvelopeLoop::Forward);
        let mut env = EnvelopeModule::new(1000.0);
        env.note_on();
        let v = run(&mut env, &c, 400);
        // loop is 40 blocks long once inside it
        for n in 100..300 {
            assert!((v[n] - v[n + 40]).abs() < 1e-3, "block {}: {} vs {}", n, v[n], v[n + 40]);
        }
        assert!((0.2..=0.6 + 1e-6).contains(&env.phase()));
        // the loop never reaches the release segment
        assert!(v[20..].iter().all(|&x| x >= -1e-6));
    }

    #[test]
    fn test_ping_pong_reverses_at_both_ends() {
        let c = cfg(EnvelopeLoop::PingPong);
        let mut env = EnvelopeModule::new(1000.0);
        env.note_on();
        let mut phases = Vec::new();
        for _ in 0..300 {
            env.advance(&c, 10);
            env.value(&c);
            phases.push(env.phase());
        }
        assert!(phases[20..].iter().all(|p| (0.2 - 1e-6..=0.6 + 1e-6).contains(p)));
        // rising then falling, period 80 blocks
        let rising = phases[30] > phases[29];
        let falling = phases[70] < phases[69];
        assert!(rising && falling, "phases {:?}", &phases[25..75]);
        for n in 60..200 {
            assert!((phases[n] - phases[n + 80]).abs() < 1e-6, "block {}", n);
        }

        env.release();
        let v = env.value(&c);
        assert!((-1.0..=1.0).contains(&v));
        assert!((env.phase() - 0.6).abs() < 1e-6);
        env.advance(&c, 10);
        env.value(&c);
        assert!(env.phase() > 0.6, "note off plays forwards");
    }
}
