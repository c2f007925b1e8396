/// Stage lengths are percentages of `length_ms`; sustain is a level in percent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdsrConfig {
  pub attack: f32,
  pub decay: f32,
  pub sustain: f32,
  pub release: f32,
  pub length_ms: f32,
}

impl Default for AdsrConfig {
  fn default() -> Self { Self { attack: 15.0, decay: 20.0, sustain: 70.0, release: 50.0, length_ms: 1000.0 } }
}

impl AdsrConfig {
  pub fn stage_ms(&self, pct: f32) -> f32 { pct.clamp(0.0, 100.0) * 0.01 * self.length_ms.max(0.0) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeStage {
  Idle,
  Attack,
  Decay,
  Sustain,
  Release,
}

pub struct Adsr {
  sr: f32,
  cfg: AdsrConfig,
  stage: EnvelopeStage,
  level: f32,
  rate: f32,
}

impl Adsr {
  pub fn new(sr: f32) -> Self {
    Self { sr, cfg: AdsrConfig::default(), stage: EnvelopeStage::Idle, level: 0.0, rate: 0.0 }
  }

  pub fn set_config(&mut self, cfg: AdsrConfig) {
    self.cfg = cfg;
    // re-derive the running stage's slope
    match self.stage {
      EnvelopeStage::Attack => self.rate = self.step(cfg.attack, 1.0),
      EnvelopeStage::Decay => self.rate = self.step(cfg.decay, 1.0 - self.sustain_level()),
      EnvelopeStage::Release => self.rate = self.step(cfg.release, self.level),
      _ => {}
    }
  }

  fn sustain_level(&self) -> f32 { (self.cfg.sustain * 0.01).clamp(0.0, 1.0) }

  // per-sample change to cover `span` over a stage of `pct`; zero length jumps
  fn step(&self, pct: f32, span: f32) -> f32 {
    let samples = self.cfg.stage_ms(pct) * 0.001 * self.sr;
    if samples < 1.0 { f32::INFINITY } else { span / samples }
  }

  pub fn retrigger(&mut self) {
    self.stage = EnvelopeStage::Attack;
    self.level = 0.0;
    self.rate = self.step(self.cfg.attack, 1.0);
  }

  pub fn release(&mut self) {
    if matches!(self.stage, EnvelopeStage::Idle | EnvelopeStage::Release) { return; }
    self.stage = EnvelopeStage::Release;
    self.rate = self.step(self.cfg.release, self.level);
  }

  pub fn reset(&mut self) {
    self.stage = EnvelopeStage::Idle;
    self.level = 0.0;
  }

  pub fn stage(&self) -> EnvelopeStage { self.stage }
  pub fn level(&self) -> f32 { self.level }
  pub fn is_done(&self) -> bool { self.stage == EnvelopeStage::Idle }

  #[inline]
  pub fn next(&mut self) -> f32 {
    match self.stage {
      EnvelopeStage::Idle => {}
      EnvelopeStage::Attack => {
        self.level += self.rate;
        if self.level >= 1.0 {
          self.level = 1.0;
          self.stage = EnvelopeStage::Decay;
          self.rate = self.step(self.cfg.decay, 1.0 - self.sustain_level());
        }
      }
      EnvelopeStage::Decay => {
        let sustain = self.sustain_level();
        self.level -= self.rate;
        if self.level <= sustain {
          self.level = sustain;
          self.stage = EnvelopeStage::Sustain;
        }
      }
      EnvelopeStage::Sustain => self.level = self.sustain_level(),
      EnvelopeStage::Release => {
        self.level -= self.rate;
        if self.level <= 0.0 {
          self.level = 0.0;
          self.stage = EnvelopeStage::Idle;
        }
      }
    }
    self.level
  }

  /// Multiply `buf` by the envelope.
  pub fn process(&mut self, buf: &mut [f32]) {
    for v in buf.iter_mut() { *v *= self.next(); }
  }
}
