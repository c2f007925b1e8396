use crate::engine::decoder::{FrameSource, LiveDecoder};
use crate::engine::dsp::adsr::Adsr;
use crate::engine::dsp::filter::Filter;
use crate::engine::frame::db_to_factor;
use crate::engine::plan::{FilterConfig, ModContext, OutputConfig};

// filter coefficients are refreshed on this grid
const FILTER_UPDATE_SAMPLES: usize = 16;
// release without an ADSR: exponential fade, time constant in seconds
const RELEASE_TIME: f32 = 0.150;
// -80 dB counts as silent
const RELEASE_SILENT: f32 = 1e-4;
const MAX_PREROLL: usize = 64;

/// The voice output chain: decoder, optional filter, then amplitude
/// envelope and velocity gain.
pub struct OutputModule {
    decoder: LiveDecoder,
    adsr: Adsr,
    adsr_on: bool,
    filter: Filter,
    filter_env: Adsr,
    filter_on: bool,
    filter_countdown: usize,
    note: f32,
    velocity_gain: f32,
    released: bool,
    release_gain: f32,
    release_coef: f32,
    preroll: Vec<f32>,
}

impl OutputModule {
    pub fn new(mix_freq: f32, seed: u64) -> Self {
        Self {
            decoder: LiveDecoder::new(mix_freq, seed),
            adsr: Adsr::new(mix_freq),
            adsr_on: false,
            filter: Filter::new(mix_freq),
            filter_env: Adsr::new(mix_freq),
            filter_on: false,
            filter_countdown: 0,
            note: 60.0,
            velocity_gain: 1.0,
            released: false,
            release_gain: 1.0,
            release_coef: (-1.0 / (RELEASE_TIME * mix_freq)).exp(),
            preroll: Vec::with_capacity(MAX_PREROLL),
        }
    }

    pub fn configure(&mut self, cfg: &OutputConfig) {
        self.decoder.set_config(cfg.decoder);
        self.adsr_on = cfg.adsr.is_some();
        if let Some(adsr) = cfg.adsr {
            self.adsr.set_config(adsr);
        }
        let filter_on = cfg.filter.is_some();
        if filter_on != self.filter_on {
            self.filter.reset();
        }
        self.filter_on = filter_on;
        if let Some(f) = &cfg.filter {
            self.filter.set_type(f.ty, f.ladder_mode, f.svf_mode);
            self.filter_env.set_config(f.envelope);
        }
    }

    pub fn retrigger(&mut self, cfg: &OutputConfig, src: &mut dyn FrameSource, channel: u8, freq: f32, velocity: u8, ctx: &ModContext) {
        self.decoder.retrigger(src, channel, freq, velocity);
        self.note = if freq > 0.0 { 69.0 + 12.0 * (freq / 440.0).log2() } else { 60.0 };
        let sens = cfg.velocity_sensitivity.max(0.0);
        self.velocity_gain = db_to_factor(-sens * (1.0 - velocity.min(127) as f32 / 127.0));
        self.released = false;
        self.release_gain = 1.0;
        self.adsr.retrigger();

        if let Some(f) = &cfg.filter {
            self.filter.reset();
            self.filter_env.retrigger();
            self.filter_countdown = 0;
            // run the filter's delay line full so its output starts aligned
            let n = self.filter.latency().min(MAX_PREROLL);
            if n > 0 {
                self.preroll.clear();
                self.preroll.resize(n, 0.0);
                self.decoder.process(src, None, &mut self.preroll);
                self.update_filter(f, 0.0, ctx);
                for &x in &self.preroll {
                    self.filter.process_sample(x);
                }
            }
        }
    }

    pub fn glide_to(&mut self, freq: f32) {
        self.decoder.glide_to(freq);
        if freq > 0.0 {
            self.note = 69.0 + 12.0 * (freq / 440.0).log2();
        }
    }

    pub fn release(&mut self) {
        self.released = true;
        self.adsr.release();
        self.filter_env.release();
    }

    pub fn kill(&mut self) {
        self.decoder.reset();
        self.adsr.reset();
        self.filter_env.reset();
        self.filter.reset();
        self.released = true;
        self.release_gain = 0.0;
    }

    pub fn is_done(&self) -> bool {
        if self.decoder.is_done() {
            return true;
        }
        self.released && if self.adsr_on { self.adsr.is_done() } else { self.release_gain < RELEASE_SILENT }
    }

    fn update_filter(&mut self, f: &FilterConfig, env: f32, ctx: &ModContext) {
        let key = f.key_tracking * 0.01 * (self.note - 60.0) / 12.0;
        let env_st = f.depth * env;
        let cutoff = f.cutoff.value(ctx) * 2f32.powf(key + env_st / 12.0);
        let resonance = f.resonance.value(ctx) * 0.01;
        self.filter.set_params(cutoff, resonance, f.drive.value(ctx));
    }

    pub fn process(&mut self, cfg: &OutputConfig, src: &mut dyn FrameSource, freq_in: Option<&[f32]>, out: &mut [f32], ctx: &ModContext) {
        self.decoder.process(src, freq_in, out);

        if let Some(f) = &cfg.filter {
            for v in out.iter_mut() {
                let env = self.filter_env.next();
                if self.filter_countdown == 0 {
                    self.update_filter(f, env, ctx);
                    self.filter_countdown = FILTER_UPDATE_SAMPLES;
                }
                self.filter_countdown -= 1;
                *v = self.filter.process_sample(*v);
            }
        }

        if self.adsr_on {
            self.adsr.process(out);
        } else if self.released {
            for v in out.iter_mut() {
                *v *= self.release_gain;
                self.release_gain *= self.release_coef;
            }
        }

        if self.velocity_gain != 1.0 {
            for v in out.iter_mut() {
                *v *= self.velocity_gain;
            }
        }
    }
}
