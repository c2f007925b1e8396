use std::sync::Arc;

use crate::engine::frame::{Instrument, LoopType, PartialSet, Source, SourceMeta};
use crate::engine::plan::{ModContext, PlayMode, SourceConfig};

/// Remembers which wave of an instrument the current note plays.
#[derive(Default)]
pub struct WaveSelector {
    // address of the configured instrument, only compared for identity
    instrument_id: usize,
    wave: Option<usize>,
}

impl WaveSelector {
    pub fn sync(&mut self, instrument: Option<&Arc<Instrument>>) {
        let id = instrument.map_or(0, |i| Arc::as_ptr(i) as usize);
        if id != self.instrument_id {
            self.instrument_id = id;
            self.wave = None;
        }
    }

    pub fn retrigger(&mut self, instrument: Option<&Arc<Instrument>>, channel: u8, freq: f32, velocity: u8) {
        self.sync(instrument);
        self.wave = instrument.and_then(|i| i.select(channel, freq, velocity));
    }

    pub fn source<'a>(&self, instrument: Option<&'a Arc<Instrument>>) -> Option<&'a Source> {
        instrument?.wave(self.wave?)
    }

    pub fn reset(&mut self) {
        self.wave = None;
    }
}

/// Frame index for a position in percent of the loop region, or of the
/// whole source when it does not loop. Always a valid index.
pub fn custom_position_index(src: &Source, position_pct: f32) -> usize {
    let last = src.len().saturating_sub(1);
    let m = &src.meta;
    let (start, end) = if m.loop_type != LoopType::None && m.loop_end > m.loop_start {
        (m.loop_start, m.loop_end)
    } else {
        (0, last)
    };
    let pos = (position_pct * 0.01).clamp(0.0, 1.0);
    let index = ((1.0 - pos) * start as f32 + pos * end as f32).round() as usize;
    index.min(last)
}

pub struct SourceModule {
    selector: WaveSelector,
}

impl SourceModule {
    pub fn new() -> Self {
        Self { selector: WaveSelector::default() }
    }

    pub fn configure(&mut self, cfg: &SourceConfig) {
        self.selector.sync(cfg.instrument.as_ref());
    }

    pub fn retrigger(&mut self, cfg: &SourceConfig, channel: u8, freq: f32, velocity: u8) {
        self.selector.retrigger(cfg.instrument.as_ref(), channel, freq, velocity);
    }

    pub fn reset(&mut self) {
        self.selector.reset();
    }

    pub fn meta(&self, cfg: &SourceConfig) -> Option<SourceMeta> {
        let mut meta = self.selector.source(cfg.instrument.as_ref())?.meta;
        if cfg.play_mode == PlayMode::CustomPosition {
            // position decides the frame, the running index is ignored
            meta.loop_type = LoopType::None;
        }
        Some(meta)
    }

    pub fn frame_at(&mut self, cfg: &SourceConfig, index: usize, out: &mut PartialSet, ctx: &ModContext) -> bool {
        let Some(src) = self.selector.source(cfg.instrument.as_ref()) else {
            return false;
        };
        let index = match cfg.play_mode {
            PlayMode::Standard => index,
            PlayMode::CustomPosition => custom_position_index(src, cfg.position.value(ctx)),
        };
        match src.frame(index) {
            Some(frame) => {
                out.assign_bounded(frame);
                true
            }
            None => false,
        }
    }
}

impl Default for SourceModule {
    fn default() -> Self {
        Self::new()
    }
}
