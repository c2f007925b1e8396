//! Real-time spectral morphing synthesis.
//!
//! Sounds are sequences of partial frames ([`engine::frame`]). A voice runs
//! an operator graph ([`engine::plan`], [`engine::graph`]) whose morph
//! operators crossfade matched partials, and resynthesizes the result with
//! a phase vocoder ([`engine::decoder`]) followed by envelope and filter.

pub mod engine {
  pub mod arena;
  #[cfg(feature = "device")]
  pub mod audio;
  pub mod decoder;
  pub mod dsp;
  pub mod error;
  pub mod exchange;
  pub mod frame;
  pub mod graph;
  pub mod messages;
  pub mod modules;
  pub mod morph;
  pub mod params;
  pub mod plan;
  pub mod synth;
}

pub use engine::error::{EngineError, EngineResult};
