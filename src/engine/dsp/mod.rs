pub mod adsr;
pub mod filter;
pub mod noise;
pub mod sines;

#[inline]
pub fn midi_to_freq(m: u8) -> f32 { 440.0 * 2f32.powf((m as f32 - 69.0) / 12.0) }

#[inline]
pub fn cents_to_ratio(c: f32) -> f32 { 2f32.powf(c / 1200.0) }

#[inline]
pub fn semitones_to_ratio(st: f32) -> f32 { 2f32.powf(st / 12.0) }
