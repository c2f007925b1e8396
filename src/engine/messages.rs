use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
  Bool(bool),
  I32(i32),
  F32(f32),
  Str(String),
}

impl ParamValue {
  pub fn type_name(&self) -> &'static str {
    match self {
      ParamValue::Bool(_) => "bool",
      ParamValue::I32(_) => "i32",
      ParamValue::F32(_) => "f32",
      ParamValue::Str(_) => "string",
    }
  }
}

/// Events for the voice pool. Channels are 0-based MIDI channels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineMsg {
  NoteOn { channel: u8, note: u8, velocity: u8 },
  NoteOff { channel: u8, note: u8 },
  /// Normalized bend in [-1, 1].
  PitchBend { channel: u8, value: f32 },
  Controller { channel: u8, controller: u8, value: u8 },
  /// Direct write of one of the external control inputs, value in [-1, 1].
  ControlInput { index: usize, value: f32 },
  AllNotesOff,
}

impl EngineMsg {
  /// Decode a raw channel message. Only note, controller and pitch bend
  /// messages are understood.
  pub fn from_midi(bytes: &[u8]) -> Option<Self> {
    let status = *bytes.first()?;
    let channel = status & 0x0f;
    let d1 = bytes.get(1).copied().unwrap_or(0) & 0x7f;
    let d2 = bytes.get(2).copied().unwrap_or(0) & 0x7f;
    match status & 0xf0 {
      0x90 if d2 > 0 => Some(EngineMsg::NoteOn { channel, note: d1, velocity: d2 }),
      0x90 | 0x80 => Some(EngineMsg::NoteOff { channel, note: d1 }),
      0xb0 => Some(EngineMsg::Controller { channel, controller: d1, value: d2 }),
      0xe0 => {
        let raw = ((d2 as i32) << 7) | d1 as i32;
        Some(EngineMsg::PitchBend { channel, value: (raw - 8192) as f32 / 8192.0 })
      }
      _ => None,
    }
  }
}
