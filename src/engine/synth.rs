//! Polyphonic voice pool driven by timed note and controller events.

use super::arena::BlockArena;
use super::dsp::{midi_to_freq, semitones_to_ratio};
use super::exchange::{PlanReceiver, PlanUpdate};
use super::graph::VoiceGraph;
use super::messages::EngineMsg;
use super::plan::N_CONTROL_INPUTS;

/// Longest stretch rendered in one go; events split blocks further.
pub const MAX_CHUNK: usize = 256;
pub const MAX_EVENTS: usize = 1024;

const CC_SUSTAIN: u8 = 64;
const CC_CONTROL_1: u8 = 21;
const CC_CONTROL_2: u8 = 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
  Idle,
  On,
  Release,
}

struct Voice {
  state: VoiceState,
  graph: VoiceGraph,
  channel: u8,
  note: u8,
  velocity: u8,
  freq: f32,
  pedal_hold: bool,
  age: u64,
}

#[derive(Clone, Copy, Debug)]
struct TimedEvent {
  offset: usize,
  msg: EngineMsg,
}

pub struct MorphSynth {
  receiver: PlanReceiver,
  voices: Vec<Voice>,
  events: Vec<TimedEvent>,
  control: [f32; N_CONTROL_INPUTS],
  pitch_bend: [f32; 16],
  pedal: bool,
  next_age: u64,
  arena: BlockArena,
}

impl MorphSynth {
  pub fn new(receiver: PlanReceiver) -> Self {
    let graphs = receiver.layout().build_graphs(receiver.snapshot());
    let voices = graphs
      .into_iter()
      .map(|graph| Voice { state: VoiceState::Idle, graph, channel: 0, note: 0, velocity: 0, freq: 0.0, pedal_hold: false, age: 0 })
      .collect();
    Self {
      receiver,
      voices,
      events: Vec::with_capacity(MAX_EVENTS),
      control: [0.0; N_CONTROL_INPUTS],
      pitch_bend: [0.0; 16],
      pedal: false,
      next_age: 0,
      arena: BlockArena::with_capacity(2 * MAX_CHUNK),
    }
  }

  pub fn mix_freq(&self) -> f32 { self.receiver.layout().mix_freq }

  /// Queue `msg` at sample `offset` of the next block. Returns false when
  /// the queue is full and the event was dropped.
  pub fn add_event(&mut self, offset: usize, msg: EngineMsg) -> bool {
    if self.events.len() >= self.events.capacity() { return false; }
    // stays sorted by offset; equal offsets keep arrival order
    let pos = self.events.partition_point(|e| e.offset <= offset);
    self.events.insert(pos, TimedEvent { offset, msg });
    true
  }

  pub fn active_voice_count(&self) -> usize {
    self.voices.iter().filter(|v| v.state != VoiceState::Idle).count()
  }

  pub fn voice_states(&self) -> impl Iterator<Item = VoiceState> + '_ { self.voices.iter().map(|v| v.state) }

  pub fn control_input(&self, index: usize) -> f32 { self.control.get(index).copied().unwrap_or(0.0) }

  /// Render one block, replacing the contents of `out`. Events queued with
  /// [`add_event`](Self::add_event) take effect at their sample offset;
  /// offsets past the block apply at its end.
  pub fn process(&mut self, out: &mut [f32]) {
    out.fill(0.0);
    self.update_plan();

    let len = out.len();
    let mut pos = 0;
    let mut ev = 0;
    while pos < len {
      while ev < self.events.len() && self.events[ev].offset <= pos {
        let msg = self.events[ev].msg;
        self.handle(msg);
        ev += 1;
      }
      let next = self.events.get(ev).map_or(len, |e| e.offset.min(len));
      let end = next.min(pos + MAX_CHUNK);
      self.render(&mut out[pos..end]);
      pos = end;
    }
    while ev < self.events.len() {
      let msg = self.events[ev].msg;
      self.handle(msg);
      ev += 1;
    }
    self.events.clear();
  }

  fn update_plan(&mut self) {
    match self.receiver.poll() {
      PlanUpdate::None => {}
      PlanUpdate::Cheap => {
        let plan = self.receiver.snapshot();
        for v in self.voices.iter_mut() { v.graph.configure(plan); }
      }
      PlanUpdate::Full(mut graphs) => {
        // rebuilt graphs start silent, playing notes are cut
        for (v, g) in self.voices.iter_mut().zip(graphs.iter_mut()) {
          std::mem::swap(&mut v.graph, g);
          v.state = VoiceState::Idle;
          v.pedal_hold = false;
        }
        self.receiver.retire(graphs);
      }
    }
  }

  fn render(&mut self, out: &mut [f32]) {
    // free finished voices before any of them renders
    for v in self.voices.iter_mut() {
      if v.state != VoiceState::Idle && v.graph.is_done() {
        v.state = VoiceState::Idle;
        v.pedal_hold = false;
      }
    }

    let plan = self.receiver.snapshot();
    let bend_range = plan.output_config().map_or(0.0, |c| c.pitch_bend_range);
    let mut frame = self.arena.frame();
    let (Some(buf), Some(freq)) = (frame.alloc(out.len()), frame.alloc(out.len())) else { return; };
    for v in self.voices.iter_mut().filter(|v| v.state != VoiceState::Idle) {
      let bend = self.pitch_bend[(v.channel & 0x0f) as usize] * bend_range;
      freq.fill(v.freq * semitones_to_ratio(bend));
      v.graph.process(plan, &self.control, Some(freq), buf);
      for (o, s) in out.iter_mut().zip(buf.iter()) { *o += s; }
    }
  }

  fn handle(&mut self, msg: EngineMsg) {
    match msg {
      EngineMsg::NoteOn { velocity: 0, channel, note } => self.note_off(channel, note),
      EngineMsg::NoteOn { channel, note, velocity } => self.note_on(channel, note, velocity),
      EngineMsg::NoteOff { channel, note } => self.note_off(channel, note),
      EngineMsg::PitchBend { channel, value } => self.pitch_bend[(channel & 0x0f) as usize] = value.clamp(-1.0, 1.0),
      EngineMsg::Controller { controller, value, .. } => match controller {
        CC_SUSTAIN => self.set_pedal(value >= 64),
        CC_CONTROL_1 => self.control[0] = value as f32 / 127.0 * 2.0 - 1.0,
        CC_CONTROL_2 => self.control[1] = value as f32 / 127.0 * 2.0 - 1.0,
        _ => {}
      },
      EngineMsg::ControlInput { index, value } => {
        if let Some(c) = self.control.get_mut(index) { *c = value.clamp(-1.0, 1.0); }
      }
      EngineMsg::AllNotesOff => {
        for v in self.voices.iter_mut().filter(|v| v.state == VoiceState::On) {
          v.state = VoiceState::Release;
          v.pedal_hold = false;
          v.graph.release();
        }
      }
    }
  }

  fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
    let plan = self.receiver.snapshot();
    let freq = midi_to_freq(note);
    let legato = plan.output_config().map_or(false, |c| c.decoder.portamento);
    if legato {
      if let Some(v) = self.voices.iter_mut().filter(|v| v.state == VoiceState::On && v.channel == channel).max_by_key(|v| v.age) {
        v.note = note;
        v.freq = freq;
        v.velocity = velocity;
        v.pedal_hold = false;
        v.graph.glide_to(plan, freq);
        return;
      }
    }

    let Some(idx) = self.pick_voice() else { return; };
    let age = self.next_age;
    self.next_age += 1;
    let v = &mut self.voices[idx];
    if v.state != VoiceState::Idle { v.graph.kill(); }
    v.graph.retrigger(plan, &self.control, channel, freq, velocity);
    v.state = VoiceState::On;
    v.channel = channel;
    v.note = note;
    v.velocity = velocity;
    v.freq = freq;
    v.pedal_hold = false;
    v.age = age;
  }

  // idle first, then the oldest releasing voice, then the oldest held one
  fn pick_voice(&self) -> Option<usize> {
    let oldest = |state: VoiceState| {
      self.voices.iter().enumerate().filter(|(_, v)| v.state == state).min_by_key(|(_, v)| v.age).map(|(i, _)| i)
    };
    self.voices.iter().position(|v| v.state == VoiceState::Idle).or_else(|| oldest(VoiceState::Release)).or_else(|| oldest(VoiceState::On))
  }

  fn note_off(&mut self, channel: u8, note: u8) {
    let pedal = self.pedal;
    for v in self.voices.iter_mut().filter(|v| v.state == VoiceState::On && v.channel == channel && v.note == note) {
      if pedal {
        v.pedal_hold = true;
      } else {
        v.state = VoiceState::Release;
        v.graph.release();
      }
    }
  }

  fn set_pedal(&mut self, down: bool) {
    self.pedal = down;
    if down { return; }
    for v in self.voices.iter_mut().filter(|v| v.pedal_hold) {
      v.pedal_hold = false;
      if v.state == VoiceState::On {
        v.state = VoiceState::Release;
        v.graph.release();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::exchange::{plan_exchange, VoiceLayout};
  use crate::engine::frame::{Instrument, InstrumentRepo, PartialSet, Source, SourceMeta};
  use crate::engine::plan::{OpKind, PlanDesc};

  fn synth(voices: usize) -> MorphSynth {
    let mut f = PartialSet::new();
    f.push(1.0, 0.25, 0.0);
    let mut repo = InstrumentRepo::new();
    repo.insert(Instrument::single("tone", Source::new(SourceMeta::default(), vec![f; 5000])));
    let mut d = PlanDesc::new();
    d.add_op("src", OpKind::Source).add_op("out", OpKind::Output);
    d.params.set_str("src/instrument", "tone");
    d.params.set_str("out/source", "op:src");
    d.params.set_bool("out/noise", false);
    let (_tx, rx) = plan_exchange(&d, repo, VoiceLayout { voices, mix_freq: 48_000.0, seed: 3 }).unwrap();
    MorphSynth::new(rx)
  }

  #[test]
  fn test_event_offset_is_sample_accurate() {
    let mut s = synth(2);
    let mut out = vec![0.0; 512];
    s.add_event(300, EngineMsg::NoteOn { channel: 0, note: 69, velocity: 127 });
    s.process(&mut out);
    assert!(out[..300].iter().all(|&v| v == 0.0));
    assert_eq!(s.active_voice_count(), 1);
  }

  #[test]
  fn test_steals_oldest_voice() {
    let mut s = synth(2);
    let mut out = vec![0.0; 64];
    for note in [60, 62, 64] {
      s.add_event(0, EngineMsg::NoteOn { channel: 0, note, velocity: 100 });
      s.process(&mut out);
    }
    let notes: Vec<u8> = s.voices.iter().map(|v| v.note).collect();
    assert!(notes.contains(&62) && notes.contains(&64), "{:?}", notes);
  }

  #[test]
  fn test_releasing_voice_is_stolen_first() {
    let mut s = synth(2);
    let mut out = vec![0.0; 64];
    s.add_event(0, EngineMsg::NoteOn { channel: 0, note: 60, velocity: 100 });
    s.add_event(1, EngineMsg::NoteOn { channel: 0, note: 62, velocity: 100 });
    s.add_event(2, EngineMsg::NoteOff { channel: 0, note: 62 });
    s.add_event(3, EngineMsg::NoteOn { channel: 0, note: 64, velocity: 100 });
    s.process(&mut out);
    let notes: Vec<u8> = s.voices.iter().map(|v| v.note).collect();
    assert!(notes.contains(&60) && notes.contains(&64), "{:?}", notes);
  }

  #[test]
  fn test_pedal_holds_until_lifted() {
    let mut s = synth(2);
    let mut out = vec![0.0; 64];
    s.add_event(0, EngineMsg::Controller { channel: 0, controller: 64, value: 127 });
    s.add_event(0, EngineMsg::NoteOn { channel: 0, note: 60, velocity: 100 });
    s.add_event(10, EngineMsg::NoteOff { channel: 0, note: 60 });
    s.process(&mut out);
    assert!(s.voice_states().any(|st| st == VoiceState::On));
    s.add_event(0, EngineMsg::Controller { channel: 0, controller: 64, value: 0 });
    s.process(&mut out);
    assert!(s.voice_states().any(|st| st == VoiceState::Release));
  }

  #[test]
  fn test_controllers_drive_control_inputs() {
    let mut s = synth(1);
    let mut out = vec![0.0; 16];
    s.add_event(0, EngineMsg::Controller { channel: 0, controller: 21, value: 127 });
    s.add_event(0, EngineMsg::Controller { channel: 0, controller: 22, value: 0 });
    s.add_event(0, EngineMsg::ControlInput { index: 3, value: 0.5 });
    s.process(&mut out);
    assert_eq!(s.control_input(0), 1.0);
    assert_eq!(s.control_input(1), -1.0);
    assert_eq!(s.control_input(3), 0.5);
  }
}
