//! Operator plans: parsing a flat parameter map into an immutable,
//! fully-resolved [`PlanSnapshot`].
//!
//! Operator ids are sorted, references resolved to indices and the
//! operators reordered so every dependency precedes its dependents. Plans
//! whose dependencies form a cycle are kept in id order and flagged; voices
//! built from them stay silent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::decoder::{DecoderConfig, MAX_UNISON_VOICES};
use super::dsp::adsr::AdsrConfig;
use super::dsp::filter::{FilterType, LadderMode, SvfMode};
use super::error::{EngineError, EngineResult};
use super::frame::{Instrument, InstrumentRepo};
use super::morph::MorphMode;
use super::params::ParamStore;

/// Number of external control-signal inputs.
pub const N_CONTROL_INPUTS: usize = 4;
pub const MAX_MOD_ENTRIES: usize = 8;
pub const MAX_ENVELOPE_POINTS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
  Source,
  Linear,
  Lfo,
  Envelope,
  Output,
}

impl OpKind {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "source" => Some(OpKind::Source),
      "linear" => Some(OpKind::Linear),
      "lfo" => Some(OpKind::Lfo),
      "envelope" => Some(OpKind::Envelope),
      "output" => Some(OpKind::Output),
      _ => None,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpDecl {
  pub id: String,
  pub kind: String,
}

/// What the control side edits: the operator list and all parameter values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDesc {
  pub ops: Vec<OpDecl>,
  #[serde(default)]
  pub params: ParamStore,
}

impl PlanDesc {
  pub fn new() -> Self { Self::default() }
  pub fn add_op(&mut self, id: impl Into<String>, kind: OpKind) -> &mut Self {
    let kind = match kind {
      OpKind::Source => "source",
      OpKind::Linear => "linear",
      OpKind::Lfo => "lfo",
      OpKind::Envelope => "envelope",
      OpKind::Output => "output",
    };
    self.ops.push(OpDecl { id: id.into(), kind: kind.to_string() });
    self
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlSource {
  Gui,
  Signal(usize),
  Op(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamScale {
  Linear,
  Log,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModEntry {
  pub source: ControlSource,
  pub bipolar: bool,
  pub amount: f32,
}

/// Control values visible to modulation while a voice renders a block.
pub struct ModContext<'a> {
  pub control: &'a [f32; N_CONTROL_INPUTS],
  pub values: &'a [f32],
}

impl ModContext<'_> {
  fn read(&self, src: ControlSource) -> f32 {
    match src {
      ControlSource::Gui => 0.0,
      ControlSource::Signal(k) => self.control.get(k).copied().unwrap_or(0.0),
      ControlSource::Op(i) => self.values.get(i).copied().unwrap_or(0.0),
    }
  }
}

/// A modulatable property: a main control plus additive modulation
/// entries, evaluated in the normalized `[0, 1]` range of the property.
#[derive(Clone, Debug, PartialEq)]
pub struct ModulationData {
  pub value: f32,
  pub control: ControlSource,
  pub min: f32,
  pub max: f32,
  pub scale: ParamScale,
  pub entries: Vec<ModEntry>,
}

impl ModulationData {
  pub fn fixed(value: f32, min: f32, max: f32, scale: ParamScale) -> Self {
    Self { value, control: ControlSource::Gui, min, max, scale, entries: Vec::new() }
  }

  fn normalize(&self, x: f32) -> f32 {
    let x = x.clamp(self.min, self.max);
    match self.scale {
      ParamScale::Linear if self.max > self.min => (x - self.min) / (self.max - self.min),
      ParamScale::Log if self.max > self.min && self.min > 0.0 => (x / self.min).ln() / (self.max / self.min).ln(),
      _ => 0.0,
    }
  }

  fn denormalize(&self, p: f32) -> f32 {
    match self.scale {
      ParamScale::Linear => self.min + p * (self.max - self.min),
      ParamScale::Log => self.min * (self.max / self.min).powf(p),
    }
  }

  pub fn value(&self, ctx: &ModContext) -> f32 {
    if self.control == ControlSource::Gui && self.entries.is_empty() {
      return self.value.clamp(self.min, self.max);
    }
    let mut p = match self.control {
      ControlSource::Gui => self.normalize(self.value),
      other => (ctx.read(other) + 1.0) * 0.5,
    };
    for e in &self.entries {
      let v = ctx.read(e.source);
      p += e.amount * if e.bipolar { v } else { (v + 1.0) * 0.5 };
    }
    self.denormalize(p.clamp(0.0, 1.0))
  }

  fn deps(&self, out: &mut Vec<usize>) {
    if let ControlSource::Op(i) = self.control { out.push(i); }
    for e in &self.entries {
      if let ControlSource::Op(i) = e.source { out.push(i); }
    }
  }

  fn remap(&mut self, perm: &[usize]) {
    if let ControlSource::Op(i) = &mut self.control { *i = perm[*i]; }
    for e in self.entries.iter_mut() {
      if let ControlSource::Op(i) = &mut e.source { *i = perm[*i]; }
    }
  }
}

#[derive(Clone, Debug)]
pub enum InputRef {
  None,
  Op(usize),
  Instrument(Arc<Instrument>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlayMode {
  #[default]
  Standard,
  CustomPosition,
}

#[derive(Clone, Debug)]
pub struct SourceConfig {
  pub instrument: Option<Arc<Instrument>>,
  pub play_mode: PlayMode,
  /// Percent of the playable range, used in custom position mode.
  pub position: ModulationData,
}

#[derive(Clone, Debug)]
pub struct LinearConfig {
  pub left: InputRef,
  pub right: InputRef,
  /// -1 is fully left, 1 fully right.
  pub morphing: ModulationData,
  pub mode: MorphMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LfoWave {
  #[default]
  Sine,
  Triangle,
  SawUp,
  SawDown,
  Square,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LfoConfig {
  pub wave: LfoWave,
  pub frequency: f32,
  pub depth: f32,
  pub center: f32,
  pub start_phase: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvelopePoint {
  /// Position in units of the envelope's `time_ms`.
  pub x: f32,
  /// Level in [0, 1].
  pub y: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnvelopeLoop {
  None,
  /// Hold at the loop start point until note off.
  #[default]
  Sustain,
  Forward,
  PingPong,
}

/// Breakpoint curve with non-decreasing x and at least two points.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvelopeConfig {
  pub points: Vec<EnvelopePoint>,
  pub loop_mode: EnvelopeLoop,
  pub loop_start: usize,
  pub loop_end: usize,
  pub time_ms: f32,
}

#[derive(Clone, Debug)]
pub struct FilterConfig {
  pub ty: FilterType,
  pub ladder_mode: LadderMode,
  pub svf_mode: SvfMode,
  pub envelope: AdsrConfig,
  /// Envelope depth in semitones.
  pub depth: f32,
  /// Percent of an octave per octave of note pitch.
  pub key_tracking: f32,
  pub cutoff: ModulationData,
  /// Percent.
  pub resonance: ModulationData,
  /// dB.
  pub drive: ModulationData,
}

#[derive(Clone, Debug)]
pub struct OutputConfig {
  pub source: Option<usize>,
  pub decoder: DecoderConfig,
  pub adsr: Option<AdsrConfig>,
  pub filter: Option<FilterConfig>,
  pub velocity_sensitivity: f32,
  pub pitch_bend_range: f32,
}

#[derive(Clone, Debug)]
pub enum OpConfig {
  Source(SourceConfig),
  Linear(LinearConfig),
  Lfo(LfoConfig),
  Envelope(EnvelopeConfig),
  Output(OutputConfig),
}

impl OpConfig {
  pub fn kind(&self) -> OpKind {
    match self {
      OpConfig::Source(_) => OpKind::Source,
      OpConfig::Linear(_) => OpKind::Linear,
      OpConfig::Lfo(_) => OpKind::Lfo,
      OpConfig::Envelope(_) => OpKind::Envelope,
      OpConfig::Output(_) => OpKind::Output,
    }
  }

  fn deps(&self) -> Vec<usize> {
    let mut d = Vec::new();
    match self {
      OpConfig::Source(c) => c.position.deps(&mut d),
      OpConfig::Linear(c) => {
        for input in [&c.left, &c.right] {
          if let InputRef::Op(i) = input { d.push(*i); }
        }
        c.morphing.deps(&mut d);
      }
      OpConfig::Lfo(_) | OpConfig::Envelope(_) => {}
      OpConfig::Output(c) => {
        if let Some(i) = c.source { d.push(i); }
        if let Some(f) = &c.filter {
          f.cutoff.deps(&mut d);
          f.resonance.deps(&mut d);
          f.drive.deps(&mut d);
        }
      }
    }
    d.sort_unstable();
    d.dedup();
    d
  }

  fn remap(&mut self, perm: &[usize]) {
    match self {
      OpConfig::Source(c) => c.position.remap(perm),
      OpConfig::Linear(c) => {
        for input in [&mut c.left, &mut c.right] {
          if let InputRef::Op(i) = input { *i = perm[*i]; }
        }
        c.morphing.remap(perm);
      }
      OpConfig::Lfo(_) | OpConfig::Envelope(_) => {}
      OpConfig::Output(c) => {
        if let Some(i) = &mut c.source { *i = perm[*i]; }
        if let Some(f) = &mut c.filter {
          f.cutoff.remap(perm);
          f.resonance.remap(perm);
          f.drive.remap(perm);
        }
      }
    }
  }
}

#[derive(Clone, Debug)]
pub struct OpSnapshot {
  pub id: String,
  pub config: OpConfig,
  /// Indices of operators this one reads from; all lower than its own
  /// index unless the plan has a cycle.
  pub deps: Vec<usize>,
}

/// Operator ids, kinds and dependency ids. Two plans with equal topology
/// only differ in parameter values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Topology {
  pub entries: Vec<(String, OpKind, Vec<String>)>,
}

#[derive(Debug)]
pub struct PlanSnapshot {
  pub version: u64,
  /// Bumped whenever the topology changes.
  pub generation: u64,
  pub topology: Topology,
  pub ops: Vec<OpSnapshot>,
  pub output: Option<usize>,
  pub has_cycle: bool,
}

impl PlanSnapshot {
  /// Resolve and validate `desc`. Version and generation are assigned by
  /// the caller.
  pub fn build(desc: &PlanDesc, repo: &InstrumentRepo) -> EngineResult<PlanSnapshot> {
    let mut decls: Vec<(&str, OpKind)> = Vec::with_capacity(desc.ops.len());
    for d in &desc.ops {
      let kind = OpKind::parse(&d.kind).ok_or_else(|| EngineError::UnknownOperator { id: d.id.clone(), kind: d.kind.clone() })?;
      decls.push((d.id.as_str(), kind));
    }
    decls.sort_by(|a, b| a.0.cmp(b.0));
    for w in decls.windows(2) {
      if w[0].0 == w[1].0 { return Err(EngineError::DuplicateOperator(w[0].0.to_string())); }
    }
    if decls.iter().filter(|d| d.1 == OpKind::Output).count() > 1 { return Err(EngineError::MultipleOutputs); }

    let index: HashMap<&str, usize> = decls.iter().enumerate().map(|(i, d)| (d.0, i)).collect();
    let mut ops = Vec::with_capacity(decls.len());
    for &(id, kind) in &decls {
      let mut r = OpReader { id, params: &desc.params, index: &index, repo, used: Vec::new() };
      let config = match kind {
        OpKind::Source => OpConfig::Source(r.source()?),
        OpKind::Linear => OpConfig::Linear(r.linear()?),
        OpKind::Lfo => OpConfig::Lfo(r.lfo()?),
        OpKind::Envelope => OpConfig::Envelope(r.envelope()?),
        OpKind::Output => OpConfig::Output(r.output()?),
      };
      r.finish()?;
      let deps = config.deps();
      ops.push(OpSnapshot { id: id.to_string(), config, deps });
    }

    let topology = Topology {
      entries: ops.iter().map(|op| (op.id.clone(), op.config.kind(), op.deps.iter().map(|&d| ops[d].id.clone()).collect())).collect(),
    };

    let order = topological_order(&ops);
    let has_cycle = order.is_none();
    if let Some(order) = order {
      let mut perm = vec![0; ops.len()];
      for (new, &old) in order.iter().enumerate() { perm[old] = new; }
      let mut slots: Vec<Option<OpSnapshot>> = ops.into_iter().map(Some).collect();
      ops = order.iter().filter_map(|&old| slots[old].take()).collect();
      for op in ops.iter_mut() {
        op.config.remap(&perm);
        for d in op.deps.iter_mut() { *d = perm[*d]; }
        op.deps.sort_unstable();
      }
    }
    let output = ops.iter().position(|op| op.config.kind() == OpKind::Output);

    Ok(PlanSnapshot { version: 0, generation: 0, topology, ops, output, has_cycle })
  }

  pub fn output_config(&self) -> Option<&OutputConfig> {
    match self.output.map(|i| &self.ops[i].config) {
      Some(OpConfig::Output(c)) => Some(c),
      _ => None,
    }
  }

  pub fn op_index(&self, id: &str) -> Option<usize> { self.ops.iter().position(|op| op.id == id) }
}

/// Kahn's algorithm; among ready operators the lowest index goes first.
/// `None` when the dependencies contain a cycle.
pub fn topological_order(ops: &[OpSnapshot]) -> Option<Vec<usize>> {
  let n = ops.len();
  let mut indegree = vec![0usize; n];
  let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];
  for (i, op) in ops.iter().enumerate() {
    for &d in &op.deps {
      indegree[i] += 1;
      users[d].push(i);
    }
  }
  let mut done = vec![false; n];
  let mut order = Vec::with_capacity(n);
  while order.len() < n {
    let next = (0..n).find(|&i| !done[i] && indegree[i] == 0)?;
    done[next] = true;
    order.push(next);
    for &u in &users[next] { indegree[u] -= 1; }
  }
  Some(order)
}

struct OpReader<'a> {
  id: &'a str,
  params: &'a ParamStore,
  index: &'a HashMap<&'a str, usize>,
  repo: &'a InstrumentRepo,
  used: Vec<String>,
}

impl OpReader<'_> {
  fn path(&mut self, name: &str) -> String {
    self.used.push(name.to_string());
    format!("{}/{}", self.id, name)
  }

  fn f32(&mut self, name: &str, default: f32, min: f32, max: f32) -> EngineResult<f32> {
    let p = self.path(name);
    Ok(self.params.get_f32(&p, default)?.clamp(min, max))
  }

  fn i32(&mut self, name: &str, default: i32, min: i32, max: i32) -> EngineResult<i32> {
    let p = self.path(name);
    Ok(self.params.get_i32(&p, default)?.clamp(min, max))
  }

  fn bool(&mut self, name: &str, default: bool) -> EngineResult<bool> {
    let p = self.path(name);
    self.params.get_bool(&p, default)
  }

  fn choice<T: Copy>(&mut self, name: &str, default: T, options: &[(&str, T)]) -> EngineResult<T> {
    let p = self.path(name);
    match self.params.get_str(&p)? {
      None => Ok(default),
      Some(s) => options.iter().find(|o| o.0 == s).map(|o| o.1).ok_or_else(|| EngineError::InvalidValue {
        path: p.clone(),
        message: format!("'{}' is not one of {:?}", s, options.iter().map(|o| o.0).collect::<Vec<_>>()),
      }),
    }
  }

  fn op_ref(&self, path: &str, target: &str) -> EngineResult<usize> {
    self.index.get(target).copied().ok_or_else(|| EngineError::MissingOperator { op: self.id.to_string(), target: format!("{} ({})", target, path) })
  }

  fn control_source(&self, path: &str, s: &str) -> EngineResult<ControlSource> {
    if s == "gui" { return Ok(ControlSource::Gui); }
    if let Some(target) = s.strip_prefix("op:") { return Ok(ControlSource::Op(self.op_ref(path, target)?)); }
    if let Some(n) = s.strip_prefix("signal") {
      if let Ok(k) = n.parse::<usize>() {
        if (1..=N_CONTROL_INPUTS).contains(&k) { return Ok(ControlSource::Signal(k - 1)); }
      }
    }
    Err(EngineError::InvalidValue { path: path.to_string(), message: format!("unknown control source '{}'", s) })
  }

  fn modulation(&mut self, name: &str, default: f32, min: f32, max: f32, scale: ParamScale) -> EngineResult<ModulationData> {
    let value = self.f32(name, default, min, max)?;
    let mut data = ModulationData::fixed(value, min, max, scale);
    let p = self.path(&format!("{}/control", name));
    if let Some(s) = self.params.get_str(&p)? { data.control = self.control_source(&p, s)?; }
    for k in 0..MAX_MOD_ENTRIES {
      let src_path = self.path(&format!("{}/mod{}/source", name, k));
      let bipolar = self.bool(&format!("{}/mod{}/bipolar", name, k), false)?;
      let amount = self.f32(&format!("{}/mod{}/amount", name, k), 0.0, -1.0, 1.0)?;
      if let Some(s) = self.params.get_str(&src_path)? {
        let source = self.control_source(&src_path, s)?;
        data.entries.push(ModEntry { source, bipolar, amount });
      }
    }
    Ok(data)
  }

  fn instrument(&self, path: &str, name: &str) -> EngineResult<Arc<Instrument>> {
    self.repo.get(name).ok_or_else(|| {
      log::debug!("{} refers to unknown instrument {}", path, name);
      EngineError::UnknownInstrument(name.to_string())
    })
  }

  fn input(&mut self, name: &str) -> EngineResult<InputRef> {
    let p = self.path(name);
    match self.params.get_str(&p)? {
      None | Some("") => Ok(InputRef::None),
      Some(s) => {
        if let Some(target) = s.strip_prefix("op:") {
          Ok(InputRef::Op(self.op_ref(&p, target)?))
        } else if let Some(inst) = s.strip_prefix("instrument:") {
          Ok(InputRef::Instrument(self.instrument(&p, inst)?))
        } else {
          Err(EngineError::InvalidValue { path: p, message: format!("expected 'op:<id>' or 'instrument:<name>', got '{}'", s) })
        }
      }
    }
  }

  fn adsr(&mut self, prefix: &str, defaults: AdsrConfig) -> EngineResult<AdsrConfig> {
    Ok(AdsrConfig {
      attack: self.f32(&format!("{}/attack", prefix), defaults.attack, 0.0, 100.0)?,
      decay: self.f32(&format!("{}/decay", prefix), defaults.decay, 0.0, 100.0)?,
      sustain: self.f32(&format!("{}/sustain", prefix), defaults.sustain, 0.0, 100.0)?,
      release: self.f32(&format!("{}/release", prefix), defaults.release, 0.0, 100.0)?,
      length_ms: self.f32(&format!("{}/length", prefix), defaults.length_ms, 1.0, 60_000.0)?,
    })
  }

  fn source(&mut self) -> EngineResult<SourceConfig> {
    let p = self.path("instrument");
    let instrument = match self.params.get_str(&p)? {
      None | Some("") => None,
      Some(s) => Some(self.instrument(&p, s.strip_prefix("instrument:").unwrap_or(s))?),
    };
    let play_mode = self.choice("play_mode", PlayMode::Standard, &[("standard", PlayMode::Standard), ("custom_position", PlayMode::CustomPosition)])?;
    let position = self.modulation("position", 50.0, 0.0, 100.0, ParamScale::Linear)?;
    Ok(SourceConfig { instrument, play_mode, position })
  }

  fn linear(&mut self) -> EngineResult<LinearConfig> {
    let left = self.input("left")?;
    let right = self.input("right")?;
    let morphing = self.modulation("morphing", 0.0, -1.0, 1.0, ParamScale::Linear)?;
    let db = self.bool("db_linear", false)?;
    Ok(LinearConfig { left, right, morphing, mode: if db { MorphMode::DbLinear } else { MorphMode::Linear } })
  }

  fn lfo(&mut self) -> EngineResult<LfoConfig> {
    let wave = self.choice("wave", LfoWave::Sine, &[
      ("sine", LfoWave::Sine),
      ("triangle", LfoWave::Triangle),
      ("saw_up", LfoWave::SawUp),
      ("saw_down", LfoWave::SawDown),
      ("square", LfoWave::Square),
    ])?;
    Ok(LfoConfig {
      wave,
      frequency: self.f32("frequency", 1.0, 0.01, 100.0)?,
      depth: self.f32("depth", 1.0, 0.0, 1.0)?,
      center: self.f32("center", 0.0, -1.0, 1.0)?,
      start_phase: self.f32("start_phase", 0.0, 0.0, 360.0)?,
    })
  }

  // defaults sketch an attack-decay-sustain-release shape
  fn envelope(&mut self) -> EngineResult<EnvelopeConfig> {
    const DEFAULT_POINTS: [(f32, f32); 4] = [(0.0, 0.0), (0.1, 1.0), (0.3, 0.7), (0.5, 0.0)];
    let count = self.i32("points", DEFAULT_POINTS.len() as i32, 2, MAX_ENVELOPE_POINTS as i32)? as usize;
    let mut points = Vec::with_capacity(count);
    let mut last_x = 0.0f32;
    // every slot is read so stale points above `points` stay valid keys
    for k in 0..MAX_ENVELOPE_POINTS {
      let (dx, dy) = DEFAULT_POINTS.get(k).copied().unwrap_or((1.0, 0.0));
      let x = self.f32(&format!("point{}/x", k), dx, 0.0, 1.0)?.max(last_x);
      let y = self.f32(&format!("point{}/y", k), dy, 0.0, 1.0)?;
      if k < count {
        points.push(EnvelopePoint { x, y });
        last_x = x;
      }
    }
    let loop_mode = self.choice("loop", EnvelopeLoop::Sustain, &[
      ("none", EnvelopeLoop::None),
      ("sustain", EnvelopeLoop::Sustain),
      ("forward", EnvelopeLoop::Forward),
      ("ping_pong", EnvelopeLoop::PingPong),
    ])?;
    let last = count as i32 - 1;
    let loop_start = self.i32("loop_start", 2, 0, last)? as usize;
    let loop_end = (self.i32("loop_end", 2, 0, last)? as usize).max(loop_start);
    Ok(EnvelopeConfig { points, loop_mode, loop_start, loop_end, time_ms: self.f32("time", 1000.0, 1.0, 60_000.0)? })
  }

  fn output(&mut self) -> EngineResult<OutputConfig> {
    let p = self.path("source");
    let source = match self.params.get_str(&p)? {
      None | Some("") => None,
      Some(s) => {
        let target = s.strip_prefix("op:").unwrap_or(s);
        Some(self.op_ref(&p, target)?)
      }
    };

    let unison = self.bool("unison", false)?;
    let voices = self.i32("unison/voices", 2, 2, MAX_UNISON_VOICES as i32)? as usize;
    let portamento = self.bool("portamento", false)?;
    let adsr_on = self.bool("adsr", false)?;
    let decoder = DecoderConfig {
      sines: self.bool("sines", true)?,
      noise: self.bool("noise", true)?,
      start_skip: true,
      loop_enabled: true,
      unison_voices: if unison { voices } else { 1 },
      unison_detune: self.f32("unison/detune", 6.0, 0.5, 50.0)?,
      vibrato: self.bool("vibrato", false)?,
      vibrato_depth: self.f32("vibrato/depth", 10.0, 0.0, 50.0)?,
      vibrato_frequency: self.f32("vibrato/frequency", 4.0, 0.1, 20.0)?,
      vibrato_attack_ms: self.f32("vibrato/attack", 0.0, 0.0, 2000.0)?,
      portamento,
      glide_ms: self.f32("portamento/glide", 200.0, 0.0, 1000.0)?,
      skip_ms: self.f32("adsr/skip", 500.0, 0.0, 5000.0)?,
    };
    let decoder = if adsr_on { decoder } else { DecoderConfig { skip_ms: 0.0, ..decoder } };
    let adsr = self.adsr("adsr", AdsrConfig::default())?;

    let filter_on = self.bool("filter", false)?;
    let ty = self.choice("filter/type", FilterType::Ladder, &[("ladder", FilterType::Ladder), ("svf", FilterType::Svf)])?;
    let p = self.path("filter/mode");
    let mode = self.params.get_str(&p)?.map(str::to_string);
    let (ladder_mode, svf_mode) = match (ty, mode.as_deref()) {
      (_, None) => (LadderMode::Lp4, SvfMode::Lp),
      (FilterType::Ladder, Some("lp1")) => (LadderMode::Lp1, SvfMode::Lp),
      (FilterType::Ladder, Some("lp2")) => (LadderMode::Lp2, SvfMode::Lp),
      (FilterType::Ladder, Some("lp3")) => (LadderMode::Lp3, SvfMode::Lp),
      (FilterType::Ladder, Some("lp4")) => (LadderMode::Lp4, SvfMode::Lp),
      (FilterType::Svf, Some("lp")) => (LadderMode::Lp4, SvfMode::Lp),
      (FilterType::Svf, Some("bp")) => (LadderMode::Lp4, SvfMode::Bp),
      (FilterType::Svf, Some("hp")) => (LadderMode::Lp4, SvfMode::Hp),
      (_, Some(other)) => {
        return Err(EngineError::InvalidValue { path: p, message: format!("mode '{}' does not fit filter type {:?}", other, ty) });
      }
    };
    let filter = FilterConfig {
      ty,
      ladder_mode,
      svf_mode,
      envelope: self.adsr("filter", AdsrConfig { attack: 15.0, decay: 50.0, sustain: 30.0, release: 50.0, length_ms: 1000.0 })?,
      depth: self.f32("filter/depth", 36.0, -96.0, 96.0)?,
      key_tracking: self.f32("filter/key_tracking", 50.0, 0.0, 100.0)?,
      cutoff: self.modulation("filter/cutoff", 500.0, 20.0, 30_000.0, ParamScale::Log)?,
      resonance: self.modulation("filter/resonance", 30.0, 0.0, 100.0, ParamScale::Linear)?,
      drive: self.modulation("filter/drive", 0.0, -24.0, 36.0, ParamScale::Linear)?,
    };

    Ok(OutputConfig {
      source,
      decoder,
      adsr: adsr_on.then_some(adsr),
      filter: filter_on.then_some(filter),
      velocity_sensitivity: self.f32("velocity_sensitivity", 24.0, 0.0, 96.0)?,
      pitch_bend_range: self.i32("pitch_bend_range", 48, 0, 96)? as f32,
    })
  }

  fn finish(self) -> EngineResult<()> {
    for name in self.params.names_for(self.id) {
      if !self.used.iter().any(|u| u == name) {
        return Err(EngineError::UnknownParam(format!("{}/{}", self.id, name)));
      }
    }
    Ok(())
  }
}
