//! Configuration handoff between the control thread and the audio thread.
//!
//! The control thread validates a [`PlanDesc`] into a [`PlanSnapshot`] and
//! publishes it. A snapshot with the topology of the previous one is a
//! cheap update: it is stored in a shared [`ArcSwap`] and the audio thread
//! picks it up at its next block. A topology change is a full update: the
//! control thread also builds one [`VoiceGraph`] per voice and ships them
//! over a bounded channel.
//!
//! The audio thread never frees anything it got this way. Replaced
//! snapshots and graphs travel back over a second channel and are dropped
//! when the control side calls [`PlanPublisher::collect`].

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::error::{EngineError, EngineResult};
use super::frame::InstrumentRepo;
use super::graph::VoiceGraph;
use super::plan::{PlanDesc, PlanSnapshot, Topology};

const FULL_UPDATE_QUEUE: usize = 2;
const RETIRE_QUEUE: usize = 16;

/// Voice count, rate and seed every voice graph is built with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceLayout {
  pub voices: usize,
  pub mix_freq: f32,
  pub seed: u64,
}

impl VoiceLayout {
  pub fn build_graphs(&self, plan: &PlanSnapshot) -> Vec<VoiceGraph> {
    (0..self.voices).map(|v| VoiceGraph::build(plan, self.mix_freq, self.seed.wrapping_add(v as u64))).collect()
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
  Cheap,
  Full,
}

struct FullUpdate {
  snapshot: Arc<PlanSnapshot>,
  graphs: Vec<VoiceGraph>,
}

#[derive(Default)]
struct Retired {
  snapshot: Option<Arc<PlanSnapshot>>,
  graphs: Option<Vec<VoiceGraph>>,
}

impl Retired {
  fn is_empty(&self) -> bool { self.snapshot.is_none() && self.graphs.is_none() }
}

/// What the audio side has to do after [`PlanReceiver::poll`].
pub enum PlanUpdate {
  None,
  /// New parameter values for the current graphs.
  Cheap,
  /// Replacement graphs; swap them in and hand the old ones to
  /// [`PlanReceiver::retire`].
  Full(Vec<VoiceGraph>),
}

/// Create both ends of the exchange with `desc` as the initial plan.
pub fn plan_exchange(desc: &PlanDesc, repo: InstrumentRepo, layout: VoiceLayout) -> EngineResult<(PlanPublisher, PlanReceiver)> {
  let mut initial = PlanSnapshot::build(desc, &repo)?;
  initial.version = 1;
  initial.generation = 1;
  let mut warned_cycles = HashSet::new();
  if initial.has_cycle {
    log::warn!("operator graph contains a cycle; voices stay silent until it is fixed");
    warned_cycles.insert(initial.topology.clone());
  }
  let topology = initial.topology.clone();
  let initial = Arc::new(initial);
  let shared = Arc::new(ArcSwap::new(initial.clone()));
  let (full_tx, full_rx) = bounded(FULL_UPDATE_QUEUE);
  let (retired_tx, retired_rx) = bounded(RETIRE_QUEUE);

  let publisher = PlanPublisher {
    repo,
    layout,
    shared: shared.clone(),
    full_tx,
    retired_rx,
    pending_full: None,
    version: 1,
    generation: 1,
    topology,
    warned_cycles,
  };
  let receiver = PlanReceiver { layout, shared, full_rx, retired_tx, held: initial, pending: Retired::default() };
  Ok((publisher, receiver))
}

/// Control-thread end.
pub struct PlanPublisher {
  repo: InstrumentRepo,
  layout: VoiceLayout,
  shared: Arc<ArcSwap<PlanSnapshot>>,
  full_tx: Sender<FullUpdate>,
  retired_rx: Receiver<Retired>,
  pending_full: Option<FullUpdate>,
  version: u64,
  generation: u64,
  topology: Topology,
  warned_cycles: HashSet<Topology>,
}

impl PlanPublisher {
  pub fn repo(&self) -> &InstrumentRepo { &self.repo }
  /// Instruments added here are visible to the next published plan.
  pub fn repo_mut(&mut self) -> &mut InstrumentRepo { &mut self.repo }
  pub fn layout(&self) -> VoiceLayout { self.layout }
  pub fn version(&self) -> u64 { self.version }
  pub fn generation(&self) -> u64 { self.generation }

  /// The most recently published snapshot.
  pub fn current(&self) -> Arc<PlanSnapshot> { self.shared.load_full() }

  /// Validate and publish `desc`. On error nothing changes and the audio
  /// thread keeps the previous plan.
  pub fn publish(&mut self, desc: &PlanDesc) -> EngineResult<UpdateKind> {
    self.collect();
    let mut snap = PlanSnapshot::build(desc, &self.repo).map_err(|e| {
      log::warn!("plan rejected: {}", e);
      e
    })?;
    if snap.has_cycle && self.warned_cycles.insert(snap.topology.clone()) {
      log::warn!("operator graph contains a cycle; voices stay silent until it is fixed");
    }

    self.version += 1;
    snap.version = self.version;
    let kind = if snap.topology == self.topology { UpdateKind::Cheap } else { UpdateKind::Full };
    if kind == UpdateKind::Full {
      self.generation += 1;
      self.topology = snap.topology.clone();
    }
    snap.generation = self.generation;
    let snap = Arc::new(snap);

    if kind == UpdateKind::Full {
      let graphs = self.layout.build_graphs(&snap);
      // an update the audio side has not taken yet is superseded
      self.pending_full = Some(FullUpdate { snapshot: snap.clone(), graphs });
      self.flush_full()?;
    }
    self.shared.store(snap);
    log::debug!("published plan v{} gen {} ({:?})", self.version, self.generation, kind);
    Ok(kind)
  }

  fn flush_full(&mut self) -> EngineResult<()> {
    let Some(update) = self.pending_full.take() else { return Ok(()); };
    match self.full_tx.try_send(update) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(update)) => {
        self.pending_full = Some(update);
        Ok(())
      }
      Err(TrySendError::Disconnected(_)) => Err(EngineError::Disconnected),
    }
  }

  /// Drop whatever the audio thread retired and retry a full update that
  /// did not fit in the queue. Returns the number of retired items.
  pub fn collect(&mut self) -> usize {
    let mut n = 0;
    for retired in self.retired_rx.try_iter() {
      n += retired.snapshot.is_some() as usize + retired.graphs.is_some() as usize;
    }
    if let Err(e) = self.flush_full() {
      log::debug!("full update not delivered: {}", e);
    }
    n
  }
}

/// Audio-thread end. Nothing here blocks or allocates.
pub struct PlanReceiver {
  layout: VoiceLayout,
  shared: Arc<ArcSwap<PlanSnapshot>>,
  full_rx: Receiver<FullUpdate>,
  retired_tx: Sender<Retired>,
  held: Arc<PlanSnapshot>,
  pending: Retired,
}

impl PlanReceiver {
  pub fn layout(&self) -> VoiceLayout { self.layout }

  /// The snapshot the voices currently render with.
  pub fn snapshot(&self) -> &PlanSnapshot { &self.held }

  /// Check for a newer plan; call once per block. While retired data is
  /// still waiting to go back, no new update is taken.
  pub fn poll(&mut self) -> PlanUpdate {
    if !self.flush() {
      return PlanUpdate::None;
    }
    if let Ok(FullUpdate { snapshot, graphs }) = self.full_rx.try_recv() {
      self.pending.snapshot = Some(std::mem::replace(&mut self.held, snapshot));
      return PlanUpdate::Full(graphs);
    }
    {
      let current = self.shared.load();
      // a full update published but not received yet has another generation
      if Arc::ptr_eq(&*current, &self.held) || current.generation != self.held.generation || current.version < self.held.version {
        return PlanUpdate::None;
      }
    }
    self.pending.snapshot = Some(std::mem::replace(&mut self.held, self.shared.load_full()));
    self.flush();
    PlanUpdate::Cheap
  }

  /// Hand replaced graphs back to the control thread.
  pub fn retire(&mut self, graphs: Vec<VoiceGraph>) {
    self.pending.graphs = Some(graphs);
    self.flush();
  }

  // true when nothing is left waiting
  fn flush(&mut self) -> bool {
    if self.pending.is_empty() {
      return true;
    }
    match self.retired_tx.try_send(std::mem::take(&mut self.pending)) {
      Ok(()) => true,
      Err(TrySendError::Full(r)) | Err(TrySendError::Disconnected(r)) => {
        self.pending = r;
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::frame::{Instrument, Source, SourceMeta};
  use crate::engine::plan::OpKind;

  fn repo() -> InstrumentRepo {
    let mut r = InstrumentRepo::new();
    r.insert(Instrument::single("tone", Source::new(SourceMeta::default(), vec![])));
    r
  }

  fn plan() -> PlanDesc {
    let mut d = PlanDesc::new();
    d.add_op("src", OpKind::Source).add_op("out", OpKind::Output);
    d.params.set_str("src/instrument", "tone");
    d.params.set_str("out/source", "op:src");
    d
  }

  fn layout() -> VoiceLayout { VoiceLayout { voices: 2, mix_freq: 48_000.0, seed: 1 } }

  #[test]
  fn test_value_change_is_cheap() {
    let (mut tx, mut rx) = plan_exchange(&plan(), repo(), layout()).unwrap();
    assert!(matches!(rx.poll(), PlanUpdate::None));
    let mut d = plan();
    d.params.set_f32("out/velocity_sensitivity", 12.0);
    assert_eq!(tx.publish(&d).unwrap(), UpdateKind::Cheap);
    assert!(matches!(rx.poll(), PlanUpdate::Cheap));
    assert_eq!(rx.snapshot().version, 2);
    assert_eq!(rx.snapshot().generation, 1);
    assert_eq!(rx.snapshot().output_config().unwrap().velocity_sensitivity, 12.0);
    assert_eq!(tx.collect(), 1);
  }

  #[test]
  fn test_topology_change_ships_graphs() {
    let (mut tx, mut rx) = plan_exchange(&plan(), repo(), layout()).unwrap();
    let mut d = plan();
    d.add_op("lfo", OpKind::Lfo);
    assert_eq!(tx.publish(&d).unwrap(), UpdateKind::Full);
    match rx.poll() {
      PlanUpdate::Full(graphs) => {
        assert_eq!(graphs.len(), 2);
        assert!(graphs.iter().all(|g| g.generation() == 2));
        rx.retire(graphs);
      }
      _ => panic!("expected a full update"),
    }
    assert_eq!(rx.snapshot().generation, 2);
    // nothing newer than what was received
    assert!(matches!(rx.poll(), PlanUpdate::None));
    assert_eq!(tx.collect(), 2);
  }

  #[test]
  fn test_rejected_plan_keeps_previous() {
    let (mut tx, mut rx) = plan_exchange(&plan(), repo(), layout()).unwrap();
    let mut d = plan();
    d.params.set_str("out/sines", "yes");
    assert!(tx.publish(&d).is_err());
    assert_eq!(tx.version(), 1);
    assert!(matches!(rx.poll(), PlanUpdate::None));
  }

  #[test]
  fn test_audio_side_waits_while_retire_queue_is_full() {
    let (mut tx, mut rx) = plan_exchange(&plan(), repo(), layout()).unwrap();
    let mut d = plan();
    d.params.set_f32("out/velocity_sensitivity", 10.0);
    tx.publish(&d).unwrap();
    for _ in 0..RETIRE_QUEUE {
      rx.retired_tx.try_send(Retired::default()).unwrap();
    }
    // taken, but the replaced snapshot cannot go back yet
    assert!(matches!(rx.poll(), PlanUpdate::Cheap));

    let mut next = PlanSnapshot::build(&d, tx.repo()).unwrap();
    next.version = 3;
    next.generation = 1;
    tx.shared.store(Arc::new(next));
    assert!(matches!(rx.poll(), PlanUpdate::None));
    assert_eq!(rx.snapshot().version, 2);

    assert_eq!(tx.collect(), 0);
    assert!(matches!(rx.poll(), PlanUpdate::Cheap));
    assert_eq!(rx.snapshot().version, 3);
    assert_eq!(tx.collect(), 2);
  }
}
