//! Per-block scratch memory for the audio thread.
//!
//! `BlockArena` owns one pre-sized buffer. Each block borrows it through
//! [`BlockArena::frame`], carves zeroed slices off the front and drops the
//! frame at the end of the block, which resets it.

pub struct BlockArena {
  storage: Vec<f32>,
}

impl BlockArena {
  pub fn with_capacity(samples: usize) -> Self { Self { storage: vec![0.0; samples] } }
  pub fn capacity(&self) -> usize { self.storage.len() }
  pub fn frame(&mut self) -> ArenaFrame<'_> { ArenaFrame { rest: &mut self.storage[..] } }
}

pub struct ArenaFrame<'a> {
  rest: &'a mut [f32],
}

impl<'a> ArenaFrame<'a> {
  /// Hand out a zeroed slice, or `None` when the arena is exhausted.
  pub fn alloc(&mut self, len: usize) -> Option<&'a mut [f32]> {
    if len > self.rest.len() { return None; }
    let rest = std::mem::take(&mut self.rest);
    let (head, tail) = rest.split_at_mut(len);
    self.rest = tail;
    head.fill(0.0);
    Some(head)
  }

  pub fn remaining(&self) -> usize { self.rest.len() }
}
