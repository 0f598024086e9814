use super::*;

/// Lifecycle of one slot in the [`GenerationRing`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
  Empty,
  /// The slot is the tail and accepts newly handed-off recorders.
  Filling,
  /// The slot is closed and the worker is consuming it.
  Draining,
}

/// What the worker should do next.
#[derive(Debug)]
pub enum WorkItem {
  /// Merge this recorder into the staging area.
  Merge(Recorder),
  /// The head generation is fully merged; promote staging and advance.
  Promote { epoch: u64 },
  /// Nothing to do until another generation closes.
  Idle,
}

#[derive(Debug)]
struct GenerationSlot {
  epoch: u64,
  recorders: Vec<Recorder>,
  state: SlotState,
}

impl GenerationSlot {
  fn empty() -> Self {
    Self {
      epoch: 0,
      recorders: Vec::new(),
      state: SlotState::Empty,
    }
  }
}

/// Bounded ring of generations waiting for consolidation.
///
/// `tail` is the slot collecting recorders for the current epoch; `head` is the
/// oldest slot not yet promoted. Generations are drained strictly oldest
/// first.
#[derive(Debug)]
pub struct GenerationRing {
  head: usize,
  slots: Vec<GenerationSlot>,
  tail: usize,
}

impl GenerationRing {
  /// Marks the head generation as promoted and moves on to the next one.
  pub fn advance_head(&mut self) {
    if self.head == self.tail {
      return;
    }

    let slot = &mut self.slots[self.head];
    debug_assert!(slot.recorders.is_empty(), "advancing over live recorders");
    slot.state = SlotState::Empty;
    slot.epoch = 0;

    self.head = self.next_index(self.head);
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Closes the tail generation and opens `next_epoch` in the following slot.
  /// Returns the epoch that was closed.
  ///
  /// # Errors
  ///
  /// Returns [`GenerationsExhausted`] when the following slot is still waiting
  /// to be drained. The ring is left unchanged in that case.
  pub fn close_tail(
    &mut self,
    next_epoch: u64,
  ) -> Result<u64, GenerationsExhausted> {
    let next = self.next_index(self.tail);

    if next == self.head {
      return Err(GenerationsExhausted);
    }

    let closed = &mut self.slots[self.tail];
    closed.state = SlotState::Draining;
    let closed_epoch = closed.epoch;

    let opened = &mut self.slots[next];
    opened.epoch = next_epoch;
    opened.state = SlotState::Filling;

    self.tail = next;

    Ok(closed_epoch)
  }

  /// Removes every queued recorder, oldest generation first.
  pub fn drain_recorders(&mut self) -> Vec<Recorder> {
    let mut drained = Vec::new();
    let mut index = self.head;

    loop {
      drained.append(&mut self.slots[index].recorders);

      if index == self.tail {
        break;
      }

      index = self.next_index(index);
    }

    drained
  }

  /// Queues a recorder into the tail generation.
  pub fn enqueue(&mut self, recorder: Recorder) {
    let tail = &mut self.slots[self.tail];

    debug_assert_eq!(
      recorder.generation(),
      tail.epoch,
      "recorder handed to the wrong generation"
    );

    tail.recorders.push(recorder);
  }

  /// Whether the worker has nothing to do.
  #[must_use]
  pub fn is_idle(&self) -> bool {
    self.head == self.tail && self.slots[self.head].recorders.is_empty()
  }

  #[must_use]
  pub fn new(max_generations: usize, epoch: u64) -> Self {
    let mut slots = (0..max_generations.max(2))
      .map(|_| GenerationSlot::empty())
      .collect::<Vec<_>>();

    slots[0].epoch = epoch;
    slots[0].state = SlotState::Filling;

    Self {
      head: 0,
      slots,
      tail: 0,
    }
  }

  /// Decides the worker's next step.
  ///
  /// Recorders are taken from the head slot even while it is still the tail,
  /// so hand-offs of full recorders are merged early; promotion waits until
  /// the slot has been closed.
  pub fn next_work(&mut self) -> WorkItem {
    let head = &mut self.slots[self.head];

    if let Some(recorder) = head.recorders.pop() {
      return WorkItem::Merge(recorder);
    }

    if self.head != self.tail {
      return WorkItem::Promote { epoch: head.epoch };
    }

    WorkItem::Idle
  }

  /// Closed generations that still have to be promoted.
  #[must_use]
  pub fn pending_generations(&self) -> usize {
    (self.tail + self.slots.len() - self.head) % self.slots.len()
  }

  #[must_use]
  pub fn queued_recorders(&self) -> usize {
    self.slots.iter().map(|slot| slot.recorders.len()).sum()
  }

  #[must_use]
  pub fn slot_state(&self, index: usize) -> Option<SlotState> {
    self.slots.get(index).map(|slot| slot.state)
  }

  #[must_use]
  pub fn tail_epoch(&self) -> u64 {
    self.slots[self.tail].epoch
  }

  fn next_index(&self, index: usize) -> usize {
    (index + 1) % self.slots.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn recorder_with(generation: u64, address: usize) -> Recorder {
    let mut recorder = Recorder::growable(generation);
    recorder
      .record(
        Event::allocate(address, 8, MemoryCategory::Internal),
        1,
        generation,
      )
      .expect("record");
    recorder
  }

  #[test]
  fn drains_oldest_generation_first() {
    let mut ring = GenerationRing::new(4, 1);

    ring.enqueue(recorder_with(1, 0x10));
    assert_eq!(ring.close_tail(2), Ok(1));
    ring.enqueue(recorder_with(2, 0x20));
    assert_eq!(ring.close_tail(3), Ok(2));
    assert_eq!(ring.pending_generations(), 2);
    assert_eq!(ring.slot_state(0), Some(SlotState::Draining));
    assert_eq!(ring.slot_state(2), Some(SlotState::Filling));

    let WorkItem::Merge(first) = ring.next_work() else {
      panic!("expected merge");
    };
    assert_eq!(first.generation(), 1);

    assert!(matches!(ring.next_work(), WorkItem::Promote { epoch: 1 }));
    ring.advance_head();
    assert_eq!(ring.slot_state(0), Some(SlotState::Empty));

    let WorkItem::Merge(second) = ring.next_work() else {
      panic!("expected merge");
    };
    assert_eq!(second.generation(), 2);

    assert!(matches!(ring.next_work(), WorkItem::Promote { epoch: 2 }));
    ring.advance_head();

    assert!(matches!(ring.next_work(), WorkItem::Idle));
    assert!(ring.is_idle());
  }

  #[test]
  fn open_generation_is_merged_but_not_promoted() {
    let mut ring = GenerationRing::new(4, 1);
    ring.enqueue(recorder_with(1, 0x10));

    assert!(matches!(ring.next_work(), WorkItem::Merge(_)));
    assert!(matches!(ring.next_work(), WorkItem::Idle));
  }

  #[test]
  fn closing_into_the_head_is_exhaustion() {
    let mut ring = GenerationRing::new(3, 1);

    assert_eq!(ring.close_tail(2), Ok(1));
    assert_eq!(ring.close_tail(3), Ok(2));
    assert_eq!(ring.close_tail(4), Err(GenerationsExhausted));
    assert_eq!(ring.tail_epoch(), 3);
    assert_eq!(ring.pending_generations(), 2);
  }

  #[test]
  fn drain_recorders_empties_every_slot() {
    let mut ring = GenerationRing::new(4, 1);
    ring.enqueue(recorder_with(1, 0x10));
    ring.close_tail(2).expect("close");
    ring.enqueue(recorder_with(2, 0x20));
    ring.enqueue(recorder_with(2, 0x30));

    let drained = ring.drain_recorders();

    assert_eq!(drained.len(), 3);
    assert_eq!(drained[0].generation(), 1);
    assert_eq!(ring.queued_recorders(), 0);
  }
}
