use super::*;

/// Smallest number of idle recorders the pool keeps regardless of how many
/// threads are registered.
const MIN_POOLED: usize = 2;

/// Append-only event log for one thread (or the shared fallback) during one
/// generation.
#[derive(Debug)]
pub struct Recorder {
  events: EventArray<EventRecord>,
  generation: u64,
}

impl Recorder {
  #[must_use]
  pub fn capacity(&self) -> ArrayCapacity {
    self.events.capacity()
  }

  pub fn clear(&mut self) {
    self.events.clear();
  }

  /// Sorts the log and returns an iterator over consolidated records.
  ///
  /// Malloc-domain records come first in canonical order, with every run
  /// sharing an address and tag priority collapsed to its highest sequence
  /// number. Virtual memory records follow uncollapsed, since each of them is
  /// a byte-exact operation. The recorder is empty once the iterator drops.
  pub fn drain_sorted(&mut self) -> SortedRecords<'_> {
    self.events.sort_by(|a, b| {
      a.domain()
        .cmp(&b.domain())
        .then_with(|| a.canonical_cmp(b))
    });

    SortedRecords {
      events: &mut self.events,
      position: 0,
    }
  }

  /// Creates a recorder backed by a fixed-capacity array.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::OutOfMemory`] if the array cannot be allocated.
  pub fn fixed(capacity: usize, generation: u64) -> Result<Self, ArrayError> {
    Ok(Self {
      events: EventArray::fixed(capacity)?,
      generation,
    })
  }

  #[must_use]
  pub fn generation(&self) -> u64 {
    self.generation
  }

  #[must_use]
  pub fn growable(generation: u64) -> Self {
    Self {
      events: EventArray::growable(),
      generation,
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  #[must_use]
  pub fn is_full(&self) -> bool {
    self.events.is_full()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.events.len()
  }

  #[must_use]
  pub fn memory_footprint(&self) -> usize {
    self
      .events
      .memory_footprint()
      .saturating_add(size_of::<Self>())
  }

  /// Appends one event stamped with `seq`.
  ///
  /// `generation` must be the epoch this recorder was handed out for.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::Full`] when a fixed-capacity recorder has no room,
  /// or [`ArrayError::OutOfMemory`] if a growable one cannot grow.
  pub fn record(
    &mut self,
    event: Event,
    seq: u64,
    generation: u64,
  ) -> Result<(), ArrayError> {
    debug_assert_eq!(
      generation, self.generation,
      "recorder used outside of its generation"
    );

    self.events.push(event.sequenced(seq))
  }

  #[must_use]
  pub fn records(&self) -> &[EventRecord] {
    self.events.as_slice()
  }

  /// Prepares a pooled recorder for another generation.
  pub fn reuse(&mut self, generation: u64) {
    self.events.clear();
    self.generation = generation;
  }
}

/// Consolidating iterator returned by [`Recorder::drain_sorted`].
#[derive(Debug)]
pub struct SortedRecords<'a> {
  events: &'a mut EventArray<EventRecord>,
  position: usize,
}

impl Iterator for SortedRecords<'_> {
  type Item = EventRecord;

  fn next(&mut self) -> Option<Self::Item> {
    let records = self.events.as_slice();
    let mut current = *records.get(self.position)?;
    self.position += 1;

    if current.domain() == Domain::Malloc {
      while let Some(following) = records.get(self.position) {
        if following.domain() != Domain::Malloc
          || following.merge_key() != current.merge_key()
        {
          break;
        }

        current = current.collapse(*following);
        self.position += 1;
      }
    }

    Some(current)
  }
}

impl Drop for SortedRecords<'_> {
  fn drop(&mut self) {
    self.events.clear();
  }
}

/// Lock-free free list of idle recorders.
///
/// The pool keeps at most a soft cap of recorders, derived from the number of
/// registered threads. Recorders returned beyond the cap are dropped so that
/// idle memory stays bounded.
#[derive(Debug)]
pub struct RecorderPool {
  free: SegQueue<Recorder>,
  pooled: AtomicUsize,
  pool_factor: usize,
  recorder_capacity: usize,
  soft_cap: AtomicUsize,
}

impl RecorderPool {
  /// Takes an idle recorder or allocates a new fixed-capacity one.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::OutOfMemory`] if a new recorder cannot be
  /// allocated.
  pub fn acquire(&self, generation: u64) -> Result<Recorder, ArrayError> {
    if let Some(mut recorder) = self.free.pop() {
      self.pooled.fetch_sub(1, Ordering::Relaxed);
      recorder.reuse(generation);
      return Ok(recorder);
    }

    Recorder::fixed(self.recorder_capacity, generation)
  }

  /// Drops every pooled recorder.
  pub fn clear(&self) {
    while self.free.pop().is_some() {
      self.pooled.fetch_sub(1, Ordering::Relaxed);
    }
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.pooled.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Approximate bytes held by pooled recorders.
  #[must_use]
  pub fn memory_footprint(&self) -> usize {
    self.len().saturating_mul(
      self
        .recorder_capacity
        .saturating_mul(size_of::<EventRecord>())
        .saturating_add(size_of::<Recorder>()),
    )
  }

  #[must_use]
  pub fn new(recorder_capacity: usize, pool_factor: usize) -> Self {
    Self {
      free: SegQueue::new(),
      pooled: AtomicUsize::new(0),
      pool_factor: pool_factor.max(1),
      recorder_capacity: recorder_capacity.max(1),
      soft_cap: AtomicUsize::new(MIN_POOLED),
    }
  }

  /// Returns a drained recorder. Returns whether it was kept.
  ///
  /// Only recorders of the pool's own shape are kept; the shared fallback
  /// recorder and anything past the soft cap are dropped.
  pub fn release(&self, mut recorder: Recorder) -> bool {
    if recorder.capacity() != ArrayCapacity::Fixed(self.recorder_capacity) {
      return false;
    }

    if self.pooled.load(Ordering::Relaxed)
      >= self.soft_cap.load(Ordering::Relaxed)
    {
      return false;
    }

    recorder.clear();
    self.free.push(recorder);
    self.pooled.fetch_add(1, Ordering::Relaxed);
    true
  }

  /// Recomputes the soft cap from the number of live writer threads.
  pub fn resize_for(&self, threads: usize) {
    let cap = threads.saturating_mul(self.pool_factor).max(MIN_POOLED);
    self.soft_cap.store(cap, Ordering::Relaxed);
  }

  #[must_use]
  pub fn soft_cap(&self) -> usize {
    self.soft_cap.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn alloc(address: usize, size: u64) -> Event {
    Event::allocate(address, size, MemoryCategory::Internal)
  }

  #[test]
  fn signals_full_at_capacity() {
    let mut recorder = Recorder::fixed(2, 1).expect("allocate");

    assert_eq!(recorder.record(alloc(0x10, 8), 1, 1), Ok(()));
    assert_eq!(recorder.record(alloc(0x20, 8), 2, 1), Ok(()));
    assert!(recorder.is_full());
    assert_eq!(recorder.record(alloc(0x30, 8), 3, 1), Err(ArrayError::Full));
    assert_eq!(recorder.len(), 2);
  }

  #[test]
  fn drain_sorted_orders_and_collapses_malloc_runs() {
    let mut recorder = Recorder::growable(1);

    recorder.record(alloc(0x30, 8), 1, 1).expect("record");
    recorder.record(alloc(0x10, 8), 2, 1).expect("record");
    recorder.record(Event::free(0x10), 3, 1).expect("record");
    recorder.record(alloc(0x10, 24), 4, 1).expect("record");
    recorder.record(alloc(0x20, 8), 5, 1).expect("record");

    let drained = recorder.drain_sorted().collect::<Vec<_>>();

    let summary = drained
      .iter()
      .map(|record| (record.address, record.op, record.seq))
      .collect::<Vec<_>>();

    assert_eq!(
      summary,
      vec![
        (0x10, EventKind::Allocate, 4),
        (0x20, EventKind::Allocate, 5),
        (0x30, EventKind::Allocate, 1),
      ]
    );
    assert!(recorder.is_empty());
  }

  #[test]
  fn free_after_allocate_wins_on_sequence() {
    let mut recorder = Recorder::growable(1);

    recorder.record(alloc(0x10, 8), 1, 1).expect("record");
    recorder.record(Event::free(0x10), 2, 1).expect("record");

    let drained = recorder.drain_sorted().collect::<Vec<_>>();

    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].op, EventKind::Free);
    assert!(drained[0].allocated_in_generation);
  }

  #[test]
  fn reallocation_after_free_clears_the_short_lived_mark() {
    let mut recorder = Recorder::growable(1);

    recorder.record(Event::free(0x10), 1, 1).expect("record");
    recorder.record(alloc(0x10, 8), 2, 1).expect("record");
    recorder.record(Event::free(0x20), 3, 1).expect("record");

    let drained = recorder.drain_sorted().collect::<Vec<_>>();

    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].op, EventKind::Allocate);
    assert!(!drained[0].allocated_in_generation);
    assert_eq!(drained[1].op, EventKind::Free);
    assert!(!drained[1].allocated_in_generation);
  }

  #[test]
  fn virtual_memory_records_are_not_collapsed() {
    let mut recorder = Recorder::growable(1);

    recorder
      .record(Event::virtual_memory(EventKind::Commit, 0x1000, 40), 1, 1)
      .expect("record");
    recorder
      .record(Event::virtual_memory(EventKind::Commit, 0x1000, 20), 2, 1)
      .expect("record");
    recorder.record(alloc(0x1000, 8), 3, 1).expect("record");

    let drained = recorder.drain_sorted().collect::<Vec<_>>();

    assert_eq!(drained.len(), 3);
    assert_eq!(drained[0].domain(), Domain::Malloc);
    assert_eq!(drained[1].seq, 1);
    assert_eq!(drained[2].seq, 2);
  }

  #[test]
  fn pool_reuses_recorders_up_to_soft_cap() {
    let pool = RecorderPool::new(4, 2);
    pool.resize_for(1);
    assert_eq!(pool.soft_cap(), 2);

    let recorders = (0..3)
      .map(|_| pool.acquire(7).expect("allocate"))
      .collect::<Vec<_>>();

    let kept = recorders
      .into_iter()
      .map(|recorder| pool.release(recorder))
      .collect::<Vec<_>>();

    assert_eq!(kept, vec![true, true, false]);
    assert_eq!(pool.len(), 2);

    let reused = pool.acquire(8).expect("reuse");
    assert_eq!(reused.generation(), 8);
    assert!(reused.is_empty());
    assert_eq!(pool.len(), 1);

    pool.clear();
    assert!(pool.is_empty());
  }

  #[test]
  fn pool_drops_foreign_recorders() {
    let pool = RecorderPool::new(4, 2);

    assert!(!pool.release(Recorder::growable(1)));
    assert!(!pool.release(Recorder::fixed(8, 1).expect("allocate")));
    assert!(pool.is_empty());
  }
}
