use super::*;

/// Scratch tables for the generation currently being consolidated.
///
/// The malloc array is kept in canonical order with at most one record per
/// `(address, tag priority)`; whenever two recorders disagree the higher
/// sequence number wins, which makes the result independent of the order the
/// recorders are merged in. Virtual memory records are only collected here and
/// put into sequence order right before promotion.
#[derive(Debug, Default)]
pub struct StagingArea {
  malloc: EventArray<EventRecord>,
  vm: EventArray<EventRecord>,
}

impl StagingArea {
  pub fn clear(&mut self) {
    self.malloc.clear();
    self.vm.clear();
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.malloc.is_empty() && self.vm.is_empty()
  }

  #[must_use]
  pub fn malloc_records(&self) -> &[EventRecord] {
    self.malloc.as_slice()
  }

  #[must_use]
  pub fn memory_footprint(&self) -> usize {
    self
      .malloc
      .memory_footprint()
      .saturating_add(self.vm.memory_footprint())
  }

  /// Folds the records of one drained recorder into the staging tables.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::OutOfMemory`] if a table cannot grow. Records merged
  /// before the failure stay merged.
  pub fn merge<I>(&mut self, records: I) -> Result<(), ArrayError>
  where
    I: IntoIterator<Item = EventRecord>,
  {
    for record in records {
      match record.domain() {
        Domain::Malloc => self.merge_malloc(record)?,
        Domain::VirtualMemory => self.vm.push(record)?,
      }
    }

    Ok(())
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Orders virtual memory records by sequence number, the order in which
  /// they happened.
  pub fn sort_vm_by_sequence(&mut self) {
    self.vm.sort_by(|a, b| a.seq.cmp(&b.seq));
  }

  #[must_use]
  pub fn vm_records(&self) -> &[EventRecord] {
    self.vm.as_slice()
  }

  fn merge_malloc(&mut self, record: EventRecord) -> Result<(), ArrayError> {
    let key = record.merge_key();

    match self.malloc.binary_search_by(|entry| entry.merge_key().cmp(&key)) {
      Ok(index) => {
        if let Some(existing) = self.malloc.get_mut(index) {
          *existing = existing.collapse(record);
        }
        Ok(())
      }
      Err(index) => self.malloc.insert(index, record),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(event: Event, seq: u64) -> EventRecord {
    event.sequenced(seq)
  }

  fn alloc(address: usize, size: u64) -> Event {
    Event::allocate(address, size, MemoryCategory::Internal)
  }

  fn permutations(items: &[Vec<EventRecord>]) -> Vec<Vec<Vec<EventRecord>>> {
    if items.len() <= 1 {
      return vec![items.to_vec()];
    }

    let mut result = Vec::new();

    for index in 0..items.len() {
      let mut rest = items.to_vec();
      let picked = rest.remove(index);

      for mut tail in permutations(&rest) {
        tail.insert(0, picked.clone());
        result.push(tail);
      }
    }

    result
  }

  #[test]
  fn merge_is_independent_of_recorder_order() {
    let recorders = vec![
      vec![
        record(alloc(0x10, 8), 1),
        record(alloc(0x40, 16), 4),
        record(Event::arena_size(0x38, 128, MemoryCategory::Arena), 9),
      ],
      vec![record(Event::free(0x10), 5), record(alloc(0x20, 8), 2)],
      vec![
        record(alloc(0x10, 32), 7),
        record(Event::arena_size(0x38, 256, MemoryCategory::Arena), 8),
        record(alloc(0x30, 8), 3),
      ],
    ];

    let mut results = permutations(&recorders).into_iter().map(|order| {
      let mut staging = StagingArea::new();
      for batch in order {
        staging.merge(batch).expect("merge");
      }
      staging.malloc_records().to_vec()
    });

    let expected = results.next().expect("at least one permutation");

    for other in results {
      assert_eq!(other, expected);
    }

    let summary = expected
      .iter()
      .map(|record| (record.address, record.op, record.seq))
      .collect::<Vec<_>>();

    assert_eq!(
      summary,
      vec![
        (0x10, EventKind::Allocate, 7),
        (0x20, EventKind::Allocate, 2),
        (0x30, EventKind::Allocate, 3),
        (0x40, EventKind::Allocate, 4),
        (0x40, EventKind::ArenaSizeUpdate, 9),
      ]
    );
  }

  #[test]
  fn free_across_recorders_remembers_the_allocation() {
    let allocated = vec![record(alloc(0x10, 8), 1), record(alloc(0x20, 8), 2)];
    let freed =
      vec![record(Event::free(0x10), 3), record(Event::free(0x30), 4)];

    for order in [[&allocated, &freed], [&freed, &allocated]] {
      let mut staging = StagingArea::new();
      for batch in order {
        staging.merge(batch.iter().copied()).expect("merge");
      }

      let records = staging.malloc_records();
      assert_eq!(records.len(), 3);

      assert_eq!(records[0].op, EventKind::Free);
      assert!(records[0].allocated_in_generation);
      assert!(!records[1].allocated_in_generation);
      assert_eq!(records[2].op, EventKind::Free);
      assert!(!records[2].allocated_in_generation);
    }
  }

  #[test]
  fn lower_priority_entry_keeps_its_sibling() {
    let mut staging = StagingArea::new();

    staging
      .merge([record(Event::arena_size(0x100, 64, MemoryCategory::Arena), 2)])
      .expect("merge");
    staging.merge([record(alloc(0x108, 8), 1)]).expect("merge");

    let ops = staging
      .malloc_records()
      .iter()
      .map(|record| record.op)
      .collect::<Vec<_>>();

    assert_eq!(ops, vec![EventKind::Allocate, EventKind::ArenaSizeUpdate]);
  }

  #[test]
  fn virtual_memory_records_are_appended_then_sequenced() {
    let mut staging = StagingArea::new();

    staging
      .merge([record(
        Event::virtual_memory(EventKind::Commit, 0x1000, 10),
        3,
      )])
      .expect("merge");
    staging
      .merge([record(
        Event::virtual_memory(EventKind::Reserve, 0x1000, 100),
        1,
      )])
      .expect("merge");

    assert_eq!(staging.vm_records()[0].seq, 3);

    staging.sort_vm_by_sequence();

    assert_eq!(staging.vm_records()[0].op, EventKind::Reserve);
    assert!(staging.malloc_records().is_empty());

    staging.clear();
    assert!(staging.is_empty());
  }
}
