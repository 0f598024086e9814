use super::*;

/// A reserved range of virtual memory and how much of it is committed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct VmRegion {
  pub base: usize,
  pub call_site: Option<CallSiteId>,
  pub category: MemoryCategory,
  pub committed: u64,
  pub reserved: u64,
}

impl VmRegion {
  #[must_use]
  pub fn contains(&self, address: usize) -> bool {
    address >= self.base && address < self.end()
  }

  #[must_use]
  pub fn end(&self) -> usize {
    crate::event::span_end(self.base, self.reserved)
  }
}

/// A structural violation found while promoting a generation.
///
/// These point at an upstream bug or an unsynchronized event stream. They are
/// counted and clamped, or turned into panics under
/// [`ConsistencyPolicy::strict`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
  CommitBeyondReserved { base: usize, committed: u64, reserved: u64 },
  OutsideRegion { address: usize, op: EventKind },
  OverlappingReserve { address: usize, size: u64 },
  PartialReleaseInside { base: usize, address: usize, size: u64 },
  ReleaseWhileCommitted { base: usize, committed: u64 },
  ReserveBelowCommitted { base: usize, committed: u64, size: u64 },
  Retag { base: usize, from: MemoryCategory, to: MemoryCategory },
  UncommitBeyondCommitted { base: usize, committed: u64, size: u64 },
}

impl Display for Inconsistency {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::CommitBeyondReserved {
        base,
        committed,
        reserved,
      } => write!(
        f,
        "region {base:#x}: committed {committed} exceeds reserved {reserved}"
      ),
      Self::OutsideRegion { address, op } => {
        write!(f, "{op:?} at {address:#x} matches no reserved region")
      }
      Self::OverlappingReserve { address, size } => write!(
        f,
        "reserve of {size} bytes at {address:#x} overlaps an existing region"
      ),
      Self::PartialReleaseInside {
        base,
        address,
        size,
      } => write!(
        f,
        "region {base:#x}: release of {size} bytes at {address:#x} touches \
         neither edge"
      ),
      Self::ReleaseWhileCommitted { base, committed } => write!(
        f,
        "region {base:#x} released with {committed} bytes still committed"
      ),
      Self::ReserveBelowCommitted {
        base,
        committed,
        size,
      } => write!(
        f,
        "region {base:#x}: resize to {size} below committed {committed}"
      ),
      Self::Retag { base, from, to } => {
        write!(f, "region {base:#x}: re-tagged from {from} to {to}")
      }
      Self::UncommitBeyondCommitted {
        base,
        committed,
        size,
      } => write!(
        f,
        "region {base:#x}: uncommit of {size} exceeds committed {committed}"
      ),
    }
  }
}

/// How promotion reacts to inconsistent input.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConsistencyPolicy {
  /// Panic instead of clamping.
  pub strict: bool,
  pub thread_stacks: ThreadStackPolicy,
}

impl Default for ConsistencyPolicy {
  fn default() -> Self {
    Self {
      strict: false,
      thread_stacks: ThreadStackPolicy::WholeStack,
    }
  }
}

impl ConsistencyPolicy {
  fn violation(&self, report: &mut PromoteReport, found: Inconsistency) {
    if self.strict {
      panic!("memory tracking inconsistency: {found}");
    }

    warn!(%found, "memory tracking inconsistency");
    report.inconsistencies.push(found);
  }
}

/// Outcome of one promotion.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PromoteReport {
  pub inconsistencies: Vec<Inconsistency>,
  pub inserted: usize,
  pub removed: usize,
  /// Blocks allocated and freed again within the promoted generation.
  pub short_lived: usize,
  pub stale_dropped: usize,
  pub untracked_frees: usize,
  pub updated: usize,
}

/// The authoritative table of live allocations and virtual memory regions.
///
/// The malloc table is sorted strictly by address and never holds two entries
/// for one address. Regions are sorted by base, never overlap, and never have
/// more committed than reserved.
#[derive(Debug, Default)]
pub struct Snapshot {
  generation: u64,
  malloc: EventArray<EventRecord>,
  promotions: u64,
  regions: EventArray<VmRegion>,
}

impl Snapshot {
  pub fn clear(&mut self) {
    self.malloc.clear();
    self.regions.clear();
  }

  /// Epoch of the most recently promoted generation.
  #[must_use]
  pub fn generation(&self) -> u64 {
    self.generation
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
      .saturating_add(self.regions.memory_footprint())
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Folds a fully merged staging area into the snapshot.
  ///
  /// # Errors
  ///
  /// Returns [`ArrayError::OutOfMemory`] if a table cannot grow. The snapshot
  /// keeps every change applied before the failure.
  pub fn promote(
    &mut self,
    staging: &mut StagingArea,
    policy: &ConsistencyPolicy,
    epoch: u64,
  ) -> Result<PromoteReport, ArrayError> {
    let mut report = PromoteReport::default();

    self.promote_malloc(staging.malloc_records(), &mut report)?;

    staging.sort_vm_by_sequence();
    for record in staging.vm_records() {
      self.apply_vm(record, policy, &mut report)?;
    }

    self.generation = epoch;
    self.promotions = self.promotions.saturating_add(1);

    trace!(
      epoch,
      inserted = report.inserted,
      updated = report.updated,
      removed = report.removed,
      "promoted staging area"
    );

    Ok(report)
  }

  /// Number of successful promotions so far.
  #[must_use]
  pub fn promotions(&self) -> u64 {
    self.promotions
  }

  #[must_use]
  pub fn region_at(&self, address: usize) -> Option<&VmRegion> {
    self
      .containing_region(address)
      .and_then(|index| self.regions.get(index))
  }

  #[must_use]
  pub fn regions(&self) -> &[VmRegion] {
    self.regions.as_slice()
  }

  /// Bytes of live malloc blocks, arena payloads excluded.
  #[must_use]
  pub fn total_malloc_bytes(&self) -> u64 {
    self
      .malloc
      .iter()
      .filter(|record| record.op == EventKind::Allocate)
      .fold(0_u64, |total, record| total.saturating_add(record.size))
  }

  fn apply_vm(
    &mut self,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) -> Result<(), ArrayError> {
    if record.op == EventKind::Reserve {
      return self.reserve(record, policy, report);
    }

    let Some(index) = self.containing_region(record.address) else {
      policy.violation(
        report,
        Inconsistency::OutsideRegion {
          address: record.address,
          op: record.op,
        },
      );
      return Ok(());
    };

    match record.op {
      EventKind::Commit => self.commit(index, record, policy, report),
      EventKind::Uncommit => self.uncommit(index, record, policy, report),
      EventKind::TagType => self.tag(index, record, policy, report),
      EventKind::Release => self.release(index, record, policy, report),
      // Malloc-domain records never reach the region table.
      EventKind::Allocate
      | EventKind::Free
      | EventKind::ArenaSizeUpdate
      | EventKind::Reserve => {}
    }

    Ok(())
  }

  fn commit(
    &mut self,
    index: usize,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) {
    let Some(region) = self.regions.get_mut(index) else {
      return;
    };

    if region.category == MemoryCategory::ThreadStack
      && policy.thread_stacks == ThreadStackPolicy::WholeStack
    {
      if region.committed == 0 {
        region.committed = record.size.min(region.reserved);
      }
      return;
    }

    let committed = region.committed.saturating_add(record.size);

    if committed > region.reserved || record.end() > region.end() {
      let found = Inconsistency::CommitBeyondReserved {
        base: region.base,
        committed,
        reserved: region.reserved,
      };
      region.committed = committed.min(region.reserved);
      policy.violation(report, found);
      return;
    }

    region.committed = committed;
  }

  fn containing_region(&self, address: usize) -> Option<usize> {
    let index = self
      .regions
      .partition_point(|region| region.base <= address)
      .checked_sub(1)?;

    self
      .regions
      .get(index)
      .filter(|region| region.contains(address))
      .map(|_| index)
  }

  fn promote_malloc(
    &mut self,
    staged: &[EventRecord],
    report: &mut PromoteReport,
  ) -> Result<(), ArrayError> {
    let mut cursor = 0;

    for record in staged {
      // Both tables are address ordered, so the cursor only moves forward.
      cursor += self.malloc.as_slice()[cursor..]
        .partition_point(|entry| entry.address < record.address);

      let existing = self
        .malloc
        .get(cursor)
        .filter(|entry| entry.address == record.address)
        .copied();

      match record.op {
        EventKind::Allocate => match existing {
          Some(previous) => {
            if previous.arena {
              self.remove_arena_sibling(cursor + 1, &previous);
            }
            if let Some(entry) = self.malloc.get_mut(cursor) {
              *entry = *record;
            }
            report.updated += 1;
          }
          None => {
            self.malloc.insert(cursor, *record)?;
            report.inserted += 1;
          }
        },
        EventKind::Free => match existing {
          Some(previous) => {
            self.malloc.remove(cursor);
            if previous.arena {
              self.remove_arena_sibling(cursor, &previous);
            }
            report.removed += 1;
          }
          None if record.allocated_in_generation => report.short_lived += 1,
          None => report.untracked_frees += 1,
        },
        EventKind::ArenaSizeUpdate => {
          let owned = cursor
            .checked_sub(1)
            .and_then(|index| self.malloc.get(index))
            .is_some_and(|owner| record.is_arena_size_of(owner));

          if !owned {
            // The arena was freed before its size update got here.
            report.stale_dropped += 1;
            continue;
          }

          match existing {
            Some(_) => {
              if let Some(entry) = self.malloc.get_mut(cursor) {
                *entry = *record;
              }
              report.updated += 1;
            }
            None => {
              self.malloc.insert(cursor, *record)?;
              report.inserted += 1;
            }
          }
        }
        // Virtual memory records are staged separately.
        EventKind::Reserve
        | EventKind::Commit
        | EventKind::Uncommit
        | EventKind::Release
        | EventKind::TagType => {}
      }
    }

    Ok(())
  }

  fn release(
    &mut self,
    index: usize,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) {
    let Some(region) = self.regions.get(index).copied() else {
      return;
    };

    let release_end = record.end();

    if record.address == region.base && release_end >= region.end() {
      if region.committed > 0 && region.category != MemoryCategory::ThreadStack
      {
        policy.violation(
          report,
          Inconsistency::ReleaseWhileCommitted {
            base: region.base,
            committed: region.committed,
          },
        );
      }

      self.regions.remove(index);
      return;
    }

    let Some(region) = self.regions.get_mut(index) else {
      return;
    };

    if record.address == region.base {
      region.base = release_end;
      region.reserved = region.reserved.saturating_sub(record.size);
    } else if release_end >= region.end() {
      region.reserved = u64::try_from(record.address - region.base)
        .unwrap_or(region.reserved);
    } else {
      let found = Inconsistency::PartialReleaseInside {
        base: region.base,
        address: record.address,
        size: record.size,
      };
      policy.violation(report, found);
      return;
    }

    region.committed = region.committed.min(region.reserved);
  }

  fn remove_arena_sibling(&mut self, index: usize, arena: &EventRecord) {
    let is_sibling = self
      .malloc
      .get(index)
      .is_some_and(|entry| entry.is_arena_size_of(arena));

    if is_sibling {
      self.malloc.remove(index);
    }
  }

  fn reserve(
    &mut self,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) -> Result<(), ArrayError> {
    let search = self
      .regions
      .binary_search_by(|region| region.base.cmp(&record.address));

    let next_base = |index: usize| {
      self
        .regions
        .get(index)
        .map_or(usize::MAX, |region| region.base)
    };

    match search {
      Ok(index) => {
        if record.end() > next_base(index + 1) {
          policy.violation(
            report,
            Inconsistency::OverlappingReserve {
              address: record.address,
              size: record.size,
            },
          );
          return Ok(());
        }

        let Some(region) = self.regions.get_mut(index) else {
          return Ok(());
        };

        if record.size < region.committed {
          let found = Inconsistency::ReserveBelowCommitted {
            base: region.base,
            committed: region.committed,
            size: record.size,
          };
          region.committed = record.size;
          region.reserved = record.size;
          policy.violation(report, found);
          return Ok(());
        }

        region.reserved = record.size;
        Ok(())
      }
      Err(index) => {
        let overlaps_previous = index
          .checked_sub(1)
          .and_then(|previous| self.regions.get(previous))
          .is_some_and(|region| region.end() > record.address);

        if overlaps_previous || record.end() > next_base(index) {
          policy.violation(
            report,
            Inconsistency::OverlappingReserve {
              address: record.address,
              size: record.size,
            },
          );
          return Ok(());
        }

        self.regions.insert(
          index,
          VmRegion {
            base: record.address,
            call_site: record.call_site,
            category: record.category,
            committed: 0,
            reserved: record.size,
          },
        )
      }
    }
  }

  fn tag(
    &mut self,
    index: usize,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) {
    let Some(region) = self.regions.get_mut(index) else {
      return;
    };

    if region.category == MemoryCategory::Untagged {
      region.category = record.category;
    } else if region.category != record.category {
      let found = Inconsistency::Retag {
        base: region.base,
        from: region.category,
        to: record.category,
      };
      policy.violation(report, found);
    }
  }

  fn uncommit(
    &mut self,
    index: usize,
    record: &EventRecord,
    policy: &ConsistencyPolicy,
    report: &mut PromoteReport,
  ) {
    let Some(region) = self.regions.get_mut(index) else {
      return;
    };

    if region.category == MemoryCategory::ThreadStack
      && policy.thread_stacks == ThreadStackPolicy::WholeStack
    {
      if record.size == region.committed {
        region.committed = 0;
      }
      return;
    }

    if record.size > region.committed {
      let found = Inconsistency::UncommitBeyondCommitted {
        base: region.base,
        committed: region.committed,
        size: record.size,
      };
      region.committed = 0;
      policy.violation(report, found);
      return;
    }

    region.committed -= record.size;
  }
}
