use super::*;

/// Unique identifier for an interned call site.
pub type CallSiteId = u64;

/// Distance between an arena object and the size record that tracks it.
pub const ARENA_SIZE_OFFSET: usize = size_of::<usize>();

/// An unsequenced event as reported by an allocation site.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Event {
  pub address: usize,
  pub arena: bool,
  pub call_site: Option<CallSiteId>,
  pub category: MemoryCategory,
  pub kind: EventKind,
  pub size: u64,
}

impl From<EventKind> for Event {
  fn from(kind: EventKind) -> Self {
    Self::new(kind)
  }
}

impl Event {
  #[must_use]
  pub fn address(mut self, address: usize) -> Self {
    self.address = address;
    self
  }

  /// Shorthand for an allocation of `size` bytes at `address`.
  #[must_use]
  pub fn allocate(address: usize, size: u64, category: MemoryCategory) -> Self {
    Self::new(EventKind::Allocate)
      .address(address)
      .size(size)
      .category(category)
  }

  /// Marks an allocation as an arena object whose payload size is reported
  /// separately through [`EventKind::ArenaSizeUpdate`].
  #[must_use]
  pub fn arena(mut self) -> Self {
    self.arena = true;
    self
  }

  /// Size update for the arena allocated at `arena_address`.
  #[must_use]
  pub fn arena_size(
    arena_address: usize,
    size: u64,
    category: MemoryCategory,
  ) -> Self {
    Self::new(EventKind::ArenaSizeUpdate)
      .address(arena_address.wrapping_add(ARENA_SIZE_OFFSET))
      .size(size)
      .category(category)
  }

  #[must_use]
  pub fn call_site(mut self, call_site: CallSiteId) -> Self {
    self.call_site = Some(call_site);
    self
  }

  #[must_use]
  pub fn category(mut self, category: MemoryCategory) -> Self {
    self.category = category;
    self
  }

  #[must_use]
  pub fn free(address: usize) -> Self {
    Self::new(EventKind::Free).address(address)
  }

  #[must_use]
  pub fn new(kind: EventKind) -> Self {
    Self {
      address: 0,
      arena: false,
      call_site: None,
      category: MemoryCategory::Untagged,
      kind,
      size: 0,
    }
  }

  #[must_use]
  pub fn sequenced(self, seq: u64) -> EventRecord {
    EventRecord {
      address: self.address,
      allocated_in_generation: false,
      arena: self.arena,
      call_site: self.call_site,
      category: self.category,
      op: self.kind,
      seq,
      size: self.size,
    }
  }

  #[must_use]
  pub fn size(mut self, size: u64) -> Self {
    self.size = size;
    self
  }

  /// Shorthand for a virtual memory operation over `[address, address + size)`.
  #[must_use]
  pub fn virtual_memory(kind: EventKind, address: usize, size: u64) -> Self {
    debug_assert_eq!(kind.domain(), Domain::VirtualMemory);
    Self::new(kind).address(address).size(size)
  }
}

/// An event stamped with its position in the current generation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct EventRecord {
  pub address: usize,
  /// Set on a free that superseded an allocation of the same block within
  /// one generation.
  #[serde(skip)]
  pub allocated_in_generation: bool,
  pub arena: bool,
  pub call_site: Option<CallSiteId>,
  pub category: MemoryCategory,
  pub op: EventKind,
  pub seq: u64,
  pub size: u64,
}

impl EventRecord {
  /// Canonical order: address, then tag priority, then sequence number.
  #[must_use]
  pub fn canonical_cmp(&self, other: &Self) -> CmpOrdering {
    self
      .merge_key()
      .cmp(&other.merge_key())
      .then(self.seq.cmp(&other.seq))
  }

  /// Collapses two records sharing a merge key into the newer one.
  ///
  /// A free that wins over an allocation remembers it, so promotion can tell
  /// a short-lived block from a free of something it never saw. The result
  /// does not depend on which record is passed first.
  #[must_use]
  pub fn collapse(self, other: Self) -> Self {
    let (mut newer, older) = if other.seq > self.seq {
      (other, self)
    } else {
      (self, other)
    };

    if newer.op == EventKind::Free {
      newer.allocated_in_generation |=
        older.op == EventKind::Allocate || older.allocated_in_generation;
    } else {
      newer.allocated_in_generation = false;
    }

    newer
  }

  #[must_use]
  pub fn domain(&self) -> Domain {
    self.op.domain()
  }

  /// Exclusive end of the range this record covers.
  #[must_use]
  pub fn end(&self) -> usize {
    span_end(self.address, self.size)
  }

  /// Whether `self` is the size record belonging to the arena `owner`.
  #[must_use]
  pub fn is_arena_size_of(&self, owner: &EventRecord) -> bool {
    self.op == EventKind::ArenaSizeUpdate
      && owner.op == EventKind::Allocate
      && owner.arena
      && owner.address.checked_add(ARENA_SIZE_OFFSET) == Some(self.address)
  }

  /// Two records with the same merge key describe the same logical slot; only
  /// the one with the highest sequence number survives consolidation.
  #[must_use]
  pub fn merge_key(&self) -> (usize, u8) {
    (self.address, self.op.tag_priority())
  }
}

pub(crate) fn span_end(address: usize, size: u64) -> usize {
  address.saturating_add(usize::try_from(size).unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn canonical_order_breaks_ties_by_priority_then_sequence() {
    let alloc = Event::allocate(0x10, 8, MemoryCategory::Internal).sequenced(9);
    let size = Event::arena_size(0x8, 64, MemoryCategory::Internal).sequenced(1);
    let later_alloc =
      Event::allocate(0x10, 16, MemoryCategory::Internal).sequenced(10);

    assert_eq!(alloc.address, size.address);
    assert_eq!(alloc.canonical_cmp(&size), CmpOrdering::Less);
    assert_eq!(alloc.canonical_cmp(&later_alloc), CmpOrdering::Less);
    assert_eq!(later_alloc.canonical_cmp(&alloc), CmpOrdering::Greater);
  }

  #[test]
  fn arena_size_record_points_behind_its_arena() {
    let arena = Event::allocate(0x100, 32, MemoryCategory::Arena)
      .arena()
      .sequenced(1);
    let size = Event::arena_size(0x100, 4096, MemoryCategory::Arena).sequenced(2);
    let plain = Event::allocate(0x100, 32, MemoryCategory::Arena).sequenced(3);

    assert!(size.is_arena_size_of(&arena));
    assert!(!size.is_arena_size_of(&plain));
  }

  #[test]
  fn span_end_saturates() {
    assert_eq!(span_end(usize::MAX - 1, 10), usize::MAX);
    assert_eq!(span_end(0x1000, 0x10), 0x1010);
  }
}
