use super::*;

/// Closed classification of why a piece of native memory exists.
#[derive(
  Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
  Heap,
  ThreadStack,
  Code,
  Gc,
  Compiler,
  ClassMetadata,
  Internal,
  Symbol,
  Arena,
  Other,
  TrackingOverhead,
  FreeChunkPool,
  /// A virtual memory region whose category has not been assigned yet.
  Untagged,
}

impl Display for MemoryCategory {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl MemoryCategory {
  pub const ALL: [MemoryCategory; 13] = [
    Self::Heap,
    Self::ThreadStack,
    Self::Code,
    Self::Gc,
    Self::Compiler,
    Self::ClassMetadata,
    Self::Internal,
    Self::Symbol,
    Self::Arena,
    Self::Other,
    Self::TrackingOverhead,
    Self::FreeChunkPool,
    Self::Untagged,
  ];

  /// Position of this category in [`MemoryCategory::ALL`].
  #[must_use]
  pub fn index(self) -> usize {
    self as usize
  }

  #[must_use]
  pub fn name(self) -> &'static str {
    match self {
      Self::Heap => "heap",
      Self::ThreadStack => "thread_stack",
      Self::Code => "code",
      Self::Gc => "gc",
      Self::Compiler => "compiler",
      Self::ClassMetadata => "class_metadata",
      Self::Internal => "internal",
      Self::Symbol => "symbol",
      Self::Arena => "arena",
      Self::Other => "other",
      Self::TrackingOverhead => "tracking_overhead",
      Self::FreeChunkPool => "free_chunk_pool",
      Self::Untagged => "untagged",
    }
  }
}

/// The table an event is resolved against.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
  Malloc,
  VirtualMemory,
}

/// Operation carried by an event.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  Allocate,
  Free,
  Reserve,
  Commit,
  Uncommit,
  Release,
  TagType,
  ArenaSizeUpdate,
}

impl EventKind {
  #[must_use]
  pub fn domain(self) -> Domain {
    match self {
      Self::Allocate | Self::Free | Self::ArenaSizeUpdate => Domain::Malloc,
      Self::Reserve
      | Self::Commit
      | Self::Uncommit
      | Self::Release
      | Self::TagType => Domain::VirtualMemory,
    }
  }

  #[must_use]
  pub fn is_malloc(self) -> bool {
    self.domain() == Domain::Malloc
  }

  /// Tie-breaker between records at the same address.
  ///
  /// `Free` shares the allocation class so that the latest of an allocate /
  /// free pair at one address always wins on sequence number, whichever order
  /// they happened in. Arena size updates sort after everything else so that
  /// they land directly behind the arena they belong to.
  #[must_use]
  pub fn tag_priority(self) -> u8 {
    match self {
      Self::Allocate | Self::Free | Self::Reserve => 0,
      Self::Commit => 1,
      Self::TagType => 2,
      Self::Uncommit => 3,
      Self::Release => 4,
      Self::ArenaSizeUpdate => 5,
    }
  }
}
