use super::*;

/// How much the tracker records.
#[derive(
  Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrackingLevel {
  /// Nothing is recorded; the tracker starts out shut down.
  Off,
  /// Per-category totals only; call sites are discarded on record.
  #[default]
  Summary,
  /// Per-category totals plus per-call-site rollups.
  Detail,
}

/// How commit/uncommit events on thread-stack regions are applied.
#[derive(
  Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStackPolicy {
  /// A stack counts as committed as a whole. Commits only apply while nothing
  /// is committed, uncommits only when they match the committed size, so
  /// guard-page churn does not move the totals.
  #[default]
  WholeStack,
  /// Treat thread stacks like any other region.
  Exact,
}

/// Controls how the tracker collects and consolidates events.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
  /// Number of frames kept per captured call site.
  pub call_site_depth: u16,
  /// Frames skipped at the top of a captured stack.
  pub call_site_skip: usize,
  /// How long the worker sleeps when there is nothing to drain.
  pub idle_wait: Duration,
  pub level: TrackingLevel,
  /// Slots in the generation ring. Running out is fatal to tracking.
  pub max_generations: usize,
  /// Idle recorders kept per registered thread.
  pub pool_factor: usize,
  /// Events held by one per-thread recorder before it must be handed off.
  pub recorder_capacity: usize,
  /// Events held by the shared fallback recorder before it hands itself off.
  pub shared_recorder_capacity: usize,
  /// Minimum bytes a call site must account for to appear in a detail
  /// baseline.
  pub site_threshold: u64,
  /// Whether the background consolidation thread is started.
  pub spawn_worker: bool,
  /// Panic on snapshot inconsistencies instead of clamping them.
  pub strict_consistency: bool,
  pub thread_stack_policy: ThreadStackPolicy,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      call_site_depth: 4,
      call_site_skip: 2,
      idle_wait: Duration::from_secs(1),
      level: TrackingLevel::Summary,
      max_generations: 32,
      pool_factor: 2,
      recorder_capacity: 512,
      shared_recorder_capacity: 4096,
      site_threshold: 1024,
      spawn_worker: true,
      strict_consistency: cfg!(debug_assertions),
      thread_stack_policy: ThreadStackPolicy::WholeStack,
    }
  }
}

impl TrackerConfig {
  /// Builder-style helper to pick the tracking level.
  #[must_use]
  pub fn with_level(mut self, level: TrackingLevel) -> Self {
    self.level = level;
    self
  }

  /// Runs consolidation only when [`MemTracker::consolidate`] is called.
  #[must_use]
  pub fn without_worker(mut self) -> Self {
    self.spawn_worker = false;
    self
  }
}
