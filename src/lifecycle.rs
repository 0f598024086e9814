use super::*;

/// Tracker lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Lifecycle {
  Uninitialized = 0,
  Bootstrapping = 1,
  Running = 2,
  /// Recording has stopped; the worker has not started draining yet.
  ShutdownPending = 3,
  /// Pending generations are being consolidated one last time.
  Draining = 4,
  Shutdown = 5,
}

impl Lifecycle {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => Self::Uninitialized,
      1 => Self::Bootstrapping,
      2 => Self::Running,
      3 => Self::ShutdownPending,
      4 => Self::Draining,
      _ => Self::Shutdown,
    }
  }

  /// Whether events are still accepted.
  #[must_use]
  pub fn is_recording(self) -> bool {
    self == Self::Running
  }
}

impl Display for Lifecycle {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Uninitialized => "uninitialized",
      Self::Bootstrapping => "bootstrapping",
      Self::Running => "running",
      Self::ShutdownPending => "shutdown pending",
      Self::Draining => "draining",
      Self::Shutdown => "shutdown",
    })
  }
}

/// Why tracking stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ShutdownReason {
  /// [`MemTracker::shutdown`] was called.
  Requested = 1,
  /// The tracker was configured with [`TrackingLevel::Off`].
  Disabled = 2,
  /// Every generation slot was occupied when a sync tried to close one.
  GenerationsExhausted = 3,
  SequenceOverflow = 4,
  /// Tracker storage could not be allocated.
  OutOfMemory = 5,
  /// The consolidation thread could not be started.
  WorkerUnavailable = 6,
  /// Strict consistency checking found a snapshot violation.
  ConsistencyViolation = 7,
}

impl ShutdownReason {
  fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(Self::Requested),
      2 => Some(Self::Disabled),
      3 => Some(Self::GenerationsExhausted),
      4 => Some(Self::SequenceOverflow),
      5 => Some(Self::OutOfMemory),
      6 => Some(Self::WorkerUnavailable),
      7 => Some(Self::ConsistencyViolation),
      _ => None,
    }
  }

  /// Whether the reason is an error condition rather than a request.
  #[must_use]
  pub fn is_fatal(self) -> bool {
    !matches!(self, Self::Requested | Self::Disabled)
  }
}

impl Display for ShutdownReason {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Requested => "shutdown requested",
      Self::Disabled => "tracking disabled",
      Self::GenerationsExhausted => "generation slots exhausted",
      Self::SequenceOverflow => "sequence counter overflowed",
      Self::OutOfMemory => "out of memory",
      Self::WorkerUnavailable => "consolidation worker unavailable",
      Self::ConsistencyViolation => "snapshot consistency violated",
    })
  }
}

/// Atomic holder of the lifecycle state and the first shutdown reason.
#[derive(Debug)]
pub(crate) struct LifecycleCell {
  reason: AtomicU8,
  state: AtomicU8,
}

impl LifecycleCell {
  /// Moves from `from` to `to`. Returns whether this call made the move.
  pub(crate) fn advance(&self, from: Lifecycle, to: Lifecycle) -> bool {
    debug_assert!(from < to, "lifecycle only moves forward");

    let moved = self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();

    if moved {
      info!(%from, %to, "tracker lifecycle transition");
    }

    moved
  }

  pub(crate) fn get(&self) -> Lifecycle {
    Lifecycle::from_u8(self.state.load(Ordering::Acquire))
  }

  pub(crate) fn new() -> Self {
    Self {
      reason: AtomicU8::new(0),
      state: AtomicU8::new(Lifecycle::Uninitialized as u8),
    }
  }

  pub(crate) fn reason(&self) -> Option<ShutdownReason> {
    ShutdownReason::from_u8(self.reason.load(Ordering::Acquire))
  }

  /// Stops recording. The first reason recorded is kept; later requests only
  /// succeed in moving the state if it has not left `Running` yet.
  ///
  /// Returns whether this call initiated the shutdown.
  pub(crate) fn request_shutdown(&self, reason: ShutdownReason) -> bool {
    let _ = self.reason.compare_exchange(
      0,
      reason as u8,
      Ordering::AcqRel,
      Ordering::Acquire,
    );

    let initiated = [Lifecycle::Bootstrapping, Lifecycle::Running]
      .into_iter()
      .any(|from| self.advance(from, Lifecycle::ShutdownPending));

    if initiated && reason.is_fatal() {
      warn!(%reason, "memory tracking stopped");
    }

    initiated
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn walks_forward_through_shutdown() {
    let cell = LifecycleCell::new();
    assert_eq!(cell.get(), Lifecycle::Uninitialized);

    assert!(cell.advance(Lifecycle::Uninitialized, Lifecycle::Bootstrapping));
    assert!(cell.advance(Lifecycle::Bootstrapping, Lifecycle::Running));
    assert!(cell.get().is_recording());

    assert!(!cell.advance(Lifecycle::Bootstrapping, Lifecycle::Running));

    assert!(cell.request_shutdown(ShutdownReason::Requested));
    assert_eq!(cell.get(), Lifecycle::ShutdownPending);
    assert!(!cell.get().is_recording());

    assert!(cell.advance(Lifecycle::ShutdownPending, Lifecycle::Draining));
    assert!(cell.advance(Lifecycle::Draining, Lifecycle::Shutdown));
    assert_eq!(cell.get(), Lifecycle::Shutdown);
  }

  #[test]
  fn first_shutdown_reason_wins() {
    let cell = LifecycleCell::new();
    cell.advance(Lifecycle::Uninitialized, Lifecycle::Bootstrapping);
    cell.advance(Lifecycle::Bootstrapping, Lifecycle::Running);

    assert!(cell.request_shutdown(ShutdownReason::SequenceOverflow));
    assert!(!cell.request_shutdown(ShutdownReason::Requested));

    assert_eq!(cell.reason(), Some(ShutdownReason::SequenceOverflow));
  }

  #[test]
  fn shutdown_during_bootstrap_is_allowed() {
    let cell = LifecycleCell::new();
    cell.advance(Lifecycle::Uninitialized, Lifecycle::Bootstrapping);

    assert!(cell.request_shutdown(ShutdownReason::OutOfMemory));
    assert_eq!(cell.get(), Lifecycle::ShutdownPending);
    assert!(ShutdownReason::OutOfMemory.is_fatal());
    assert!(!ShutdownReason::Disabled.is_fatal());
  }

  #[test]
  fn consistency_violation_round_trips_through_the_cell() {
    let cell = LifecycleCell::new();
    cell.advance(Lifecycle::Uninitialized, Lifecycle::Bootstrapping);
    cell.advance(Lifecycle::Bootstrapping, Lifecycle::Running);

    assert!(cell.request_shutdown(ShutdownReason::ConsistencyViolation));
    assert_eq!(cell.reason(), Some(ShutdownReason::ConsistencyViolation));
    assert!(ShutdownReason::ConsistencyViolation.is_fatal());
    assert_eq!(
      ShutdownReason::ConsistencyViolation.to_string(),
      "snapshot consistency violated"
    );
  }
}
