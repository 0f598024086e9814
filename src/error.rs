use super::*;

/// A recorder has no room left; hand it off and retry with a fresh one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Full;

impl Display for Full {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str("recorder is full")
  }
}

impl std::error::Error for Full {}

/// The sequence counter left the signed 64-bit range.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SequenceOverflow;

impl Display for SequenceOverflow {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str("sequence counter overflowed")
  }
}

impl std::error::Error for SequenceOverflow {}

/// Every generation slot is occupied; consolidation cannot keep up.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GenerationsExhausted;

impl Display for GenerationsExhausted {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str("all generation slots are in use")
  }
}

impl std::error::Error for GenerationsExhausted {}

/// Failure to store a record in an [`EventArray`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArrayError {
  /// A fixed-capacity array reached its limit.
  Full,
  /// Growing the backing storage failed.
  OutOfMemory,
}

impl Display for ArrayError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Full => f.write_str("event array is at capacity"),
      Self::OutOfMemory => {
        f.write_str("failed to allocate event array storage")
      }
    }
  }
}

impl std::error::Error for ArrayError {}

/// Errors surfaced by [`MemTracker`] queries.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrackerError {
  /// Tracking is not running; carries the reason it stopped, if it did.
  NotTracking(Option<ShutdownReason>),
}

impl Display for TrackerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::NotTracking(Some(reason)) => {
        write!(f, "memory tracking is not running: {reason}")
      }
      Self::NotTracking(None) => f.write_str("memory tracking is not running"),
    }
  }
}

impl std::error::Error for TrackerError {}

/// Errors that can occur when exporting or streaming baselines.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode baseline as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}
