use super::*;

/// Stamps every event with its position in the current generation.
///
/// Values start at 1; 0 means "unsequenced". The counter is only reset while
/// every writer is paused, so within a generation the values handed out are
/// unique and increase in each thread's program order.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
  counter: AtomicU64,
}

impl SequenceGenerator {
  /// Largest value a sequence number may take.
  pub const LIMIT: u64 = i64::MAX as u64;

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the next sequence number.
  ///
  /// # Errors
  ///
  /// Returns [`SequenceOverflow`] once the counter passes
  /// [`SequenceGenerator::LIMIT`]; the caller must stop tracking.
  pub fn next(&self) -> Result<u64, SequenceOverflow> {
    let seq = self.counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);

    if seq > Self::LIMIT {
      return Err(SequenceOverflow);
    }

    Ok(seq)
  }

  /// Last value handed out, or 0 right after a reset.
  #[must_use]
  pub fn peek(&self) -> u64 {
    self.counter.load(Ordering::Relaxed).min(Self::LIMIT)
  }

  /// Starts a new generation. Only valid while writers are paused.
  pub fn reset(&self) {
    self.counter.store(0, Ordering::Relaxed);
  }

  #[cfg(test)]
  #[must_use]
  pub(crate) fn starting_at(value: u64) -> Self {
    Self {
      counter: AtomicU64::new(value),
    }
  }
}
