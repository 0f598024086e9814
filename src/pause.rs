use super::*;

/// Brings every event writer to quiescence around a sync.
///
/// A host with its own safepoint mechanism implements this directly and
/// leaves [`PauseCoordinator::enter_writer`] at its default; without one, the
/// [`WriterGate`] provides the same guarantee in-process.
pub trait PauseCoordinator: Send + Sync + fmt::Debug {
  /// Runs `action` while no writer is inside a recording critical section.
  fn with_paused_world(&self, action: &mut dyn FnMut());

  /// Marks the calling thread as recording until the ticket drops.
  fn enter_writer(&self) -> WriterTicket<'_> {
    WriterTicket::unguarded()
  }
}

/// Proof that the holder may touch its recorder slot.
#[derive(Debug)]
pub struct WriterTicket<'a> {
  _guard: Option<RwLockReadGuard<'a, ()>>,
}

impl<'a> WriterTicket<'a> {
  #[must_use]
  pub fn unguarded() -> Self {
    Self { _guard: None }
  }

  fn guarded(guard: RwLockReadGuard<'a, ()>) -> Self {
    Self {
      _guard: Some(guard),
    }
  }
}

/// In-process pause: writers share a read lock, a sync takes it exclusively.
#[derive(Debug, Default)]
pub struct WriterGate {
  gate: RwLock<()>,
  pauses: AtomicU64,
}

impl WriterGate {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of completed pauses.
  #[must_use]
  pub fn pauses(&self) -> u64 {
    self.pauses.load(Ordering::Relaxed)
  }
}

impl PauseCoordinator for WriterGate {
  fn enter_writer(&self) -> WriterTicket<'_> {
    WriterTicket::guarded(read(&self.gate))
  }

  fn with_paused_world(&self, action: &mut dyn FnMut()) {
    let _paused = write(&self.gate);
    action();
    self.pauses.fetch_add(1, Ordering::Relaxed);
  }
}

/// Coordinator for hosts that only ever call [`MemTracker::sync`] from inside
/// their own stop-the-world pause.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPaused;

impl PauseCoordinator for HostPaused {
  fn with_paused_world(&self, action: &mut dyn FnMut()) {
    action();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pause_waits_for_writers_to_leave() {
    let gate = Arc::new(WriterGate::new());
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|scope| {
      scope.spawn({
        let gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        move || {
          let _ticket = gate.enter_writer();
          entered_tx.send(()).expect("send");
          release_rx.recv().expect("recv");
          lock(&order).push("writer done");
        }
      });

      entered_rx.recv().expect("writer entered");

      scope.spawn({
        let gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        move || {
          gate.with_paused_world(&mut || lock(&order).push("paused"));
        }
      });

      thread::sleep(Duration::from_millis(20));
      release_tx.send(()).expect("release");
    });

    assert_eq!(*lock(&order), vec!["writer done", "paused"]);
    assert_eq!(gate.pauses(), 1);
  }

  #[test]
  fn host_paused_runs_action_inline() {
    let mut ran = false;
    HostPaused.with_paused_world(&mut || {
      ran = true;
    });
    let _ticket = HostPaused.enter_writer();
    assert!(ran);
  }
}
