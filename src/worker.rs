use super::*;

/// Outcome of one consolidation step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum WorkerStep {
  /// Something was merged or promoted; try again right away.
  Progress,
  /// Nothing is pending.
  Idle,
  /// Tracking is over; the worker should exit.
  Stop,
}

/// State the consolidation worker drives.
pub(crate) trait ConsolidationTarget: Send + Sync + 'static {
  /// Runs the last drain and releases tracking structures.
  fn finish_shutdown(&self);

  fn shutdown_requested(&self) -> bool;

  fn step(&self) -> WorkerStep;
}

/// Wakes the worker before its idle timeout expires.
#[derive(Debug, Default)]
pub(crate) struct WorkerSignal {
  pending: Mutex<bool>,
  wakeup: Condvar,
}

impl WorkerSignal {
  pub(crate) fn notify(&self) {
    *lock(&self.pending) = true;
    self.wakeup.notify_one();
  }

  /// Blocks until notified or `timeout` passes. A notification sent while
  /// nobody was waiting is not lost.
  pub(crate) fn wait(&self, timeout: Duration) {
    let mut pending = lock(&self.pending);

    if !*pending {
      pending = match self.wakeup.wait_timeout(pending, timeout) {
        Ok((guard, _)) => guard,
        Err(err) => err.into_inner().0,
      };
    }

    *pending = false;
  }
}

/// Starts the background consolidation thread.
///
/// The thread only holds a weak reference between steps, so it exits on its
/// own once the tracker is dropped.
pub(crate) fn spawn<T: ConsolidationTarget>(
  target: Weak<T>,
  signal: Arc<WorkerSignal>,
  idle_wait: Duration,
) -> io::Result<JoinHandle<()>> {
  thread::Builder::new()
    .name("memtrack-consolidation".into())
    .spawn(move || {
      debug!("consolidation worker started");
      worker_loop(&target, &signal, idle_wait);
      debug!("consolidation worker exiting");
    })
}

fn worker_loop<T: ConsolidationTarget>(
  target: &Weak<T>,
  signal: &WorkerSignal,
  idle_wait: Duration,
) {
  loop {
    let Some(target) = target.upgrade() else {
      return;
    };

    if target.shutdown_requested() {
      target.finish_shutdown();
      return;
    }

    match target.step() {
      WorkerStep::Progress => {}
      WorkerStep::Idle => {
        drop(target);
        signal.wait(idle_wait);
      }
      WorkerStep::Stop => return,
    }
  }
}
