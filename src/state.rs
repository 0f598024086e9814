use super::*;

/// Thin builder that customizes [`TrackerConfig`] without exposing all knobs
/// up front.
#[derive(Debug, Default)]
pub struct MemTrackerBuilder {
  config: TrackerConfig,
  pause: Option<Arc<dyn PauseCoordinator>>,
  #[cfg(test)]
  sequence: Option<SequenceGenerator>,
}

impl MemTrackerBuilder {
  #[must_use]
  pub fn finish(self) -> MemTracker {
    let pause = self
      .pause
      .unwrap_or_else(|| Arc::new(WriterGate::new()) as Arc<dyn PauseCoordinator>);

    #[cfg(test)]
    let sequence = self.sequence.unwrap_or_default();
    #[cfg(not(test))]
    let sequence = SequenceGenerator::new();

    MemTracker::bootstrap(self.config, pause, sequence)
  }

  #[must_use]
  pub fn level(mut self, level: TrackingLevel) -> Self {
    self.config.level = level;
    self
  }

  #[must_use]
  pub fn max_generations(mut self, slots: usize) -> Self {
    self.config.max_generations = slots;
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces the in-process [`WriterGate`] with a host-provided pause.
  #[must_use]
  pub fn pause_coordinator(mut self, pause: Arc<dyn PauseCoordinator>) -> Self {
    self.pause = Some(pause);
    self
  }

  #[must_use]
  pub fn recorder_capacity(mut self, events: usize) -> Self {
    self.config.recorder_capacity = events;
    self
  }

  #[cfg(test)]
  #[must_use]
  pub(crate) fn sequence(mut self, sequence: SequenceGenerator) -> Self {
    self.sequence = Some(sequence);
    self
  }

  #[must_use]
  pub fn spawn_worker(mut self, spawn: bool) -> Self {
    self.config.spawn_worker = spawn;
    self
  }

  #[must_use]
  pub fn strict_consistency(mut self, strict: bool) -> Self {
    self.config.strict_consistency = strict;
    self
  }

  #[must_use]
  pub fn thread_stack_policy(mut self, policy: ThreadStackPolicy) -> Self {
    self.config.thread_stack_policy = policy;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: TrackerConfig) -> Self {
    self.config = config;
    self
  }
}

/// Point-in-time view of the tracker's own state.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct TrackerStatus {
  pub epoch: u64,
  pub events_recorded: u64,
  pub hand_offs: u64,
  pub inconsistencies: u64,
  pub level: TrackingLevel,
  pub lifecycle: Lifecycle,
  pub pending_generations: usize,
  pub pooled_recorders: usize,
  pub promotions: u64,
  pub queued_recorders: usize,
  pub reason: Option<ShutdownReason>,
  pub registered_threads: usize,
  pub short_lived: u64,
  pub stale_dropped: u64,
  pub tracker_overhead: u64,
  pub untracked_frees: u64,
}

#[derive(Debug, Default)]
struct Counters {
  events_recorded: AtomicU64,
  hand_offs: AtomicU64,
  inconsistencies: AtomicU64,
  short_lived: AtomicU64,
  stale_dropped: AtomicU64,
  untracked_frees: AtomicU64,
}

impl Counters {
  fn absorb(&self, report: &PromoteReport) {
    let add = |counter: &AtomicU64, value: usize| {
      counter.fetch_add(value as u64, Ordering::Relaxed);
    };

    add(&self.inconsistencies, report.inconsistencies.len());
    add(&self.short_lived, report.short_lived);
    add(&self.stale_dropped, report.stale_dropped);
    add(&self.untracked_frees, report.untracked_frees);
  }
}

#[derive(Debug, Default)]
struct Consolidation {
  snapshot: Snapshot,
  staging: StagingArea,
}

/// Recorder slot owned by one registered thread.
#[derive(Debug, Default)]
struct ThreadSlot {
  recorder: Mutex<Option<Recorder>>,
}

#[derive(Debug)]
struct TrackerInner {
  collector: CallSiteCollector,
  config: TrackerConfig,
  consistency: ConsistencyPolicy,
  consolidation: RwLock<Consolidation>,
  counters: Counters,
  epoch: AtomicU64,
  final_summary: Mutex<Option<Baseline>>,
  generations: Mutex<GenerationRing>,
  lifecycle: LifecycleCell,
  next_thread: AtomicU64,
  pause: Arc<dyn PauseCoordinator>,
  pool: RecorderPool,
  sequence: SequenceGenerator,
  shared: Mutex<Option<Recorder>>,
  signal: Arc<WorkerSignal>,
  threads: DashMap<u64, Arc<ThreadSlot>, BuildNoHashHasher<u64>>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerInner {
  /// Merges every queued recorder and promotes every closed generation, then
  /// folds whatever is left of the open generation in as well.
  fn drain_everything(&self) {
    while self.step() == WorkerStep::Progress {}

    let mut consolidation = write(&self.consolidation);
    let leftovers = lock(&self.generations).drain_recorders();

    for mut recorder in leftovers {
      if consolidation.staging.merge(recorder.drain_sorted()).is_err() {
        warn!("dropping events that could not be staged during shutdown");
      }
    }

    if consolidation.staging.is_empty() {
      return;
    }

    let epoch = lock(&self.generations).tail_epoch();
    self.promote_staged(&mut *consolidation, epoch);
  }

  /// Queues a recorder into the open generation.
  fn enqueue(&self, recorder: Recorder) {
    if recorder.is_empty() {
      self.pool.release(recorder);
      return;
    }

    let events = recorder.len();
    lock(&self.generations).enqueue(recorder);
    self.counters.hand_offs.fetch_add(1, Ordering::Relaxed);
    debug!(events, "recorder handed off");
    self.signal.notify();
  }

  /// Stops tracking because of a fatal condition.
  fn fail(&self, reason: ShutdownReason) {
    if self.lifecycle.request_shutdown(reason) {
      self.signal.notify();
    }
  }

  fn is_recording(&self) -> bool {
    self.lifecycle.get().is_recording()
  }

  fn memory_footprint(&self, consolidation: &Consolidation) -> u64 {
    let bytes = consolidation
      .snapshot
      .memory_footprint()
      .saturating_add(consolidation.staging.memory_footprint())
      .saturating_add(self.pool.memory_footprint());

    u64::try_from(bytes).unwrap_or(u64::MAX)
  }

  /// Applies the tracking level to an incoming event.
  fn prepare(&self, mut event: Event) -> Event {
    if self.config.level != TrackingLevel::Detail {
      event.call_site = None;
    }

    event
  }

  /// Promotes the staged generation into the snapshot and empties staging.
  ///
  /// A strict consistency violation panics inside the promotion; it is caught
  /// here and stops tracking, so neither the worker nor a caller of
  /// [`MemTracker::consolidate`] unwinds.
  fn promote_staged(&self, consolidation: &mut Consolidation, epoch: u64) {
    let Consolidation { snapshot, staging } = consolidation;

    let promoted = panic::catch_unwind(AssertUnwindSafe(|| {
      snapshot.promote(staging, &self.consistency, epoch)
    }));

    match promoted {
      Ok(Ok(report)) => {
        self.counters.absorb(&report);
        debug!(
          epoch,
          live = snapshot.malloc_records().len(),
          regions = snapshot.regions().len(),
          "generation promoted"
        );
      }
      Ok(Err(_)) => self.fail(ShutdownReason::OutOfMemory),
      Err(_) => {
        error!(epoch, "snapshot consistency violated during promotion");
        self.fail(ShutdownReason::ConsistencyViolation);
      }
    }

    staging.clear();
  }

  /// Appends to a recorder, acquiring one first if the slot is empty.
  fn record_into(
    &self,
    slot: &mut Option<Recorder>,
    event: Event,
    fresh: impl FnOnce(u64) -> Result<Recorder, ArrayError>,
  ) -> Result<(), Full> {
    let epoch = self.epoch.load(Ordering::Acquire);

    if slot.is_none() {
      match fresh(epoch) {
        Ok(recorder) => *slot = Some(recorder),
        Err(_) => {
          self.fail(ShutdownReason::OutOfMemory);
          return Ok(());
        }
      }
    }

    let Some(recorder) = slot.as_mut() else {
      return Ok(());
    };

    if recorder.is_full() {
      return Err(Full);
    }

    let seq = match self.sequence.next() {
      Ok(seq) => seq,
      Err(SequenceOverflow) => {
        self.fail(ShutdownReason::SequenceOverflow);
        return Ok(());
      }
    };

    match recorder.record(event, seq, epoch) {
      Ok(()) => {
        self.counters.events_recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
      }
      Err(ArrayError::Full) => Err(Full),
      Err(ArrayError::OutOfMemory) => {
        self.fail(ShutdownReason::OutOfMemory);
        Ok(())
      }
    }
  }

  /// Records through the shared fallback recorder.
  fn record_shared(&self, event: Event) {
    let mut shared = lock(&self.shared);
    let capacity = self.config.shared_recorder_capacity;
    let fresh = |epoch| Recorder::fixed(capacity, epoch);

    if self.record_into(&mut *shared, event, fresh).is_ok() {
      return;
    }

    if let Some(full) = shared.take() {
      self.enqueue(full);
    }

    if self.record_into(&mut *shared, event, fresh).is_err() {
      trace!("shared recorder rejected an event after hand-off");
    }
  }

  /// Empties every thread slot and the shared recorder.
  fn take_open_recorders(&self) -> Vec<Recorder> {
    let slots = self
      .threads
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect::<Vec<_>>();

    let mut open = slots
      .iter()
      .filter_map(|slot| lock(&slot.recorder).take())
      .collect::<Vec<_>>();

    if let Some(shared) = lock(&self.shared).take() {
      open.push(shared);
    }

    open
  }

  /// Moves every open recorder into the tail generation and closes it.
  /// Must run inside a pause.
  fn sync_paused(&self) -> Result<u64, TrackerError> {
    if !self.is_recording() {
      return Err(TrackerError::NotTracking(self.lifecycle.reason()));
    }

    let open = self.take_open_recorders();
    let mut generations = lock(&self.generations);

    for recorder in open {
      if recorder.is_empty() {
        self.pool.release(recorder);
      } else {
        generations.enqueue(recorder);
      }
    }

    let next_epoch = self.epoch.load(Ordering::Acquire).saturating_add(1);

    match generations.close_tail(next_epoch) {
      Ok(closed) => {
        let pending = generations.pending_generations();
        drop(generations);

        self.sequence.reset();
        self.epoch.store(next_epoch, Ordering::Release);
        debug!(closed, pending, "generation closed");
        self.signal.notify();

        Ok(closed)
      }
      Err(GenerationsExhausted) => {
        drop(generations);
        self.fail(ShutdownReason::GenerationsExhausted);
        Err(TrackerError::NotTracking(self.lifecycle.reason()))
      }
    }
  }
}

impl ConsolidationTarget for TrackerInner {
  fn finish_shutdown(&self) {
    if !self
      .lifecycle
      .advance(Lifecycle::ShutdownPending, Lifecycle::Draining)
    {
      return;
    }

    self.pause.with_paused_world(&mut || {
      let open = self.take_open_recorders();
      let mut generations = lock(&self.generations);

      for recorder in open {
        generations.enqueue(recorder);
      }
    });

    self.drain_everything();

    {
      let mut consolidation = write(&self.consolidation);
      let summary = Baseline::from_snapshot(
        &consolidation.snapshot,
        &BaselineOptions {
          detail: false,
          site_threshold: self.config.site_threshold,
        },
      )
      .with_tracker_overhead(self.memory_footprint(&consolidation));

      *lock(&self.final_summary) = Some(summary);
      *consolidation = Consolidation::default();
    }

    self.pool.clear();

    self.lifecycle.advance(Lifecycle::Draining, Lifecycle::Shutdown);
  }

  fn shutdown_requested(&self) -> bool {
    self.lifecycle.get() == Lifecycle::ShutdownPending
  }

  fn step(&self) -> WorkerStep {
    if self.lifecycle.get() == Lifecycle::Shutdown {
      return WorkerStep::Stop;
    }

    let mut consolidation = write(&self.consolidation);
    let work = lock(&self.generations).next_work();

    match work {
      WorkItem::Merge(mut recorder) => {
        let merged = consolidation.staging.merge(recorder.drain_sorted());
        self.pool.release(recorder);

        if merged.is_err() {
          self.fail(ShutdownReason::OutOfMemory);
        }

        WorkerStep::Progress
      }
      WorkItem::Promote { epoch } => {
        self.promote_staged(&mut *consolidation, epoch);
        lock(&self.generations).advance_head();

        WorkerStep::Progress
      }
      WorkItem::Idle => WorkerStep::Idle,
    }
  }
}

impl Drop for TrackerInner {
  fn drop(&mut self) {
    self.signal.notify();
  }
}

/// Process-scoped memory tracking context.
///
/// Cloning is cheap; every clone refers to the same tracker.
#[derive(Clone, Debug)]
pub struct MemTracker {
  inner: Arc<TrackerInner>,
}

impl Default for MemTracker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemTracker {
  /// Summarizes the live snapshot.
  ///
  /// The baseline reflects the last promoted generation; call
  /// [`MemTracker::sync`] and let consolidation catch up first for an
  /// up-to-date view. Detail is only available at [`TrackingLevel::Detail`].
  /// After shutdown the retained final summary is returned for
  /// `detail == false`.
  ///
  /// # Errors
  ///
  /// Returns [`TrackerError::NotTracking`] when tracking is not running and no
  /// summary is available.
  pub fn baseline(&self, detail: bool) -> Result<Baseline, TrackerError> {
    let inner = &self.inner;

    match inner.lifecycle.get() {
      Lifecycle::Running => {
        let options = BaselineOptions {
          detail: detail && inner.config.level == TrackingLevel::Detail,
          site_threshold: inner.config.site_threshold,
        };

        let consolidation = read(&inner.consolidation);
        let overhead = inner.memory_footprint(&consolidation);

        Ok(
          Baseline::from_snapshot(&consolidation.snapshot, &options)
            .with_tracker_overhead(overhead),
        )
      }
      Lifecycle::Shutdown if !detail => self
        .final_summary()
        .ok_or(TrackerError::NotTracking(inner.lifecycle.reason())),
      _ => Err(TrackerError::NotTracking(inner.lifecycle.reason())),
    }
  }

  fn bootstrap(
    config: TrackerConfig,
    pause: Arc<dyn PauseCoordinator>,
    sequence: SequenceGenerator,
  ) -> Self {
    let consistency = ConsistencyPolicy {
      strict: config.strict_consistency,
      thread_stacks: config.thread_stack_policy,
    };

    let inner = Arc::new(TrackerInner {
      collector: CallSiteCollector::new(Arc::new(CallSiteTable::new()), &config),
      consistency,
      consolidation: RwLock::new(Consolidation::default()),
      counters: Counters::default(),
      epoch: AtomicU64::new(1),
      final_summary: Mutex::new(None),
      generations: Mutex::new(GenerationRing::new(config.max_generations, 1)),
      lifecycle: LifecycleCell::new(),
      next_thread: AtomicU64::new(1),
      pause,
      pool: RecorderPool::new(config.recorder_capacity, config.pool_factor),
      sequence,
      shared: Mutex::new(None),
      signal: Arc::new(WorkerSignal::default()),
      threads: DashMap::default(),
      worker: Mutex::new(None),
      config,
    });

    let tracker = Self { inner };
    let inner = &tracker.inner;

    inner
      .lifecycle
      .advance(Lifecycle::Uninitialized, Lifecycle::Bootstrapping);

    if inner.config.level == TrackingLevel::Off {
      inner.lifecycle.request_shutdown(ShutdownReason::Disabled);
      inner.finish_shutdown();
      return tracker;
    }

    if inner.config.spawn_worker {
      match worker::spawn(
        Arc::downgrade(inner),
        Arc::clone(&inner.signal),
        inner.config.idle_wait,
      ) {
        Ok(handle) => *lock(&inner.worker) = Some(handle),
        Err(err) => {
          warn!(%err, "failed to start consolidation worker");
          inner.lifecycle.request_shutdown(ShutdownReason::WorkerUnavailable);
          inner.finish_shutdown();
          return tracker;
        }
      }
    }

    inner
      .lifecycle
      .advance(Lifecycle::Bootstrapping, Lifecycle::Running);

    tracker
  }

  #[must_use]
  pub fn builder() -> MemTrackerBuilder {
    MemTrackerBuilder::new()
  }

  #[must_use]
  pub fn call_sites(&self) -> &Arc<CallSiteTable> {
    self.inner.collector.table()
  }

  /// Captures the caller's native stack as a call site.
  ///
  /// Returns `None` below [`TrackingLevel::Detail`], where call sites are not
  /// kept anyway.
  #[must_use]
  pub fn capture_call_site(&self) -> Option<CallSiteId> {
    if self.inner.config.level != TrackingLevel::Detail
      || !self.inner.is_recording()
    {
      return None;
    }

    Some(self.inner.collector.capture())
  }

  #[must_use]
  pub fn config(&self) -> &TrackerConfig {
    &self.inner.config
  }

  /// Runs consolidation on the calling thread until nothing is pending.
  /// Returns the number of merge and promote steps performed.
  ///
  /// Completes a pending shutdown when no worker thread is running, including
  /// one that tracking itself stopped along the way.
  pub fn consolidate(&self) -> usize {
    let inner = &self.inner;
    let mut steps = 0;

    if !inner.shutdown_requested() {
      while inner.step() == WorkerStep::Progress {
        steps += 1;
      }
    }

    if inner.shutdown_requested() && !self.worker_running() {
      inner.finish_shutdown();
    }

    steps
  }

  /// Signed changes from `older` to `newer`.
  #[must_use]
  pub fn diff(&self, older: &Baseline, newer: &Baseline) -> BaselineDiff {
    BaselineDiff::between(older, newer)
  }

  /// The summary kept when tracking shut down.
  #[must_use]
  pub fn final_summary(&self) -> Option<Baseline> {
    lock(&self.inner.final_summary).clone()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::builder().finish()
  }

  /// Records an event for a caller without a [`ThreadRecorder`].
  ///
  /// Events go to a shared recorder that hands itself off when full. A no-op
  /// once tracking has stopped.
  pub fn record(&self, event: Event) {
    let inner = &self.inner;

    if !inner.is_recording() {
      return;
    }

    let _ticket = inner.pause.enter_writer();
    inner.record_shared(inner.prepare(event));
  }

  /// Registers the calling thread as a writer with its own recorder slot.
  #[must_use]
  pub fn register_thread(&self) -> ThreadRecorder {
    let inner = &self.inner;
    let id = inner.next_thread.fetch_add(1, Ordering::Relaxed);
    let slot = Arc::new(ThreadSlot::default());

    inner.threads.insert(id, Arc::clone(&slot));
    inner.pool.resize_for(inner.threads.len());

    trace!(thread = id, "registered writer thread");

    ThreadRecorder {
      id,
      inner: Arc::clone(inner),
      slot,
    }
  }

  /// Stops tracking, drains everything pending and releases the tracking
  /// structures. A final summary baseline stays available.
  pub fn shutdown(&self) {
    let inner = &self.inner;

    inner.lifecycle.request_shutdown(ShutdownReason::Requested);
    inner.signal.notify();

    let handle = lock(&inner.worker).take();

    if let Some(handle) = handle {
      if handle.join().is_err() {
        warn!("consolidation worker panicked");
      }
    }

    inner.finish_shutdown();
  }

  #[must_use]
  pub fn status(&self) -> TrackerStatus {
    let inner = &self.inner;

    let (pending_generations, queued_recorders) = {
      let generations = lock(&inner.generations);
      (generations.pending_generations(), generations.queued_recorders())
    };

    let (promotions, tracker_overhead) = {
      let consolidation = read(&inner.consolidation);
      (
        consolidation.snapshot.promotions(),
        inner.memory_footprint(&consolidation),
      )
    };

    let counter = |value: &AtomicU64| value.load(Ordering::Relaxed);

    TrackerStatus {
      epoch: inner.epoch.load(Ordering::Acquire),
      events_recorded: counter(&inner.counters.events_recorded),
      hand_offs: counter(&inner.counters.hand_offs),
      inconsistencies: counter(&inner.counters.inconsistencies),
      level: inner.config.level,
      lifecycle: inner.lifecycle.get(),
      pending_generations,
      pooled_recorders: inner.pool.len(),
      promotions,
      queued_recorders,
      reason: inner.lifecycle.reason(),
      registered_threads: inner.threads.len(),
      short_lived: counter(&inner.counters.short_lived),
      stale_dropped: counter(&inner.counters.stale_dropped),
      tracker_overhead,
      untracked_frees: counter(&inner.counters.untracked_frees),
    }
  }

  /// Closes the current generation and hands it to consolidation. Returns the
  /// epoch that was closed.
  ///
  /// Runs inside the configured [`PauseCoordinator`].
  ///
  /// # Errors
  ///
  /// Returns [`TrackerError::NotTracking`] if tracking is not running, or if
  /// this sync found every generation slot occupied and stopped tracking.
  pub fn sync(&self) -> Result<u64, TrackerError> {
    let inner = &self.inner;
    let mut outcome = Err(TrackerError::NotTracking(inner.lifecycle.reason()));

    inner.pause.with_paused_world(&mut || {
      outcome = inner.sync_paused();
    });

    outcome
  }

  fn worker_running(&self) -> bool {
    lock(&self.inner.worker)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }
}

/// Per-thread handle for recording events without cross-thread contention.
///
/// Dropping the handle hands its recorder to consolidation and unregisters
/// the thread.
#[derive(Debug)]
pub struct ThreadRecorder {
  id: u64,
  inner: Arc<TrackerInner>,
  slot: Arc<ThreadSlot>,
}

impl ThreadRecorder {
  /// Queues the current recorder for consolidation.
  ///
  /// Still accepted while a shutdown is pending, so events recorded before
  /// tracking stopped reach the final drain.
  pub fn hand_off(&self) {
    let inner = &self.inner;
    let _ticket = inner.pause.enter_writer();

    if inner.lifecycle.get() >= Lifecycle::Draining {
      return;
    }

    let recorder = lock(&self.slot.recorder).take();

    if let Some(recorder) = recorder {
      inner.enqueue(recorder);
    }
  }

  #[must_use]
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Appends one event to this thread's recorder.
  ///
  /// A no-op once tracking has stopped.
  ///
  /// # Errors
  ///
  /// Returns [`Full`] when the recorder has no room; call
  /// [`ThreadRecorder::hand_off`] and retry.
  pub fn record(&self, event: Event) -> Result<(), Full> {
    let inner = &self.inner;

    if !inner.is_recording() {
      return Ok(());
    }

    let _ticket = inner.pause.enter_writer();
    let mut slot = lock(&self.slot.recorder);

    inner.record_into(&mut *slot, inner.prepare(event), |epoch| {
      inner.pool.acquire(epoch)
    })
  }

  /// Records, handing the recorder off and retrying once if it was full.
  pub fn record_or_hand_off(&self, event: Event) {
    if self.record(event).is_ok() {
      return;
    }

    self.hand_off();

    if self.record(event).is_err() {
      trace!(thread = self.id, "fresh recorder rejected an event");
    }
  }
}

impl Drop for ThreadRecorder {
  fn drop(&mut self) {
    self.hand_off();

    self.inner.threads.remove(&self.id);
    self.inner.pool.resize_for(self.inner.threads.len());
  }
}
