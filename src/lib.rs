//! Core library entry point for the native memory tracker.
//!
//! Allocation sites feed events into per-thread recorders; at every sync point
//! the open recorders are closed into a generation that a single background
//! worker merges into a staging area and then promotes into the live
//! snapshot. Baselines summarize that snapshot by category and call site.

mod baseline;
mod call_site;
mod capture;
mod category;
mod config;
mod error;
mod event;
mod event_array;
mod export;
mod generation;
mod lifecycle;
mod pause;
mod recorder;
mod sequence;
mod snapshot;
mod staging;
mod state;
mod worker;

use {
  backtrace::Frame,
  lifecycle::LifecycleCell,
  crossbeam_queue::SegQueue,
  dashmap::DashMap,
  nohash_hasher::BuildNoHashHasher,
  serde::{Deserialize, Serialize},
  std::{
    cmp::Ordering as CmpOrdering,
    collections::HashMap,
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    mem::size_of,
    panic::{self, AssertUnwindSafe},
    sync::{
      Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard,
      RwLockWriteGuard, Weak,
      atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
  },
  tracing::{debug, error, info, trace, warn},
  worker::{ConsolidationTarget, WorkerSignal, WorkerStep},
};

pub use {
  baseline::{
    Baseline, BaselineDiff, BaselineOptions, CategoryDelta, CategorySummary,
    MallocSite, MallocSiteDelta, SiteOrder, VmSite, VmSiteDelta,
  },
  call_site::{CallSiteMetadata, CallSiteTable, FrameMetadata},
  capture::CallSiteCollector,
  category::{Domain, EventKind, MemoryCategory},
  config::{ThreadStackPolicy, TrackerConfig, TrackingLevel},
  error::{
    ArrayError, ExportError, Full, GenerationsExhausted, SequenceOverflow,
    TrackerError,
  },
  event::{ARENA_SIZE_OFFSET, CallSiteId, Event, EventRecord},
  event_array::{ArrayCapacity, EventArray},
  export::{BaselineStreamWriter, JsonLinesWriter},
  generation::{GenerationRing, SlotState, WorkItem},
  lifecycle::{Lifecycle, ShutdownReason},
  pause::{HostPaused, PauseCoordinator, WriterGate, WriterTicket},
  recorder::{Recorder, RecorderPool, SortedRecords},
  sequence::SequenceGenerator,
  snapshot::{ConsistencyPolicy, Inconsistency, PromoteReport, Snapshot, VmRegion},
  staging::StagingArea,
  state::{MemTracker, MemTrackerBuilder, ThreadRecorder, TrackerStatus},
};

/// Poisoning only means another thread panicked mid-update; the tracked tables
/// stay structurally valid, so the guard is recovered instead of propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  match lock.read() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
  match lock.write() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}
