use super::*;

/// Metadata describing a single resolved frame of a call site.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct FrameMetadata {
  pub address: usize,
  pub filename: Arc<str>,
  pub function: Arc<str>,
  pub lineno: u32,
}

impl FrameMetadata {
  #[must_use]
  pub fn new(
    address: usize,
    filename: impl Into<String>,
    function: impl Into<String>,
    lineno: u32,
  ) -> Self {
    Self {
      address,
      filename: Arc::<str>::from(filename.into()),
      function: Arc::<str>::from(function.into()),
      lineno,
    }
  }
}

/// Resolved metadata for an interned call site.
#[derive(Debug, Clone, Serialize)]
pub struct CallSiteMetadata {
  frames: Arc<[FrameMetadata]>,
  id: CallSiteId,
}

impl CallSiteMetadata {
  /// Return addresses of the call site, innermost first.
  pub fn addresses(&self) -> impl Iterator<Item = usize> + '_ {
    self.frames.iter().map(|frame| frame.address)
  }

  #[must_use]
  pub fn frames(&self) -> &[FrameMetadata] {
    &self.frames
  }

  #[must_use]
  pub fn id(&self) -> CallSiteId {
    self.id
  }
}

#[derive(Debug)]
struct CallSiteTableInner {
  by_addresses: HashMap<Vec<usize>, CallSiteId>,
  by_id: HashMap<CallSiteId, Arc<CallSiteMetadata>, BuildNoHashHasher<u64>>,
  next_id: CallSiteId,
}

impl Default for CallSiteTableInner {
  fn default() -> Self {
    Self {
      by_addresses: HashMap::new(),
      by_id: HashMap::default(),
      next_id: 1,
    }
  }
}

/// Interns return-address chains and provides their resolved frames.
///
/// Ids are stable for the lifetime of the table and start at 1.
#[derive(Debug, Default)]
pub struct CallSiteTable {
  inner: Mutex<CallSiteTableInner>,
}

impl CallSiteTable {
  /// Explicitly associate frames with a call-site identifier.
  ///
  /// Used to replay call sites captured by another process and in tests.
  pub fn insert_with_id<I>(&self, id: CallSiteId, frames: I)
  where
    I: Into<Vec<FrameMetadata>>,
  {
    let frames: Vec<FrameMetadata> = frames.into();
    let addresses = frames.iter().map(|frame| frame.address).collect();
    let mut inner = lock(&self.inner);

    inner.by_addresses.insert(addresses, id);
    inner.by_id.insert(
      id,
      Arc::new(CallSiteMetadata {
        frames: Arc::from(frames),
        id,
      }),
    );

    if inner.next_id <= id {
      inner.next_id = id.saturating_add(1);
    }
  }

  /// Intern the provided frames and return their stable identifier.
  ///
  /// Frames are keyed by their return addresses only; symbol data of a chain
  /// that is already known is not replaced.
  pub fn intern<I>(&self, frames: I) -> CallSiteId
  where
    I: Into<Vec<FrameMetadata>>,
  {
    let frames: Vec<FrameMetadata> = frames.into();
    let addresses = frames.iter().map(|frame| frame.address).collect();
    let mut inner = lock(&self.inner);

    if let Some(existing) = inner.by_addresses.get(&addresses).copied() {
      return existing;
    }

    let id = inner.next_id;
    inner.next_id = inner.next_id.saturating_add(1);

    inner.by_addresses.insert(addresses, id);
    inner.by_id.insert(
      id,
      Arc::new(CallSiteMetadata {
        frames: Arc::from(frames),
        id,
      }),
    );

    id
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[must_use]
  pub fn len(&self) -> usize {
    lock(&self.inner).by_id.len()
  }

  /// Looks up an already interned address chain without symbolizing it.
  #[must_use]
  pub fn lookup(&self, addresses: &[usize]) -> Option<CallSiteId> {
    lock(&self.inner).by_addresses.get(addresses).copied()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve a call-site identifier back into its metadata, if known.
  #[must_use]
  pub fn resolve(&self, id: CallSiteId) -> Option<Arc<CallSiteMetadata>> {
    lock(&self.inner).by_id.get(&id).cloned()
  }
}
