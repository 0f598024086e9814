use super::*;

/// Totals for one memory category.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct CategorySummary {
  pub arena_bytes: u64,
  pub arena_count: u64,
  pub category: MemoryCategory,
  pub malloc_bytes: u64,
  pub malloc_count: u64,
  pub vm_committed: u64,
  pub vm_reserved: u64,
}

impl CategorySummary {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.malloc_count == 0
      && self.arena_count == 0
      && self.arena_bytes == 0
      && self.vm_reserved == 0
  }

  fn new(category: MemoryCategory) -> Self {
    Self {
      arena_bytes: 0,
      arena_count: 0,
      category,
      malloc_bytes: 0,
      malloc_count: 0,
      vm_committed: 0,
      vm_reserved: 0,
    }
  }
}

/// Live malloc blocks attributed to one call site.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct MallocSite {
  pub bytes: u64,
  pub call_site: CallSiteId,
  pub count: u64,
}

/// Virtual memory regions attributed to one call site.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct VmSite {
  pub call_site: CallSiteId,
  pub committed: u64,
  pub count: u64,
  pub reserved: u64,
}

/// Ordering of the call-site rollups.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteOrder {
  /// Largest byte volume first, for display.
  #[default]
  BySize,
  /// Ascending call-site id, for comparing baselines.
  BySite,
}

/// Inputs to [`Baseline::from_snapshot`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BaselineOptions {
  pub detail: bool,
  /// Call sites accounting for fewer bytes are left out of the rollups.
  pub site_threshold: u64,
}

impl Default for BaselineOptions {
  fn default() -> Self {
    Self {
      detail: false,
      site_threshold: 1024,
    }
  }
}

/// Point-in-time summary of a [`Snapshot`].
///
/// A baseline is a value: once computed it does not follow later changes to
/// the snapshot it came from.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Baseline {
  categories: Vec<CategorySummary>,
  detail: bool,
  generation: u64,
  malloc_sites: Vec<MallocSite>,
  site_order: SiteOrder,
  thread_count: u64,
  tracker_overhead: u64,
  vm_sites: Vec<VmSite>,
}

impl Baseline {
  #[must_use]
  pub fn categories(&self) -> &[CategorySummary] {
    &self.categories
  }

  #[must_use]
  pub fn category(&self, category: MemoryCategory) -> &CategorySummary {
    &self.categories[category.index()]
  }

  /// Changes from `self` (the older baseline) to `newer`.
  #[must_use]
  pub fn diff(&self, newer: &Baseline) -> BaselineDiff {
    BaselineDiff::between(self, newer)
  }

  /// Serialize the baseline to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  /// Aggregates the snapshot into per-category totals and, in detail mode,
  /// per-call-site rollups sorted by size.
  #[must_use]
  pub fn from_snapshot(snapshot: &Snapshot, options: &BaselineOptions) -> Self {
    let mut categories = MemoryCategory::ALL
      .iter()
      .map(|category| CategorySummary::new(*category))
      .collect::<Vec<_>>();

    for record in snapshot.malloc_records() {
      let summary = &mut categories[record.category.index()];

      match record.op {
        EventKind::Allocate => {
          summary.malloc_count += 1;
          summary.malloc_bytes = summary.malloc_bytes.saturating_add(record.size);

          if record.arena {
            summary.arena_count += 1;
          }
        }
        EventKind::ArenaSizeUpdate => {
          summary.arena_bytes = summary.arena_bytes.saturating_add(record.size);
        }
        _ => {}
      }
    }

    let mut thread_count = 0;

    for region in snapshot.regions() {
      let summary = &mut categories[region.category.index()];
      summary.vm_reserved = summary.vm_reserved.saturating_add(region.reserved);
      summary.vm_committed =
        summary.vm_committed.saturating_add(region.committed);

      if region.category == MemoryCategory::ThreadStack {
        thread_count += 1;
      }
    }

    let (malloc_sites, vm_sites) = if options.detail {
      (
        malloc_sites(snapshot, options.site_threshold),
        vm_sites(snapshot, options.site_threshold),
      )
    } else {
      (Vec::new(), Vec::new())
    };

    let mut baseline = Self {
      categories,
      detail: options.detail,
      generation: snapshot.generation(),
      malloc_sites,
      site_order: SiteOrder::BySite,
      thread_count,
      tracker_overhead: 0,
      vm_sites,
    };

    baseline.sort_sites(SiteOrder::BySize);
    baseline
  }

  /// Epoch of the last generation folded into the snapshot.
  #[must_use]
  pub fn generation(&self) -> u64 {
    self.generation
  }

  #[must_use]
  pub fn is_detail(&self) -> bool {
    self.detail
  }

  #[must_use]
  pub fn malloc_sites(&self) -> &[MallocSite] {
    &self.malloc_sites
  }

  #[must_use]
  pub fn site_order(&self) -> SiteOrder {
    self.site_order
  }

  /// Re-sorts both rollup lists.
  pub fn sort_sites(&mut self, order: SiteOrder) {
    match order {
      SiteOrder::BySize => {
        self.malloc_sites.sort_by(|a, b| {
          b.bytes.cmp(&a.bytes).then(a.call_site.cmp(&b.call_site))
        });
        self.vm_sites.sort_by(|a, b| {
          b.reserved
            .cmp(&a.reserved)
            .then(b.committed.cmp(&a.committed))
            .then(a.call_site.cmp(&b.call_site))
        });
      }
      SiteOrder::BySite => {
        self.malloc_sites.sort_by_key(|site| site.call_site);
        self.vm_sites.sort_by_key(|site| site.call_site);
      }
    }

    self.site_order = order;
  }

  /// Streams this baseline into the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn stream_into<W: BaselineStreamWriter>(
    &self,
    writer: &mut W,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    writer.write_baseline(self, timestamp)
  }

  #[must_use]
  pub fn thread_count(&self) -> u64 {
    self.thread_count
  }

  #[must_use]
  pub fn total_committed(&self) -> u64 {
    self
      .categories
      .iter()
      .fold(0, |total, summary| total.saturating_add(summary.vm_committed))
  }

  #[must_use]
  pub fn total_malloc_bytes(&self) -> u64 {
    self
      .categories
      .iter()
      .fold(0, |total, summary| total.saturating_add(summary.malloc_bytes))
  }

  #[must_use]
  pub fn total_reserved(&self) -> u64 {
    self
      .categories
      .iter()
      .fold(0, |total, summary| total.saturating_add(summary.vm_reserved))
  }

  /// Bytes the tracker itself held when the baseline was taken.
  #[must_use]
  pub fn tracker_overhead(&self) -> u64 {
    self.tracker_overhead
  }

  #[must_use]
  pub fn vm_sites(&self) -> &[VmSite] {
    &self.vm_sites
  }

  #[must_use]
  pub(crate) fn with_tracker_overhead(mut self, bytes: u64) -> Self {
    self.tracker_overhead = bytes;
    self
  }
}

fn malloc_sites(snapshot: &Snapshot, threshold: u64) -> Vec<MallocSite> {
  let mut sites: HashMap<CallSiteId, MallocSite, BuildNoHashHasher<u64>> =
    HashMap::default();

  for record in snapshot.malloc_records() {
    let Some(call_site) = record.call_site else {
      continue;
    };

    if record.op != EventKind::Allocate {
      continue;
    }

    let site = sites.entry(call_site).or_insert(MallocSite {
      bytes: 0,
      call_site,
      count: 0,
    });
    site.bytes = site.bytes.saturating_add(record.size);
    site.count += 1;
  }

  sites
    .into_values()
    .filter(|site| site.bytes >= threshold)
    .collect()
}

fn vm_sites(snapshot: &Snapshot, threshold: u64) -> Vec<VmSite> {
  let mut sites: HashMap<CallSiteId, VmSite, BuildNoHashHasher<u64>> =
    HashMap::default();

  for region in snapshot.regions() {
    let Some(call_site) = region.call_site else {
      continue;
    };

    let site = sites.entry(call_site).or_insert(VmSite {
      call_site,
      committed: 0,
      count: 0,
      reserved: 0,
    });
    site.reserved = site.reserved.saturating_add(region.reserved);
    site.committed = site.committed.saturating_add(region.committed);
    site.count += 1;
  }

  sites
    .into_values()
    .filter(|site| site.reserved >= threshold)
    .collect()
}

/// Signed change of one category between two baselines.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct CategoryDelta {
  pub arena_bytes: i64,
  pub arena_count: i64,
  pub category: MemoryCategory,
  pub malloc_bytes: i64,
  pub malloc_count: i64,
  pub vm_committed: i64,
  pub vm_reserved: i64,
}

impl CategoryDelta {
  #[must_use]
  pub fn is_zero(&self) -> bool {
    self.arena_bytes == 0
      && self.arena_count == 0
      && self.malloc_bytes == 0
      && self.malloc_count == 0
      && self.vm_committed == 0
      && self.vm_reserved == 0
  }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct MallocSiteDelta {
  pub bytes: i64,
  pub call_site: CallSiteId,
  pub count: i64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct VmSiteDelta {
  pub call_site: CallSiteId,
  pub committed: i64,
  pub count: i64,
  pub reserved: i64,
}

/// Difference between two baselines.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct BaselineDiff {
  categories: Vec<CategoryDelta>,
  malloc_sites: Vec<MallocSiteDelta>,
  thread_count: i64,
  tracker_overhead: i64,
  vm_sites: Vec<VmSiteDelta>,
}

impl BaselineDiff {
  /// Computes `newer - older` for every category and call site.
  ///
  /// Call sites only present in one of the baselines count as zero in the
  /// other. Sites whose numbers did not move are left out.
  #[must_use]
  pub fn between(older: &Baseline, newer: &Baseline) -> Self {
    let categories = older
      .categories
      .iter()
      .zip(&newer.categories)
      .map(|(old, new)| CategoryDelta {
        arena_bytes: delta(new.arena_bytes, old.arena_bytes),
        arena_count: delta(new.arena_count, old.arena_count),
        category: new.category,
        malloc_bytes: delta(new.malloc_bytes, old.malloc_bytes),
        malloc_count: delta(new.malloc_count, old.malloc_count),
        vm_committed: delta(new.vm_committed, old.vm_committed),
        vm_reserved: delta(new.vm_reserved, old.vm_reserved),
      })
      .collect();

    let mut malloc_sites = Vec::new();

    walk_by_site(
      &older.malloc_sites,
      &newer.malloc_sites,
      |site| site.call_site,
      |old, new| {
        let call_site = new.or(old).map_or(0, |site| site.call_site);
        let (old_bytes, old_count) = old.map_or((0, 0), |s| (s.bytes, s.count));
        let (new_bytes, new_count) = new.map_or((0, 0), |s| (s.bytes, s.count));

        let change = MallocSiteDelta {
          bytes: delta(new_bytes, old_bytes),
          call_site,
          count: delta(new_count, old_count),
        };

        if change.bytes != 0 || change.count != 0 {
          malloc_sites.push(change);
        }
      },
    );

    let mut vm_sites = Vec::new();

    walk_by_site(
      &older.vm_sites,
      &newer.vm_sites,
      |site| site.call_site,
      |old, new| {
        let call_site = new.or(old).map_or(0, |site| site.call_site);
        let totals = |site: Option<&VmSite>| {
          site.map_or((0, 0, 0), |s| (s.reserved, s.committed, s.count))
        };
        let (old_reserved, old_committed, old_count) = totals(old);
        let (new_reserved, new_committed, new_count) = totals(new);

        let change = VmSiteDelta {
          call_site,
          committed: delta(new_committed, old_committed),
          count: delta(new_count, old_count),
          reserved: delta(new_reserved, old_reserved),
        };

        if change.reserved != 0 || change.committed != 0 || change.count != 0 {
          vm_sites.push(change);
        }
      },
    );

    malloc_sites.sort_by(|a, b| {
      b.bytes
        .unsigned_abs()
        .cmp(&a.bytes.unsigned_abs())
        .then(a.call_site.cmp(&b.call_site))
    });

    vm_sites.sort_by(|a, b| {
      b.reserved
        .unsigned_abs()
        .cmp(&a.reserved.unsigned_abs())
        .then(a.call_site.cmp(&b.call_site))
    });

    Self {
      categories,
      malloc_sites,
      thread_count: delta(newer.thread_count, older.thread_count),
      tracker_overhead: delta(newer.tracker_overhead, older.tracker_overhead),
      vm_sites,
    }
  }

  #[must_use]
  pub fn categories(&self) -> &[CategoryDelta] {
    &self.categories
  }

  #[must_use]
  pub fn category(&self, category: MemoryCategory) -> Option<&CategoryDelta> {
    self.categories.get(category.index())
  }

  /// Serialize the diff to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  #[must_use]
  pub fn malloc_sites(&self) -> &[MallocSiteDelta] {
    &self.malloc_sites
  }

  /// Streams this diff into the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn stream_into<W: BaselineStreamWriter>(
    &self,
    writer: &mut W,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    writer.write_diff(self, timestamp)
  }

  #[must_use]
  pub fn thread_count(&self) -> i64 {
    self.thread_count
  }

  #[must_use]
  pub fn tracker_overhead(&self) -> i64 {
    self.tracker_overhead
  }

  #[must_use]
  pub fn vm_sites(&self) -> &[VmSiteDelta] {
    &self.vm_sites
  }
}

/// Visits the union of two site lists in ascending site order.
fn walk_by_site<T, K, F>(older: &[T], newer: &[T], key: K, mut visit: F)
where
  K: Fn(&T) -> CallSiteId,
  F: FnMut(Option<&T>, Option<&T>),
{
  let mut older = older.iter().collect::<Vec<_>>();
  let mut newer = newer.iter().collect::<Vec<_>>();
  older.sort_by_key(|site| key(site));
  newer.sort_by_key(|site| key(site));

  let (mut i, mut j) = (0, 0);

  while i < older.len() || j < newer.len() {
    match (older.get(i), newer.get(j)) {
      (Some(old), Some(new)) => match key(old).cmp(&key(new)) {
        CmpOrdering::Less => {
          visit(Some(old), None);
          i += 1;
        }
        CmpOrdering::Greater => {
          visit(None, Some(new));
          j += 1;
        }
        CmpOrdering::Equal => {
          visit(Some(old), Some(new));
          i += 1;
          j += 1;
        }
      },
      (Some(old), None) => {
        visit(Some(old), None);
        i += 1;
      }
      (None, Some(new)) => {
        visit(None, Some(new));
        j += 1;
      }
      (None, None) => break,
    }
  }
}

fn delta(newer: u64, older: u64) -> i64 {
  let change = i128::from(newer) - i128::from(older);

  match i64::try_from(change) {
    Ok(value) => value,
    Err(_) if change.is_negative() => i64::MIN,
    Err(_) => i64::MAX,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn snapshot_from(events: &[Event]) -> Snapshot {
    let mut staging = StagingArea::new();
    staging
      .merge(
        events
          .iter()
          .enumerate()
          .map(|(index, event)| event.sequenced(index as u64 + 1)),
      )
      .expect("merge");

    let mut snapshot = Snapshot::new();
    snapshot
      .promote(&mut staging, &ConsistencyPolicy::default(), 1)
      .expect("promote");
    snapshot
  }

  fn sample_events() -> Vec<Event> {
    vec![
      Event::allocate(0x1000, 512, MemoryCategory::Internal).call_site(1),
      Event::allocate(0x2000, 600, MemoryCategory::Internal).call_site(1),
      Event::allocate(0x3000, 64, MemoryCategory::Gc).call_site(2),
      Event::allocate(0x4000, 48, MemoryCategory::Compiler)
        .arena()
        .call_site(3),
      Event::arena_size(0x4000, 8192, MemoryCategory::Compiler),
      Event::virtual_memory(EventKind::Reserve, 0x10_0000, 8192)
        .category(MemoryCategory::ThreadStack)
        .call_site(4),
      Event::virtual_memory(EventKind::Commit, 0x10_0000, 8192),
      Event::virtual_memory(EventKind::Reserve, 0x20_0000, 4096)
        .category(MemoryCategory::Code)
        .call_site(5),
      Event::virtual_memory(EventKind::Commit, 0x20_0000, 1024),
    ]
  }

  #[test]
  fn totals_are_conserved() {
    let snapshot = snapshot_from(&sample_events());
    let baseline = Baseline::from_snapshot(&snapshot, &BaselineOptions::default());

    assert_eq!(baseline.total_malloc_bytes(), snapshot.total_malloc_bytes());
    assert_eq!(baseline.total_malloc_bytes(), 512 + 600 + 64 + 48);
    assert_eq!(baseline.total_reserved(), 8192 + 4096);
    assert_eq!(baseline.total_committed(), 8192 + 1024);
  }

  #[test]
  fn separates_arenas_from_plain_blocks() {
    let snapshot = snapshot_from(&sample_events());
    let baseline = Baseline::from_snapshot(&snapshot, &BaselineOptions::default());

    let compiler = baseline.category(MemoryCategory::Compiler);
    assert_eq!(compiler.arena_count, 1);
    assert_eq!(compiler.arena_bytes, 8192);
    assert_eq!(compiler.malloc_count, 1);

    let internal = baseline.category(MemoryCategory::Internal);
    assert_eq!(internal.malloc_count, 2);
    assert_eq!(internal.malloc_bytes, 1112);
    assert_eq!(internal.arena_count, 0);

    assert_eq!(baseline.thread_count(), 1);
    assert!(baseline.malloc_sites().is_empty());
  }

  #[test]
  fn detail_rollups_respect_threshold_and_order() {
    let snapshot = snapshot_from(&sample_events());
    let mut baseline = Baseline::from_snapshot(
      &snapshot,
      &BaselineOptions {
        detail: true,
        site_threshold: 1024,
      },
    );

    assert_eq!(
      baseline.malloc_sites(),
      &[MallocSite {
        bytes: 1112,
        call_site: 1,
        count: 2,
      }]
    );

    let vm = baseline
      .vm_sites()
      .iter()
      .map(|site| site.call_site)
      .collect::<Vec<_>>();
    assert_eq!(vm, vec![4, 5]);

    baseline.sort_sites(SiteOrder::BySite);
    assert_eq!(baseline.site_order(), SiteOrder::BySite);
    assert_eq!(baseline.vm_sites()[0].call_site, 4);
  }

  #[test]
  fn diff_reports_signed_changes() {
    let options = BaselineOptions {
      detail: true,
      site_threshold: 0,
    };

    let older = Baseline::from_snapshot(&snapshot_from(&sample_events()), &options);

    let mut events = sample_events();
    events.remove(1);
    events.push(Event::allocate(0x5000, 2048, MemoryCategory::Gc).call_site(6));
    let newer = Baseline::from_snapshot(&snapshot_from(&events), &options);

    let diff = older.diff(&newer);

    let internal = diff.category(MemoryCategory::Internal).expect("internal");
    assert_eq!(internal.malloc_bytes, -600);
    assert_eq!(internal.malloc_count, -1);

    let gc = diff.category(MemoryCategory::Gc).expect("gc");
    assert_eq!(gc.malloc_bytes, 2048);

    let sites = diff
      .malloc_sites()
      .iter()
      .map(|site| (site.call_site, site.bytes))
      .collect::<Vec<_>>();
    assert_eq!(sites, vec![(6, 2048), (1, -600)]);

    assert!(diff.vm_sites().is_empty());
    assert_eq!(diff.thread_count(), 0);
    assert!(
      diff
        .category(MemoryCategory::Code)
        .is_some_and(CategoryDelta::is_zero)
    );
  }

  #[test]
  fn baseline_does_not_follow_later_changes() {
    let mut snapshot = snapshot_from(&sample_events());
    let baseline = Baseline::from_snapshot(&snapshot, &BaselineOptions::default());

    let mut staging = StagingArea::new();
    staging
      .merge([Event::free(0x1000).sequenced(1)])
      .expect("merge");
    snapshot
      .promote(&mut staging, &ConsistencyPolicy::default(), 2)
      .expect("promote");

    assert_eq!(baseline.total_malloc_bytes(), 512 + 600 + 64 + 48);
    assert_eq!(snapshot.total_malloc_bytes(), 600 + 64 + 48);
  }

  #[test]
  fn delta_saturates() {
    assert_eq!(delta(u64::MAX, 0), i64::MAX);
    assert_eq!(delta(0, u64::MAX), i64::MIN);
    assert_eq!(delta(5, 7), -2);
  }
}
