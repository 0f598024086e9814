use super::*;

/// Captures native call sites and interns them through the shared table.
///
/// Only return addresses are collected on the hot path; frames are symbolized
/// the first time a chain is seen.
#[derive(Debug)]
pub struct CallSiteCollector {
  max_depth: usize,
  skip_frames: usize,
  table: Arc<CallSiteTable>,
}

impl CallSiteCollector {
  /// Captures the calling thread's stack and returns its call-site id.
  #[must_use]
  pub fn capture(&self) -> CallSiteId {
    let frames = self.capture_frames();
    let addresses = frames
      .iter()
      .map(|frame| frame.ip() as usize)
      .collect::<Vec<_>>();

    if let Some(id) = self.table.lookup(&addresses) {
      return id;
    }

    let mut resolved = frames.iter().map(extract_metadata).collect::<Vec<_>>();

    if resolved.is_empty() {
      resolved.push(FrameMetadata::new(0, "<unknown>", "<unknown>", 0));
    }

    let id = self.table.intern(resolved);
    trace!(call_site = id, depth = addresses.len(), "interned call site");
    id
  }

  fn capture_frames(&self) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(self.max_depth);
    let mut remaining_skip = self.skip_frames;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if frames.len() >= self.max_depth {
        return false;
      }

      frames.push(frame.clone());
      true
    });

    frames
  }

  #[must_use]
  pub fn new(table: Arc<CallSiteTable>, config: &TrackerConfig) -> Self {
    Self {
      max_depth: usize::from(config.call_site_depth.max(1)),
      skip_frames: config.call_site_skip,
      table,
    }
  }

  #[must_use]
  pub fn table(&self) -> &Arc<CallSiteTable> {
    &self.table
  }
}

fn extract_metadata(frame: &Frame) -> FrameMetadata {
  let mut filename = None;
  let mut function = None;
  let mut lineno = None;

  backtrace::resolve_frame(frame, |symbol| {
    if filename.is_none() {
      filename = symbol
        .filename()
        .and_then(path_to_string)
        .map(str::to_string);
    }

    if function.is_none() {
      function = symbol.name().map(|name| name.to_string());
    }

    if lineno.is_none() {
      lineno = symbol.lineno();
    }
  });

  FrameMetadata::new(
    frame.ip() as usize,
    filename.unwrap_or_else(|| "<native>".to_string()),
    function.unwrap_or_else(|| "<unknown>".to_string()),
    lineno.unwrap_or(0),
  )
}

fn path_to_string(path: &std::path::Path) -> Option<&str> {
  path
    .to_str()
    .or_else(|| path.file_name().and_then(OsStr::to_str))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn collector(depth: u16) -> CallSiteCollector {
    let config = TrackerConfig {
      call_site_depth: depth,
      call_site_skip: 0,
      ..TrackerConfig::default()
    };

    CallSiteCollector::new(Arc::new(CallSiteTable::new()), &config)
  }

  #[test]
  fn repeated_capture_from_one_site_reuses_the_id() {
    let collector = collector(4);

    let ids = (0..3).map(|_| collector.capture()).collect::<Vec<_>>();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(collector.table().len(), 1);
  }

  #[test]
  fn respects_depth_limit() {
    let collector = collector(2);

    let id = collector.capture();
    let site = collector.table().resolve(id).expect("interned call site");

    assert!(!site.frames().is_empty());
    assert!(site.frames().len() <= 2);
  }
}
