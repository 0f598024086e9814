use super::*;

/// Sink for a sequence of baselines and the changes between them.
pub trait BaselineStreamWriter {
  /// # Errors
  ///
  /// Returns an `ExportError` if the baseline cannot be serialized or if
  /// the underlying writer fails to persist the data.
  fn write_baseline(
    &mut self,
    baseline: &Baseline,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError>;

  /// # Errors
  ///
  /// Returns an `ExportError` if the diff cannot be serialized or written.
  fn write_diff(
    &mut self,
    diff: &BaselineDiff,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError>;
}

/// Writes one JSON object per line, keyed `baseline` or `diff` by payload.
///
/// Every line carries a running index so a reader can spot gaps.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
  written: u64,
}

impl<W: Write> BaselineStreamWriter for JsonLinesWriter<W> {
  fn write_baseline(
    &mut self,
    baseline: &Baseline,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    self.write_line(StreamPayload::Baseline(baseline), timestamp)
  }

  fn write_diff(
    &mut self,
    diff: &BaselineDiff,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    self.write_line(StreamPayload::Diff(diff), timestamp)
  }
}

impl<W: Write> JsonLinesWriter<W> {
  /// # Errors
  ///
  /// Returns an error if flushing the underlying writer fails.
  pub fn flush(&mut self) -> Result<(), ExportError> {
    self.writer.flush()?;
    Ok(())
  }

  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer, written: 0 }
  }

  fn write_line(
    &mut self,
    payload: StreamPayload<'_>,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    let line = StreamLine {
      index: self.written,
      payload,
      timestamp_ns: timestamp.and_then(nanos_since_epoch),
    };

    serde_json::to_writer(&mut self.writer, &line)?;
    self.writer.write_all(b"\n")?;
    self.written += 1;

    Ok(())
  }

  /// Number of lines written so far.
  pub fn written(&self) -> u64 {
    self.written
  }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum StreamPayload<'a> {
  Baseline(&'a Baseline),
  Diff(&'a BaselineDiff),
}

#[derive(Serialize)]
struct StreamLine<'a> {
  index: u64,
  #[serde(flatten)]
  payload: StreamPayload<'a>,
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp_ns: Option<u128>,
}

fn nanos_since_epoch(ts: SystemTime) -> Option<u128> {
  ts.duration_since(SystemTime::UNIX_EPOCH)
    .ok()
    .map(|duration| duration.as_nanos())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn baseline_with(bytes: u64) -> Baseline {
    let mut staging = StagingArea::new();
    staging
      .merge([Event::allocate(0x10, bytes, MemoryCategory::Gc)
        .call_site(9)
        .sequenced(1)])
      .expect("merge");

    let mut snapshot = Snapshot::new();
    snapshot
      .promote(&mut staging, &ConsistencyPolicy::default(), 1)
      .expect("promote");

    Baseline::from_snapshot(
      &snapshot,
      &BaselineOptions {
        detail: true,
        site_threshold: 0,
      },
    )
  }

  fn lines(writer: JsonLinesWriter<Vec<u8>>) -> Vec<serde_json::Value> {
    String::from_utf8(writer.into_inner())
      .expect("utf8")
      .lines()
      .map(|line| serde_json::from_str(line).expect("json line"))
      .collect()
  }

  #[test]
  fn json_export_includes_categories_and_sites() {
    let baseline = baseline_with(4096);

    let mut buffer = Vec::new();
    baseline.export_json(&mut buffer).expect("export");

    let value: serde_json::Value =
      serde_json::from_slice(&buffer).expect("valid json");

    let gc = value["categories"]
      .as_array()
      .expect("categories")
      .iter()
      .find(|entry| entry["category"] == "gc")
      .expect("gc category");

    assert_eq!(gc["malloc_bytes"], 4096);
    assert_eq!(value["malloc_sites"][0]["call_site"], 9);
    assert_eq!(value["detail"], true);
  }

  #[test]
  fn diff_export_is_valid_json() {
    let diff = baseline_with(100).diff(&baseline_with(60));

    let mut buffer = Vec::new();
    diff.export_json(&mut buffer).expect("export");

    let value: serde_json::Value =
      serde_json::from_slice(&buffer).expect("valid json");
    assert_eq!(value["malloc_sites"][0]["bytes"], -40);
  }

  #[test]
  fn json_lines_writer_emits_one_line_per_baseline() {
    let mut writer = JsonLinesWriter::new(Vec::new());

    baseline_with(10)
      .stream_into(&mut writer, Some(SystemTime::UNIX_EPOCH))
      .expect("first");
    baseline_with(20).stream_into(&mut writer, None).expect("second");
    writer.flush().expect("flush");

    assert_eq!(writer.written(), 2);

    let lines = lines(writer);
    assert_eq!(lines.len(), 2);

    assert_eq!(lines[0]["timestamp_ns"], 0);
    assert_eq!(lines[0]["index"], 0);

    assert!(lines[1].get("timestamp_ns").is_none());
    assert_eq!(lines[1]["baseline"]["generation"], 1);
  }

  #[test]
  fn diffs_share_the_line_stream_with_baselines() {
    let older = baseline_with(64);
    let newer = baseline_with(256);
    let mut writer = JsonLinesWriter::new(Vec::new());

    older.stream_into(&mut writer, None).expect("older");
    older
      .diff(&newer)
      .stream_into(&mut writer, None)
      .expect("diff");
    newer.stream_into(&mut writer, None).expect("newer");

    let lines = lines(writer);
    assert_eq!(lines.len(), 3);

    let diff = &lines[1];
    assert_eq!(diff["index"], 1);
    assert!(diff.get("baseline").is_none());
    assert_eq!(diff["diff"]["malloc_sites"][0]["bytes"], 192);

    assert_eq!(lines[2]["index"], 2);
    assert!(lines[2].get("diff").is_none());
  }
}
