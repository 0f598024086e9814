use {
  memtrack::{
    Event, EventKind, MemTracker, MemoryCategory, TrackerConfig, TrackingLevel,
  },
  std::io,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let tracker = MemTracker::builder()
    .with_config(
      TrackerConfig {
        site_threshold: 0,
        ..TrackerConfig::default()
      }
      .with_level(TrackingLevel::Detail)
      .without_worker(),
    )
    .finish();

  let writer = tracker.register_thread();
  let site = tracker.capture_call_site();

  let with_site = |event: Event| match site {
    Some(id) => event.call_site(id),
    None => event,
  };

  writer.record_or_hand_off(with_site(Event::allocate(
    0x1000,
    128,
    MemoryCategory::Internal,
  )));
  writer.record_or_hand_off(with_site(Event::allocate(
    0x2000,
    64,
    MemoryCategory::Symbol,
  )));
  writer.record_or_hand_off(Event::free(0x2000));
  writer.record_or_hand_off(with_site(
    Event::virtual_memory(EventKind::Reserve, 0x10_0000, 64 * 1024)
      .category(MemoryCategory::Code),
  ));
  writer.record_or_hand_off(Event::virtual_memory(
    EventKind::Commit,
    0x10_0000,
    16 * 1024,
  ));

  let before = tracker.baseline(true)?;

  tracker.sync()?;
  tracker.consolidate();

  let after = tracker.baseline(true)?;

  println!("=== demo baseline ===");
  after.export_json(io::stdout().lock())?;
  println!();

  println!("=== change since start ===");
  tracker.diff(&before, &after).export_json(io::stdout().lock())?;
  println!();

  if let Some(site) = site.and_then(|id| tracker.call_sites().resolve(id)) {
    println!("=== call site {} ===", site.id());
    for frame in site.frames() {
      println!(
        "{:#x} {} ({}:{})",
        frame.address, frame.function, frame.filename, frame.lineno
      );
    }
  }

  drop(writer);
  tracker.shutdown();

  println!("=== status ===");
  println!("{}", serde_json::to_string_pretty(&tracker.status())?);

  Ok(())
}
