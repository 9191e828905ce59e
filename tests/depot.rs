use chrono::{DateTime, TimeDelta};
use depot::Depot;
use depot::artifact::{
    ArtifactRef, KIND_MAP, KIND_TEXT, Lifecycle, MapArtifact, Text, Value, downcast_ref,
    same_artifact,
};
use depot::backend::Backend;
use depot::backend::local::LocalFileBackend;
use depot::backend::remote::{RemoteSettings, RemoteSyncBackend};
use depot::backend::write_behind::{WriteBehindBackend, WriteBehindSettings};
use depot::codec::CodecRegistry;
use depot::coordinator::DepotSettings;
use depot::descriptor::{CENTRAL_SERVER, Descriptor};
use depot::error::DepotError;
use depot::merge::MergerRegistry;
use depot::policy::ErrorPolicy;
use depot::test_util::artifacts::Widget;
use depot::test_util::backend::RecordingBackend;
use depot::test_util::clock::ControlledClock;
use depot::test_util::memory::FixedMemory;
use depot::test_util::transfer::DirTransfer;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const PLENTY_OF_MEMORY: u64 = 64 * 1024 * 1024 * 1024;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn codecs() -> Arc<CodecRegistry> {
    let codecs = CodecRegistry::with_defaults();
    codecs.register(Widget::KIND, Widget::codec());
    Arc::new(codecs)
}

fn text(value: &str) -> ArtifactRef {
    Arc::new(Text::new(value))
}

fn text_in(backend: &impl Backend, desc: &Descriptor) -> Option<String> {
    let artifact = backend.get(desc).unwrap()?.into_artifact()?;
    downcast_ref::<Text>(&artifact).map(|text| text.as_str().to_string())
}

fn write_behind<B: Backend + 'static>(base: B, delay: Duration) -> WriteBehindBackend<B> {
    WriteBehindBackend::with_parts(
        base,
        WriteBehindSettings {
            delay,
            jitter: 0.0,
            ..WriteBehindSettings::default()
        },
        Box::new(FixedMemory::new(PLENTY_OF_MEMORY)),
        Arc::new(MergerRegistry::with_defaults()),
    )
    .unwrap()
}

#[test]
fn test_concurrent_gets_of_equal_descriptors_return_one_instance() {
    init_logging();
    let dir = tempdir().unwrap();
    let writer = Depot::new(LocalFileBackend::new(dir.path(), codecs()), codecs());
    writer
        .put(&Descriptor::new(Widget::KIND, "shared"), Widget::new("shared", 1))
        .unwrap();

    let reader = Arc::new(Depot::new(LocalFileBackend::new(dir.path(), codecs()), codecs()));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reader = Arc::clone(&reader);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut desc = Descriptor::new(Widget::KIND, "shared");
                if i % 2 == 0 {
                    desc = desc.gzipped();
                }
                barrier.wait();
                reader.get(&desc).unwrap().unwrap()
            })
        })
        .collect();
    let results: Vec<ArtifactRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|r| same_artifact(r, &results[0])));
}

#[test]
fn test_round_trip_returns_same_reference_until_removed() {
    let dir = tempdir().unwrap();
    let depot = Depot::new(LocalFileBackend::new(dir.path(), codecs()), codecs());
    let desc = Descriptor::new(KIND_TEXT, "greeting");
    let value = text("hello");
    depot.put(&desc, value.clone()).unwrap();
    assert!(same_artifact(&depot.get(&desc).unwrap().unwrap(), &value));

    let replacement = text("hi");
    depot.put(&desc, replacement.clone()).unwrap();
    assert!(same_artifact(&depot.get(&desc).unwrap().unwrap(), &replacement));

    depot.remove(&desc).unwrap();
    assert!(depot.get(&desc).unwrap().is_none());
}

#[test]
fn test_removal_is_visible_before_write_behind_flush() {
    let base = Arc::new(RecordingBackend::new());
    let depot = Depot::new(write_behind(base.clone(), Duration::from_secs(3600)), codecs());
    let desc = Descriptor::new(KIND_TEXT, "doomed");
    depot.put(&desc, text("v")).unwrap();
    depot.flush().unwrap();

    depot.remove(&desc).unwrap();
    assert!(depot.get(&desc).unwrap().is_none());
    assert!(!depot.contains(&desc).unwrap());
    assert!(base.contains(&desc).unwrap());

    depot.flush().unwrap();
    assert!(!base.contains(&desc).unwrap());
}

#[test]
fn test_write_behind_reads_own_writes_and_flushes_on_demand() {
    let base = Arc::new(RecordingBackend::new());
    let depot = Depot::new(write_behind(base.clone(), Duration::from_secs(5)), codecs());
    let desc = Descriptor::new(KIND_TEXT, "k");
    depot.put(&desc, text("a")).unwrap();
    assert_eq!(
        depot.get_as::<Text>(&desc).unwrap().unwrap().as_str(),
        "a"
    );
    depot.flush().unwrap();
    assert_eq!(text_in(&base, &desc).as_deref(), Some("a"));
}

#[test]
fn test_write_behind_coalesces_repeated_puts() {
    let base = Arc::new(RecordingBackend::new());
    let depot = Depot::new(write_behind(base.clone(), Duration::from_secs(3600)), codecs());
    let desc = Descriptor::new(KIND_TEXT, "k");
    depot.put(&desc, text("a")).unwrap();
    depot.put(&desc, text("b")).unwrap();
    depot.close().unwrap();
    assert_eq!(text_in(&base, &desc).as_deref(), Some("b"));
    assert_eq!(base.put_count(), 1);
}

#[test]
fn test_guarded_artifacts_are_only_replaced_when_dead() {
    init_logging();
    let dir = tempdir().unwrap();
    let depot = Depot::new(LocalFileBackend::new(dir.path(), codecs()), codecs()).with_settings(
        DepotSettings {
            error_policy: ErrorPolicy::Throw,
            strict_overwrite: true,
            ..DepotSettings::default()
        },
    );
    let desc = Descriptor::new(Widget::KIND, "w");
    let first = Widget::guarded("w", 1);
    depot.put(&desc, first.clone()).unwrap();
    assert!(matches!(
        depot.put(&desc, Widget::guarded("w", 2)),
        Err(DepotError::OverwriteConflict(_))
    ));

    first.kill();
    let second = Widget::guarded("w", 3);
    depot.put(&desc, second.clone()).unwrap();
    let current = depot.get_as::<Widget>(&desc).unwrap().unwrap();
    assert!(Arc::ptr_eq(&current, &second));
}

#[test]
fn test_symlinks_resolve_and_reject_self_reference() {
    let dir = tempdir().unwrap();
    let depot = Depot::new(LocalFileBackend::new(dir.path(), codecs()), codecs());
    let a = Descriptor::new(KIND_TEXT, "a");
    let b = Descriptor::new(KIND_TEXT, "b");
    let value = text("target");
    depot.put(&b, value.clone()).unwrap();
    depot.put_symlink(&a, &b).unwrap();
    assert!(same_artifact(&depot.get(&a).unwrap().unwrap(), &value));

    depot.backend().put(&a, Value::Link(a.clone())).unwrap();
    assert!(matches!(
        depot.get(&a),
        Err(DepotError::SelfReferentialSymlink(_))
    ));
}

#[test]
fn test_remote_store_is_only_asked_after_max_age() {
    let remote = tempdir().unwrap();
    let transfer = Arc::new(DirTransfer::new(remote.path()));
    let clock = ControlledClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
    let on_host = |host: &str, dir: &std::path::Path| {
        let local = LocalFileBackend::with_clock(dir, codecs(), clock.clone())
            .with_default_max_age(TimeDelta::hours(1));
        let settings = RemoteSettings {
            host_name: host.to_string(),
            default_host: Some("store.example.org".to_string()),
            remote_dir: "/depot".to_string(),
            ..RemoteSettings::default()
        };
        Depot::new(
            RemoteSyncBackend::new(local, Arc::clone(&transfer), settings),
            codecs(),
        )
    };
    let (writer_dir, reader_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let writer = on_host("build1", writer_dir.path());
    let desc = Descriptor::new(KIND_TEXT, "report").with_server(CENTRAL_SERVER);
    writer.put(&desc, text("v1")).unwrap();

    let reader = on_host("build2", reader_dir.path());
    assert!(reader.get(&desc).unwrap().is_some());
    transfer.clear_calls();

    clock.advance_by(TimeDelta::minutes(30));
    let fresh_reader = on_host("build2", reader_dir.path());
    assert!(fresh_reader.get(&desc).unwrap().is_some());
    assert!(transfer.calls().is_empty());

    clock.advance_by(TimeDelta::minutes(31));
    let late_reader = on_host("build2", reader_dir.path());
    assert!(late_reader.get(&desc).unwrap().is_some());
    assert_eq!(transfer.data_pulls(), 1);
}

#[test]
fn test_concurrent_edits_are_merged() {
    let dir = tempdir().unwrap();
    let local = Arc::new(LocalFileBackend::new(dir.path(), codecs()));
    let editor = Depot::new(write_behind(local.clone(), Duration::from_secs(3600)), codecs());
    let mut desc = Descriptor::new(KIND_MAP, "prefs");
    let s0: MapArtifact = [("theme", "light"), ("font", "mono")].into_iter().collect();
    editor.put(&desc, Arc::new(s0)).unwrap();
    editor.flush().unwrap();
    assert!(editor.mark_for_merge(&mut desc).unwrap());

    let s1: MapArtifact = [("theme", "dark"), ("font", "mono"), ("lang", "en")]
        .into_iter()
        .collect();
    let s2: MapArtifact = [("theme", "light"), ("font", "serif"), ("tabs", "4")]
        .into_iter()
        .collect();
    local
        .put(&desc, Value::Artifact(Arc::new(s2)))
        .unwrap();

    editor.update(&mut desc, Arc::new(s1)).unwrap();
    editor.flush().unwrap();

    let stored = local.get(&desc).unwrap().unwrap().into_artifact().unwrap();
    let stored = downcast_ref::<MapArtifact>(&stored).unwrap();
    let expected: MapArtifact = [
        ("theme", "dark"),
        ("font", "serif"),
        ("lang", "en"),
        ("tabs", "4"),
    ]
    .into_iter()
    .collect();
    assert_eq!(stored, &expected);
}
