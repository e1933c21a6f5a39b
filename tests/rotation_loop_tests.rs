//! # Rotation Loop Integration Tests
//!
//! Drives the full resolve → render → write pipeline against a scripted
//! in-memory backend and a temporary output directory. No network and no
//! Kubernetes API: the backend seam is the same trait the REST client
//! implements, so everything above the wire is the real code path.
//!
//! These tests verify:
//! - Any number of plain-name entries costs one listing call per tick
//! - The first resolution writes files without reporting a rotation
//! - Later ticks rewrite only entries whose content actually changed
//! - A vault outage serves cached content within the staleness window and
//!   fails the entry beyond it
//! - Per-entry failures leave sibling entries and last-good outputs intact,
//!   and a recovered backend heals the pod without a restart
//! - `fail-on-error` decides whether a failing first resolution is fatal
//! - `init-only` plans resolve once and return; cancellation stops the
//!   sidecar loop and short-circuits retry backoff

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use secret_injection_agent::config::{
    ChangeSignal, ConflictPolicy, FolderRef, InjectionPlan, LocatorConfig, SecretFormat, SecretRef,
};
use secret_injection_agent::rotation::{EntryState, RotationLoop};
use secret_injection_agent::vault::{FieldValue, ResolvedSecret, SecretSource};
use secret_injection_agent::InjectionError;

const UID_A: &str = "AAAAAAAAAAAAAAAAAAAAAA";
const UID_B: &str = "BBBBBBBBBBBBBBBBBBBBBB";
const HOUR: Duration = Duration::from_secs(3600);

/// Scriptable in-memory backend. Tests hold the `Arc`, mutate records or
/// flip availability between ticks, and read the call counters.
#[derive(Default)]
struct ScriptedSource {
    records: Mutex<Vec<ResolvedSecret>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
    folder_calls: AtomicUsize,
}

impl ScriptedSource {
    fn with_records(records: Vec<ResolvedSecret>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            ..Self::default()
        })
    }

    fn set_records(&self, records: Vec<ResolvedSecret>) {
        *self.records.lock().unwrap() = records;
    }

    fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), InjectionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InjectionError::BackendUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait-object handle the loop owns while the test keeps the `Arc`.
struct SourceHandle(Arc<ScriptedSource>);

#[async_trait]
impl SecretSource for SourceHandle {
    async fn list_records(&self) -> Result<Vec<ResolvedSecret>, InjectionError> {
        self.0.list_calls.fetch_add(1, Ordering::SeqCst);
        self.0.check_up()?;
        Ok(self.0.records.lock().unwrap().clone())
    }

    async fn get_record(&self, locator: &str) -> Result<ResolvedSecret, InjectionError> {
        self.0.check_up()?;
        self.0
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.uid == locator || r.title == locator)
            .cloned()
            .ok_or_else(|| InjectionError::RecordNotFound(locator.to_string()))
    }

    async fn get_file(&self, _locator: &str, file_name: &str) -> Result<Vec<u8>, InjectionError> {
        self.0.check_up()?;
        Ok(format!("content of {file_name}").into_bytes())
    }

    async fn list_folder(
        &self,
        _folder: &FolderRef,
    ) -> Result<Vec<ResolvedSecret>, InjectionError> {
        self.0.folder_calls.fetch_add(1, Ordering::SeqCst);
        self.0.check_up()?;
        Ok(self.0.records.lock().unwrap().clone())
    }
}

fn record(uid: &str, title: &str, password: &str) -> ResolvedSecret {
    let mut fields = BTreeMap::new();
    fields.insert(
        "password".to_string(),
        FieldValue::Text(password.to_string()),
    );
    ResolvedSecret {
        uid: uid.to_string(),
        title: title.to_string(),
        record_type: "login".to_string(),
        notes: None,
        fields,
        custom_fields: BTreeMap::new(),
        files: Vec::new(),
        attachment: None,
    }
}

fn plain_entry(name: &str, root: &Path) -> SecretRef {
    SecretRef {
        name: name.to_string(),
        output_path: root.join(name),
        fields: Vec::new(),
        format: SecretFormat::Json,
        template: None,
        notation: None,
        file_name: None,
        env_inject: false,
        env_prefix: None,
        mirror: None,
    }
}

fn plan(secrets: Vec<SecretRef>, folders: Vec<FolderRef>) -> InjectionPlan {
    InjectionPlan {
        secrets,
        folders,
        locator: LocatorConfig::default(),
        fail_on_error: true,
        strict_lookup: false,
        refresh_interval: Duration::from_secs(300),
        signal: None,
        init_only: false,
        ca_cert: None,
    }
}

fn build_loop(
    plan: InjectionPlan,
    source: &Arc<ScriptedSource>,
    cache_max_age: Duration,
) -> (RotationLoop, Arc<AtomicBool>, CancellationToken) {
    let readiness = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let rotation = RotationLoop::new(
        plan,
        Box::new(SourceHandle(source.clone())),
        cache_max_age,
        None,
        readiness.clone(),
        cancel.clone(),
    );
    (rotation, readiness, cancel)
}

fn read_json(path: &Path) -> BTreeMap<String, String> {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("missing output file {}: {e}", path.display()));
    serde_json::from_str(&text).expect("output file holds a json object")
}

#[tokio::test]
async fn test_plain_name_entries_share_one_listing_call_per_tick() {
    for count in [0usize, 1, 5, 50] {
        let dir = tempfile::tempdir().expect("tempdir");
        let records: Vec<ResolvedSecret> = (0..count)
            .map(|i| record(&format!("{i:A>22}"), &format!("record-{i}"), "pw"))
            .collect();
        let source = ScriptedSource::with_records(records);
        let entries: Vec<SecretRef> = (0..count)
            .map(|i| plain_entry(&format!("record-{i}"), dir.path()))
            .collect();
        let (mut rotation, _, _) = build_loop(plan(entries, Vec::new()), &source, HOUR);

        let report = rotation.resolve_once().await;

        assert_eq!(report.failed, 0, "no failures expected with {count} entries");
        assert_eq!(report.files_written, count);
        let expected = usize::from(count > 0);
        assert_eq!(
            source.list_calls.load(Ordering::SeqCst),
            expected,
            "{count} plain-name entries must cost exactly {expected} listing call(s)"
        );
    }
}

#[tokio::test]
async fn test_first_resolution_writes_files_without_a_rotation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let mut first_plan = plan(vec![plain_entry("db-creds", dir.path())], Vec::new());
    first_plan.signal = Some(ChangeSignal {
        signal: "SIGUSR2".to_string(),
        process: Some("no-such-process-name".to_string()),
    });
    let (mut rotation, readiness, _) = build_loop(first_plan, &source, HOUR);

    let report = rotation.resolve_once().await;

    assert_eq!(report.entries, 1);
    assert_eq!(report.files_written, 1);
    assert_eq!(report.rotated, 0, "the first resolution is not a rotation");
    assert_eq!(report.signaled, 0, "no reload signal at startup");
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Fresh);
    assert!(readiness.load(Ordering::SeqCst), "ready after a clean pass");

    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "hunter2");
}

#[tokio::test]
async fn test_unchanged_content_is_not_rewritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, _, _) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );

    rotation.resolve_once().await;
    let second = rotation.resolve_once().await;

    assert_eq!(second.rotated, 0);
    assert_eq!(second.files_written, 0, "identical content never hits the disk");
    assert_eq!(
        source.list_calls.load(Ordering::SeqCst),
        2,
        "every tick re-lists; only the writes are skipped"
    );
}

#[tokio::test]
async fn test_changed_content_rotates_and_rewrites() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let mut rotated_plan = plan(vec![plain_entry("db-creds", dir.path())], Vec::new());
    rotated_plan.signal = Some(ChangeSignal {
        signal: "SIGUSR2".to_string(),
        process: Some("no-such-process-name".to_string()),
    });
    let (mut rotation, _, _) = build_loop(rotated_plan, &source, HOUR);

    rotation.resolve_once().await;
    source.set_records(vec![record(UID_A, "db-creds", "rotated-pw")]);
    let report = rotation.resolve_once().await;

    assert_eq!(report.rotated, 1);
    assert_eq!(report.files_written, 1);
    // The filter names no running process, so delivery counts zero; the
    // point is that the loop got as far as delivery only on a changed tick.
    assert_eq!(report.signaled, 0);

    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "rotated-pw");
}

#[tokio::test(start_paused = true)]
async fn test_outage_serves_cached_content_within_the_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, readiness, _) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );

    rotation.resolve_once().await;
    source.set_unavailable(true);
    let degraded = rotation.resolve_once().await;

    assert_eq!(degraded.degraded, 1);
    assert_eq!(degraded.failed, 0);
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Stale);
    assert!(readiness.load(Ordering::SeqCst), "degraded is still ready");
    assert_eq!(
        source.list_calls.load(Ordering::SeqCst),
        4,
        "the outage tick retries the listing three times"
    );
    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "hunter2", "last-good content stays on disk");

    source.set_unavailable(false);
    let recovered = rotation.resolve_once().await;

    assert_eq!(recovered.degraded, 0);
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Fresh);
    assert_eq!(
        recovered.files_written, 0,
        "change detection survives the outage; identical content is not rewritten"
    );
}

#[tokio::test(start_paused = true)]
async fn test_outage_beyond_the_staleness_window_fails_the_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, readiness, _) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        Duration::ZERO,
    );

    rotation.resolve_once().await;
    // Age the cache entry past the zero-length serving window.
    std::thread::sleep(Duration::from_millis(5));
    source.set_unavailable(true);
    let report = rotation.resolve_once().await;

    assert_eq!(report.degraded, 0, "an expired cache entry is never served");
    assert_eq!(report.failed, 1);
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Failed);
    assert!(!readiness.load(Ordering::SeqCst));
    assert!(matches!(
        report.first_error,
        Some(InjectionError::BackendUnavailable(_))
    ));
    assert!(
        dir.path().join("db-creds").exists(),
        "even a failed entry never deletes the last-good file"
    );
}

#[tokio::test(start_paused = true)]
async fn test_fail_closed_vs_fail_open_on_the_first_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");

    let source = ScriptedSource::with_records(Vec::new());
    source.set_unavailable(true);
    let (mut closed, _, _) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );
    let err = closed
        .run_once()
        .await
        .expect_err("fail-on-error must turn a failed first resolution into an error");
    assert!(matches!(err, InjectionError::BackendUnavailable(_)));

    let source = ScriptedSource::with_records(Vec::new());
    source.set_unavailable(true);
    let mut open_plan = plan(vec![plain_entry("db-creds", dir.path())], Vec::new());
    open_plan.fail_on_error = false;
    let (mut open, readiness, _) = build_loop(open_plan, &source, HOUR);
    let report = open
        .run_once()
        .await
        .expect("fail-open starts the workload without its secrets");
    assert_eq!(report.failed, 1);
    assert!(
        !readiness.load(Ordering::SeqCst),
        "the probe still surfaces the failure"
    );
}

#[tokio::test]
async fn test_per_entry_failures_leave_siblings_intact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, readiness, _) = build_loop(
        plan(
            vec![
                plain_entry("db-creds", dir.path()),
                plain_entry("not-there-yet", dir.path()),
            ],
            Vec::new(),
        ),
        &source,
        HOUR,
    );

    let report = rotation.resolve_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.files_written, 1, "the resolvable sibling still lands");
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Fresh);
    assert_eq!(rotation.entry_state("secret/1"), EntryState::Failed);
    assert!(!readiness.load(Ordering::SeqCst));
    assert!(matches!(
        report.first_error,
        Some(InjectionError::RecordNotFound(_))
    ));
    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "hunter2");

    // The missing record appears; the next tick heals without a restart.
    source.set_records(vec![
        record(UID_A, "db-creds", "hunter2"),
        record(UID_B, "not-there-yet", "now-present"),
    ]);
    let healed = rotation.resolve_once().await;

    assert_eq!(healed.failed, 0);
    assert_eq!(healed.files_written, 1, "only the late entry writes");
    assert_eq!(rotation.entry_state("secret/1"), EntryState::Fresh);
    assert!(readiness.load(Ordering::SeqCst));
    let content = read_json(&dir.path().join("not-there-yet"));
    assert_eq!(content["password"], "now-present");
}

#[tokio::test]
async fn test_later_tick_failures_keep_last_good_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, readiness, _) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );

    rotation.resolve_once().await;
    // The record disappears from the vault; not a retryable condition.
    source.set_records(Vec::new());
    let failing = rotation.resolve_once().await;

    assert_eq!(failing.failed, 1);
    assert_eq!(rotation.entry_state("secret/0"), EntryState::Failed);
    assert!(!readiness.load(Ordering::SeqCst));
    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "hunter2", "last-good output survives");

    // It comes back with new content; the rotation is detected against the
    // last successful resolution, not against the failed tick.
    source.set_records(vec![record(UID_A, "db-creds", "rotated-pw")]);
    let recovered = rotation.resolve_once().await;

    assert_eq!(recovered.failed, 0);
    assert_eq!(recovered.rotated, 1);
    assert!(readiness.load(Ordering::SeqCst));
    let content = read_json(&dir.path().join("db-creds"));
    assert_eq!(content["password"], "rotated-pw");
}

#[tokio::test]
async fn test_folder_entries_render_one_file_per_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![
        record(UID_A, "postgres", "pg-pw"),
        record(UID_B, "mysql", "my-pw"),
    ]);
    let folder = FolderRef {
        uid: Some("FLDAAAAAAAAAAAAAAAAAAA".to_string()),
        path: None,
        output_path: dir.path().join("prod"),
        secret_prefix: None,
        policy: ConflictPolicy::Overwrite,
        owned: true,
    };
    let (mut rotation, _, _) = build_loop(plan(Vec::new(), vec![folder]), &source, HOUR);

    let report = rotation.resolve_once().await;

    assert_eq!(report.entries, 1, "a folder is one plan entry");
    assert_eq!(report.files_written, 2, "but writes one file per record");
    assert_eq!(source.folder_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rotation.entry_state("folder/0"), EntryState::Fresh);
    assert_eq!(read_json(&dir.path().join("prod/postgres"))["password"], "pg-pw");
    assert_eq!(read_json(&dir.path().join("prod/mysql"))["password"], "my-pw");

    // One record rotates; the folder entry counts as one rotation and
    // rewrites its whole directory listing.
    source.set_records(vec![
        record(UID_A, "postgres", "pg-rotated"),
        record(UID_B, "mysql", "my-pw"),
    ]);
    let rotated = rotation.resolve_once().await;

    assert_eq!(rotated.rotated, 1);
    assert_eq!(rotated.files_written, 2);
    assert_eq!(read_json(&dir.path().join("prod/postgres"))["password"], "pg-rotated");
}

#[tokio::test]
async fn test_init_only_resolves_once_and_returns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let mut init_plan = plan(vec![plain_entry("db-creds", dir.path())], Vec::new());
    init_plan.init_only = true;
    let (mut rotation, readiness, _) = build_loop(init_plan, &source, HOUR);

    rotation.run().await.expect("init-only run completes");

    assert_eq!(source.list_calls.load(Ordering::SeqCst), 1, "exactly one pass");
    assert!(readiness.load(Ordering::SeqCst));
    assert!(dir.path().join("db-creds").exists());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_the_sidecar_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(vec![record(UID_A, "db-creds", "hunter2")]);
    let (mut rotation, _, cancel) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );

    let handle = tokio::spawn(async move { rotation.run().await });
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("run must return promptly after cancellation")
        .expect("rotation task must not panic");
    assert!(result.is_ok(), "cancellation is a clean shutdown, not an error");
    assert_eq!(
        source.list_calls.load(Ordering::SeqCst),
        1,
        "the loop never starts a second tick after cancellation"
    );
}

#[tokio::test]
async fn test_cancellation_short_circuits_retry_backoff() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ScriptedSource::with_records(Vec::new());
    source.set_unavailable(true);
    let (mut rotation, _, cancel) = build_loop(
        plan(vec![plain_entry("db-creds", dir.path())], Vec::new()),
        &source,
        HOUR,
    );

    cancel.cancel();
    let report = rotation.resolve_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(
        source.list_calls.load(Ordering::SeqCst),
        1,
        "a cancelled pass gives up after the first attempt instead of sleeping"
    );
}
