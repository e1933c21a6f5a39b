//! # Rotation Loop
//!
//! Owns the resolve → render → write → mirror → signal pipeline and drives it
//! either once (init-container mode) or on a fixed interval (sidecar mode).
//!
//! ## Per-Entry State Machine
//!
//! Every plan entry moves through `Uninitialized → Fresh → Stale →
//! Fresh|Failed`:
//!
//! - **Fresh**: the last tick resolved the entry from the vault
//! - **Stale**: the vault was unreachable and the entry is served from the
//!   cache (degraded mode, bounded by the cache max age)
//! - **Failed**: neither the vault nor a usable cache entry could produce
//!   the secrets
//!
//! ## Failure Policy
//!
//! Retries are bounded (3 attempts, exponential delay, only
//! `BackendUnavailable` retries) and every sleep races the cancellation
//! token. A failing first resolution is fatal under `fail-on-error`;
//! failures on later ticks flip readiness off and keep ticking — the probe
//! surfaces the condition, the process never crashes on a bad tick.
//!
//! Ticks are strictly sequential: all writes of a tick are durable (fsync +
//! rename) before the next tick can start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResolutionCache;
use crate::config::{FolderRef, InjectionPlan, SecretRef};
use crate::constants::{FETCH_RETRY_ATTEMPTS, FETCH_RETRY_BASE_MS, FETCH_RETRY_MAX_MS};
use crate::error::InjectionError;
use crate::mirror::SecretMirror;
use crate::notify;
use crate::output;
use crate::render::{render_folder, render_secret, TemplateRenderer};
use crate::vault::{PlanFetcher, ResolvedSecret, SecretSource};

/// Lifecycle of one plan entry across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    /// Never successfully resolved
    #[default]
    Uninitialized,
    /// Last tick resolved from the vault
    Fresh,
    /// Last tick served from the cache while the vault was unreachable
    Stale,
    /// Last tick produced nothing usable
    Failed,
}

/// What a single tick did, for logging and for tests.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Plan entries attempted (secrets + folders)
    pub entries: usize,
    /// Output files written this tick
    pub files_written: usize,
    /// Entries whose content changed relative to the previous resolution
    pub rotated: usize,
    /// Entries served from the cache in degraded mode
    pub degraded: usize,
    /// Entries that produced nothing usable
    pub failed: usize,
    /// Sibling processes signaled after a rotation
    pub signaled: usize,
    /// First per-entry error of the tick, for fatal escalation
    pub first_error: Option<InjectionError>,
}

enum EntryOutcome {
    Fresh { files_written: usize, rotated: bool },
    Degraded,
    Failed(InjectionError),
}

/// Sequential resolve/render/write driver for one pod's injection plan.
pub struct RotationLoop {
    plan: InjectionPlan,
    source: Box<dyn SecretSource>,
    cache: ResolutionCache,
    templates: TemplateRenderer,
    mirror: Option<SecretMirror>,
    readiness: Arc<AtomicBool>,
    cancel: CancellationToken,
    states: HashMap<String, EntryState>,
}

impl std::fmt::Debug for RotationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationLoop")
            .field("entries", &self.plan.entry_count())
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl RotationLoop {
    pub fn new(
        plan: InjectionPlan,
        source: Box<dyn SecretSource>,
        cache_max_age: Duration,
        mirror: Option<SecretMirror>,
        readiness: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan,
            source,
            cache: ResolutionCache::new(cache_max_age),
            templates: TemplateRenderer::new(),
            mirror,
            readiness,
            cancel,
            states: HashMap::new(),
        }
    }

    /// Current state of one plan entry (`secret/<i>` or `folder/<i>`).
    #[must_use]
    pub fn entry_state(&self, key: &str) -> EntryState {
        self.states.get(key).copied().unwrap_or_default()
    }

    /// One full resolution pass over every plan entry.
    ///
    /// Per-entry failures never abort the pass; they are isolated into the
    /// report and the entry keeps its previous on-disk content. Readiness
    /// reflects whether the pass left any entry failed.
    pub async fn resolve_once(&mut self) -> TickReport {
        let mut report = TickReport {
            entries: self.plan.entry_count(),
            ..TickReport::default()
        };

        // One fetcher per pass: all plain-name entries share its single
        // listing round trip.
        let mut fetcher = PlanFetcher::new(self.source.as_ref(), self.plan.strict_lookup);

        for (index, entry) in self.plan.secrets.iter().enumerate() {
            let key = format!("secret/{index}");
            let outcome = resolve_secret_entry(
                &self.cancel,
                &mut fetcher,
                &self.cache,
                &self.templates,
                self.mirror.as_ref(),
                entry,
                &key,
            )
            .await;
            apply_outcome(&mut self.states, &mut report, &key, outcome);
        }

        for (index, folder) in self.plan.folders.iter().enumerate() {
            let key = format!("folder/{index}");
            let outcome = resolve_folder_entry(
                &self.cancel,
                &mut fetcher,
                &self.cache,
                self.mirror.as_ref(),
                folder,
                &key,
            )
            .await;
            apply_outcome(&mut self.states, &mut report, &key, outcome);
        }

        // Signal once per changed tick, never per entry. The first
        // resolution writes files but rotates nothing, so dependents that
        // start after the agent see no spurious reload.
        if report.rotated > 0 {
            if let Some(change) = &self.plan.signal {
                report.signaled = notify::notify_change(change);
                info!(
                    processes = report.signaled,
                    signal = %change.signal,
                    "📣 Notified dependents of rotated secrets"
                );
            }
        }

        self.readiness.store(report.failed == 0, Ordering::SeqCst);
        report
    }

    /// One pass with the fail-closed policy applied: any failed entry turns
    /// into an error return.
    pub async fn run_once(&mut self) -> Result<TickReport, InjectionError> {
        let mut report = self.resolve_once().await;
        if self.plan.fail_on_error && report.failed > 0 {
            if let Some(err) = report.first_error.take() {
                return Err(err);
            }
        }
        Ok(report)
    }

    /// Run to completion: resolve once, then either exit (`init-only`) or
    /// keep rotating on the refresh interval until cancelled.
    ///
    /// Only the first resolution can kill the process. Later tick failures
    /// are logged and flip readiness off; the loop keeps going so a
    /// recovered vault heals the pod without a restart.
    pub async fn run(&mut self) -> Result<(), InjectionError> {
        let report = self.run_once().await?;
        info!(
            entries = report.entries,
            files = report.files_written,
            failed = report.failed,
            "✅ Initial secret resolution complete"
        );

        if self.plan.init_only {
            return Ok(());
        }

        loop {
            if let Some(at) = next_tick_time(self.plan.refresh_interval) {
                debug!(next_tick = %at, "Sleeping until the next rotation tick");
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Rotation loop cancelled, shutting down");
                    return Ok(());
                }
                () = tokio::time::sleep(self.plan.refresh_interval) => {}
            }

            let report = self.resolve_once().await;
            if report.failed > 0 {
                error!(
                    failed = report.failed,
                    entries = report.entries,
                    "❌ Rotation tick had failing entries; keeping last-good outputs"
                );
            } else if report.rotated > 0 {
                info!(
                    rotated = report.rotated,
                    files = report.files_written,
                    "🔄 Rotated secrets"
                );
            } else {
                debug!(entries = report.entries, "Rotation tick, nothing changed");
            }
        }
    }
}

/// Delay before the next fetch attempt: 500 ms doubling, capped at 30 s.
fn retry_delay(attempt: u32) -> Duration {
    let exp = FETCH_RETRY_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(exp.min(FETCH_RETRY_MAX_MS))
}

/// Wall-clock timestamp of the next tick, for the operator log line.
fn next_tick_time(interval: Duration) -> Option<String> {
    chrono::Utc::now()
        .checked_add_signed(chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero()))
        .map(|dt| dt.to_rfc3339())
}

async fn fetch_secret_with_retry(
    cancel: &CancellationToken,
    fetcher: &mut PlanFetcher<'_>,
    entry: &SecretRef,
) -> Result<ResolvedSecret, InjectionError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match fetcher.fetch_secret(entry).await {
            Ok(record) => return Ok(record),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= FETCH_RETRY_ATTEMPTS || cancel.is_cancelled() {
            return Err(err);
        }
        let delay = retry_delay(attempt);
        warn!(entry = entry.label(), attempt, delay = ?delay, %err, "🔄 Retrying vault fetch");
        tokio::select! {
            () = cancel.cancelled() => return Err(err),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn fetch_folder_with_retry(
    cancel: &CancellationToken,
    fetcher: &mut PlanFetcher<'_>,
    folder: &FolderRef,
) -> Result<Vec<ResolvedSecret>, InjectionError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match fetcher.fetch_folder(folder).await {
            Ok(records) => return Ok(records),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= FETCH_RETRY_ATTEMPTS || cancel.is_cancelled() {
            return Err(err);
        }
        let delay = retry_delay(attempt);
        warn!(folder = folder.label(), attempt, delay = ?delay, %err, "🔄 Retrying folder fetch");
        tokio::select! {
            () = cancel.cancelled() => return Err(err),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[allow(clippy::too_many_arguments, reason = "pass-scoped context, not state")]
async fn resolve_secret_entry(
    cancel: &CancellationToken,
    fetcher: &mut PlanFetcher<'_>,
    cache: &ResolutionCache,
    templates: &TemplateRenderer,
    mirror: Option<&SecretMirror>,
    entry: &SecretRef,
    key: &str,
) -> EntryOutcome {
    let record = match fetch_secret_with_retry(cancel, fetcher, entry).await {
        Ok(record) => record,
        Err(err) if err.is_retryable() => {
            if cache.get_fresh(key).is_some() {
                warn!(
                    entry = entry.label(),
                    %err,
                    "⚠️ Vault unreachable, serving cached secrets (degraded)"
                );
                return EntryOutcome::Degraded;
            }
            error!(entry = entry.label(), %err, "❌ Vault unreachable and no usable cache entry");
            return EntryOutcome::Failed(err);
        }
        Err(err) => {
            error!(entry = entry.label(), %err, "❌ Secret resolution failed");
            return EntryOutcome::Failed(err);
        }
    };

    let current = vec![record];
    let previous = cache.get(key);
    let first = previous.is_none();
    let rotated = previous.is_some_and(|prev| prev != current);

    let mut files_written = 0;
    if first || rotated {
        let files = match render_secret(entry, &current[0], templates) {
            Ok(files) => files,
            Err(err) => {
                error!(entry = entry.label(), %err, "❌ Rendering failed");
                return EntryOutcome::Failed(err);
            }
        };
        if let Err(err) = output::write_all(&files) {
            error!(entry = entry.label(), %err, "❌ Writing output files failed");
            return EntryOutcome::Failed(err);
        }
        files_written = files.len();

        if let (Some(target), Some(mirror)) = (&entry.mirror, mirror) {
            if let Err(err) = mirror.mirror_record(target, &current[0]).await {
                error!(entry = entry.label(), %err, "❌ Secret mirroring failed");
                return EntryOutcome::Failed(err);
            }
        }
    }

    cache.put(key, current);
    EntryOutcome::Fresh {
        files_written,
        rotated,
    }
}

async fn resolve_folder_entry(
    cancel: &CancellationToken,
    fetcher: &mut PlanFetcher<'_>,
    cache: &ResolutionCache,
    mirror: Option<&SecretMirror>,
    folder: &FolderRef,
    key: &str,
) -> EntryOutcome {
    let records = match fetch_folder_with_retry(cancel, fetcher, folder).await {
        Ok(records) => records,
        Err(err) if err.is_retryable() => {
            if cache.get_fresh(key).is_some() {
                warn!(
                    folder = folder.label(),
                    %err,
                    "⚠️ Vault unreachable, serving cached folder records (degraded)"
                );
                return EntryOutcome::Degraded;
            }
            error!(folder = folder.label(), %err, "❌ Vault unreachable and no usable cache entry");
            return EntryOutcome::Failed(err);
        }
        Err(err) => {
            error!(folder = folder.label(), %err, "❌ Folder resolution failed");
            return EntryOutcome::Failed(err);
        }
    };

    let previous = cache.get(key);
    let first = previous.is_none();
    let rotated = previous.is_some_and(|prev| prev != records);

    let mut files_written = 0;
    if first || rotated {
        let files = match render_folder(folder, &records) {
            Ok(files) => files,
            Err(err) => {
                error!(folder = folder.label(), %err, "❌ Rendering folder failed");
                return EntryOutcome::Failed(err);
            }
        };
        if let Err(err) = output::write_all(&files) {
            error!(folder = folder.label(), %err, "❌ Writing folder outputs failed");
            return EntryOutcome::Failed(err);
        }
        files_written = files.len();

        if let Some(mirror) = mirror {
            if let Err(err) = mirror.mirror_folder(folder, &records).await {
                error!(folder = folder.label(), %err, "❌ Folder mirroring failed");
                return EntryOutcome::Failed(err);
            }
        }
    }

    cache.put(key, records);
    EntryOutcome::Fresh {
        files_written,
        rotated,
    }
}

fn apply_outcome(
    states: &mut HashMap<String, EntryState>,
    report: &mut TickReport,
    key: &str,
    outcome: EntryOutcome,
) {
    let next = match outcome {
        EntryOutcome::Fresh {
            files_written,
            rotated,
        } => {
            report.files_written += files_written;
            if rotated {
                report.rotated += 1;
            }
            EntryState::Fresh
        }
        EntryOutcome::Degraded => {
            report.degraded += 1;
            EntryState::Stale
        }
        EntryOutcome::Failed(err) => {
            report.failed += 1;
            if report.first_error.is_none() {
                report.first_error = Some(err);
            }
            EntryState::Failed
        }
    };
    let previous = states.insert(key.to_string(), next).unwrap_or_default();
    if previous != next {
        debug!(entry = key, from = ?previous, to = ?next, "Entry state transition");
    }
}
