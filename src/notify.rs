//! # Change Notification
//!
//! Delivers a Unix signal to sibling processes after a rotation tick rewrote
//! secret files, so long-running workloads reload credentials without a
//! restart.
//!
//! Requires `shareProcessNamespace: true` on the pod; without it the agent's
//! PID namespace contains only the agent and nothing is signaled. PID 1 (the
//! sandbox pause process) and the agent itself are always excluded. An
//! optional command-name filter restricts delivery to processes whose
//! `/proc/<pid>/comm` matches exactly.

use std::fs;
use std::str::FromStr;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::ChangeSignal;
use crate::error::InjectionError;

/// Parse a signal name from an annotation value. Accepts the full name
/// (`SIGHUP`) or the short form (`HUP`), case-insensitive.
pub fn signal_from_name(name: &str) -> Result<Signal, InjectionError> {
    let trimmed = name.trim().to_uppercase();
    let full = if trimmed.starts_with("SIG") {
        trimmed
    } else {
        format!("SIG{trimmed}")
    };
    match Signal::from_str(&full) {
        Ok(signal) => Ok(signal),
        Err(_errno) => Err(InjectionError::ConfigInvalid(format!(
            "unknown signal name '{name}'"
        ))),
    }
}

/// Signal every sibling process in the shared PID namespace. Best effort:
/// delivery failures are logged, never fatal. Returns the number of
/// processes signaled.
pub fn notify_change(change: &ChangeSignal) -> usize {
    let signal = match signal_from_name(&change.signal) {
        Ok(signal) => signal,
        // the name was validated at parse time; a failure here means the
        // plan was constructed by hand
        Err(err) => {
            warn!(signal = %change.signal, %err, "⚠️ Invalid change signal, skipping delivery");
            return 0;
        }
    };

    let mut delivered = 0;
    for (pid, comm) in sibling_processes(change.process.as_deref()) {
        match signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                debug!(pid, command = %comm, signal = %change.signal, "📣 Delivered change signal");
                delivered += 1;
            }
            Err(errno) => {
                warn!(pid, command = %comm, %errno, "⚠️ Failed to deliver change signal");
            }
        }
    }
    delivered
}

/// Scan `/proc` for sibling processes, excluding the agent itself and the
/// sandbox pause process at PID 1.
fn sibling_processes(process_filter: Option<&str>) -> Vec<(i32, String)> {
    let own_pid = std::process::id() as i32;
    let Ok(entries) = fs::read_dir("/proc") else {
        warn!("⚠️ /proc is not readable; change signal not delivered");
        return Vec::new();
    };

    let mut siblings = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == own_pid || pid == 1 {
            continue;
        }
        let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
            .unwrap_or_default()
            .trim()
            .to_string();
        if let Some(filter) = process_filter {
            if comm != filter {
                continue;
            }
        }
        siblings.push((pid, comm));
    }
    siblings.sort_unstable();
    siblings
}
