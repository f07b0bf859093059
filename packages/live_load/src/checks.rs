//! Check results and run counters
//!
//! A check is a named pass/fail assertion recorded by every session. Counters
//! track session and frame volume across all virtual users.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const HTTP_OK: &str = "HTTP request was successful";
pub const CSRF_PRESENT: &str = "CSRF token is present";
pub const CREDENTIALS_FOUND: &str = "join credentials found";
pub const WS_UPGRADED: &str = "WebSocket connection was successful";
pub const JOIN_REPLY_OK: &str = "join reply was ok";
pub const EVENT_REPLY_OK: &str = "event reply was ok";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: u64,
    pub failed: u64,
}

/// Named pass/fail counts.
#[derive(Debug, Default)]
pub struct CheckTally {
    checks: Mutex<BTreeMap<&'static str, Tally>>,
}

impl CheckTally {
    /// Record one outcome and hand it back, so callers can branch on it.
    pub fn record(&self, name: &'static str, passed: bool) -> bool {
        if let Ok(mut map) = self.checks.lock() {
            let tally = map.entry(name).or_default();
            if passed {
                tally.passed += 1;
            } else {
                tally.failed += 1;
            }
        }
        passed
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Tally {
        self.checks
            .lock()
            .ok()
            .and_then(|map| map.get(name).copied())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<CheckSummary> {
        match self.checks.lock() {
            Ok(map) => map
                .iter()
                .map(|(name, tally)| CheckSummary {
                    name: name.to_string(),
                    passed: tally.passed,
                    failed: tally.failed,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Run-wide counters, shared by every virtual user.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pub checks: CheckTally,

    pub sessions_started: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_failed: AtomicU64,

    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,

    /// Failed sessions keyed by error code.
    failures: Mutex<BTreeMap<String, u64>>,

    start_time: Option<Instant>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self, error_code: &str) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.failures.lock() {
            *map.entry(error_code.to_string()).or_default() += 1;
        }
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            elapsed_secs: self.elapsed_secs(),
            sessions: SessionCounts {
                started: self.sessions_started.load(Ordering::Relaxed),
                completed: self.sessions_completed.load(Ordering::Relaxed),
                failed: self.sessions_failed.load(Ordering::Relaxed),
            },
            frames: FrameCounts {
                sent: self.frames_sent.load(Ordering::Relaxed),
                received: self.frames_received.load(Ordering::Relaxed),
            },
            checks: self.checks.snapshot(),
            failures: self
                .failures
                .lock()
                .map(|map| map.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub sessions: SessionCounts,
    pub frames: FrameCounts,
    pub checks: Vec<CheckSummary>,
    pub failures: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCounts {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameCounts {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub passed: u64,
    pub failed: u64,
}

impl RunSummary {
    /// No failed check and no failed session.
    pub fn all_passed(&self) -> bool {
        self.sessions.failed == 0 && self.checks.iter().all(|c| c.failed == 0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checks:")?;
        for check in &self.checks {
            let mark = if check.failed == 0 { "ok  " } else { "FAIL" };
            writeln!(
                f,
                "  {mark} {:<40} {} passed, {} failed",
                check.name, check.passed, check.failed
            )?;
        }
        writeln!(
            f,
            "sessions: {} started, {} completed, {} failed",
            self.sessions.started, self.sessions.completed, self.sessions.failed
        )?;
        writeln!(
            f,
            "frames:   {} sent, {} received",
            self.frames.sent, self.frames.received
        )?;
        if !self.failures.is_empty() {
            writeln!(f, "failures:")?;
            for (code, count) in &self.failures {
                writeln!(f, "  {code}: {count}")?;
            }
        }
        write!(f, "elapsed:  {:.2}s", self.elapsed_secs)
    }
}
