use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::{EntityKey, Health, SpotSample, StatusChange};

pub const SPOT_HISTORY_MAX: usize = 100;
pub const SPOT_HISTORY_KEEP: usize = 50;
pub const STATUS_LOG_MAX: usize = 200;
pub const STATUS_LOG_KEEP: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityState {
    pub last_status: Option<String>,
    pub last_spot_count: Option<String>,
    pub spot_history: Vec<SpotSample>,
    pub alerted: bool,
    pub low_spot_alerted: BTreeSet<u32>,
    pub open: bool,
}

impl EntityState {
    pub fn record_spots(&mut self, at: DateTime<Utc>, spots: &str) {
        self.spot_history.push(SpotSample {
            at,
            spots: spots.to_string(),
        });
        compact(&mut self.spot_history, SPOT_HISTORY_MAX, SPOT_HISTORY_KEEP);
    }

    /// Recent spot counts with consecutive repeats folded, oldest first.
    pub fn trend(&self, last: usize) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in &self.spot_history {
            if out.last() != Some(&s.spots.as_str()) {
                out.push(&s.spots);
            }
        }
        let skip = out.len().saturating_sub(last);
        out.split_off(skip)
    }
}

/// Everything the engine remembers between cycles and across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorState {
    pub total_checks: u64,
    pub total_alerts: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,

    pub started_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_alert: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_daily_report: Option<DateTime<Utc>>,

    pub paused: bool,
    pub entities: BTreeMap<String, EntityState>,
    pub status_log: Vec<StatusChange>,
    pub page_hashes: BTreeMap<String, String>,
    pub command_cursor: i64,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            total_checks: 0,
            total_alerts: 0,
            total_errors: 0,
            consecutive_errors: 0,
            started_at: Utc::now(),
            last_check: None,
            last_alert: None,
            last_heartbeat: None,
            last_daily_report: None,
            paused: false,
            entities: BTreeMap::new(),
            status_log: Vec::new(),
            page_hashes: BTreeMap::new(),
            command_cursor: 0,
        }
    }
}

impl MonitorState {
    pub fn entity(&self, key: &EntityKey) -> Option<&EntityState> {
        self.entities.get(key.as_str())
    }

    pub fn entity_mut(&mut self, key: &EntityKey) -> &mut EntityState {
        self.entities.entry(key.as_str().to_string()).or_default()
    }

    pub fn notified(&self) -> impl Iterator<Item = &str> {
        self.entities
            .iter()
            .filter(|(_, e)| e.alerted)
            .map(|(k, _)| k.as_str())
    }

    pub fn any_open(&self) -> bool {
        self.entities.values().any(|e| e.open)
    }

    pub fn log_status_change(&mut self, change: StatusChange) {
        self.status_log.push(change);
        compact(&mut self.status_log, STATUS_LOG_MAX, STATUS_LOG_KEEP);
    }

    /// Records one failed fetch attempt. Returns true when the streak has just
    /// reached a multiple of `threshold` and operators should hear about it.
    pub fn record_error(&mut self, threshold: u32) -> bool {
        self.total_errors += 1;
        self.consecutive_errors += 1;
        threshold > 0 && self.consecutive_errors % threshold == 0
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Forget which entities were alerted, their spot history and the change log.
    pub fn reset(&mut self) {
        for e in self.entities.values_mut() {
            e.alerted = false;
            e.low_spot_alerted.clear();
            e.spot_history.clear();
        }
        self.status_log.clear();
    }

    pub fn health(&self) -> Health {
        Health {
            status: if self.paused { "paused" } else { "ok" },
            started_at: self.started_at,
            last_check: self.last_check,
            total_checks: self.total_checks,
            total_alerts: self.total_alerts,
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
            notified: self.notified().count(),
        }
    }
}

/// Drop the oldest entries once `max` is exceeded, keeping the newest `keep`.
fn compact<T>(items: &mut Vec<T>, max: usize, keep: usize) {
    if items.len() > max {
        let excess = items.len() - keep;
        items.drain(..excess);
    }
}

/// JSON snapshot of [`MonitorState`] on local disk.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable snapshots fall back to a fresh state.
    pub fn load(&self) -> MonitorState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path=%self.path.display(), "no state file, starting fresh");
                return MonitorState::default();
            }
            Err(e) => {
                warn!(error=?e, path=%self.path.display(), "state file unreadable, starting fresh");
                return MonitorState::default();
            }
        };

        match serde_json::from_str::<MonitorState>(&raw) {
            Ok(mut state) => {
                state.started_at = Utc::now();
                state
            }
            Err(e) => {
                warn!(error=%e, path=%self.path.display(), "state file corrupt, starting fresh");
                MonitorState::default()
            }
        }
    }

    /// Whole-file rewrite through a sibling temp file.
    pub fn save(&self, state: &MonitorState) -> Result<()> {
        let body = serde_json::to_vec_pretty(state).context("serialize state")?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}
