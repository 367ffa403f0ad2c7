use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One calendar row as it appeared on the page during a single fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRow {
    pub kind: String,
    pub organization: String,
    pub region: String,
    pub city: String,
    pub registration_deadline: String,
    pub spot_count: String,
    pub status_text: String,
    pub target_date: String,

    // Registration link from the status cell, absolute when the page URL is known.
    pub link: Option<String>,
}

impl TrackedRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.kind, &self.organization, &self.target_date)
    }

    pub fn normalized_status(&self) -> String {
        normalize_status(&self.status_text)
    }
}

pub fn normalize_status(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Stable identity of an offering across cycles: `(kind, organization, target date)`.
///
/// Region and city are not part of the key, so two rows that differ only by
/// location collapse into one entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(kind: &str, organization: &str, target_date: &str) -> Self {
        Self(format!(
            "{}|{}|{}",
            kind.trim(),
            organization.trim(),
            target_date.trim()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotSample {
    pub at: DateTime<Utc>,
    pub spots: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub at: DateTime<Utc>,
    pub key: String,
    pub organization: String,
    pub from: String,
    pub to: String,
}

/// Inbound operator message from the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub total_alerts: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub notified: usize,
}

#[cfg(test)]
pub(crate) fn row(org: &str, date: &str, spots: &str, status: &str) -> TrackedRow {
    TrackedRow {
        kind: "CENT@CASA".into(),
        organization: org.into(),
        region: "Lombardia".into(),
        city: "Milano".into(),
        registration_deadline: "20/04/2024".into(),
        spot_count: spots.into(),
        status_text: status.into(),
        target_date: date.into(),
        link: None,
    }
}
