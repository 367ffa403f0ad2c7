use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::Rules;
use crate::store::MonitorState;
use crate::types::{StatusChange, TrackedRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotChange {
    pub row: TrackedRow,
    pub previous: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub row: TrackedRow,
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowSpot {
    pub row: TrackedRow,
    pub remaining: u32,
}

/// What changed between the stored state and one batch of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub newly_open: Vec<TrackedRow>,
    pub spot_changes: Vec<SpotChange>,
    pub status_changes: Vec<StatusTransition>,
    pub low_spots: Vec<LowSpot>,
    pub open_rows: usize,
    pub closed_rows: usize,
}

impl ChangeSet {
    pub fn is_quiet(&self) -> bool {
        self.newly_open.is_empty()
            && self.spot_changes.is_empty()
            && self.status_changes.is_empty()
            && self.low_spots.is_empty()
    }
}

/// A status is closed when it contains any configured closed term; anything
/// else, including text never seen before, counts as open.
pub fn is_open(status: &str, rules: &Rules) -> bool {
    let status = status.to_uppercase();
    !rules
        .closed_statuses
        .iter()
        .any(|term| status.contains(term.as_str()))
}

/// Seat count as a number, if the cell holds one.
pub fn parse_spots(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

/// One row per entity key, in order of first appearance. Among rows sharing a
/// key the first open one stands for the entity, else the first row.
pub fn one_per_entity<'a>(rows: &'a [TrackedRow], rules: &Rules) -> Vec<&'a TrackedRow> {
    let mut picked: Vec<&TrackedRow> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();
    for row in rows {
        match slot.get(row.key().as_str()).copied() {
            Some(i) => {
                if !is_open(&picked[i].status_text, rules) && is_open(&row.status_text, rules) {
                    picked[i] = row;
                }
            }
            None => {
                slot.insert(row.key().as_str().to_string(), picked.len());
                picked.push(row);
            }
        }
    }
    picked
}

/// Diff `rows` against `state`, updating each entity's stored status, spot
/// count, history and alert flags along the way. Each entity is classified
/// once per batch, however many rows carry its key.
pub fn detect(
    rows: &[TrackedRow],
    state: &mut MonitorState,
    rules: &Rules,
    now: DateTime<Utc>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut transitions = Vec::new();

    for row in one_per_entity(rows, rules) {
        let key = row.key();
        let status = row.normalized_status();
        let open = is_open(&status, rules);
        let entity = state.entity_mut(&key);

        entity.record_spots(now, &row.spot_count);

        if let Some(prev) = entity.last_status.as_deref() {
            if prev != status {
                changes.status_changes.push(StatusTransition {
                    row: row.clone(),
                    previous: prev.to_string(),
                    current: status.clone(),
                });
                transitions.push(StatusChange {
                    at: now,
                    key: key.to_string(),
                    organization: row.organization.clone(),
                    from: prev.to_string(),
                    to: status.clone(),
                });
            }
        }

        if open {
            changes.open_rows += 1;
            let newly = !entity.alerted;

            if newly {
                changes.newly_open.push(row.clone());
            } else if let Some(prev) = entity.last_spot_count.as_deref() {
                if prev != row.spot_count {
                    changes.spot_changes.push(SpotChange {
                        row: row.clone(),
                        previous: prev.to_string(),
                    });
                }
            }

            if let Some(n) = parse_spots(&row.spot_count) {
                if n > 0 && n <= rules.low_spot_threshold && entity.low_spot_alerted.insert(n) {
                    changes.low_spots.push(LowSpot {
                        row: row.clone(),
                        remaining: n,
                    });
                }
            }

            entity.alerted = true;
        } else {
            changes.closed_rows += 1;
            entity.alerted = false;
            entity.low_spot_alerted.clear();
        }

        entity.open = open;
        entity.last_status = Some(status);
        entity.last_spot_count = Some(row.spot_count.clone());
    }

    for t in transitions {
        state.log_status_change(t);
    }
    changes
}
