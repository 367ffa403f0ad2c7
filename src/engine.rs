use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::detect::{detect, ChangeSet};
use crate::extract::RowExtractor;
use crate::messages;
use crate::notify::{Notifier, RetryPolicy, Transport};
use crate::scheduler::Shutdown;
use crate::scrape::{backoff_delay, content_hash, PageSource};
use crate::store::{MonitorState, StateFile};
use crate::types::{Health, TrackedRow};

/// Result of one check cycle, as seen by the scheduler and the `/check` reply.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub paused: bool,
    pub pages_ok: usize,
    pub rows: usize,
    pub changes: ChangeSet,
    pub any_open: bool,
}

/// Rows from the most recent successful fetch of each page.
#[derive(Default)]
struct PageCache {
    rows: HashMap<String, Vec<TrackedRow>>,
    at: Option<DateTime<Utc>>,
}

impl PageCache {
    fn all_rows(&self, urls: &[Url]) -> Vec<TrackedRow> {
        urls.iter()
            .filter_map(|u| self.rows.get(u.as_str()))
            .flatten()
            .cloned()
            .collect()
    }
}

/// The monitor: shared state plus the collaborators that feed and drain it.
///
/// `state` is the only place mutable monitor data lives; `cycle` serialises
/// whole check cycles so an operator `/check` never interleaves with the
/// scheduled one. Neither lock is held across a notification send.
pub struct Engine {
    cfg: Config,
    pub(crate) state: Mutex<MonitorState>,
    cycle: Mutex<()>,
    saving: Mutex<()>,
    cache: Mutex<PageCache>,
    store: StateFile,
    source: Arc<dyn PageSource>,
    extractor: Arc<dyn RowExtractor>,
    pub(crate) notifier: Notifier,
    pub(crate) shutdown: Shutdown,
}

impl Engine {
    pub fn new(
        cfg: Config,
        source: Arc<dyn PageSource>,
        extractor: Arc<dyn RowExtractor>,
        transport: Arc<dyn Transport>,
        shutdown: Shutdown,
    ) -> Self {
        let store = StateFile::new(cfg.state_file.clone());
        let state = store.load();
        info!(
            path=%store.path().display(),
            notified = state.notified().count(),
            paused = state.paused,
            "state loaded"
        );

        let notifier = Notifier::new(
            transport,
            cfg.chat_id.clone(),
            RetryPolicy {
                attempts: cfg.notify_retries,
                delay: cfg.notify_retry_delay,
            },
            shutdown.clone(),
        );

        Self {
            cfg,
            state: Mutex::new(state),
            cycle: Mutex::new(()),
            saving: Mutex::new(()),
            cache: Mutex::new(PageCache::default()),
            store,
            source,
            extractor,
            notifier,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn snapshot(&self) -> MonitorState {
        self.state.lock().await.clone()
    }

    pub async fn health(&self) -> Health {
        self.state.lock().await.health()
    }

    pub(crate) async fn cached_rows(&self) -> (Vec<TrackedRow>, Option<DateTime<Utc>>) {
        let cache = self.cache.lock().await;
        (cache.all_rows(&self.cfg.urls), cache.at)
    }

    /// Writes a snapshot of the current state to disk off the runtime threads;
    /// failures are logged, never fatal. Saves run one at a time so an older
    /// snapshot never lands after a newer one.
    pub async fn persist(&self) {
        let _saving = self.saving.lock().await;
        let snapshot = self.state.lock().await.clone();
        let store = self.store.clone();
        let res = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error=?e, path=%self.store.path().display(), "failed to persist state")
            }
            Err(e) => error!(error=%e, "state save task failed"),
        }
    }

    /// One fetch → extract → detect → notify pass over every configured page.
    pub async fn run_check(&self) -> CycleOutcome {
        let _cycle = self.cycle.lock().await;

        if self.state.lock().await.paused {
            debug!("paused, skipping check");
            self.persist().await;
            return CycleOutcome {
                paused: true,
                ..CycleOutcome::default()
            };
        }

        let mut rows = Vec::new();
        let mut pages_ok = 0;
        for url in &self.cfg.urls {
            let Some(body) = self.fetch(url).await else {
                continue;
            };
            pages_ok += 1;
            rows.extend(self.rows_for(url, &body).await);
        }

        let now = Utc::now();
        let mut outcome = CycleOutcome {
            pages_ok,
            rows: rows.len(),
            ..CycleOutcome::default()
        };

        {
            let mut state = self.state.lock().await;
            state.total_checks += 1;
            state.last_check = Some(now);

            if pages_ok == 0 {
                // Nothing observed: keep every entity's flags as they were.
                outcome.any_open = state.any_open();
            } else {
                let changes = detect(&rows, &mut state, &self.cfg.rules, now);
                outcome.any_open = changes.open_rows > 0;
                outcome.changes = changes;
            }
        }
        if pages_ok > 0 {
            self.cache.lock().await.at = Some(now);
        }

        info!(
            pages = pages_ok,
            rows = outcome.rows,
            open = outcome.changes.open_rows,
            new = outcome.changes.newly_open.len(),
            "check finished"
        );

        self.dispatch(&outcome.changes).await;
        self.persist().await;
        outcome
    }

    /// Fetch with doubling backoff. Each failed attempt is counted, and the
    /// operator is warned once every `error_alert_threshold` failures in a row.
    async fn fetch(&self, url: &Url) -> Option<String> {
        let attempts = self.cfg.max_retries.max(1);
        for attempt in 1..=attempts {
            match self.source.fetch_page(url).await {
                Ok(body) => {
                    self.state.lock().await.record_success();
                    return Some(body);
                }
                Err(e) => {
                    warn!(error=%e, url=%url, attempt, "fetch failed");
                    let (warn_now, streak) = {
                        let mut state = self.state.lock().await;
                        let w = state.record_error(self.cfg.error_alert_threshold);
                        (w, state.consecutive_errors)
                    };
                    if warn_now {
                        let text = messages::fetch_failures(streak, url.as_str(), &e.to_string());
                        self.notifier.notify(&text, true).await;
                    }
                    if attempt < attempts
                        && !self
                            .shutdown
                            .sleep(backoff_delay(self.cfg.retry_delay, attempt))
                            .await
                    {
                        return None;
                    }
                }
            }
        }
        error!(url=%url, attempts, "giving up on page for this cycle");
        None
    }

    /// Extract rows, reusing the cached rows when the page is byte-identical.
    async fn rows_for(&self, url: &Url, body: &str) -> Vec<TrackedRow> {
        let hash = content_hash(body);
        let unchanged = {
            let mut state = self.state.lock().await;
            let prev = state.page_hashes.insert(url.to_string(), hash.clone());
            prev.as_deref() == Some(hash.as_str())
        };

        let mut cache = self.cache.lock().await;
        if unchanged {
            if let Some(rows) = cache.rows.get(url.as_str()) {
                debug!(url=%url, "page unchanged, reusing rows");
                return rows.clone();
            }
        }
        let rows = self.extractor.extract(body, url);
        cache.rows.insert(url.to_string(), rows.clone());
        rows
    }

    async fn dispatch(&self, changes: &ChangeSet) {
        let page = self
            .cfg
            .urls
            .first()
            .map(|u| u.to_string())
            .unwrap_or_default();

        for row in &changes.newly_open {
            info!(org=%row.organization, date=%row.target_date, "seats open");
            let text = messages::opened(row, &page);
            if self.notifier.notify(&text, false).await {
                let mut state = self.state.lock().await;
                state.total_alerts += 1;
                state.last_alert = Some(Utc::now());
                drop(state);
                self.repeat_in_background(text);
            } else {
                // Not delivered: let the next cycle treat it as newly open again.
                warn!(org=%row.organization, "open alert undelivered, will retry next cycle");
                self.state.lock().await.entity_mut(&row.key()).alerted = false;
            }
        }

        for low in &changes.low_spots {
            if self.notifier.notify(&messages::low_spot(low), true).await {
                self.state.lock().await.total_alerts += 1;
            }
        }

        if !changes.spot_changes.is_empty()
            && self
                .notifier
                .notify(&messages::spot_changes(&changes.spot_changes), true)
                .await
        {
            self.state.lock().await.total_alerts += changes.spot_changes.len() as u64;
        }

        // Opened rows already announced their status.
        let transitions: Vec<_> = changes
            .status_changes
            .iter()
            .filter(|t| !changes.newly_open.iter().any(|r| r.key() == t.row.key()))
            .cloned()
            .collect();
        if !transitions.is_empty() {
            self.notifier
                .notify(&messages::status_changes(&transitions), true)
                .await;
        }
    }

    /// Remaining copies of an opened alert, spaced out so the check loop keeps its pace.
    fn repeat_in_background(&self, text: String) {
        let copies = self.cfg.alert_repeat_count.saturating_sub(1);
        if copies == 0 {
            return;
        }
        let notifier = self.notifier.clone();
        let shutdown = self.shutdown.clone();
        let delay = self.cfg.alert_repeat_delay;
        tokio::spawn(async move {
            for _ in 0..copies {
                if !shutdown.sleep(delay).await {
                    break;
                }
                notifier.notify(&text, false).await;
            }
        });
    }

    /// Heartbeat and daily report, each compared against its own last firing.
    pub async fn run_timers(&self, now: DateTime<Utc>) {
        let mut fired = false;

        if self.cfg.heartbeat_hours > 0 {
            let period = chrono::Duration::hours(self.cfg.heartbeat_hours as i64);
            let due = {
                let mut state = self.state.lock().await;
                match state.last_heartbeat {
                    None => {
                        state.last_heartbeat = Some(now);
                        false
                    }
                    Some(last) => now - last >= period,
                }
            };
            if due {
                let text = messages::heartbeat(&*self.state.lock().await, now);
                self.notifier.notify(&text, true).await;
                self.state.lock().await.last_heartbeat = Some(now);
                fired = true;
            }
        }

        if let Some(hour) = self.cfg.daily_report_hour {
            let due = {
                let state = self.state.lock().await;
                now.hour() == hour
                    && state.last_daily_report.map(|t| t.date_naive()) != Some(now.date_naive())
            };
            if due {
                let (rows, _) = self.cached_rows().await;
                let text = messages::daily_report(&*self.state.lock().await, &rows, &self.cfg.rules, now);
                self.notifier.notify(&text, true).await;
                self.state.lock().await.last_daily_report = Some(now);
                fired = true;
            }
        }

        if fired {
            self.persist().await;
        }
    }

    pub async fn announce_startup(&self) {
        self.notifier.notify(&messages::startup(&self.cfg), true).await;
    }

    /// Final persist, then a best-effort goodbye.
    pub async fn shutdown(&self) {
        self.persist().await;
        let text = messages::shutdown(&*self.state.lock().await);
        self.notifier.notify(&text, true).await;
        info!("engine stopped");
    }
}
