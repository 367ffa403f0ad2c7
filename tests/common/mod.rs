#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use slot_watch::config::Config;
use slot_watch::engine::Engine;
use slot_watch::extract::TableExtractor;
use slot_watch::notify::{SendError, Transport};
use slot_watch::scheduler::{Shutdown, ShutdownTrigger};
use slot_watch::scrape::PageSource;
use slot_watch::types::InboundMessage;

pub const CHAT: &str = "4242";
pub const PAGE_URL: &str = "https://calendar.example/calendario.php";

/// Pops one scripted body (or error) per fetch; errors once the script runs dry.
#[derive(Default)]
pub struct FakeSource {
    script: Mutex<VecDeque<Result<String, String>>>,
    pub calls: Mutex<usize>,
}

impl FakeSource {
    pub fn push_page(&self, body: String) {
        self.script.lock().unwrap().push_back(Ok(body));
    }

    pub fn push_error(&self, msg: &str) {
        self.script.lock().unwrap().push_back(Err(msg.to_string()));
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn fetch_page(&self, _url: &Url) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(body)) => Ok(body),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("connection refused")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub chat_id: String,
    pub text: String,
    pub silent: bool,
}

#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub inbound: Mutex<Vec<InboundMessage>>,
    pub offsets: Mutex<Vec<i64>>,
    pub failing: AtomicBool,
}

impl FakeTransport {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.text.clone()).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }

    /// While set, every send fails and nothing is recorded.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn incoming(&self, update_id: i64, chat_id: &str, text: &str) {
        self.inbound.lock().unwrap().push(InboundMessage {
            update_id,
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, chat_id: &str, text: &str, silent: bool) -> Result<(), SendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Failed(anyhow!("bad gateway")));
        }
        self.sent.lock().unwrap().push(Sent {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            silent,
        });
        Ok(())
    }

    async fn poll(&self, offset: i64) -> Result<Vec<InboundMessage>> {
        self.offsets.lock().unwrap().push(offset);
        Ok(self
            .inbound
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.update_id >= offset)
            .cloned()
            .collect())
    }
}

pub fn config(state_file: &Path, extra: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("TELEGRAM_BOT_TOKEN", "test-token"),
        ("TELEGRAM_CHAT_ID", CHAT),
        ("MONITOR_URLS", PAGE_URL),
        ("MAX_RETRIES", "1"),
        ("NOTIFY_RETRIES", "1"),
        ("ALERT_REPEAT_COUNT", "1"),
        ("HEARTBEAT_HOURS", "0"),
        ("DAILY_REPORT_HOUR", "-1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    env.insert("STATE_FILE".into(), state_file.display().to_string());
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|k| env.get(k).cloned()).expect("test config")
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub source: Arc<FakeSource>,
    pub transport: Arc<FakeTransport>,
    pub trigger: ShutdownTrigger,
}

pub fn harness(cfg: Config) -> Harness {
    let (shutdown, trigger) = Shutdown::new();
    let source = Arc::new(FakeSource::default());
    let transport = Arc::new(FakeTransport::default());
    let engine = Arc::new(Engine::new(
        cfg.clone(),
        source.clone(),
        Arc::new(TableExtractor::new(cfg.rules.clone())),
        transport.clone(),
        shutdown,
    ));
    Harness {
        engine,
        source,
        transport,
        trigger,
    }
}

/// Calendar page with one home-exam row per `(organization, date, spots, status)`.
pub fn page(rows: &[(&str, &str, &str, &str)]) -> String {
    let mut body = String::from("<html><body><table id=\"calendario\">\n");
    body.push_str("<tr><th>Type</th><th>University</th><th>Region</th><th>City</th>");
    body.push_str("<th>Deadline</th><th>Seats</th><th>Status</th><th>Date</th></tr>\n");
    for (org, date, spots, status) in rows {
        body.push_str(&format!(
            "<tr><td>CENT@CASA</td><td>{org}</td><td>Lombardia</td><td>Milano</td>\
             <td>20/04/2024</td><td>{spots}</td><td>{status}</td><td>{date}</td></tr>\n"
        ));
    }
    body.push_str("</table></body></html>");
    body
}
