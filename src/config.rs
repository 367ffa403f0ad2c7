use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

const DEFAULT_URL: &str = "https://testcisia.it/calendario.php?tolc=cents&lingua=inglese";
const DEFAULT_KINDS: &str = "CENT@CASA,CENT@HOME";
const DEFAULT_CLOSED: &str = "POSTI ESAURITI,ISCRIZIONI CONCLUSE,ISCRIZIONI CHIUSE,NOT LONGER AVAILABLE,BOOKINGS CLOSED,ENDED";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("bad monitor url {0:?}")]
    BadUrl(String),
}

/// Row filtering and classification rules shared by the extractor and detector.
#[derive(Debug, Clone)]
pub struct Rules {
    /// Upper-cased substrings a row's type column must contain (any of).
    pub kinds: Vec<String>,
    /// Organization allow-list; empty means every organization.
    pub names: Vec<String>,
    /// Upper-cased status substrings that mark a row as closed.
    pub closed_statuses: Vec<String>,
    pub low_spot_threshold: u32,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            kinds: split_list(DEFAULT_KINDS, true),
            names: Vec::new(),
            closed_statuses: split_list(DEFAULT_CLOSED, true),
            low_spot_threshold: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub chat_id: String,
    pub urls: Vec<Url>,
    pub rules: Rules,

    pub check_interval: Duration,
    pub fast_check_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub error_alert_threshold: u32,

    pub heartbeat_hours: u64,
    pub daily_report_hour: Option<u32>,
    pub alert_repeat_count: u32,
    pub alert_repeat_delay: Duration,
    pub notify_retries: u32,
    pub notify_retry_delay: Duration,

    pub enable_commands: bool,
    pub command_poll: Duration,
    pub state_file: PathBuf,

    pub keep_alive: bool,
    pub health_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("TELEGRAM_BOT_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        let chat_id = get("TELEGRAM_CHAT_ID").ok_or(ConfigError::Missing("TELEGRAM_CHAT_ID"))?;

        let urls = split_list(&get("MONITOR_URLS").unwrap_or_else(|| DEFAULT_URL.into()), false)
            .into_iter()
            .map(|raw| parse_url(&raw))
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = Rules::default();
        let rules = Rules {
            kinds: get("WATCH_KINDS").map(|v| split_list(&v, true)).unwrap_or(defaults.kinds),
            names: get("WATCH_UNIVERSITIES").map(|v| split_list(&v, false)).unwrap_or_default(),
            closed_statuses: get("CLOSED_STATUSES")
                .map(|v| split_list(&v, true))
                .unwrap_or(defaults.closed_statuses),
            low_spot_threshold: num(&get, "LOW_SPOTS_THRESHOLD", defaults.low_spot_threshold)?,
        };

        let daily_report_hour = match num::<i64>(&get, "DAILY_REPORT_HOUR", 8)? {
            h if h < 0 => None,
            h if h < 24 => Some(h as u32),
            h => {
                return Err(ConfigError::Invalid {
                    key: "DAILY_REPORT_HOUR",
                    value: h.to_string(),
                })
            }
        };

        let port: u16 = num(&get, "PORT", 10000)?;
        let host = get("HEALTH_BIND").unwrap_or_else(|| "0.0.0.0".into());

        Ok(Self {
            bot_token,
            chat_id,
            urls,
            rules,
            check_interval: period(&get, "CHECK_INTERVAL_SECONDS", 60)?,
            fast_check_interval: period(&get, "FAST_CHECK_INTERVAL_SECONDS", 15)?,
            max_retries: num::<u32>(&get, "MAX_RETRIES", 3)?.max(1),
            retry_delay: secs(&get, "RETRY_DELAY_SECONDS", 5)?,
            error_alert_threshold: num::<u32>(&get, "ERROR_ALERT_THRESHOLD", 5)?.max(1),
            heartbeat_hours: num(&get, "HEARTBEAT_HOURS", 6)?,
            daily_report_hour,
            alert_repeat_count: num::<u32>(&get, "ALERT_REPEAT_COUNT", 10)?.max(1),
            alert_repeat_delay: secs(&get, "ALERT_REPEAT_DELAY_SECONDS", 30)?,
            notify_retries: num::<u32>(&get, "NOTIFY_RETRIES", 3)?.max(1),
            notify_retry_delay: secs(&get, "NOTIFY_RETRY_DELAY_SECONDS", 2)?,
            enable_commands: flag(&get, "ENABLE_COMMANDS", true)?,
            command_poll: period(&get, "COMMAND_POLL_SECONDS", 5)?,
            state_file: PathBuf::from(get("STATE_FILE").unwrap_or_else(|| "state.json".into())),
            keep_alive: get("RENDER").is_some() || flag(&get, "ENABLE_KEEP_ALIVE", false)?,
            health_bind: format!("{host}:{port}"),
        })
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::BadUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConfigError::BadUrl(raw.to_string())),
    }
}

fn split_list(raw: &str, upper: bool) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| if upper { s.to_uppercase() } else { s.to_string() })
        .collect()
}

fn num<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

fn secs(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    num(get, key, default).map(Duration::from_secs)
}

/// Like [`secs`], but zero is rejected.
fn period(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let d = secs(get, key, default)?;
    if d.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
        });
    }
    Ok(d)
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn credentials_are_required() {
        let empty: [(&str, &str); 0] = [];
        assert!(matches!(load(&empty), Err(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))));
        assert!(matches!(
            load(&[("TELEGRAM_BOT_TOKEN", "t")]),
            Err(ConfigError::Missing("TELEGRAM_CHAT_ID"))
        ));
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("TELEGRAM_BOT_TOKEN", "t"), ("TELEGRAM_CHAT_ID", "42")]).unwrap();
        assert_eq!(cfg.urls.len(), 1);
        assert_eq!(cfg.check_interval, Duration::from_secs(60));
        assert_eq!(cfg.fast_check_interval, Duration::from_secs(15));
        assert_eq!(cfg.daily_report_hour, Some(8));
        assert_eq!(cfg.rules.low_spot_threshold, 5);
        assert!(cfg.rules.closed_statuses.contains(&"ISCRIZIONI CHIUSE".to_string()));
        assert!(!cfg.keep_alive);
        assert_eq!(cfg.health_bind, "0.0.0.0:10000");
    }

    #[test]
    fn overrides_and_lists() {
        let cfg = load(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("MONITOR_URLS", "https://a.example/x, https://b.example/y"),
            ("WATCH_UNIVERSITIES", "Sapienza, Padova"),
            ("DAILY_REPORT_HOUR", "-1"),
            ("RENDER", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.urls.len(), 2);
        assert_eq!(cfg.rules.names, vec!["Sapienza", "Padova"]);
        assert_eq!(cfg.daily_report_hour, None);
        assert!(cfg.keep_alive);
    }

    #[test]
    fn rejects_bad_values() {
        let base = [("TELEGRAM_BOT_TOKEN", "t"), ("TELEGRAM_CHAT_ID", "42")];
        let mut with_url = base.to_vec();
        with_url.push(("MONITOR_URLS", "ftp://nope"));
        assert!(matches!(load(&with_url), Err(ConfigError::BadUrl(_))));

        let mut with_num = base.to_vec();
        with_num.push(("CHECK_INTERVAL_SECONDS", "soon"));
        assert!(matches!(load(&with_num), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn zero_loop_periods_are_rejected() {
        for key in ["CHECK_INTERVAL_SECONDS", "FAST_CHECK_INTERVAL_SECONDS", "COMMAND_POLL_SECONDS"] {
            let env = [("TELEGRAM_BOT_TOKEN", "t"), ("TELEGRAM_CHAT_ID", "42"), (key, "0")];
            assert!(
                matches!(load(&env), Err(ConfigError::Invalid { key: k, .. }) if k == key),
                "{key} accepted 0"
            );
        }
        let env = [("TELEGRAM_BOT_TOKEN", "t"), ("TELEGRAM_CHAT_ID", "42"), ("RETRY_DELAY_SECONDS", "0")];
        assert_eq!(load(&env).unwrap().retry_delay, Duration::ZERO);
    }
}
