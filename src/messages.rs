//! Alert and reply text. Everything here is Telegram HTML; row fields are
//! escaped before interpolation.

use chrono::{DateTime, Utc};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as esc};
use std::collections::HashSet;
use std::fmt::Write;
use std::time::Duration;

use crate::detect::{is_open, LowSpot, SpotChange, StatusTransition};
use crate::config::{Config, Rules};
use crate::store::MonitorState;
use crate::types::TrackedRow;

pub fn opened(row: &TrackedRow, page: &str) -> String {
    let link = row.link.as_deref().unwrap_or(page);
    format!(
        "🚨🚨🚨 <b>SEATS OPEN!</b> 🚨🚨🚨\n\n\
         🏫 <b>{org}</b>\n\
         📍 {city}, {region}\n\
         📅 Exam: <b>{date}</b>\n\
         📝 Registration until: {deadline}\n\
         💺 Seats: <b>{spots}</b>\n\
         📌 Status: <b>{status}</b>\n\n\
         🔗 <a href=\"{link}\">REGISTER NOW</a>",
        org = esc(&row.organization),
        city = esc(&row.city),
        region = esc(&row.region),
        date = esc(&row.target_date),
        deadline = esc(&row.registration_deadline),
        spots = esc(&row.spot_count),
        status = esc(&row.status_text),
        link = attr(link),
    )
}

pub fn low_spot(low: &LowSpot) -> String {
    format!(
        "⚠️ <b>Only {n} seat{s} left</b>\n🏫 {org}\n📅 {date}",
        n = low.remaining,
        s = if low.remaining == 1 { "" } else { "s" },
        org = esc(&low.row.organization),
        date = esc(&low.row.target_date),
    )
}

pub fn spot_changes(changes: &[SpotChange]) -> String {
    let mut out = String::from("💺 <b>Seat count changed</b>\n");
    for c in changes {
        let _ = write!(
            out,
            "\n• {} ({}): {} → <b>{}</b>",
            esc(&c.row.organization),
            esc(&c.row.target_date),
            esc(&c.previous),
            esc(&c.row.spot_count),
        );
    }
    out
}

pub fn status_changes(changes: &[StatusTransition]) -> String {
    let mut out = String::from("📌 <b>Status changed</b>\n");
    for c in changes {
        let _ = write!(
            out,
            "\n• {} ({}): {} → <b>{}</b>",
            esc(&c.row.organization),
            esc(&c.row.target_date),
            esc(&c.previous),
            esc(&c.current),
        );
    }
    out
}

pub fn fetch_failures(consecutive: u32, url: &str, error: &str) -> String {
    format!(
        "⚠️ <b>{consecutive} consecutive fetch failures</b>\n{}\n<code>{}</code>",
        esc(url),
        esc(error),
    )
}

pub fn status(state: &MonitorState, cfg: &Config, now: DateTime<Utc>) -> String {
    let mode = if state.paused { "⏸ paused" } else { "▶️ running" };
    format!(
        "📊 <b>Monitor status</b>\n\n\
         Monitoring: {mode}\n\
         Uptime: {uptime}\n\
         Last check: {last}\n\
         Interval: {normal}s (fast {fast}s)\n\
         Checks: {checks}\n\
         Alerts: {alerts}\n\
         Errors: {errors} ({streak} in a row)\n\
         Notified now: {notified}\n\
         Tracked entries: {tracked}",
        uptime = human(now - state.started_at),
        last = ago(state.last_check, now),
        normal = cfg.check_interval.as_secs(),
        fast = cfg.fast_check_interval.as_secs(),
        checks = state.total_checks,
        alerts = state.total_alerts,
        errors = state.total_errors,
        streak = state.consecutive_errors,
        notified = state.notified().count(),
        tracked = state.entities.len(),
    )
}

pub fn heartbeat(state: &MonitorState, now: DateTime<Utc>) -> String {
    format!(
        "💓 Still watching. Up {}, {} checks, {} alerts, {} errors.",
        human(now - state.started_at),
        state.total_checks,
        state.total_alerts,
        state.total_errors,
    )
}

pub fn daily_report(state: &MonitorState, rows: &[TrackedRow], rules: &Rules, now: DateTime<Utc>) -> String {
    format!(
        "🗓 <b>Daily report</b>\n\n{}\n\n{}",
        heartbeat(state, now),
        report(rows, rules, None)
    )
}

/// Table of current rows, one line per entity.
pub fn report(rows: &[TrackedRow], rules: &Rules, at: Option<DateTime<Utc>>) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<&TrackedRow> = rows.iter().filter(|r| seen.insert(r.key())).collect();
    if unique.is_empty() {
        return "📋 No matching rows on the page yet.".into();
    }

    let open = unique.iter().filter(|r| is_open(&r.status_text, rules)).count();
    let mut out = format!(
        "📋 <b>Current rows</b>: {} ({} open, {} closed)",
        unique.len(),
        open,
        unique.len() - open
    );
    if let Some(at) = at {
        let _ = write!(out, "\nas of {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    out.push('\n');

    for r in unique {
        let icon = if is_open(&r.status_text, rules) { "🟢" } else { "🔴" };
        let _ = write!(
            out,
            "\n{icon} <b>{}</b>\n    📍 {} | 📅 {} | 💺 {}\n    {}",
            esc(&r.organization),
            esc(&r.city),
            esc(&r.target_date),
            esc(&r.spot_count),
            esc(&r.status_text),
        );
    }
    out
}

pub fn trend(state: &MonitorState, per_entity: usize) -> String {
    let lines: Vec<String> = state
        .entities
        .iter()
        .filter_map(|(key, e)| {
            let t = e.trend(per_entity);
            if t.is_empty() {
                return None;
            }
            Some(format!("• {}: {}", esc(key), esc(&t.join(" → "))))
        })
        .collect();
    if lines.is_empty() {
        return "📈 No seat history yet.".into();
    }
    format!("📈 <b>Seat trend</b>\n\n{}", lines.join("\n"))
}

pub fn change_log(state: &MonitorState, n: usize) -> String {
    if state.status_log.is_empty() {
        return "📜 No status changes recorded.".into();
    }
    let skip = state.status_log.len().saturating_sub(n);
    let mut out = String::from("📜 <b>Recent status changes</b>\n");
    for c in &state.status_log[skip..] {
        let _ = write!(
            out,
            "\n{} {}: {} → {}",
            c.at.format("%m-%d %H:%M"),
            esc(&c.organization),
            esc(&c.from),
            esc(&c.to),
        );
    }
    out
}

pub fn check_summary(rows: usize, open: usize, new_alerts: usize) -> String {
    format!("🔍 Check done: {rows} rows, {open} open, {new_alerts} new alert(s).")
}

pub fn help() -> String {
    "🤖 <b>Commands</b>\n\n\
     /status – counters and mode\n\
     /check – run a check now\n\
     /report – current rows\n\
     /pause – stop checking\n\
     /resume – start checking again\n\
     /reset – forget sent alerts and history\n\
     /trend – recent seat counts\n\
     /log [n] – last status changes\n\
     /ping – am I alive?\n\
     /help – this text"
        .into()
}

pub fn startup(cfg: &Config) -> String {
    let pages: Vec<String> = cfg
        .urls
        .iter()
        .map(|u| format!("🔗 <a href=\"{}\">page</a>", attr(u.as_str())))
        .collect();
    format!(
        "🤖 <b>Monitor started</b>\nChecking every {}s.\n{}",
        cfg.check_interval.as_secs(),
        pages.join("\n")
    )
}

pub fn shutdown(state: &MonitorState) -> String {
    format!(
        "🛑 Monitor stopping after {} checks and {} alerts.",
        state.total_checks, state.total_alerts
    )
}

fn ago(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at {
        Some(t) => format!("{} ago", human(now - t)),
        None => "never".into(),
    }
}

fn human(d: chrono::Duration) -> String {
    let secs = d.to_std().unwrap_or(Duration::ZERO).as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::row;

    #[test]
    fn opened_alert_escapes_and_links() {
        let mut r = row("A&B <Univ>", "2024-05-01", "3", "POSTI DISPONIBILI");
        let page = "https://testcisia.it/calendario.php";
        assert!(opened(&r, page).contains("A&amp;B &lt;Univ&gt;"));
        assert!(opened(&r, page).contains(page));

        r.link = Some("https://testcisia.it/iscrizione.php?a=1&b=2".into());
        assert!(opened(&r, page).contains("iscrizione.php?a=1&amp;b=2"));
    }

    #[test]
    fn report_dedups_by_key_and_counts() {
        let rules = Rules::default();
        let a = row("Acme", "d1", "4", "DISPONIBILE");
        let mut dup = a.clone();
        dup.city = "Torino".into();
        let b = row("Beta", "d2", "0", "POSTI ESAURITI");
        let text = report(&[a, dup, b], &rules, None);
        assert!(text.contains("2 (1 open, 1 closed)"));
        assert_eq!(text.matches("🟢").count(), 1);
        assert_eq!(text.matches("🔴").count(), 1);
    }

    #[test]
    fn low_spot_pluralises() {
        let one = LowSpot { row: row("Acme", "d", "1", "x"), remaining: 1 };
        assert!(low_spot(&one).contains("Only 1 seat left"));
        let three = LowSpot { row: row("Acme", "d", "3", "x"), remaining: 3 };
        assert!(low_spot(&three).contains("Only 3 seats left"));
    }

    #[test]
    fn human_durations() {
        assert_eq!(human(chrono::Duration::seconds(42)), "42s");
        assert_eq!(human(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(human(chrono::Duration::seconds(7260)), "2h 1m");
        assert_eq!(human(chrono::Duration::seconds(-5)), "0s");
    }
}
