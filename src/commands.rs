use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::messages;

const DEFAULT_LOG_LINES: usize = 10;
const MAX_LOG_LINES: usize = 50;
const TREND_POINTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Check,
    Report,
    Pause,
    Resume,
    Reset,
    Trend,
    Log(usize),
    Ping,
    Help,
}

impl Command {
    /// First token names the command (leading `/` and `@bot` suffix optional,
    /// any case); the rest are arguments. Unknown names yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let head = tokens.next()?;
        let name = head.strip_prefix('/').unwrap_or(head);
        let name = name.split('@').next().unwrap_or(name).to_lowercase();

        let cmd = match name.as_str() {
            "status" | "stats" | "s" => Command::Status,
            "check" | "now" | "c" => Command::Check,
            "report" | "list" | "r" => Command::Report,
            "pause" | "stop" => Command::Pause,
            "resume" | "start" | "go" => Command::Resume,
            "reset" | "clear" => Command::Reset,
            "trend" | "t" => Command::Trend,
            "log" | "changes" | "l" => {
                let n = tokens
                    .next()
                    .and_then(|a| a.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_LOG_LINES)
                    .clamp(1, MAX_LOG_LINES);
                Command::Log(n)
            }
            "ping" => Command::Ping,
            "help" | "h" | "?" => Command::Help,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn mutates(self) -> bool {
        matches!(
            self,
            Command::Check | Command::Pause | Command::Resume | Command::Reset
        )
    }
}

impl Engine {
    /// Pull new operator messages, run the recognised ones and reply to each.
    pub async fn poll_commands(&self) {
        let cursor = self.state.lock().await.command_cursor;
        let inbound = match self.notifier.transport().poll(cursor).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(error=%e, "command poll failed");
                return;
            }
        };
        if inbound.is_empty() {
            return;
        }

        let mut next = cursor;
        for msg in inbound {
            next = next.max(msg.update_id + 1);
            // Advance past every update up front so a slow command never gets replayed.
            self.state.lock().await.command_cursor = next;

            if msg.chat_id != self.notifier.chat_id() {
                debug!(chat=%msg.chat_id, "ignoring message from unknown chat");
                continue;
            }
            let Some(cmd) = Command::parse(&msg.text) else {
                debug!(text=%msg.text, "ignoring unknown command");
                continue;
            };

            info!(?cmd, "operator command");
            let reply = self.execute(cmd).await;
            self.notifier.notify(&reply, false).await;
        }
        self.persist().await;
    }

    /// Runs one command and returns the reply text.
    pub async fn execute(&self, cmd: Command) -> String {
        let now = Utc::now();
        let reply = match cmd {
            Command::Status => messages::status(&*self.state.lock().await, self.config(), now),
            Command::Check => {
                let outcome = self.run_check().await;
                if outcome.paused {
                    "⏸ Monitoring is paused; /resume first.".to_string()
                } else if outcome.pages_ok == 0 {
                    "❌ Could not fetch any page, see logs.".to_string()
                } else {
                    messages::check_summary(
                        outcome.rows,
                        outcome.changes.open_rows,
                        outcome.changes.newly_open.len(),
                    )
                }
            }
            Command::Report => {
                let (rows, at) = self.cached_rows().await;
                messages::report(&rows, &self.config().rules, at)
            }
            Command::Pause => {
                self.state.lock().await.paused = true;
                "⏸ Monitoring paused.".to_string()
            }
            Command::Resume => {
                self.state.lock().await.paused = false;
                "▶️ Monitoring resumed.".to_string()
            }
            Command::Reset => {
                self.state.lock().await.reset();
                "🧹 Notified set, seat history and change log cleared.".to_string()
            }
            Command::Trend => messages::trend(&*self.state.lock().await, TREND_POINTS),
            Command::Log(n) => messages::change_log(&*self.state.lock().await, n),
            Command::Ping => "🏓 pong".to_string(),
            Command::Help => messages::help(),
        };

        if cmd.mutates() {
            self.persist().await;
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_aliases_and_case() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("STATUS"), Some(Command::Status));
        assert_eq!(Command::parse("/Check@slot_watch_bot"), Some(Command::Check));
        assert_eq!(Command::parse("  /stop  "), Some(Command::Pause));
        assert_eq!(Command::parse("/go"), Some(Command::Resume));
        assert_eq!(Command::parse("/list"), Some(Command::Report));
        assert_eq!(Command::parse("/?"), Some(Command::Help));
    }

    #[test]
    fn log_takes_an_optional_bounded_count() {
        assert_eq!(Command::parse("/log"), Some(Command::Log(DEFAULT_LOG_LINES)));
        assert_eq!(Command::parse("/log 3"), Some(Command::Log(3)));
        assert_eq!(Command::parse("/log 999"), Some(Command::Log(MAX_LOG_LINES)));
        assert_eq!(Command::parse("/log zero"), Some(Command::Log(DEFAULT_LOG_LINES)));
    }

    #[test]
    fn unknown_or_empty_is_ignored() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("hello there"), None);
        assert_eq!(Command::parse("/shutdown"), None);
    }

    #[test]
    fn only_state_changing_commands_persist() {
        assert!(Command::Reset.mutates());
        assert!(Command::Pause.mutates());
        assert!(!Command::Status.mutates());
        assert!(!Command::Log(3).mutates());
    }
}
