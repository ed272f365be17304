use anyhow::Result;
#[cfg(feature = "colored-output")]
use colored::*;
use notify_stream::{
    ConnectionState, MergedRecord, NotificationEvent, NotificationRecord, RecordOrigin,
};
use serde::Serialize;

pub struct OutputManager {
    colored: bool,
}

impl OutputManager {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }

    pub fn json<T: Serialize>(&self, value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn format_event(&self, event: &NotificationEvent) -> String {
        match event {
            NotificationEvent::StateChanged { state } => format!(
                "{} {}",
                self.colorize("state", &Color::Yellow, false),
                self.format_state(*state)
            ),
            NotificationEvent::Received { record } => format!(
                "{} {}",
                self.colorize("new", &Color::Green, true),
                self.format_record(record)
            ),
            NotificationEvent::HistoryUpdated { pages, has_more } => format!(
                "{} {pages} page(s){}",
                self.colorize("history", &Color::Yellow, false),
                if *has_more { ", more available" } else { "" }
            ),
            NotificationEvent::HistoryFailed { error } => format!(
                "{} {error}",
                self.colorize("history failed", &Color::Red, false)
            ),
            NotificationEvent::UnreadChanged { unread } => format!(
                "{} {}",
                self.colorize("unread", &Color::Yellow, false),
                self.colorize(&unread.to_string(), &Color::Cyan, true)
            ),
            NotificationEvent::Reconnecting { attempt, delay_ms } => format!(
                "{} attempt {attempt} in {:.1}s",
                self.colorize("reconnecting", &Color::Yellow, false),
                *delay_ms as f64 / 1000.0
            ),
            NotificationEvent::ReconnectGaveUp {
                attempts,
                consecutive_server_errors,
            } => format!(
                "{} after {attempts} attempt(s), {consecutive_server_errors} consecutive server error(s)",
                self.colorize("gave up", &Color::Red, true)
            ),
            NotificationEvent::IdentityChanged { profile_id } => format!(
                "{} {}",
                self.colorize("profile", &Color::Yellow, false),
                profile_id.as_deref().unwrap_or("-")
            ),
        }
    }

    pub fn format_state(&self, state: ConnectionState) -> String {
        let (label, color) = match state {
            ConnectionState::Idle => ("idle", Color::Blue),
            ConnectionState::Connecting => ("connecting", Color::Yellow),
            ConnectionState::Connected => ("connected", Color::Green),
            ConnectionState::Disconnected => ("disconnected", Color::Yellow),
            ConnectionState::Error => ("error", Color::Red),
        };
        self.colorize(label, &color, true)
    }

    pub fn format_record(&self, record: &NotificationRecord) -> String {
        let marker = if record.is_read { " " } else { "*" };
        let id = record
            .id
            .map(|id| format!("#{id}"))
            .unwrap_or_else(|| "#-".to_string());
        let sender = if record.sender_name.is_empty() {
            "someone"
        } else {
            record.sender_name.as_str()
        };
        format!(
            "{} {} {} {} {}",
            self.colorize(marker, &Color::Green, true),
            self.colorize(&id, &Color::Blue, false),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.colorize(record.kind.as_str(), &Color::Cyan, false),
            sender
        )
    }

    pub fn format_list(&self, records: &[MergedRecord], unread: u64) -> String {
        let mut output = String::new();
        output.push_str(&self.colorize("Notifications:", &Color::Green, true));
        output.push('\n');
        for merged in records {
            output.push_str("  ");
            output.push_str(&self.format_record(&merged.record));
            if merged.origin == RecordOrigin::Streamed {
                output.push_str(" (live)");
            }
            output.push('\n');
        }
        output.push_str(&format!(
            "{}: {}\n",
            self.colorize("Unread", &Color::Yellow, false),
            self.colorize(&unread.to_string(), &Color::Cyan, true)
        ));
        output
    }

    fn colorize(&self, text: &str, color: &Color, bold: bool) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                let colored_text = match color {
                    Color::Green => text.green(),
                    Color::Yellow => text.yellow(),
                    Color::Blue => text.blue(),
                    Color::Cyan => text.cyan(),
                    Color::Red => text.red(),
                };
                if bold {
                    colored_text.bold().to_string()
                } else {
                    colored_text.to_string()
                }
            } else {
                text.to_string()
            }
        }

        #[cfg(not(feature = "colored-output"))]
        {
            let _ = (color, bold, self.colored);
            text.to_string()
        }
    }
}

enum Color {
    Green,
    Yellow,
    Blue,
    Cyan,
    Red,
}
