use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use ktail_types::{ContainerKey, LogEntry, LogLevel};

/// Level keywords, most severe first
const LEVEL_WORDS: [(&str, LogLevel); 10] = [
    ("FATAL", LogLevel::Fatal),
    ("PANIC", LogLevel::Fatal),
    ("CRITICAL", LogLevel::Fatal),
    ("ERROR", LogLevel::Error),
    ("ERR", LogLevel::Error),
    ("WARNING", LogLevel::Warn),
    ("WARN", LogLevel::Warn),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
    ("TRACE", LogLevel::Trace),
];

/// JSON keys that commonly carry the level
const LEVEL_FIELDS: [&str; 8] = [
    "level",
    "lvl",
    "severity",
    "log.level",
    "loglevel",
    "log_level",
    "Level",
    "LEVEL",
];

/// Log parser for extracting structure from raw log lines
pub struct LogParser;

impl LogParser {
    /// Parse one line read from a container into a LogEntry
    pub fn parse(line: &str, key: &ContainerKey, line_number: u64) -> LogEntry {
        // Kubernetes prefixes each line with an RFC 3339 timestamp when asked to
        let (timestamp, content) = Self::split_timestamp(line);

        let mut entry = LogEntry::new(key, line_number, content.to_string());
        entry.timestamp = timestamp;

        match Self::parse_json(content) {
            Some(fields) => {
                entry.level = Self::level_from_json(&fields);
                entry.fields = Some(fields);
            }
            None => entry.level = Self::level_from_text(content),
        }

        entry
    }

    /// Split a leading timestamp such as `2024-01-15T10:30:00.123456789Z` off the line
    fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
        let Some((head, rest)) = line.split_once(' ') else {
            return match DateTime::parse_from_rfc3339(line) {
                Ok(ts) => (Some(ts.with_timezone(&Utc)), ""),
                Err(_) => (None, line),
            };
        };

        match DateTime::parse_from_rfc3339(head) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), rest),
            Err(_) => (None, line),
        }
    }

    fn parse_json(content: &str) -> Option<HashMap<String, Value>> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed).ok()? {
            Value::Object(map) => Some(map.into_iter().collect()),
            _ => None,
        }
    }

    fn level_from_json(fields: &HashMap<String, Value>) -> LogLevel {
        for field in LEVEL_FIELDS {
            match fields.get(field) {
                Some(Value::String(s)) => return LogLevel::parse(s),
                // Numeric levels as used by pino/bunyan
                Some(Value::Number(n)) => {
                    if let Some(num) = n.as_u64() {
                        return match num {
                            0..=10 => LogLevel::Trace,
                            11..=20 => LogLevel::Debug,
                            21..=30 => LogLevel::Info,
                            31..=40 => LogLevel::Warn,
                            41..=50 => LogLevel::Error,
                            _ => LogLevel::Fatal,
                        };
                    }
                }
                _ => {}
            }
        }

        LogLevel::Unknown
    }

    /// Look for `[LEVEL]`, `LEVEL:`, ` LEVEL ` and finally a leading `LEVEL`
    fn level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        let decorated: [fn(&str) -> String; 3] = [
            |w| format!("[{}]", w),
            |w| format!("{}:", w),
            |w| format!(" {} ", w),
        ];
        for decorate in decorated {
            for (word, level) in LEVEL_WORDS {
                if upper.contains(&decorate(word)) {
                    return level;
                }
            }
        }

        let start = upper.trim_start();
        LEVEL_WORDS
            .iter()
            .find(|(word, _)| start.starts_with(*word))
            .map(|(_, level)| *level)
            .unwrap_or(LogLevel::Unknown)
    }
}
