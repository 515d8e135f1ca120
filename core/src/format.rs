//! Rendering of completed lines before fan-out
//!
//! Bytes are decoded as UTF-8 (invalid sequences become U+FFFD), optionally
//! prefixed with a millisecond timestamp and suffixed with the raw bytes in
//! lowercase hex.

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp prefix applied to each line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    #[default]
    None,
    Utc,
    Local,
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimestampMode::None => "none",
            TimestampMode::Utc => "utc",
            TimestampMode::Local => "local",
        };
        f.write_str(label)
    }
}

/// How lines are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFormat {
    pub timestamps: TimestampMode,
    /// Append `" | <hex>"` of the undecoded bytes
    pub raw_hex: bool,
}

/// Applies a [`LineFormat`] to raw line bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormatter {
    format: LineFormat,
}

impl LineFormatter {
    pub fn new(format: LineFormat) -> Self {
        Self { format }
    }

    pub fn line_format(&self) -> LineFormat {
        self.format
    }

    /// Render `raw` using the current wall clock
    pub fn format(&self, raw: &[u8]) -> String {
        match self.format.timestamps {
            TimestampMode::None => self.render(None, raw),
            TimestampMode::Utc => self.render(Some(utc_stamp(&Utc::now())), raw),
            TimestampMode::Local => self.render(Some(local_stamp(&Local::now())), raw),
        }
    }

    /// Render `raw` as if received at `at`
    pub fn format_at(&self, raw: &[u8], at: DateTime<Utc>) -> String {
        match self.format.timestamps {
            TimestampMode::None => self.render(None, raw),
            TimestampMode::Utc => self.render(Some(utc_stamp(&at)), raw),
            TimestampMode::Local => {
                self.render(Some(local_stamp(&at.with_timezone(&Local))), raw)
            }
        }
    }

    fn render(&self, stamp: Option<String>, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        let mut line = match stamp {
            Some(stamp) => format!("{} {}", stamp, text),
            None => text.into_owned(),
        };
        if self.format.raw_hex {
            line.push_str(" | ");
            line.push_str(&hex::encode(raw));
        }
        line
    }
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`
pub fn utc_stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `YYYY-MM-DDTHH:MM:SS.mmm+HH:MM` in the zone of `at`
pub fn local_stamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}
