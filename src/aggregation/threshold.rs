//! Time-of-day threshold blocks
//!
//! A station can have several blocks such as "45 dB from 22:00 to 06:00".
//! A block whose end is earlier than its start wraps past midnight.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// A time-of-day range `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: NaiveTime,
    pub to: NaiveTime,
}

impl TimeWindow {
    pub fn new(from: NaiveTime, to: NaiveTime) -> Self {
        Self { from, to }
    }

    /// Parse `HH:MM` or `HH:MM:SS` bounds
    pub fn parse(from: &str, to: &str) -> Option<Self> {
        Some(Self::new(parse_time_of_day(from)?, parse_time_of_day(to)?))
    }

    /// Whether the window wraps past midnight
    pub fn is_overnight(&self) -> bool {
        self.from > self.to
    }

    /// Whether `time` falls inside the window
    ///
    /// `from == to` covers the whole day.
    pub fn contains(&self, time: NaiveTime) -> bool {
        let time = time.with_nanosecond(0).unwrap_or(time);
        if self.from == self.to {
            true
        } else if self.is_overnight() {
            time >= self.from || time < self.to
        } else {
            time >= self.from && time < self.to
        }
    }
}

/// Alarm limit for one station during one time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBlock {
    pub station: String,
    pub window: TimeWindow,
    pub limit: f64,
}

impl ThresholdBlock {
    pub fn new(station: impl Into<String>, window: TimeWindow, limit: f64) -> Self {
        Self {
            station: station.into(),
            window,
            limit,
        }
    }

    /// Whether `value` measured at `time` breaks this block's limit
    pub fn is_exceeded(&self, time: NaiveTime, value: f64) -> bool {
        self.window.contains(time) && value > self.limit
    }
}

fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}
