//! Window arithmetic for admission control.
//!
//! These functions are pure: given the stored record (if any) and `now`
//! they return the decision plus the record to write back. The engine runs
//! them inside a single-document transaction so that read, decision and
//! write are atomic per key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Resets the window once strictly more than `window` has elapsed.
    pub fn roll(self, now: DateTime<Utc>, window: Duration) -> Self {
        if now - self.window_start > window {
            Self::started(now)
        } else {
            self
        }
    }

    /// `ceil((window - elapsed) / 1s)`, never below one second.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let remaining_ms = (window - (now - self.window_start)).num_milliseconds();
        let seconds = (remaining_ms + 999).div_euclid(1000);
        seconds.max(1) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl WindowLimit {
    pub fn per_seconds(max_requests: u32, seconds: i64) -> Self {
        Self {
            max_requests,
            window: Duration::seconds(seconds),
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::per_seconds(max_requests, 60)
    }

    pub fn per_day(max_requests: u32) -> Self {
        Self::per_seconds(max_requests, 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: Option<u64>,
}

/// Fixed-window decision. The first request for a key is always allowed;
/// a request arriving when `count >= max` is denied without a write.
pub fn admit_single(
    record: Option<WindowCounter>,
    limit: WindowLimit,
    now: DateTime<Utc>,
) -> (Admission, Option<WindowCounter>) {
    let counter = match record {
        Some(existing) => existing.roll(now, limit.window),
        None => WindowCounter::started(now),
    };
    if record.is_some() && counter.count >= limit.max_requests {
        let admission = Admission {
            allowed: false,
            remaining: 0,
            retry_after_seconds: Some(counter.retry_after_seconds(now, limit.window)),
        };
        return (admission, None);
    }
    let next = WindowCounter {
        count: counter.count + 1,
        window_start: counter.window_start,
    };
    let admission = Admission {
        allowed: true,
        remaining: limit.max_requests.saturating_sub(next.count),
        retry_after_seconds: None,
    };
    (admission, Some(next))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitWindow {
    Minute,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualWindowRecord {
    pub minute: WindowCounter,
    pub day: WindowCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualAdmission {
    pub allowed: bool,
    pub remaining_minute: u32,
    pub remaining_day: u32,
    pub error_type: Option<LimitWindow>,
    pub retry_after_seconds: Option<u64>,
}

/// Short and long window checked together; the short window is consulted
/// first, so exhausting both reports `Minute`. Denials do not count.
pub fn admit_dual(
    record: Option<DualWindowRecord>,
    minute: WindowLimit,
    day: WindowLimit,
    now: DateTime<Utc>,
) -> (DualAdmission, Option<DualWindowRecord>) {
    let (minute_counter, day_counter) = match record {
        Some(existing) => (
            existing.minute.roll(now, minute.window),
            existing.day.roll(now, day.window),
        ),
        None => (WindowCounter::started(now), WindowCounter::started(now)),
    };

    let denied = |window: LimitWindow, counter: WindowCounter, limit: WindowLimit| DualAdmission {
        allowed: false,
        remaining_minute: minute.max_requests.saturating_sub(minute_counter.count),
        remaining_day: day.max_requests.saturating_sub(day_counter.count),
        error_type: Some(window),
        retry_after_seconds: Some(counter.retry_after_seconds(now, limit.window)),
    };

    if minute_counter.count >= minute.max_requests {
        return (denied(LimitWindow::Minute, minute_counter, minute), None);
    }
    if day_counter.count >= day.max_requests {
        return (denied(LimitWindow::Day, day_counter, day), None);
    }

    let next = DualWindowRecord {
        minute: WindowCounter {
            count: minute_counter.count + 1,
            window_start: minute_counter.window_start,
        },
        day: WindowCounter {
            count: day_counter.count + 1,
            window_start: day_counter.window_start,
        },
    };
    let admission = DualAdmission {
        allowed: true,
        remaining_minute: minute.max_requests.saturating_sub(next.minute.count),
        remaining_day: day.max_requests.saturating_sub(next.day.count),
        error_type: None,
        retry_after_seconds: None,
    };
    (admission, Some(next))
}
