//! Billing-cycle window math.
//!
//! [`cycle_window`] is a pure function of `(anchor, length, now)`. Month-based
//! cycles are always computed as `anchor + k * n months` from the original
//! anchor, so a cycle anchored on the 31st does not drift after February.

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleLength {
    Days(u32),
    Months(u32),
}

impl std::fmt::Display for CycleLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Months(1) => f.write_str("monthly"),
            Self::Months(12) => f.write_str("yearly"),
            Self::Months(n) => write!(f, "months:{n}"),
            Self::Days(n) => write!(f, "days:{n}"),
        }
    }
}

impl std::str::FromStr for CycleLength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let parse_n = |n: &str| -> Result<u32, String> {
            match n.parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(format!("cycle length must be a positive integer: {n}")),
            }
        };
        match s.as_str() {
            "monthly" => Ok(Self::Months(1)),
            "yearly" | "annual" => Ok(Self::Months(12)),
            "weekly" => Ok(Self::Days(7)),
            other => {
                if let Some(n) = other.strip_prefix("days:") {
                    parse_n(n).map(Self::Days)
                } else if let Some(n) = other.strip_prefix("months:") {
                    parse_n(n).map(Self::Months)
                } else {
                    Err(format!(
                        "unknown billing cycle: {s} (expected monthly, yearly, days:N or months:N)"
                    ))
                }
            }
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn shift_months(anchor: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        anchor.checked_add_months(magnitude)
    } else {
        anchor.checked_sub_months(magnitude)
    }
}

/// The cycle containing `now`. `now` may precede the anchor.
pub fn cycle_window(anchor: DateTime<Utc>, length: CycleLength, now: DateTime<Utc>) -> CycleWindow {
    match length {
        CycleLength::Days(n) => {
            let period = Duration::days(i64::from(n.max(1)));
            let period_us = period.num_microseconds().unwrap_or(i64::MAX);
            let elapsed_us = (now - anchor).num_microseconds().unwrap_or(0);
            let k = elapsed_us.div_euclid(period_us);
            let start = anchor + Duration::microseconds(k.saturating_mul(period_us));
            CycleWindow {
                start,
                end: start + period,
            }
        }
        CycleLength::Months(n) => {
            let n = i64::from(n.max(1));
            let month_index = |t: DateTime<Utc>| {
                use chrono::Datelike;
                i64::from(t.year()) * 12 + i64::from(t.month0())
            };
            // Estimate, then correct by at most a step in either direction
            let mut k = (month_index(now) - month_index(anchor)).div_euclid(n);
            let at = |k: i64| shift_months(anchor, k * n).unwrap_or(anchor);
            for _ in 0..4 {
                if at(k) > now {
                    k -= 1;
                } else if at(k + 1) <= now {
                    k += 1;
                } else {
                    break;
                }
            }
            CycleWindow {
                start: at(k),
                end: at(k + 1),
            }
        }
    }
}
