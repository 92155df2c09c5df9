//! Calendar recurrence engine
//!
//! Parses the RRULE subset used by the scheduling UI
//! (`FREQ=DAILY;INTERVAL=2;BYHOUR=8,20;BYMINUTE=30`), computes next-fire
//! instants, and runs a cancellable timer loop that invokes a callback at
//! each fire.
//
// Missed fires are not replayed: the loop always asks for the first
// occurrence strictly after the current clock, so a fire that passes while
// the process sleeps (or while the callback runs long) is simply skipped
// and the grid stays anchored to real time.

use chrono::{DateTime, Duration as TimeDelta, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periods the scan ahead of the current clock is bounded by. A rule whose
/// BYHOUR set never intersects its hour grid yields nothing within the
/// bound and is reported as exhausted.
const MAX_PERIOD_SCAN: usize = 512;

/// Rule parse failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("recurrence rule has no FREQ")]
    MissingFreq,

    #[error("malformed rule part: {0:?}")]
    Malformed(String),

    #[error("unsupported rule key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Base frequency of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Hourly,
    Daily,
    Weekly,
}

/// A parsed recurrence rule, anchored at a start instant.
///
/// The anchor plays the role of DTSTART: occurrence grids advance from it
/// in INTERVAL-sized steps, and its hour/minute fill in whatever BYHOUR/
/// BYMINUTE leave unspecified. Seconds are truncated to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    freq: Freq,
    interval: u32,
    /// Sorted, deduplicated; empty means "from the anchor"
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    anchor: DateTime<Utc>,
}

impl Rule {
    /// Parse a semicolon-separated `KEY=VALUE` rule, anchored at `anchor`.
    pub fn parse(text: &str, anchor: DateTime<Utc>) -> Result<Self, RuleError> {
        let anchor = anchor
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(anchor);

        let mut freq = None;
        let mut interval = 1u32;
        let mut by_hour = Vec::new();
        let mut by_minute = Vec::new();

        for part in text.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RuleError::Malformed(part.to_string()))?;

            match key.to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "HOURLY" => Freq::Hourly,
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        _ => {
                            return Err(RuleError::InvalidValue {
                                key: "FREQ".to_string(),
                                value: value.to_string(),
                            })
                        }
                    });
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|&i| i >= 1)
                        .ok_or_else(|| RuleError::InvalidValue {
                            key: "INTERVAL".to_string(),
                            value: value.to_string(),
                        })?;
                }
                "BYHOUR" => by_hour = parse_list("BYHOUR", value, 23)?,
                "BYMINUTE" => by_minute = parse_list("BYMINUTE", value, 59)?,
                other => return Err(RuleError::UnknownKey(other.to_string())),
            }
        }

        let freq = freq.ok_or(RuleError::MissingFreq)?;
        by_hour.sort_unstable();
        by_hour.dedup();
        by_minute.sort_unstable();
        by_minute.dedup();

        Ok(Self {
            freq,
            interval,
            by_hour,
            by_minute,
            anchor,
        })
    }

    /// The first occurrence strictly after `after`, or `None` when the rule
    /// produces nothing within the scan bound.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let step = match self.freq {
            Freq::Hourly => TimeDelta::hours(self.interval as i64),
            Freq::Daily => TimeDelta::days(self.interval as i64),
            Freq::Weekly => TimeDelta::weeks(self.interval as i64),
        };
        let step_secs = step.num_seconds();

        // Jump to the period containing `after`, minus one for the boundary.
        let elapsed = (after - self.anchor).num_seconds();
        let mut period = if elapsed > 0 { elapsed / step_secs - 1 } else { 0 };
        period = period.max(0);

        for _ in 0..MAX_PERIOD_SCAN {
            let base = self.anchor + step * (period as i32);
            for candidate in self.expand(base) {
                if candidate > after && candidate >= self.anchor {
                    return Some(candidate);
                }
            }
            period += 1;
        }
        None
    }

    /// The occurrences within one period, ascending.
    fn expand(&self, base: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let anchor_minute = [self.anchor.minute()];
        let minutes: &[u32] = if self.by_minute.is_empty() {
            &anchor_minute
        } else {
            &self.by_minute
        };

        match self.freq {
            Freq::Hourly => {
                // BYHOUR restricts which hours of the grid fire at all.
                if !self.by_hour.is_empty() && !self.by_hour.contains(&base.hour()) {
                    return Vec::new();
                }
                minutes
                    .iter()
                    .filter_map(|&m| base.with_minute(m))
                    .collect()
            }
            Freq::Daily | Freq::Weekly => {
                let anchor_hour = [self.anchor.hour()];
                let hours: &[u32] = if self.by_hour.is_empty() {
                    &anchor_hour
                } else {
                    &self.by_hour
                };

                let mut occurrences = Vec::with_capacity(hours.len() * minutes.len());
                for &h in hours {
                    for &m in minutes {
                        if let Some(t) = base.with_hour(h).and_then(|t| t.with_minute(m)) {
                            occurrences.push(t);
                        }
                    }
                }
                occurrences
            }
        }
    }
}

fn parse_list(key: &str, value: &str, max: u32) -> Result<Vec<u32>, RuleError> {
    value
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<u32>()
                .ok()
                .filter(|&v| v <= max)
                .ok_or_else(|| RuleError::InvalidValue {
                    key: key.to_string(),
                    value: item.to_string(),
                })
        })
        .collect()
}

/// Timer loop for one schedule.
///
/// Sleeps until the rule's next fire, invokes the callback, and repeats.
/// Cancellation is prompt: once the token fires, the callback is never
/// invoked again. The next fire is always computed from the real clock, so
/// callback execution time does not shift the grid.
pub async fn run_schedule<F, Fut>(rule: Rule, token: CancellationToken, mut fire: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let now = Utc::now();
        let Some(next) = rule.next_after(now) else {
            debug!("Recurrence rule yields no further occurrences, stopping schedule");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => fire().await,
        }
    }
}
