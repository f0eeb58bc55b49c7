//! Wall-clock ↔ instant conversion in a restaurant's zone.
//!
//! DST resolution is deterministic:
//! - an ambiguous local time (clocks fall back) maps to the earlier instant;
//! - a nonexistent local time (clocks spring forward) maps to the first valid
//!   local minute after the gap.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::limits::MAX_DST_GAP_MINUTES;
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TzError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("instant out of range: {0}")]
    OutOfRange(Ms),
    #[error("local time {0} cannot be resolved")]
    Unresolvable(NaiveDateTime),
}

/// Source of "now". Injected so read-side projections can be evaluated at a fixed instant.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNow {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub instant: Ms,
}

#[derive(Clone)]
pub struct TimeZoneConverter {
    clock: Arc<dyn Clock>,
}

impl TimeZoneConverter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn parse_zone(zone: &str) -> Result<Tz, TzError> {
        zone.parse::<Tz>()
            .map_err(|_| TzError::InvalidTimezone(zone.to_string()))
    }

    pub fn to_utc(&self, date: NaiveDate, time: NaiveTime, zone: &str) -> Result<Ms, TzError> {
        let tz = Self::parse_zone(zone)?;
        resolve_local(date.and_time(time), tz)
    }

    pub fn to_local(&self, instant: Ms, zone: &str) -> Result<(NaiveDate, NaiveTime), TzError> {
        let tz = Self::parse_zone(zone)?;
        let local = local_datetime(instant, tz)?;
        Ok((local.date(), local.time()))
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn now(&self, zone: &str) -> Result<LocalNow, TzError> {
        let instant = self.clock.now_ms();
        let (date, time) = self.to_local(instant, zone)?;
        Ok(LocalNow {
            date,
            time,
            instant,
        })
    }

    pub fn today(&self, zone: &str) -> Result<NaiveDate, TzError> {
        Ok(self.now(zone)?.date)
    }

    pub fn tomorrow(&self, zone: &str) -> Result<NaiveDate, TzError> {
        let today = self.today(zone)?;
        today
            .succ_opt()
            .ok_or(TzError::OutOfRange(self.clock.now_ms()))
    }

    pub fn hour_of_day(&self, zone: &str) -> Result<u32, TzError> {
        Ok(self.now(zone)?.time.hour())
    }
}

fn local_datetime(instant: Ms, tz: Tz) -> Result<NaiveDateTime, TzError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(instant).ok_or(TzError::OutOfRange(instant))?;
    Ok(utc.with_timezone(&tz).naive_local())
}

/// Resolve a local wall-clock time to an instant using the DST rule in the module docs.
pub(crate) fn resolve_local(naive: NaiveDateTime, tz: Tz) -> Result<Ms, TzError> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Ok(dt.timestamp_millis());
    }
    for minutes in 1..=MAX_DST_GAP_MINUTES {
        let Some(candidate) = naive.checked_add_signed(Duration::minutes(minutes)) else {
            break;
        };
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            tracing::debug!(%naive, resolved = %candidate, zone = %tz.name(), "local time in DST gap");
            return Ok(dt.timestamp_millis());
        }
    }
    Err(TzError::Unresolvable(naive))
}
