//! Time service: calendar timestamps and monotonic wall-clock reconstruction.
//!
//! A charge point usually boots with nothing but a millisecond tick counter.
//! The wall clock becomes known only once the central system reports its time
//! (BootNotification / Heartbeat confirmations). This module keeps the two
//! apart: [`Timestamp`] is a calendar moment, [`Clock`] pairs the tick counter
//! with a server-provided base time and can reconstruct the wall time of
//! events that were captured *before* the clock was set.

use std::fmt;
use std::ops::{Add, Sub};

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// Scalar time in seconds. `t2 - t1` is a duration; the representable range
/// spans 1970 to the 32-bit rollover in 2038.
pub type TimeScalar = i32;

/// Differences at or above this value saturate in [`Timestamp::seconds_since`]
/// and mean "effectively never". The margin is 400 days below the 32-bit
/// second rollover.
pub const INFINITY_THLD: TimeScalar = i32::MAX - 400 * 24 * 3600;

/// Length of the emitted JSON date string, `2023-01-01T00:00:00.000Z`.
pub const JSON_DATE_LEN: usize = 24;

/// A calendar moment with one-second resolution.
///
/// Total order, saturating second arithmetic, and conversion to/from the
/// first 19 characters of an ISO-8601 Zulu string. [`Timestamp::MIN`] doubles
/// as the "not yet known" sentinel throughout the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// UNIX time 0; also the sentinel for "timestamp not yet known".
    pub const MIN: Timestamp = Timestamp(NaiveDateTime::UNIX_EPOCH);

    /// Upper bound of the representable range (`MIN + i32::MAX` seconds).
    pub fn max() -> Timestamp {
        let bound = NaiveDateTime::UNIX_EPOCH
            .checked_add_signed(TimeDelta::seconds(i32::MAX as i64))
            .unwrap_or(NaiveDateTime::MAX);
        Timestamp(bound)
    }

    pub fn new(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Option<Timestamp> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .map(Timestamp)
    }

    /// Parses the first 19 characters of a JSON date string such as
    /// `2020-10-01T20:53:32.486Z`. Anything after the seconds field is
    /// ignored; wrong separators, non-digits, or out-of-range components
    /// yield `None`.
    pub fn parse(s: &str) -> Option<Timestamp> {
        if s.len() < 19 || !s.is_char_boundary(19) {
            return None;
        }
        NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(Timestamp)
    }

    /// Emits the 24-character JSON date form with a fixed `.000Z` suffix.
    pub fn to_json_string(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.000Z",
            self.0.year(),
            self.0.month(),
            self.0.day(),
            self.0.hour(),
            self.0.minute(),
            self.0.second()
        )
    }

    /// Seconds since [`Timestamp::MIN`], clamped to `[0, i32::MAX]`.
    pub fn to_scalar(&self) -> TimeScalar {
        let secs = self.0.signed_duration_since(NaiveDateTime::UNIX_EPOCH).num_seconds();
        secs.clamp(0, i32::MAX as i64) as TimeScalar
    }

    pub fn from_scalar(scalar: TimeScalar) -> Timestamp {
        Timestamp::MIN + scalar.max(0)
    }

    /// Signed difference `self - rhs` in seconds. Differences whose
    /// magnitude reaches [`INFINITY_THLD`] saturate to the numeric limit
    /// and encode "effectively never".
    pub fn seconds_since(&self, rhs: &Timestamp) -> TimeScalar {
        let secs = self.0.signed_duration_since(rhs.0).num_seconds();
        if secs >= INFINITY_THLD as i64 {
            TimeScalar::MAX
        } else if secs <= -(INFINITY_THLD as i64) {
            TimeScalar::MIN
        } else {
            secs as TimeScalar
        }
    }

    /// True while the timestamp still holds the "not yet known" sentinel.
    pub fn is_deferred(&self) -> bool {
        *self == Timestamp::MIN
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::MIN
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl Add<TimeScalar> for Timestamp {
    type Output = Timestamp;

    fn add(self, secs: TimeScalar) -> Timestamp {
        let shifted = self
            .0
            .checked_add_signed(TimeDelta::seconds(secs as i64))
            .unwrap_or(NaiveDateTime::MAX);
        Timestamp(shifted.clamp(Timestamp::MIN.0, Timestamp::max().0))
    }
}

impl Sub<TimeScalar> for Timestamp {
    type Output = Timestamp;

    fn sub(self, secs: TimeScalar) -> Timestamp {
        let shifted = self
            .0
            .checked_sub_signed(TimeDelta::seconds(secs as i64))
            .unwrap_or(NaiveDateTime::MIN);
        Timestamp(shifted.clamp(Timestamp::MIN.0, Timestamp::max().0))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = TimeScalar;

    fn sub(self, rhs: Timestamp) -> TimeScalar {
        self.seconds_since(&rhs)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_json_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid JSON date string: {raw:?}")))
    }
}

/// Millisecond tick source with an arbitrary epoch. Must be monotonic while
/// the process lives; it does not survive a reboot.
pub type TickSource = Box<dyn FnMut() -> u64>;

/// Tick source backed by the process monotonic clock.
pub fn system_tick_source() -> TickSource {
    let origin = std::time::Instant::now();
    Box::new(move || origin.elapsed().as_millis() as u64)
}

/// Wall-clock reconstruction from the tick source plus one server-provided
/// reference point.
///
/// Until [`Clock::set_time`] succeeds, [`Clock::now`] reports
/// [`Timestamp::MIN`]; callers record the capture tick instead and later
/// rebuild the true wall time with [`Clock::resolve`]. This is the mechanism
/// that lets a StartTransaction initiated hours before the first successful
/// server contact carry a correct timestamp.
pub struct Clock {
    tick_source: TickSource,
    basetime: Timestamp,
    base_tick: i64,
    valid: bool,
}

impl Clock {
    pub fn new(tick_source: TickSource) -> Clock {
        Clock {
            tick_source,
            basetime: Timestamp::MIN,
            base_tick: 0,
            valid: false,
        }
    }

    /// Raw milliseconds from the tick source.
    pub fn tick_ms(&mut self) -> u64 {
        (self.tick_source)()
    }

    /// Tick source in whole seconds.
    pub fn ticks(&mut self) -> i64 {
        (self.tick_ms() / 1000) as i64
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Adopts a server-reported time string as the new wall-clock reference.
    /// Returns false (state unchanged) if the string is not a JSON date.
    pub fn set_time(&mut self, json_date: &str) -> bool {
        match Timestamp::parse(json_date) {
            Some(ts) => {
                self.set_timestamp(ts);
                true
            }
            None => {
                warn!(raw = json_date, "rejected invalid time string");
                false
            }
        }
    }

    /// Adopts an already-parsed timestamp as the wall-clock reference.
    pub fn set_timestamp(&mut self, basetime: Timestamp) {
        self.base_tick = self.ticks();
        self.basetime = basetime;
        self.valid = true;
    }

    /// Current wall time, or [`Timestamp::MIN`] before the clock was set.
    pub fn now(&mut self) -> Timestamp {
        if !self.valid {
            return Timestamp::MIN;
        }
        let elapsed = self.ticks() - self.base_tick;
        self.basetime + elapsed.clamp(i32::MIN as i64, i32::MAX as i64) as TimeScalar
    }

    /// Reconstructs the wall time of an event captured at `captured_tick`
    /// seconds (from [`Clock::ticks`]). `None` while the clock is unset.
    pub fn resolve(&mut self, captured_tick: i64) -> Option<Timestamp> {
        if !self.valid {
            return None;
        }
        let offset = captured_tick - self.base_tick;
        Some(self.basetime + offset.clamp(i32::MIN as i64, i32::MAX as i64) as TimeScalar)
    }

    /// Current time as a scalar, for timestamp arithmetic.
    pub fn time_scalar(&mut self) -> TimeScalar {
        self.now().to_scalar()
    }

    pub fn create_timestamp(&self, scalar: TimeScalar) -> Timestamp {
        Timestamp::from_scalar(scalar)
    }

    pub fn to_scalar(&self, timestamp: &Timestamp) -> TimeScalar {
        timestamp.to_scalar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn manual_clock() -> (Clock, Rc<Cell<u64>>) {
        let tick = Rc::new(Cell::new(0u64));
        let source = tick.clone();
        (Clock::new(Box::new(move || source.get())), tick)
    }

    #[test]
    fn parse_accepts_json_dates() {
        let ts = Timestamp::parse("2020-10-01T20:53:32.486Z").unwrap();
        assert_eq!(ts.to_json_string(), "2020-10-01T20:53:32.000Z");

        // fractional seconds and the zone designator are optional
        assert!(Timestamp::parse("2020-10-01T20:53:32").is_some());
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!(Timestamp::parse("").is_none());
        assert!(Timestamp::parse("2020-10-01 20:53:32").is_none());
        assert!(Timestamp::parse("2020-13-01T20:53:32").is_none());
        assert!(Timestamp::parse("2020-10-32T20:53:32").is_none());
        assert!(Timestamp::parse("2020-10-01T25:53:32").is_none());
        assert!(Timestamp::parse("not-a-date").is_none());
    }

    #[test]
    fn emission_is_24_chars() {
        let ts = Timestamp::parse("2023-01-01T00:00:00.000Z").unwrap();
        assert_eq!(ts.to_json_string().len(), JSON_DATE_LEN);
        assert_eq!(ts.to_json_string(), "2023-01-01T00:00:00.000Z");
    }

    #[test]
    fn arithmetic_and_ordering() {
        let a = Timestamp::parse("2023-01-01T00:00:00Z").unwrap();
        let b = a + 90;
        assert_eq!(b.to_json_string(), "2023-01-01T00:01:30.000Z");
        assert_eq!(b - a, 90);
        assert_eq!(a - b, -90);
        assert!(a < b);
        assert!(Timestamp::MIN < a);
        assert!(a < Timestamp::max());
    }

    #[test]
    fn arithmetic_saturates_at_bounds() {
        assert_eq!(Timestamp::MIN - 100, Timestamp::MIN);
        assert_eq!(Timestamp::max() + 100, Timestamp::max());
    }

    #[test]
    fn differences_near_the_rollover_read_as_never() {
        // the true difference is below i32::MAX but past the threshold, so
        // it collapses to the "never" value instead of its literal count
        let near_rollover = Timestamp::from_scalar(INFINITY_THLD + 10);
        assert_eq!(near_rollover - Timestamp::MIN, TimeScalar::MAX);
        assert_eq!(Timestamp::MIN - near_rollover, TimeScalar::MIN);

        // ordinary differences stay exact
        let a = Timestamp::parse("2023-01-01T00:00:00Z").unwrap();
        assert_eq!((a + 3600) - a, 3600);
    }

    #[test]
    fn scalar_round_trip() {
        let ts = Timestamp::parse("2023-06-15T12:30:45Z").unwrap();
        assert_eq!(Timestamp::from_scalar(ts.to_scalar()), ts);
        assert_eq!(Timestamp::MIN.to_scalar(), 0);
    }

    #[test]
    fn serde_round_trip() {
        let ts = Timestamp::parse("2023-02-01T00:00:00.000Z").unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2023-02-01T00:00:00.000Z\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn clock_reports_min_until_set() {
        let (mut clock, tick) = manual_clock();
        assert!(!clock.is_valid());
        assert_eq!(clock.now(), Timestamp::MIN);

        tick.set(5_000);
        assert!(clock.set_time("2023-01-01T00:00:00.000Z"));
        assert!(clock.is_valid());

        tick.set(65_000);
        assert_eq!(clock.now().to_json_string(), "2023-01-01T00:01:00.000Z");
    }

    #[test]
    fn set_time_rejects_garbage_and_keeps_state() {
        let (mut clock, tick) = manual_clock();
        tick.set(1_000);
        assert!(clock.set_time("2023-01-01T00:00:00.000Z"));
        assert!(!clock.set_time("yesterday-ish"));
        assert!(clock.is_valid());
        assert_eq!(clock.now().to_json_string(), "2023-01-01T00:00:00.000Z");
    }

    #[test]
    fn resolve_backdates_captured_ticks() {
        let (mut clock, tick) = manual_clock();

        // event observed at tick 0, clock set two hours later
        tick.set(2 * 3600 * 1000);
        assert!(clock.set_time("2023-01-01T02:00:00.000Z"));

        let backdated = clock.resolve(0).unwrap();
        assert_eq!(backdated.to_json_string(), "2023-01-01T00:00:00.000Z");
    }

    #[test]
    fn resolve_is_none_while_unset() {
        let (mut clock, _tick) = manual_clock();
        assert!(clock.resolve(0).is_none());
    }
}
