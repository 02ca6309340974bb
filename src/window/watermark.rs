//! Event time: timestamps, watermark policies and emission policies.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Assertion that no more records with an earlier timestamp will
/// arrive on the stream that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    pub const MIN: Watermark = Watermark(DateTime::<Utc>::MIN_UTC);
    /// Marks that a stream is exhausted.
    pub const MAX: Watermark = Watermark(DateTime::<Utc>::MAX_UTC);

    pub fn time(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm({})", self.0)
    }
}

/// Reads the system time.
pub type Now = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub(crate) fn system_now() -> Now {
    Arc::new(Utc::now)
}

/// Tracks the event times seen on one stream partition and decides
/// how far the watermark can go.
///
/// A new instance is made for every source partition, so there is no
/// state shared between processor instances.
pub trait WatermarkPolicy: Send {
    /// Note a new event. Returns the watermark after it.
    fn report_event(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc>;

    /// The watermark right now, which may move even without new
    /// events.
    fn current_watermark(&mut self) -> DateTime<Utc>;
}

pub type WatermarkPolicySupplier = Arc<dyn Fn() -> Box<dyn WatermarkPolicy> + Send + Sync>;

/// The watermark trails the highest timestamp seen by `lag`.
pub fn limiting_lag(lag: Duration) -> WatermarkPolicySupplier {
    Arc::new(move || Box::new(LimitingLag::new(lag)))
}

/// Like [`limiting_lag`], but once no event advanced the top
/// timestamp for `max_delay` of system time, the watermark starts
/// following the system clock.
pub fn limiting_lag_and_delay(lag: Duration, max_delay: Duration) -> WatermarkPolicySupplier {
    limiting_lag_and_delay_with_clock(lag, max_delay, system_now())
}

pub fn limiting_lag_and_delay_with_clock(
    lag: Duration,
    max_delay: Duration,
    now: Now,
) -> WatermarkPolicySupplier {
    Arc::new(move || Box::new(LimitingLagAndDelay::new(lag, max_delay, now.clone())))
}

pub struct LimitingLag {
    lag: Duration,
    top: Option<DateTime<Utc>>,
}

impl LimitingLag {
    pub fn new(lag: Duration) -> Self {
        Self { lag, top: None }
    }
}

impl WatermarkPolicy for LimitingLag {
    fn report_event(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        if self.top.map_or(true, |top| timestamp > top) {
            self.top = Some(timestamp);
        }
        self.current_watermark()
    }

    fn current_watermark(&mut self) -> DateTime<Utc> {
        self.top
            .and_then(|top| top.checked_sub_signed(self.lag))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

pub struct LimitingLagAndDelay {
    lag: Duration,
    max_delay: Duration,
    now: Now,
    late_time: Option<DateTime<Utc>>,
    system_time_of_last_event: DateTime<Utc>,
}

impl LimitingLagAndDelay {
    pub fn new(lag: Duration, max_delay: Duration, now: Now) -> Self {
        let system_time_of_last_event = now();
        Self {
            lag,
            max_delay,
            now,
            late_time: None,
            system_time_of_last_event,
        }
    }
}

impl WatermarkPolicy for LimitingLagAndDelay {
    fn report_event(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let event_late_time = timestamp
            .checked_sub_signed(self.lag)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if self.late_time.map_or(true, |late| event_late_time > late) {
            self.late_time = Some(event_late_time);
            self.system_time_of_last_event = (self.now)();
        }
        self.current_watermark()
    }

    fn current_watermark(&mut self) -> DateTime<Utc> {
        let Some(late_time) = self.late_time else {
            return DateTime::<Utc>::MIN_UTC;
        };
        let idle = (self.now)().signed_duration_since(self.system_time_of_last_event);
        if idle > self.max_delay {
            late_time
                .checked_add_signed(idle - self.max_delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        } else {
            late_time
        }
    }
}

/// Decides which watermark advances are worth sending downstream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEmissionPolicy {
    /// Emit every advance, never the same value twice.
    #[default]
    SuppressDuplicates,
    /// Emit only once the watermark moved by at least this much.
    MinStep(Duration),
}

pub fn suppress_duplicates() -> WatermarkEmissionPolicy {
    WatermarkEmissionPolicy::SuppressDuplicates
}

pub fn emit_by_min_step(step: Duration) -> WatermarkEmissionPolicy {
    WatermarkEmissionPolicy::MinStep(step)
}

impl WatermarkEmissionPolicy {
    pub fn should_emit(&self, last: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> bool {
        let Some(last) = last else {
            return candidate > DateTime::<Utc>::MIN_UTC;
        };
        match self {
            Self::SuppressDuplicates => candidate > last,
            Self::MinStep(step) => match last.checked_add_signed(*step) {
                Some(threshold) => candidate > last && candidate >= threshold,
                None => false,
            },
        }
    }
}

/// Everything a timestamp transform needs to turn raw records into
/// event-time envelopes plus a watermark stream.
pub struct TimestampDefinition<T> {
    pub(crate) timestamp_fn: Arc<dyn Fn(&T) -> DateTime<Utc> + Send + Sync>,
    pub(crate) policy: WatermarkPolicySupplier,
    pub(crate) emission: WatermarkEmissionPolicy,
    pub(crate) allowed_lateness: Duration,
}

impl<T> Clone for TimestampDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            timestamp_fn: self.timestamp_fn.clone(),
            policy: self.policy.clone(),
            emission: self.emission,
            allowed_lateness: self.allowed_lateness,
        }
    }
}

impl<T> TimestampDefinition<T> {
    /// Suppresses duplicate watermarks and allows no lateness.
    pub fn new(
        timestamp_fn: impl Fn(&T) -> DateTime<Utc> + Send + Sync + 'static,
        policy: WatermarkPolicySupplier,
    ) -> Self {
        Self {
            timestamp_fn: Arc::new(timestamp_fn),
            policy,
            emission: WatermarkEmissionPolicy::default(),
            allowed_lateness: Duration::zero(),
        }
    }

    pub fn with_emission_policy(mut self, emission: WatermarkEmissionPolicy) -> Self {
        self.emission = emission;
        self
    }

    /// Hold the watermark back so records up to this much behind it
    /// still make it into their windows.
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    pub fn allowed_lateness(&self) -> Duration {
        self.allowed_lateness
    }

    pub fn emission_policy(&self) -> WatermarkEmissionPolicy {
        self.emission
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn limiting_lag_trails_top() {
        let mut policy = LimitingLag::new(Duration::seconds(2));
        assert_eq!(policy.current_watermark(), DateTime::<Utc>::MIN_UTC);
        assert_eq!(policy.report_event(at(10)), at(8));
        // Out of order events don't move it back.
        assert_eq!(policy.report_event(at(5)), at(8));
        assert_eq!(policy.report_event(at(12)), at(10));
    }

    #[test]
    fn limiting_lag_and_delay_follows_system_time_when_idle() {
        let clock = Arc::new(Mutex::new(at(1_000)));
        let now: Now = {
            let clock = clock.clone();
            Arc::new(move || *clock.lock().unwrap())
        };
        let mut policy = LimitingLagAndDelay::new(Duration::seconds(1), Duration::seconds(5), now);
        assert_eq!(policy.report_event(at(100)), at(99));

        *clock.lock().unwrap() = at(1_003);
        assert_eq!(policy.current_watermark(), at(99));

        *clock.lock().unwrap() = at(1_008);
        assert_eq!(policy.current_watermark(), at(102));
    }

    #[test]
    fn suppress_duplicates_only_emits_advances() {
        let policy = suppress_duplicates();
        assert!(policy.should_emit(None, at(1)));
        assert!(!policy.should_emit(None, DateTime::<Utc>::MIN_UTC));
        assert!(!policy.should_emit(Some(at(1)), at(1)));
        assert!(!policy.should_emit(Some(at(2)), at(1)));
        assert!(policy.should_emit(Some(at(1)), at(2)));
    }

    #[test]
    fn min_step_waits_for_step() {
        let policy = emit_by_min_step(Duration::seconds(10));
        assert!(!policy.should_emit(Some(at(0)), at(9)));
        assert!(policy.should_emit(Some(at(0)), at(10)));
    }
}
