//! Duration helpers, calendar math, and the timed-execution scheduler.

use crate::{common::*, deferred::Deferred, error::Error, rt};
use chrono::{DateTime, Datelike, Months, Timelike, Utc};

// conversions

/// Converts a count of nanoseconds.
pub fn nanos(count: u64) -> Duration {
    Duration::from_nanos(count)
}

/// Converts a count of microseconds.
pub fn micros(count: u64) -> Duration {
    Duration::from_micros(count)
}

/// Converts a count of milliseconds.
pub fn millis(count: u64) -> Duration {
    Duration::from_millis(count)
}

/// Converts a count of seconds.
pub fn seconds(count: u64) -> Duration {
    Duration::from_secs(count)
}

/// Converts a count of minutes.
pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count * 60)
}

/// Converts a count of hours.
pub fn hours(count: u64) -> Duration {
    Duration::from_secs(count * 3_600)
}

/// Converts a count of days.
pub fn days(count: u64) -> Duration {
    Duration::from_secs(count * 86_400)
}

/// The period of a frequency, e.g. `hz(4.0)` is 250ms.
pub fn hz(rate: f64) -> Duration {
    assert!(
        rate.is_finite() && rate > 0.0,
        "the rate must be a positive number"
    );
    Duration::from_secs_f64(1.0 / rate)
}

/// Renders a duration as its greatest-unit-first decomposition over days,
/// hours, minutes, and seconds. Sub-second durations render as `"0s"`.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_owned();
    }
    let mut parts = Vec::new();
    for (unit, label) in [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")] {
        let count = secs / unit;
        if count > 0 {
            parts.push(format!("{count}{label}"));
            secs %= unit;
        }
    }
    parts.join(" ")
}

// calendar

/// Calendar units for [`floor`] and [`add`], all interpreted in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

fn midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

/// Truncates a timestamp to `unit`, clearing all finer-grained fields.
/// Weeks begin on Monday; months on their first day.
pub fn floor(t: DateTime<Utc>, unit: CalendarUnit) -> DateTime<Utc> {
    use CalendarUnit::*;

    match unit {
        Millisecond => t
            .with_nanosecond(t.nanosecond() / 1_000_000 * 1_000_000)
            .expect("truncated nanosecond is valid"),
        Second => t.with_nanosecond(0).expect("zero nanosecond is valid"),
        Minute => floor(t, Second)
            .with_second(0)
            .expect("zero second is valid"),
        Hour => floor(t, Minute).with_minute(0).expect("zero minute is valid"),
        Day => midnight(t),
        Week => midnight(t) - chrono::Duration::days(t.weekday().num_days_from_monday() as i64),
        Month => t
            .date_naive()
            .with_day(1)
            .expect("day one is always valid")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc(),
    }
}

/// Offsets a timestamp by `count` units, with calendar semantics for months
/// (day-of-month clamps at the shorter month's end).
pub fn add(t: DateTime<Utc>, count: i64, unit: CalendarUnit) -> DateTime<Utc> {
    use CalendarUnit::*;

    match unit {
        Millisecond => t + chrono::Duration::milliseconds(count),
        Second => t + chrono::Duration::seconds(count),
        Minute => t + chrono::Duration::minutes(count),
        Hour => t + chrono::Duration::hours(count),
        Day => t + chrono::Duration::days(count),
        Week => t + chrono::Duration::weeks(count),
        Month => {
            if count >= 0 {
                t.checked_add_months(Months::new(count as u32))
            } else {
                t.checked_sub_months(Months::new((-count) as u32))
            }
            .expect("month arithmetic out of range")
        }
    }
}

// scheduler

/// Runs `f` once after `delay`. The returned deferred resolves to the
/// function's result.
pub fn after<T, F>(delay: Duration, f: F) -> Deferred<T>
where
    T: 'static + Send + Clone,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    let out = Deferred::new();
    let link = out.clone();
    rt::spawn(async move {
        rt::sleep(delay).await;
        link.resolve(f());
    });
    out
}

/// Runs `f` once at `when`, or immediately when `when` is in the past.
pub fn at<T, F>(when: DateTime<Utc>, f: F) -> Deferred<T>
where
    T: 'static + Send + Clone,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    after(delay, f)
}

/// A cancellable ticket returned by [`every`]. Cancellation is idempotent
/// and prevents further ticks without interrupting a running one.
#[derive(Debug, Clone)]
pub struct Ticket {
    cancelled: Arc<AtomicBool>,
}

impl Ticket {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(SeqCst)
    }
}

/// Runs `f` at a fixed rate, first after `initial_delay`, then every
/// `period` measured against the schedule rather than the previous
/// completion — a late tick fires immediately and the schedule never
/// drifts. An `Err` from `f` cancels the ticket.
pub fn every<F>(period: Duration, initial_delay: Duration, mut f: F) -> Ticket
where
    F: FnMut() -> Result<(), Error> + Send + 'static,
{
    assert!(!period.is_zero(), "the period must be non-zero");

    let ticket = Ticket::new();
    let cancelled = ticket.cancelled.clone();
    rt::spawn(async move {
        rt::sleep(initial_delay).await;
        let mut next = Instant::now();
        loop {
            if cancelled.load(SeqCst) {
                break;
            }
            if let Err(error) = f() {
                tracing::warn!(%error, "periodic task failed, cancelling its ticket");
                cancelled.store(true, SeqCst);
                break;
            }
            next += period;
            let now = Instant::now();
            if next > now {
                rt::sleep(next - now).await;
            }
        }
    });
    ticket
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn conversions() {
        assert_eq!(minutes(2), Duration::from_secs(120));
        assert_eq!(hours(1), Duration::from_secs(3_600));
        assert_eq!(days(2), Duration::from_secs(172_800));
        assert_eq!(hz(4.0), Duration::from_millis(250));
    }

    #[test]
    fn format_duration_decomposes() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(400)), "0s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 1h 1m 1s");
        assert_eq!(format_duration(days(2) + seconds(5)), "2d 5s");
    }

    #[test]
    fn floor_is_idempotent() {
        use CalendarUnit::*;

        let t = Utc.with_ymd_and_hms(2024, 5, 16, 13, 37, 42).unwrap()
            + chrono::Duration::milliseconds(123);
        for unit in [Millisecond, Second, Minute, Hour, Day, Week, Month] {
            let once = floor(t, unit);
            assert_eq!(floor(once, unit), once, "{unit:?}");
        }
    }

    #[test]
    fn floor_clears_finer_fields() {
        let t = Utc.with_ymd_and_hms(2024, 5, 16, 13, 37, 42).unwrap();
        assert_eq!(
            floor(t, CalendarUnit::Hour),
            Utc.with_ymd_and_hms(2024, 5, 16, 13, 0, 0).unwrap()
        );
        // 2024-05-16 is a Thursday; the week floors to Monday the 13th.
        assert_eq!(
            floor(t, CalendarUnit::Week),
            Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap()
        );
        assert_eq!(
            floor(t, CalendarUnit::Month),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn add_months_clamps() {
        let t = Utc.with_ymd_and_hms(2023, 11, 30, 8, 0, 0).unwrap();
        assert_eq!(
            add(t, 3, CalendarUnit::Month),
            Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap()
        );
        assert_eq!(
            add(t, -1, CalendarUnit::Month),
            Utc.with_ymd_and_hms(2023, 10, 30, 8, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn after_resolves_to_result() {
        let ok = after(Duration::from_millis(5), || Ok(5));
        assert_eq!(ok.await, Ok(5));

        let err = after::<i32, _>(Duration::from_millis(5), || Err(Error::failure("nope")));
        assert_eq!(err.await, Err(Error::failure("nope")));
    }

    #[tokio::test]
    async fn every_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticket = every(Duration::from_millis(10), Duration::ZERO, {
            let count = count.clone();
            move || {
                count.fetch_add(1, SeqCst);
                Ok(())
            }
        });

        rt::sleep(Duration::from_millis(55)).await;
        ticket.cancel();
        ticket.cancel();
        let seen = count.load(SeqCst);
        assert!(seen >= 2, "expected at least two ticks, saw {seen}");

        rt::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(SeqCst), seen);
    }

    #[tokio::test]
    async fn every_cancels_on_error() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticket = every(Duration::from_millis(5), Duration::ZERO, {
            let count = count.clone();
            move || {
                count.fetch_add(1, SeqCst);
                Err(Error::failure("tick failed"))
            }
        });

        rt::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(SeqCst), 1);
        assert!(ticket.is_cancelled());
    }
}
