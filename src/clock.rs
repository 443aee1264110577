// src/clock.rs
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use std::sync::{Arc, Mutex};

/// Time source for the engine. Production code uses the system clock;
/// tests pin a fixed instant and advance it explicitly so month-end
/// eligibility and debounce behavior are deterministic.
#[derive(Clone)]
pub struct EngineClock {
    fixed: Option<Arc<Mutex<DateTime<Utc>>>>,
}

impl EngineClock {
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// Fixed clock from a "YYYY-MM-DD HH:MM:SS" string, interpreted as UTC.
    /// Panics on malformed input; only test setups construct clocks this way.
    pub fn fixed(initial_time_str: &str) -> Self {
        let naive = NaiveDateTime::parse_from_str(initial_time_str, "%Y-%m-%d %H:%M:%S")
            .expect("Invalid initial time string format for fixed clock");
        Self {
            fixed: Some(Arc::new(Mutex::new(naive.and_utc()))),
        }
    }

    pub fn set_time(&self, time_str: &str) {
        if let Some(fixed) = &self.fixed {
            let naive = NaiveDateTime::parse_from_str(time_str, "%Y-%m-%d %H:%M:%S")
                .expect("Invalid time string format for fixed clock");
            let mut guard = fixed.lock().expect("Clock mutex poisoned");
            *guard = naive.and_utc();
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Some(fixed) = &self.fixed {
            let mut guard = fixed.lock().expect("Clock mutex poisoned");
            *guard += duration;
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.fixed {
            Some(fixed) => *fixed.lock().expect("Clock mutex poisoned"),
            None => Utc::now(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = EngineClock::fixed("2026-03-14 09:00:00");
        assert_eq!(
            clock.today(),
            NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date")
        );
        clock.advance(Duration::days(18));
        assert_eq!(
            clock.today(),
            NaiveDate::from_ymd_opt(2026, 4, 1).expect("valid date")
        );
    }

    #[test]
    fn set_time_replaces_instant() {
        let clock = EngineClock::fixed("2026-03-14 09:00:00");
        clock.set_time("2026-07-01 00:00:00");
        assert_eq!(
            clock.today(),
            NaiveDate::from_ymd_opt(2026, 7, 1).expect("valid date")
        );
    }
}
