//! Simple interval timer running on microsecond timestamps.
//!
//! The timer never looks at the wall clock itself, the caller hands it `now`.  That keeps
//! it usable with [`crate::common::get_micro_time`] in the real thing and with a manual
//! clock in tests.

pub const MICROS_PER_SEC: u128 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval,
        }
    }
    pub fn from_secs(now: u128, secs: u32) -> MicroTimer {
        MicroTimer::new(now, secs as u128 * MICROS_PER_SEC)
    }
    pub fn get_interval(&self) -> u128 {
        self.interval
    }
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    /// time left before the timer expires (zero once it has)
    pub fn remaining(&self, now: u128) -> u128 {
        (self.last_time + self.interval).saturating_sub(now)
    }
}

#[cfg(test)]
mod test_micro_timer {
    use super::*;

    #[test]
    fn test_expiration() {
        let mut now = 1000;
        let mt = MicroTimer::new(now, 100);
        assert!(!mt.expired(now));
        now += 99;
        assert!(!mt.expired(now));
        now += 2;
        assert!(mt.expired(now));
        assert_eq!(mt.remaining(now), 0);
    }

    #[test]
    fn from_secs() {
        let mt = MicroTimer::from_secs(0, 10);
        assert_eq!(mt.get_interval(), 10_000_000);
        assert_eq!(mt.remaining(4_000_000), 6_000_000);
        assert_eq!(mt.remaining(20_000_000), 0);
        assert!(!mt.expired(10_000_000));
        assert!(mt.expired(10_000_001));
    }
}
