//! Exact media time
//!
//! Presentation timestamps are computed as `start + n * frame_duration`. With
//! non-integer frame durations (30000/1001 fps) float or nanosecond arithmetic
//! drifts over long sessions, so timestamps are kept as reduced fractions of a
//! second and only rounded when handed to a clock.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul};
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A non-negative rational number of seconds, always in lowest terms
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaTime {
    numer: u128,
    denom: u128,
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime { numer: 0, denom: 1 };

    /// `numer / denom` seconds. A zero denominator is treated as one.
    pub fn new(numer: u128, denom: u128) -> Self {
        let denom = denom.max(1);
        let g = gcd(numer, denom).max(1);
        Self {
            numer: numer / g,
            denom: denom / g,
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self::new(d.as_nanos(), NANOS_PER_SEC)
    }

    pub fn numer(&self) -> u128 {
        self.numer
    }

    pub fn denom(&self) -> u128 {
        self.denom
    }

    /// Truncated to whole nanoseconds
    pub fn to_duration(&self) -> Duration {
        let nanos = self.numer * NANOS_PER_SEC / self.denom;
        let secs = (nanos / NANOS_PER_SEC) as u64;
        let sub = (nanos % NANOS_PER_SEC) as u32;
        Duration::new(secs, sub)
    }

    /// Whole ticks of a clock running at `rate` Hz (floor)
    pub fn to_clock_ticks(&self, rate: u32) -> u64 {
        (self.numer * rate as u128 / self.denom) as u64
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        let g = gcd(self.denom, rhs.denom).max(1);
        let denom = self.denom / g * rhs.denom;
        let numer = self.numer * (denom / self.denom) + rhs.numer * (denom / rhs.denom);
        MediaTime::new(numer, denom)
    }
}

impl Mul<u64> for MediaTime {
    type Output = MediaTime;

    fn mul(self, rhs: u64) -> MediaTime {
        MediaTime::new(self.numer * rhs as u128, self.denom)
    }
}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.numer * other.denom).cmp(&(other.numer * self.denom))
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.numer, self.denom)
    }
}

impl From<Duration> for MediaTime {
    fn from(d: Duration) -> Self {
        Self::from_duration(d)
    }
}
