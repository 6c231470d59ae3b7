//! NTP 32.32 timetags and the per-process clock.
//!
//! Every sample write and every evaluator run takes an explicit [`Timetag`]
//! so that tests can drive time deterministically; [`Clock`] is the only
//! place the wall clock is consulted. Timetags are anchored to a monotonic
//! instant captured at clock creation, so NTP adjustments to the system
//! clock never reorder samples.

use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rosc::OscTime;

/// Offset between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// An NTP 32.32 fixed-point timetag, as carried by OSC bundles.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timetag(u64);

impl Timetag {
    /// The OSC "immediately" timetag.
    pub const IMMEDIATE: Timetag = Timetag(1);

    pub fn new(seconds: u32, fraction: u32) -> Self {
        Timetag(((seconds as u64) << 32) | fraction as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Timetag(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    pub fn is_immediate(self) -> bool {
        self.0 <= 1
    }

    /// Builds a timetag from seconds in the NTP epoch.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs <= 0.0 {
            return Timetag::IMMEDIATE;
        }
        let whole = secs as u64;
        let frac = ((secs - whole as f64) * (u32::MAX as f64 + 1.0)) as u64;
        Timetag((whole << 32) | (frac & 0xFFFF_FFFF))
    }

    pub fn as_secs_f64(self) -> f64 {
        self.seconds() as f64 + self.fraction() as f64 / (u32::MAX as f64 + 1.0)
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn secs_since(self, earlier: Timetag) -> f64 {
        self.as_secs_f64() - earlier.as_secs_f64()
    }

    pub fn add_secs(self, secs: f64) -> Timetag {
        Timetag::from_secs_f64(self.as_secs_f64() + secs)
    }
}

impl From<OscTime> for Timetag {
    fn from(t: OscTime) -> Self {
        Timetag::new(t.seconds, t.fractional)
    }
}

impl From<Timetag> for OscTime {
    fn from(t: Timetag) -> Self {
        OscTime {
            seconds: t.seconds(),
            fractional: t.fraction(),
        }
    }
}

impl fmt::Debug for Timetag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timetag({}.{:08x})", self.seconds(), self.fraction())
    }
}

/// Monotonic clock yielding NTP timetags.
///
/// The wall clock is read once at construction; subsequent reads add the
/// monotonic elapsed time to that anchor.
#[derive(Debug)]
pub struct Clock {
    anchor: Instant,
    wall_ntp: f64,
}

impl Clock {
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Clock {
            anchor: Instant::now(),
            wall_ntp: wall + NTP_UNIX_OFFSET as f64,
        }
    }

    pub fn now(&self) -> Timetag {
        Timetag::from_secs_f64(self.wall_ntp + self.anchor.elapsed().as_secs_f64())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timetag_round_trips_through_osc() {
        let t = Timetag::new(3_900_000_000, 0x8000_0000);
        let osc: OscTime = t.into();
        assert_eq!(Timetag::from(osc), t);
        assert_eq!(t.seconds(), 3_900_000_000);
        assert_eq!(t.fraction(), 0x8000_0000);
    }

    #[test]
    fn fractional_seconds_survive_conversion() {
        let t = Timetag::from_secs_f64(100.5);
        assert_eq!(t.seconds(), 100);
        assert!((t.as_secs_f64() - 100.5).abs() < 1e-6);
    }

    #[test]
    fn secs_since_is_signed() {
        let a = Timetag::from_secs_f64(10.0);
        let b = Timetag::from_secs_f64(12.5);
        assert!((b.secs_since(a) - 2.5).abs() < 1e-6);
        assert!((a.secs_since(b) + 2.5).abs() < 1e-6);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a.seconds() > NTP_UNIX_OFFSET as u32);
    }
}
