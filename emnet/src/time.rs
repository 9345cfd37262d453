//! Time keeping for timers and the protocol engines.
//!
//! The stack never reads a clock on its own. Every entry point that can expire a timer takes the
//! current [`Instant`] as an argument, which keeps tests deterministic and lets the embedding
//! runtime use whatever tick source the board has.
//!
//! [`Instant`]: struct.Instant.html
use core::{fmt, ops};
pub use core::time::Duration;

/// A point in time, in milliseconds since an arbitrary epoch such as board reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    millis: i64,
}

impl Instant {
    /// The epoch itself.
    pub const ZERO: Instant = Instant { millis: 0 };

    /// Create an `Instant` from a number of milliseconds.
    pub fn from_millis<T: Into<i64>>(millis: T) -> Instant {
        Instant { millis: millis.into() }
    }

    /// Create an `Instant` from a number of seconds.
    pub fn from_secs<T: Into<i64>>(secs: T) -> Instant {
        Instant { millis: secs.into() * 1000 }
    }

    /// Milliseconds since the epoch.
    pub fn total_millis(self) -> i64 {
        self.millis
    }

    /// The time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: Instant) -> Duration {
        Duration::from_millis((self.millis - earlier.millis).max(0) as u64)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.millis / 1000, self.millis % 1000)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.as_millis() as i64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.as_millis() as i64;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis - rhs.as_millis() as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instant_ops() {
        assert_eq!(Instant::from_millis(4) + Duration::from_millis(6), Instant::from_millis(10));
        assert_eq!(Instant::from_millis(7) - Duration::from_millis(5), Instant::from_millis(2));
        assert_eq!(Instant::from_secs(2), Instant::from_millis(2000));
    }

    #[test]
    fn saturating_since() {
        let now = Instant::from_millis(5000);
        assert_eq!(now.saturating_since(Instant::from_millis(4250)), Duration::from_millis(750));
        assert_eq!(now.saturating_since(Instant::from_millis(6000)), Duration::from_millis(0));
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Instant::from_millis(5674)), "5.674s");
        assert_eq!(format!("{}", Instant::from_millis(5000)), "5.000s");
    }
}
