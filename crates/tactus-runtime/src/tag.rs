//! Logical time tags.
//!
//! A [`Tag`] is a coordinate in the superdense time lattice: a logical
//! instant in nanoseconds paired with a microstep. The microstep orders
//! zero-delay events causally within a single instant. Tags are totally
//! ordered lexicographically, which is what makes event processing
//! deterministic: two runs pop the event queue in the same order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in logical (or physical) time, in nanoseconds.
pub type TimePoint = i64;

/// A time interval in nanoseconds.
pub type Interval = i64;

/// Index within a logical instant, ordering zero-delay rounds.
pub type Microstep = u32;

/// A (time, microstep) coordinate in the logical-time lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Logical instant in nanoseconds.
    pub time: TimePoint,
    /// Microstep within the instant.
    pub microstep: Microstep,
}

impl Tag {
    /// Smaller than every tag a program can reach. Initial value of a
    /// trigger's last-scheduled tag.
    pub const NEVER: Tag = Tag {
        time: TimePoint::MIN,
        microstep: 0,
    };

    /// Larger than every tag a program can reach. Stop tag of a program
    /// with no timeout.
    pub const FOREVER: Tag = Tag {
        time: TimePoint::MAX,
        microstep: Microstep::MAX,
    };

    /// The origin tag `(0, 0)`.
    pub const ZERO: Tag = Tag {
        time: 0,
        microstep: 0,
    };

    /// Create a tag from a time point and microstep.
    pub const fn new(time: TimePoint, microstep: Microstep) -> Self {
        Tag { time, microstep }
    }

    /// The tag one microstep later within the same instant, saturating.
    pub fn next_microstep(self) -> Tag {
        Tag {
            time: self.time,
            microstep: self.microstep.saturating_add(1),
        }
    }

    /// The tag reached by delaying this one by `interval`.
    ///
    /// A strictly positive interval moves to `(time + interval, 0)` with
    /// saturating addition. A zero interval means "same instant, next
    /// microstep". `NEVER` absorbs every delay.
    pub fn delay(self, interval: Interval) -> Tag {
        if self.time == TimePoint::MIN {
            return Tag::NEVER;
        }
        if interval > 0 {
            Tag {
                time: self.time.saturating_add(interval),
                microstep: 0,
            }
        } else {
            self.next_microstep()
        }
    }

    /// Saturating interval addition; identical lattice semantics to
    /// [`Tag::delay`]. Timer re-arming uses this with the timer period.
    pub fn add_interval(self, interval: Interval) -> Tag {
        self.delay(interval)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Tag::NEVER {
            write!(f, "(NEVER)")
        } else if *self == Tag::FOREVER {
            write!(f, "(FOREVER)")
        } else {
            write!(f, "({}, {})", self.time, self.microstep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Tag::new(1, 0) < Tag::new(2, 0));
        assert!(Tag::new(1, 0) < Tag::new(1, 1));
        assert!(Tag::new(1, 5) < Tag::new(2, 0));
        assert_eq!(Tag::new(3, 2), Tag::new(3, 2));
    }

    #[test]
    fn sentinels_bound_everything() {
        let t = Tag::new(0, 0);
        assert!(Tag::NEVER < t);
        assert!(t < Tag::FOREVER);
        assert!(Tag::NEVER < Tag::FOREVER);
    }

    #[test]
    fn positive_delay_resets_microstep() {
        let t = Tag::new(100, 7);
        assert_eq!(t.delay(50), Tag::new(150, 0));
    }

    #[test]
    fn zero_delay_bumps_microstep() {
        let t = Tag::new(100, 7);
        assert_eq!(t.delay(0), Tag::new(100, 8));
        assert_eq!(t.next_microstep(), Tag::new(100, 8));
    }

    #[test]
    fn delay_saturates() {
        let t = Tag::new(TimePoint::MAX - 10, 0);
        assert_eq!(t.delay(100).time, TimePoint::MAX);

        let m = Tag::new(5, Microstep::MAX);
        assert_eq!(m.delay(0).microstep, Microstep::MAX);
    }

    #[test]
    fn never_absorbs_delay() {
        assert_eq!(Tag::NEVER.delay(1_000), Tag::NEVER);
        assert_eq!(Tag::NEVER.delay(0), Tag::NEVER);
    }

    #[test]
    fn display() {
        assert_eq!(Tag::new(42, 1).to_string(), "(42, 1)");
        assert_eq!(Tag::NEVER.to_string(), "(NEVER)");
    }
}
