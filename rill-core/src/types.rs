//! Strongly-typed identifiers for rill entities.
//!
//! Explicit wrapper types prevent bugs from mixing up IDs. All IDs are
//! 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `BrokerId` with `PartitionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(BrokerId, "broker", "Unique identifier for a broker in the cluster.");
define_id!(PartitionId, "partition", "Identifier for a partition within a stream.");
define_id!(WaiterId, "waiter", "Opaque identity for a registered log waiter.");

/// Leader epoch for a partition.
///
/// Incremented on every leader change. Strictly monotonic per partition
/// across the cluster; used to reject stale writes and to drive safe
/// follower truncation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LeaderEpoch(u64);

impl LeaderEpoch {
    /// Creates an epoch from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw epoch value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next epoch.
    ///
    /// # Panics
    /// Panics if the epoch would overflow.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX, "epoch overflow");
        Self(self.0 + 1)
    }
}

impl fmt::Debug for LeaderEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch({})", self.0)
    }
}

impl fmt::Display for LeaderEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

impl From<u64> for LeaderEpoch {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Offset of a record in a partition log.
///
/// Offsets are dense and monotonically increasing from 0 within a
/// partition. The value `-1` ([`Offset::NONE`]) stands for "no offset":
/// the newest offset of an empty log and the high watermark before any
/// record has been committed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Offset(i64);

impl Offset {
    /// The "no offset" sentinel.
    pub const NONE: Self = Self(-1);

    /// Creates an offset from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true if this is the "no offset" sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }

    /// Returns the next offset. `NONE.next()` is offset 0.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous offset, saturating at `NONE`.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        if self.0 <= 0 {
            Self::NONE
        } else {
            Self(self.0 - 1)
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset({})", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let broker = BrokerId::new(1);
        let partition = PartitionId::new(1);

        // These are different types even with same value.
        assert_eq!(broker.get(), partition.get());
    }

    #[test]
    fn test_id_display() {
        let broker = BrokerId::new(42);
        assert_eq!(format!("{broker}"), "broker-42");
        assert_eq!(format!("{broker:?}"), "broker(42)");
    }

    #[test]
    fn test_epoch_next() {
        let epoch = LeaderEpoch::new(3);
        assert_eq!(epoch.next().get(), 4);
        assert!(epoch < epoch.next());
    }

    #[test]
    #[should_panic(expected = "epoch overflow")]
    fn test_epoch_overflow_panics() {
        let _ = LeaderEpoch::new(u64::MAX).next();
    }

    #[test]
    fn test_offset_sentinel() {
        assert!(Offset::NONE.is_none());
        assert_eq!(Offset::NONE.next(), Offset::new(0));
        assert_eq!(Offset::new(0).prev(), Offset::NONE);
        assert_eq!(Offset::NONE.prev(), Offset::NONE);
        assert!(!Offset::new(0).is_none());
    }

    #[test]
    fn test_offset_ordering() {
        assert!(Offset::NONE < Offset::new(0));
        assert!(Offset::new(1) < Offset::new(2));
    }
}
