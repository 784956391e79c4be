//! Interest and readiness masks.
//!
//! `Interest` is what a socket asks its backend to watch for; `Ready` is what
//! the backend reports back. Both are small copyable bit sets.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// Directions a socket wants to be notified about.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest. A registered handle with empty interest is parked.
    pub const NONE: Self = Self(0);
    /// Readable (or acceptable, for listeners)
    pub const READ: Self = Self(0b01);
    /// Writable (or connected, for pending connects)
    pub const WRITE: Self = Self(0b10);
    /// Both directions
    pub const BOTH: Self = Self(0b11);

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Sub for Interest {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ | WRITE"),
        }
    }
}

/// Readiness reported by a backend for one handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Self = Self(0);
    pub const READ: Self = Self(0b0001);
    pub const WRITE: Self = Self(0b0010);
    /// Error condition pending on the handle
    pub const ERROR: Self = Self(0b0100);
    /// Peer hung up
    pub const CLOSE: Self = Self(0b1000);

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_closed(self) -> bool {
        self.0 & Self::CLOSE.0 != 0
    }

    /// Project the readiness onto the interest directions.
    #[inline]
    #[must_use]
    pub const fn directions(self) -> Interest {
        Interest(self.0 & Interest::BOTH.0)
    }
}

impl BitOr for Ready {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<Interest> for Ready {
    fn from(interest: Interest) -> Self {
        Self(interest.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if self.is_readable() {
            parts.push("READ");
        }
        if self.is_writable() {
            parts.push("WRITE");
        }
        if self.is_error() {
            parts.push("ERROR");
        }
        if self.is_closed() {
            parts.push("CLOSE");
        }
        if parts.is_empty() {
            f.write_str("EMPTY")
        } else {
            f.write_str(&parts.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_ops() {
        let both = Interest::READ | Interest::WRITE;
        assert_eq!(both, Interest::BOTH);
        assert!(both.contains(Interest::READ));
        assert_eq!(both - Interest::READ, Interest::WRITE);
        assert!((Interest::READ & Interest::WRITE).is_empty());
    }

    #[test]
    fn test_ready_directions() {
        let ready = Ready::READ | Ready::CLOSE;
        assert_eq!(ready.directions(), Interest::READ);
        assert_eq!(format!("{ready:?}"), "READ | CLOSE");
        assert_eq!(format!("{:?}", Ready::EMPTY), "EMPTY");
    }
}
