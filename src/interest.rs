//! Interest-set bookkeeping for channels.
//!
//! A channel can be interested in three kinds of readiness: connect completion,
//! inbound data and outbound capacity. mio has no dedicated "connect" interest;
//! a pending connect is reported as writable, so both `connect` and `write`
//! translate to [`mio::Interest::WRITABLE`].
//!
//! ```text
//!   InterestSet { connect, read, write }
//!        connect ─┐
//!        write   ─┴──▶ Interest::WRITABLE
//!        read    ────▶ Interest::READABLE
//! ```

use std::fmt;

use mio::Interest;

const CONNECT: u8 = 0b001;
const READ: u8 = 0b010;
const WRITE: u8 = 0b100;

/// The readiness kinds a channel currently wants to be notified about.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const EMPTY: InterestSet = InterestSet(0);
    pub const CONNECT: InterestSet = InterestSet(CONNECT);
    pub const READ: InterestSet = InterestSet(READ);
    pub const WRITE: InterestSet = InterestSet(WRITE);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_connect(self) -> bool {
        self.0 & CONNECT != 0
    }

    pub fn is_read(self) -> bool {
        self.0 & READ != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & WRITE != 0
    }

    pub fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn add(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 | other.0)
    }

    #[must_use]
    pub fn remove(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 & !other.0)
    }

    /// Set armed for a freshly registered channel. It is not yet known to be
    /// writable, so only connect completion and inbound data are watched.
    pub fn connect_and_read() -> InterestSet {
        InterestSet::CONNECT.add(InterestSet::READ)
    }

    /// Translates the set into the mio interest mask.
    ///
    /// Returns `None` for a set that maps to nothing, since mio cannot
    /// register an empty interest.
    pub fn to_mio(self) -> Option<Interest> {
        let readable = self.is_read().then_some(Interest::READABLE);
        let writable = (self.is_connect() || self.is_write()).then_some(Interest::WRITABLE);
        match (readable, writable) {
            (Some(r), Some(w)) => Some(r | w),
            (Some(r), None) => Some(r),
            (None, Some(w)) => Some(w),
            (None, None) => None,
        }
    }
}

impl std::ops::BitOr for InterestSet {
    type Output = InterestSet;

    fn bitor(self, rhs: InterestSet) -> InterestSet {
        self.add(rhs)
    }
}

impl fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(3);
        if self.is_connect() {
            names.push("CONNECT");
        }
        if self.is_read() {
            names.push("READ");
        }
        if self.is_write() {
            names.push("WRITE");
        }
        if names.is_empty() {
            f.write_str("EMPTY")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_read() {
        let set = InterestSet::connect_and_read();
        assert!(set.is_connect());
        assert!(set.is_read());
        assert!(!set.is_write());
        assert_eq!(set.to_mio(), Some(Interest::READABLE | Interest::WRITABLE));
    }

    #[test]
    fn test_remove_connect_keeps_read() {
        let set = InterestSet::connect_and_read().remove(InterestSet::CONNECT);
        assert_eq!(set, InterestSet::READ);
        assert_eq!(set.to_mio(), Some(Interest::READABLE));
    }

    #[test]
    fn test_write_toggle() {
        let armed = InterestSet::READ | InterestSet::WRITE;
        assert!(armed.contains(InterestSet::WRITE));
        let disarmed = armed.remove(InterestSet::WRITE);
        assert!(!disarmed.is_write());
        assert_eq!(disarmed, InterestSet::READ);
    }

    #[test]
    fn test_empty_has_no_mio_interest() {
        assert!(InterestSet::EMPTY.is_empty());
        assert_eq!(InterestSet::EMPTY.to_mio(), None);
        assert_eq!(format!("{:?}", InterestSet::EMPTY), "EMPTY");
        assert_eq!(
            format!("{:?}", InterestSet::READ | InterestSet::WRITE),
            "READ | WRITE"
        );
    }
}
