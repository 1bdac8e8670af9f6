//! Log sequence numbers.

use std::fmt;

/// A 64-bit log sequence number, doubling as the monotone commit stamp.
///
/// `Lsn::INVALID` (zero) is the distinguished "no position" value: it is
/// produced when an epoch closes without a usable log snapshot, and every
/// consumer of an LSN cookie must ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The distinguished invalid position.
    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit offset.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// Bitwise reinterpretation of a tuple's tagged `clsn` word.
    ///
    /// The caller is responsible for checking the installer tag first; an
    /// installer-tagged word reinterpreted this way compares greater than
    /// any real log position, which is exactly what the reclamation
    /// `clsn < trim_lsn` tests rely on.
    #[inline]
    #[must_use]
    pub const fn from_word(word: u64) -> Self {
        Self(word)
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "lsn#{}", self.0)
        } else {
            f.write_str("lsn#invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Lsn;

    #[test]
    fn invalid_is_zero_and_smallest() {
        assert_eq!(Lsn::INVALID.offset(), 0);
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::INVALID < Lsn::new(1));
    }

    #[test]
    fn ordering_follows_raw_offset() {
        assert!(Lsn::new(3) < Lsn::new(9));
        assert_eq!(Lsn::new(7), Lsn::from_word(7));
    }

    #[test]
    fn display_marks_invalid() {
        assert_eq!(Lsn::new(42).to_string(), "lsn#42");
        assert_eq!(Lsn::INVALID.to_string(), "lsn#invalid");
    }
}
