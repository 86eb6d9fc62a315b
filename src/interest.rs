use std::num::NonZeroU8;
use std::{fmt, ops};

/// Readiness a [`Channel`] is interested in.
///
/// `Interest` is the registration side of readiness: a [`Channel`] tells its
/// loop's multiplexer which of the two event classes it wants to be woken
/// for. The empty set is represented as `Option<Interest>` being `None`, so
/// `Option<Interest>` is the same size as `Interest` itself.
///
/// [`Channel`]: crate::Channel
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

// These must be unique.
const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// Returns an `Interest` set representing readable interest.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Returns an `Interest` set representing writable interest.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from `self`, returning `None` if the set would be
    /// empty.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    /// Returns true if the value includes readable interest.
    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    /// Returns true if the value includes writable interest.
    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0.get()
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Interest> {
        NonZeroU8::new(bits & (READABLE | WRITABLE)).map(Interest)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read = both.remove(Interest::WRITABLE).unwrap();
        assert!(read.is_readable());
        assert!(!read.is_writable());
        assert_eq!(read.remove(Interest::READABLE), None);
    }

    #[test]
    fn is_option_sized() {
        use std::mem::size_of;
        assert_eq!(size_of::<Option<Interest>>(), size_of::<Interest>());
    }

    #[test]
    fn fmt_debug() {
        assert_eq!(format!("{:?}", Interest::READABLE), "READABLE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
    }
}
