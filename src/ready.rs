use std::fmt;

/// Readiness reported by the multiplexer for one [`Channel`].
///
/// A thin wrapper around the raw `epoll` event bits; the predicates group
/// them the way [`Channel::handle_event`] dispatches: hangup-without-input
/// routes to the close callback, error to the error callback, any of the
/// input flavours (data, priority data, peer half-close) to the read
/// callback, and output to the write callback.
///
/// [`Channel`]: crate::Channel
/// [`Channel::handle_event`]: crate::Channel::handle_event
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u32);

impl Ready {
    pub const EMPTY: Ready = Ready(0);

    pub(crate) const fn from_bits(bits: u32) -> Ready {
        Ready(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Data (or priority data, or a peer half-close) can be read.
    pub fn is_readable(self) -> bool {
        self.0 & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }

    /// Both halves of the connection are gone.
    pub fn is_hangup(self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }

    /// The peer shut down its write half (received FIN).
    pub fn is_read_closed(self) -> bool {
        self.0 & libc::EPOLLRDHUP as u32 != 0
    }

    pub fn is_priority(self) -> bool {
        self.0 & libc::EPOLLPRI as u32 != 0
    }

    pub(crate) fn has_input(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FLAGS: &[(libc::c_int, &str)] = &[
            (libc::EPOLLIN, "IN"),
            (libc::EPOLLPRI, "PRI"),
            (libc::EPOLLOUT, "OUT"),
            (libc::EPOLLERR, "ERR"),
            (libc::EPOLLHUP, "HUP"),
            (libc::EPOLLRDHUP, "RDHUP"),
        ];
        let mut one = false;
        for (flag, name) in FLAGS {
            if self.0 & *flag as u32 != 0 {
                if one {
                    write!(fmt, " ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn predicates() {
        let r = Ready::from_bits((libc::EPOLLIN | libc::EPOLLHUP) as u32);
        assert!(r.is_readable());
        assert!(r.is_hangup());
        assert!(r.has_input());
        assert!(!r.is_writable());

        let hup_only = Ready::from_bits(libc::EPOLLHUP as u32);
        assert!(hup_only.is_hangup());
        assert!(!hup_only.has_input());
        assert!(Ready::EMPTY.is_empty());
    }

    #[test]
    fn fmt_debug() {
        let r = Ready::from_bits((libc::EPOLLIN | libc::EPOLLOUT) as u32);
        assert_eq!(format!("{:?}", r), "IN OUT");
        assert_eq!(format!("{:?}", Ready::EMPTY), "(empty)");
    }
}
