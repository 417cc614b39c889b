//! Readiness multiplexer.
//!
//! A thin wrapper over the OS readiness facility that tracks an interest set
//! per descriptor. Registrations carry an opaque [`Token`] which comes back
//! with every [`Event`].
//!
//! One-shot interest ([`Interest::ONESHOT`]) is what keeps a connection on a
//! single worker at a time: once a descriptor fires it is disarmed until
//! somebody calls [`Reactor::modify`] on it again.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::{Events, Reactor, Waker};
    } else {
        compile_error!("evhttp-core requires epoll (Linux)");
    }
}

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Opaque registration key returned with each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// Interest / readiness bitset.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer closed its writing half.
    pub const PEER_HUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const HUP: Interest = Interest(libc::EPOLLHUP as u32);
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    /// Disarm after the first notification until re-armed via `modify`.
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    /// Edge-triggered delivery.
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Interest(bits)
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_edge(self) -> bool {
        self.contains(Self::EDGE)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interest, &str); 7] = [
            (Interest::READABLE, "IN"),
            (Interest::WRITABLE, "OUT"),
            (Interest::PEER_HUP, "RDHUP"),
            (Interest::HUP, "HUP"),
            (Interest::ERROR, "ERR"),
            (Interest::ONESHOT, "ONESHOT"),
            (Interest::EDGE, "ET"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) && flag != Interest::NONE {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readiness: Interest,
}

impl Event {
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readiness.intersects(Interest::READABLE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.readiness.intersects(Interest::WRITABLE)
    }

    /// Peer hangup or socket error: the connection is unusable.
    #[inline]
    pub fn is_hangup_or_error(&self) -> bool {
        self.readiness
            .intersects(Interest::PEER_HUP | Interest::HUP | Interest::ERROR)
    }
}
