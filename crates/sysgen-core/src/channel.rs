//! Notification/IPC channels between two protection domains.
//!
//! Channels are created through [`crate::system::SystemDescription`] so that
//! each end's local id comes out of its PD's id space.

use crate::pd::PdHandle;
use crate::store::Handle;

/// Handle to a [`Channel`] owned by a system description.
pub type ChannelHandle = Handle<Channel>;

/// One end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEnd {
    /// The PD on this end.
    pub pd: PdHandle,
    /// Local id within that PD's id space.
    pub id: u8,
    /// Whether this end may notify the other.
    pub notify: bool,
    /// Whether this end may issue protected procedure calls to the other.
    pub pp: bool,
}

/// Creation options for a channel; defaults to notify-both, no fixed ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Fixed local id on end A, if the caller reserves one.
    pub id_a: Option<u8>,
    /// Fixed local id on end B.
    pub id_b: Option<u8>,
    /// End A may notify end B.
    pub notify_a: bool,
    /// End B may notify end A.
    pub notify_b: bool,
    /// End A may issue protected procedure calls to end B.
    pub pp_a: bool,
    /// End B may issue protected procedure calls to end A.
    pub pp_b: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            id_a: None,
            id_b: None,
            notify_a: true,
            notify_b: true,
            pp_a: false,
            pp_b: false,
        }
    }
}

impl ChannelOptions {
    /// Options for a call channel: end A calls into end B.
    #[must_use]
    pub fn calling() -> Self {
        Self {
            pp_a: true,
            ..Self::default()
        }
    }
}

/// A bidirectional link between exactly two PDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    a: ChannelEnd,
    b: ChannelEnd,
}

impl Channel {
    pub(crate) const fn from_ends(a: ChannelEnd, b: ChannelEnd) -> Self {
        Self { a, b }
    }

    /// End A.
    #[must_use]
    pub const fn end_a(&self) -> ChannelEnd {
        self.a
    }

    /// End B.
    #[must_use]
    pub const fn end_b(&self) -> ChannelEnd {
        self.b
    }

    /// The allocated (or caller-fixed) local ids of both ends.
    #[must_use]
    pub const fn end_ids(&self) -> (u8, u8) {
        (self.a.id, self.b.id)
    }

    /// Returns this channel's end on `pd`, if `pd` participates.
    #[must_use]
    pub fn end_for(&self, pd: PdHandle) -> Option<ChannelEnd> {
        if self.a.pd == pd {
            Some(self.a)
        } else if self.b.pd == pd {
            Some(self.b)
        } else {
            None
        }
    }
}
