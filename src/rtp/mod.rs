//! RTP packet and media-frame models.
//!
//! [`RtpPacket`] is the unit the bridge emits and listeners consume: an
//! RFC 3550 fixed header plus an owned payload. [`MediaFrame`] is the unit
//! producers feed into the bridge: raw frame bytes plus the precomputed
//! packetization descriptors that say how to slice it into packets.

mod frame;
mod packet;

pub use frame::{MediaFrame, MediaKind, RtpPacketization};
pub use packet::RtpPacket;

/// Upper bound on a single datagram's payload, by convention.
pub const MTU: usize = 1500;
