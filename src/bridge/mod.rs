//! Media-frame → RTP packetizer bridge.
//!
//! [`MediaFrameListenerBridge`] sits between a media producer and the RTP
//! side of the stack: frames go in with their packetization descriptors,
//! sequenced and timestamp-rebased RTP packets come out through registered
//! [`RtpListener`]s. A sliding-window accumulator keeps an instant bitrate
//! estimate alongside.

mod accumulator;
mod listener_bridge;

pub use listener_bridge::{LayerSelector, MediaFrameListenerBridge, RtpListener};
