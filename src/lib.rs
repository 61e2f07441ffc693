//! **rtp-reactor** is the I/O core of a real-time media server: a
//! single-threaded UDP event loop plus the media-frame → RTP packetizer
//! bridge that feeds it.
//!
//! # Architecture
//!
//! The loop follows a single-thread reactor pattern over `poll(2)`:
//!
//! - [`EventLoop`]: one thread serializing socket reads, non-blocking
//!   writes, deferred tasks, and timers
//! - [`MediaFrameListenerBridge`]: packetizes media frames into RTP and
//!   fans out to listeners (which typically call [`EventLoop::send`])
//! - [`RtpPacket`] / [`MediaFrame`]: the packet and frame models
//!
//! Any thread may call `send`, `post`, the timer constructors, and the
//! [`Timer`] methods; every effect lands on the loop thread. A self-pipe
//! (`eventfd` on Linux) interrupts the poll whenever work arrives, and a
//! `signaled` flag coalesces redundant wakeups.
//!
//! ## Backpressure
//!
//! | State | Threshold | Behavior |
//! |-------|-----------|----------|
//! | Normal | < max/2 | All packets enqueued |
//! | Lagging | > max/2 | Enqueued, consumer behind (warned once) |
//! | Overflown | > max | Packets dropped (error logged once) |
//!
//! `max` defaults to 16384 packets (`RTP_REACTOR_MAX_QUEUE` overrides).
//! Recovery to Normal happens below max/4.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::{Ipv4Addr, UdpSocket};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rtp_reactor::{EventLoop, MediaFrameListenerBridge, RtpListener, RtpPacket};
//!
//! // RTP listeners usually forward straight into the loop's send queue.
//! struct Forwarder {
//!     lp: EventLoop,
//!     peer: (Ipv4Addr, u16),
//! }
//!
//! impl RtpListener for Forwarder {
//!     fn on_rtp(&self, _ssrc: u32, packet: &RtpPacket) {
//!         let (ip, port) = self.peer;
//!         self.lp.send(ip, port, packet.serialize());
//!     }
//! }
//!
//! let lp = EventLoop::new().unwrap();
//! let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
//! lp.start(socket, None).unwrap();
//!
//! let bridge = MediaFrameListenerBridge::new(0x1234_5678);
//! bridge.add_listener(Arc::new(Forwarder {
//!     lp: lp.clone(),
//!     peer: (Ipv4Addr::new(192, 0, 2, 10), 5004),
//! }));
//!
//! // Periodic stats on the loop thread.
//! let stats = lp.create_timer_repeating(
//!     Duration::from_secs(1),
//!     Duration::from_secs(1),
//!     move |_now| { /* read bridge.bitrate() ... */ },
//! );
//!
//! // ... feed bridge.on_media_frame(&frame) from the producer ...
//!
//! stats.cancel();
//! lp.stop();
//! ```

mod bridge;
mod clock;
mod error;
mod reactor;
mod rtp;

pub use bridge::{LayerSelector, MediaFrameListenerBridge, RtpListener};
pub use error::{Error, Result};
pub use reactor::{BackpressureState, EventLoop, LoopListener, TaskHandle, Timer};
pub use rtp::{MediaFrame, MediaKind, RtpPacket, RtpPacketization, MTU};
