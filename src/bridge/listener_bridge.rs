// src/bridge/listener_bridge.rs - Media frame to RTP packet bridge
//
// Stateful adapter between a media producer and RTP consumers: slices each
// frame along its packetization descriptors, stamps SSRC/sequence/timestamp,
// rebases timestamps across resets, and fans out to listeners. Independent
// of the event loop; listeners typically enqueue via `EventLoop::send`.
//
// Timestamp model: source timestamps are ms scale; emitted RTP timestamps
// are the rebased ms value multiplied by the media clock rate in kHz
// (48 audio, 90 video), truncated to 32 bits.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::bridge::accumulator::WindowAccumulator;
use crate::clock::wall_now_ms;
use crate::rtp::{MediaFrame, MediaKind, RtpPacket, RtpPacketization};

/// Default audio media clock, kHz.
const AUDIO_RATE_KHZ: u64 = 48;
/// Default video media clock, kHz.
const VIDEO_RATE_KHZ: u64 = 90;

/// Consumer of the bridge's RTP output. Called under the bridge mutex, on
/// whatever thread drives `on_media_frame`.
pub trait RtpListener: Send + Sync {
    fn on_rtp(&self, ssrc: u32, packet: &RtpPacket);
}

/// Codec-specific layer annotation seam, applied to each video packet
/// before fan-out. Layer selection itself lives outside this crate.
pub trait LayerSelector: Send + Sync {
    fn annotate(&self, packet: &mut RtpPacket);
}

/// Timestamp rebasing state. `first_timestamp == 0` marks a fresh epoch.
struct RebaseState {
    first_timestamp: u64,
    base_timestamp: u64,
    last_timestamp: u64,
    last_time_ms: u64,
}

struct BridgeShared {
    listeners: Vec<Arc<dyn RtpListener>>,
    accumulator: WindowAccumulator,
    bitrate_bps: u64,
}

/// Converts media frames into RTP packets and fans them out to listeners.
///
/// May be driven from any thread; the sequencing state is internally
/// serialized and the listener set has its own short critical section.
pub struct MediaFrameListenerBridge {
    ssrc: u32,
    audio_rate_khz: u64,
    video_rate_khz: u64,
    ext_seq_num: AtomicU32,
    reset: AtomicBool,
    rebase: Mutex<RebaseState>,
    num_frames: AtomicU64,
    num_packets: AtomicU64,
    total_bytes: AtomicU64,
    shared: Mutex<BridgeShared>,
    layer_selector: Mutex<Option<Arc<dyn LayerSelector>>>,
}

impl MediaFrameListenerBridge {
    pub fn new(ssrc: u32) -> Self {
        Self::with_rates(ssrc, AUDIO_RATE_KHZ as u32, VIDEO_RATE_KHZ as u32)
    }

    /// Construct with explicit media clock rates in kHz.
    pub fn with_rates(ssrc: u32, audio_rate_khz: u32, video_rate_khz: u32) -> Self {
        Self {
            ssrc,
            audio_rate_khz: u64::from(audio_rate_khz.max(1)),
            video_rate_khz: u64::from(video_rate_khz.max(1)),
            ext_seq_num: AtomicU32::new(0),
            reset: AtomicBool::new(false),
            rebase: Mutex::new(RebaseState {
                first_timestamp: 0,
                base_timestamp: 0,
                last_timestamp: 0,
                last_time_ms: 0,
            }),
            num_frames: AtomicU64::new(0),
            num_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            shared: Mutex::new(BridgeShared {
                listeners: Vec::new(),
                accumulator: WindowAccumulator::new(),
                bitrate_bps: 0,
            }),
            layer_selector: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn add_listener(&self, listener: Arc<dyn RtpListener>) {
        debug!("Adding RTP listener to bridge (ssrc {:#010x})", self.ssrc);
        self.shared.lock().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RtpListener>) {
        debug!("Removing RTP listener from bridge (ssrc {:#010x})", self.ssrc);
        self.shared
            .lock()
            .listeners
            .retain(|entry| !Arc::ptr_eq(entry, listener));
    }

    pub fn set_layer_selector(&self, selector: Arc<dyn LayerSelector>) {
        *self.layer_selector.lock() = Some(selector);
    }

    /// Start a new timestamp epoch: the next frame rebases onto the last
    /// emitted timestamp instead of continuing the source clock.
    pub fn reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Packetize one frame and fan the packets out to the listeners.
    /// Frames without packetization info are dropped silently.
    pub fn on_media_frame(&self, frame: &MediaFrame) {
        if !frame.has_packetization_info() {
            return;
        }

        let rate = match frame.kind() {
            MediaKind::Audio => self.audio_rate_khz,
            MediaKind::Video => self.video_rate_khz,
        };
        let now = wall_now_ms();

        self.num_frames.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        {
            let mut shared = self.shared.lock();
            shared.accumulator.update(now, frame.len() as u64);
            shared.bitrate_bps = shared.accumulator.instant() * 8;
        }

        let rtp_timestamp = self.rebase_timestamp(frame, rate, now);

        let emittable: Vec<&RtpPacketization> = frame
            .packetization()
            .iter()
            .filter(|info| Self::emittable(info, frame.len()))
            .collect();

        let selector = self.layer_selector.lock().clone();

        for (index, info) in emittable.iter().enumerate() {
            let mut packet = RtpPacket::new(frame.kind(), frame.codec());
            packet.set_ssrc(self.ssrc);
            packet.set_ext_seq_num(self.ext_seq_num.fetch_add(1, Ordering::Relaxed));
            packet.set_payload(&frame.data()[info.pos..info.pos + info.size]);
            packet.prefix_payload(&info.prefix);
            packet.set_timestamp(rtp_timestamp);
            packet.set_marker(index + 1 == emittable.len());

            self.num_packets.fetch_add(1, Ordering::Relaxed);

            if frame.kind() == MediaKind::Video {
                if let Some(selector) = selector.as_ref() {
                    selector.annotate(&mut packet);
                }
            }

            let shared = self.shared.lock();
            for listener in &shared.listeners {
                listener.on_rtp(self.ssrc, &packet);
            }
        }
    }

    /// Advance the rebasing state for one frame and return the scaled RTP
    /// timestamp shared by all of its packets.
    fn rebase_timestamp(&self, frame: &MediaFrame, rate: u64, now: u64) -> u32 {
        let mut guard = self.rebase.lock();
        let rebase = &mut *guard;

        let resetting = self.reset.swap(false, Ordering::AcqRel);
        if resetting {
            // Continue exactly where the previous epoch left off.
            rebase.first_timestamp = 0;
            rebase.base_timestamp = rebase.last_timestamp;
        }

        if rebase.first_timestamp == 0 {
            if !resetting && rebase.last_time_ms != 0 {
                // Epoch began without an explicit reset: account for the
                // wall-clock gap since the last emission.
                let gap_ms = now.saturating_sub(rebase.last_time_ms);
                rebase.base_timestamp = rebase.last_timestamp + gap_ms * rate / 1000 + 1;
            }
            rebase.first_timestamp = u64::from(frame.timestamp());
        }

        let delta = u64::from(frame.timestamp().wrapping_sub(rebase.first_timestamp as u32));
        rebase.last_timestamp = rebase.base_timestamp.wrapping_add(delta);
        rebase.last_time_ms = now;

        rebase.last_timestamp.wrapping_mul(rate) as u32
    }

    fn emittable(info: &RtpPacketization, frame_len: usize) -> bool {
        if info.total_len() > RtpPacket::MAX_MEDIA_LEN {
            return false;
        }
        info.pos
            .checked_add(info.size)
            .map_or(false, |end| end <= frame_len)
    }

    /// Decay the bitrate window over an idle period.
    pub fn update(&self) {
        self.update_at(wall_now_ms());
    }

    pub fn update_at(&self, now_ms: u64) {
        let mut shared = self.shared.lock();
        shared.accumulator.decay(now_ms);
        shared.bitrate_bps = shared.accumulator.instant() * 8;
    }

    /// Instant bitrate in bits per second.
    pub fn bitrate(&self) -> u64 {
        self.shared.lock().bitrate_bps
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames.load(Ordering::Relaxed)
    }

    pub fn num_packets(&self) -> u64 {
        self.num_packets.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
