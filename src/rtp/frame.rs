// src/rtp/frame.rs - Media frame model
//
// A frame carries the raw encoded bytes plus the packetization descriptors
// computed upstream: each descriptor selects one RTP packet's payload slice
// and an optional prefix (e.g. a fragmentation header) to prepend.

use bytes::Bytes;

/// Media kind of a frame or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One RTP packet's worth of a frame: `[pos, pos + size)` within the frame
/// data, with `prefix` bytes prepended on the wire.
#[derive(Debug, Clone)]
pub struct RtpPacketization {
    pub pos: usize,
    pub size: usize,
    pub prefix: Bytes,
}

impl RtpPacketization {
    pub fn new(pos: usize, size: usize, prefix: Bytes) -> Self {
        Self { pos, size, prefix }
    }

    /// Bytes this descriptor will occupy in the packet payload.
    pub fn total_len(&self) -> usize {
        self.prefix.len() + self.size
    }
}

/// An encoded media frame with its packetization info.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    kind: MediaKind,
    /// Codec id, carried as the RTP payload type.
    codec: u8,
    data: Bytes,
    /// Source timestamp, ms scale, 32-bit as on the wire.
    timestamp: u32,
    packetization: Vec<RtpPacketization>,
}

impl MediaFrame {
    pub fn audio(codec: u8, data: Bytes, timestamp: u32) -> Self {
        Self::new(MediaKind::Audio, codec, data, timestamp)
    }

    pub fn video(codec: u8, data: Bytes, timestamp: u32) -> Self {
        Self::new(MediaKind::Video, codec, data, timestamp)
    }

    pub fn new(kind: MediaKind, codec: u8, data: Bytes, timestamp: u32) -> Self {
        Self {
            kind,
            codec,
            data,
            timestamp,
            packetization: Vec::new(),
        }
    }

    /// Append a packetization descriptor. Descriptors emit in insertion
    /// order.
    pub fn add_packetization(&mut self, pos: usize, size: usize, prefix: Bytes) {
        self.packetization.push(RtpPacketization::new(pos, size, prefix));
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> u8 {
        self.codec
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn has_packetization_info(&self) -> bool {
        !self.packetization.is_empty()
    }

    pub fn packetization(&self) -> &[RtpPacketization] {
        &self.packetization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_len_includes_prefix() {
        let info = RtpPacketization::new(0, 100, Bytes::from_static(&[1, 2, 3]));
        assert_eq!(info.total_len(), 103);
    }

    #[test]
    fn test_packetization_order_preserved() {
        let mut frame = MediaFrame::video(96, Bytes::from_static(b"0123456789"), 1000);
        assert!(!frame.has_packetization_info());

        frame.add_packetization(0, 4, Bytes::new());
        frame.add_packetization(4, 6, Bytes::new());
        assert!(frame.has_packetization_info());
        assert_eq!(frame.packetization().len(), 2);
        assert_eq!(frame.packetization()[0].pos, 0);
        assert_eq!(frame.packetization()[1].pos, 4);
    }
}
