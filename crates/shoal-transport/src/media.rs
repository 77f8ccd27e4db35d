//! # Media packets
//!
//! A [`MediaPacket`] is one encoded-frame fragment. On the wire it travels as
//! an RTP packet so that receivers and the QUIC ACK correlator can recover
//! the sequence number from the first bytes of a datagram.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Media capture and encoding live outside this crate. The core only talks
//! to them through [`RateControl`] and [`MediaSink`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header size.
pub const RTP_HEADER_SIZE: usize = 12;

/// Dynamic payload type used for video.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

// ─── MediaPacket ─────────────────────────────────────────────────────────────

/// One encoded-frame fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// 16-bit sequence number (wraps).
    pub seq: u16,
    /// Media timestamp in the stream's clock rate.
    pub timestamp: u32,
    /// Stream identifier.
    pub ssrc: u32,
    pub payload_type: u8,
    /// Last packet of a frame.
    pub marker: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn new(ssrc: u32, seq: u16, timestamp: u32, payload: Bytes) -> Self {
        MediaPacket {
            seq,
            timestamp,
            ssrc,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            marker: false,
            payload,
        }
    }

    pub fn with_marker(mut self) -> Self {
        self.marker = true;
        self
    }

    /// Encoded size (header + payload).
    pub fn wire_len(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u8(RTP_VERSION << 6);
        let mut second = self.payload_type & 0x7F;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);
        buf.put_u16(self.seq);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode an RTP packet. CSRC entries, header extensions and padding are
    /// skipped; the payload is a zero-copy slice of `data`.
    pub fn decode(data: &Bytes) -> Result<Self, CodecError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: RTP_HEADER_SIZE,
                available: data.len(),
            });
        }
        let mut buf = &data[..];
        let first = buf.get_u8();
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let has_padding = first & 0x20 != 0;
        let has_extension = first & 0x10 != 0;
        let csrc_count = (first & 0x0F) as usize;

        let second = buf.get_u8();
        let seq = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut offset = RTP_HEADER_SIZE + csrc_count * 4;
        if has_extension {
            let ext_header_end = offset + 4;
            if data.len() < ext_header_end {
                return Err(CodecError::Truncated {
                    needed: ext_header_end,
                    available: data.len(),
                });
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset = ext_header_end + words * 4;
        }
        if data.len() < offset {
            return Err(CodecError::Truncated {
                needed: offset,
                available: data.len(),
            });
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || end - offset < pad {
                return Err(CodecError::Truncated {
                    needed: offset + pad,
                    available: data.len(),
                });
            }
            end -= pad;
        }

        Ok(MediaPacket {
            seq,
            timestamp,
            ssrc,
            payload_type: second & 0x7F,
            marker: second & 0x80 != 0,
            payload: data.slice(offset..end),
        })
    }
}

/// Read the sequence number of an encoded media packet without decoding it.
pub fn peek_sequence(data: &[u8]) -> Option<u16> {
    if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != RTP_VERSION {
        return None;
    }
    Some(u16::from_be_bytes([data[2], data[3]]))
}

// ─── Collaborator contracts ──────────────────────────────────────────────────

/// Rate-control entry points of the media encoder.
pub trait RateControl: Send {
    /// Apply a new encoder target bitrate.
    fn set_target_bitrate(&mut self, bps: u64);

    /// Ask the encoder for a key frame. Encoders without key-frame control
    /// ignore it.
    fn request_key_frame(&mut self) {}
}

/// Consumer of received media packets.
pub trait MediaSink: Send {
    fn consume(&mut self, packet: MediaPacket);
}
