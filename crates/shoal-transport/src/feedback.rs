//! # CC Feedback Wire Format
//!
//! Congestion-control feedback report in the RFC 8888 layout, carried as an
//! RTCP transport-layer feedback message (PT=205, FMT=11).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P| FMT=11  |   PT = 205    |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 SSRC of RTCP packet sender                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   SSRC of 1st RTP Stream                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          begin_seq            |          num_reports          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |R|ECN|  Arrival time offset    | ...                           .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! .                                                               .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Report Timestamp (32 bits)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Each block carries `num_reports` 16-bit records, padded with one zero
//! record when the count is odd. The arrival time offset counts 1/1024 s
//! units back from the report timestamp and saturates at `0x1FFF`.
//!
//! Besides the codec this module holds the two feedback producers: the
//! [`FeedbackBuilder`] that turns observed arrivals into reports, and the
//! six-byte [`MinimalFeedback`] used when the receiver only reports the last
//! packet it saw.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::clock::NTP_UNITS_PER_SEC;
use crate::error::CodecError;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const RTCP_VERSION: u8 = 2;

/// RTCP transport-layer feedback packet type.
pub const RTPFB_PACKET_TYPE: u8 = 205;

/// FMT value for congestion control feedback.
pub const CCFB_FORMAT: u8 = 11;

/// Header (4) + sender SSRC (4) + report timestamp (4).
pub const MIN_REPORT_SIZE: usize = 12;

/// Stream SSRC (4) + begin_seq (2) + num_reports (2).
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Largest representable arrival time offset.
pub const MAX_ARRIVAL_OFFSET: u16 = 0x1FFF;

/// NTP units per arrival-time-offset unit (65536 / 1024).
pub const NTP_UNITS_PER_ATO: u32 = NTP_UNITS_PER_SEC / 1024;

// ─── Report types ────────────────────────────────────────────────────────────

/// Per-packet arrival outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArrivalRecord {
    /// Set when the packet arrived; clear for a packet reported lost.
    pub received: bool,
    /// Two-bit ECN mark.
    pub ecn: u8,
    /// 13-bit arrival time offset in 1/1024 s before the report timestamp.
    pub arrival_offset: u16,
}

impl ArrivalRecord {
    pub fn received(ecn: u8, arrival_offset: u16) -> Self {
        ArrivalRecord {
            received: true,
            ecn: ecn & 0x03,
            arrival_offset: arrival_offset.min(MAX_ARRIVAL_OFFSET),
        }
    }

    pub fn lost() -> Self {
        ArrivalRecord::default()
    }

    pub fn to_u16(self) -> u16 {
        let mut v = self.arrival_offset.min(MAX_ARRIVAL_OFFSET);
        v |= ((self.ecn & 0x03) as u16) << 13;
        if self.received {
            v |= 0x8000;
        }
        v
    }

    pub fn from_u16(v: u16) -> Self {
        ArrivalRecord {
            received: v & 0x8000 != 0,
            ecn: ((v >> 13) & 0x03) as u8,
            arrival_offset: v & MAX_ARRIVAL_OFFSET,
        }
    }
}

/// Arrival records for one media stream starting at `begin_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReportBlock {
    pub ssrc: u32,
    pub begin_seq: u16,
    /// Declared record count. Must equal `records.len()` when encoding.
    pub num_reports: u16,
    pub records: Vec<ArrivalRecord>,
}

impl StreamReportBlock {
    /// Build a block whose declared count matches its records.
    pub fn new(ssrc: u32, begin_seq: u16, records: Vec<ArrivalRecord>) -> Self {
        StreamReportBlock {
            ssrc,
            begin_seq,
            num_reports: records.len() as u16,
            records,
        }
    }

    /// Encoded size including the padding record.
    pub fn encoded_len(&self) -> usize {
        let n = self.num_reports as usize;
        BLOCK_HEADER_SIZE + 2 * (n + n % 2)
    }
}

/// A complete congestion-control feedback report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcFeedbackReport {
    pub sender_ssrc: u32,
    pub blocks: Vec<StreamReportBlock>,
    /// Q16.16 NTP time the report was generated.
    pub report_timestamp: u32,
}

impl CcFeedbackReport {
    pub fn new(sender_ssrc: u32, report_timestamp: u32) -> Self {
        CcFeedbackReport {
            sender_ssrc,
            blocks: Vec::new(),
            report_timestamp,
        }
    }

    /// Total encoded length. Always a multiple of 4.
    pub fn encoded_len(&self) -> usize {
        8 + self
            .blocks
            .iter()
            .map(StreamReportBlock::encoded_len)
            .sum::<usize>()
            + 4
    }

    /// Serialize the report.
    ///
    /// Fails if a block's declared count disagrees with its records or the
    /// report is too large for the 16-bit RTCP length field.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        for block in &self.blocks {
            if block.num_reports as usize != block.records.len() {
                return Err(CodecError::ReportCountMismatch {
                    ssrc: block.ssrc,
                    declared: block.num_reports,
                    actual: block.records.len(),
                });
            }
        }
        let total = self.encoded_len();
        let words = total / 4 - 1;
        if words > u16::MAX as usize {
            return Err(CodecError::TooLarge(total));
        }

        buf.reserve(total);
        buf.put_u8((RTCP_VERSION << 6) | CCFB_FORMAT);
        buf.put_u8(RTPFB_PACKET_TYPE);
        buf.put_u16(words as u16);
        buf.put_u32(self.sender_ssrc);
        for block in &self.blocks {
            buf.put_u32(block.ssrc);
            buf.put_u16(block.begin_seq);
            buf.put_u16(block.num_reports);
            for record in &block.records {
                buf.put_u16(record.to_u16());
            }
            if block.records.len() % 2 != 0 {
                buf.put_u16(0);
            }
        }
        buf.put_u32(self.report_timestamp);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse a report.
    ///
    /// The RTCP length field bounds the report; trailing bytes beyond it are
    /// ignored. Padding records are skipped.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MIN_REPORT_SIZE {
            return Err(CodecError::Truncated {
                needed: MIN_REPORT_SIZE,
                available: data.len(),
            });
        }
        let mut buf = data;
        let first = buf.get_u8();
        let version = first >> 6;
        if version != RTCP_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let packet_type = buf.get_u8();
        if packet_type != RTPFB_PACKET_TYPE {
            return Err(CodecError::UnexpectedPacketType(packet_type));
        }
        let total = (buf.get_u16() as usize + 1) * 4;
        if total > data.len() {
            return Err(CodecError::Truncated {
                needed: total,
                available: data.len(),
            });
        }
        if total < MIN_REPORT_SIZE {
            return Err(CodecError::Truncated {
                needed: MIN_REPORT_SIZE,
                available: total,
            });
        }
        let sender_ssrc = buf.get_u32();

        // Blocks lie between the sender SSRC and the trailing timestamp.
        let mut body = &data[8..total - 4];
        let mut blocks = Vec::new();
        while body.has_remaining() {
            if body.remaining() < BLOCK_HEADER_SIZE {
                return Err(CodecError::Truncated {
                    needed: BLOCK_HEADER_SIZE,
                    available: body.remaining(),
                });
            }
            let ssrc = body.get_u32();
            let begin_seq = body.get_u16();
            let num_reports = body.get_u16();
            let n = num_reports as usize;
            let padded = 2 * (n + n % 2);
            if body.remaining() < padded {
                return Err(CodecError::Truncated {
                    needed: padded,
                    available: body.remaining(),
                });
            }
            let records = (0..n)
                .map(|_| ArrivalRecord::from_u16(body.get_u16()))
                .collect();
            if n % 2 != 0 {
                body.advance(2);
            }
            blocks.push(StreamReportBlock {
                ssrc,
                begin_seq,
                num_reports,
                records,
            });
        }

        let mut tail = &data[total - 4..total];
        let report_timestamp = tail.get_u32();

        Ok(CcFeedbackReport {
            sender_ssrc,
            blocks,
            report_timestamp,
        })
    }
}

/// Arrival time offset for a packet that arrived at `arrival` and is reported
/// at `report_ts`, saturating at [`MAX_ARRIVAL_OFFSET`]. Differences are
/// taken modulo 2^32 so a report just past the timestamp wrap still measures
/// forward; an arrival stamped after the report counts as zero.
pub fn arrival_offset(report_ts: u32, arrival: u32) -> u16 {
    let delta = report_ts.wrapping_sub(arrival);
    if delta > i32::MAX as u32 {
        return 0;
    }
    (delta / NTP_UNITS_PER_ATO).min(MAX_ARRIVAL_OFFSET as u32) as u16
}

// ─── Minimal feedback ────────────────────────────────────────────────────────

/// Size of an encoded [`MinimalFeedback`].
pub const MINIMAL_FEEDBACK_SIZE: usize = 6;

/// Last-seen report: arrival time of the newest packet and its sequence
/// number. The sender reconstructs the rest by inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalFeedback {
    pub timestamp: u32,
    pub seq: u16,
}

impl MinimalFeedback {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.timestamp);
        buf.put_u16(self.seq);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MINIMAL_FEEDBACK_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse a minimal feedback message. The message must be exactly
    /// [`MINIMAL_FEEDBACK_SIZE`] bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MINIMAL_FEEDBACK_SIZE {
            return Err(CodecError::Truncated {
                needed: MINIMAL_FEEDBACK_SIZE,
                available: data.len(),
            });
        }
        if data.len() > MINIMAL_FEEDBACK_SIZE {
            return Err(CodecError::BadLength {
                expected: MINIMAL_FEEDBACK_SIZE,
                actual: data.len(),
            });
        }
        Ok(MinimalFeedback {
            timestamp: data.get_u32(),
            seq: data.get_u16(),
        })
    }
}

// ─── Feedback builder ────────────────────────────────────────────────────────

/// Default cap on records per stream block.
pub const DEFAULT_MAX_RECORDS: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Arrival {
    seq: u16,
    at: u32,
    ecn: u8,
}

#[derive(Debug, Default)]
struct StreamArrivals {
    ssrc: u32,
    pending: Vec<Arrival>,
}

/// Collects packet arrivals and turns them into [`CcFeedbackReport`]s.
///
/// Each report covers the packets recorded since the previous one, from the
/// oldest to the newest sequence number (wrap aware). Sequence numbers in
/// that range that were never recorded are reported lost.
#[derive(Debug)]
pub struct FeedbackBuilder {
    sender_ssrc: u32,
    max_records: usize,
    streams: Vec<StreamArrivals>,
}

impl FeedbackBuilder {
    pub fn new(sender_ssrc: u32) -> Self {
        FeedbackBuilder {
            sender_ssrc,
            max_records: DEFAULT_MAX_RECORDS,
            streams: Vec::new(),
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.clamp(1, u16::MAX as usize);
        self
    }

    /// Record that packet `seq` of stream `ssrc` arrived at `at` (NTP units).
    pub fn record(&mut self, ssrc: u32, seq: u16, at: u32, ecn: u8) {
        let stream = match self.streams.iter_mut().position(|s| s.ssrc == ssrc) {
            Some(idx) => &mut self.streams[idx],
            None => {
                self.streams.push(StreamArrivals {
                    ssrc,
                    pending: Vec::new(),
                });
                let last = self.streams.len() - 1;
                &mut self.streams[last]
            }
        };
        stream.pending.push(Arrival {
            seq,
            at,
            ecn: ecn & 0x03,
        });
    }

    /// True if arrivals are waiting to be reported.
    pub fn has_pending(&self) -> bool {
        self.streams.iter().any(|s| !s.pending.is_empty())
    }

    /// Build a report stamped `report_ts`, or `None` if nothing arrived since
    /// the last report.
    pub fn build(&mut self, report_ts: u32) -> Option<CcFeedbackReport> {
        if !self.has_pending() {
            return None;
        }
        let mut report = CcFeedbackReport::new(self.sender_ssrc, report_ts);
        for stream in &mut self.streams {
            if stream.pending.is_empty() {
                continue;
            }
            let arrivals = std::mem::take(&mut stream.pending);
            report
                .blocks
                .push(build_block(stream.ssrc, &arrivals, report_ts, self.max_records));
        }
        Some(report)
    }
}

fn build_block(ssrc: u32, arrivals: &[Arrival], report_ts: u32, max_records: usize) -> StreamReportBlock {
    // Signed distance from the first arrival resolves sequence wrap.
    let anchor = arrivals[0].seq;
    let offset = |seq: u16| seq.wrapping_sub(anchor) as i16 as i32;
    let lo = arrivals.iter().map(|a| offset(a.seq)).min().unwrap_or(0);
    let hi = arrivals.iter().map(|a| offset(a.seq)).max().unwrap_or(0);

    // Keep the newest packets when the range exceeds the cap.
    let lo = lo.max(hi - max_records as i32 + 1);
    let begin_seq = anchor.wrapping_add(lo as u16);
    let count = (hi - lo + 1) as usize;

    let mut records = vec![ArrivalRecord::lost(); count];
    for a in arrivals {
        let idx = offset(a.seq) - lo;
        if idx < 0 {
            continue;
        }
        records[idx as usize] = ArrivalRecord::received(a.ecn, arrival_offset(report_ts, a.at));
    }
    StreamReportBlock::new(ssrc, begin_seq, records)
}
