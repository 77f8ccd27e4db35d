//! Property-based tests for the CC feedback codec.
//!
//! Round-trip exactness over arbitrary well-formed reports, layout length,
//! and rejection of every truncation.

use bytes::Bytes;
use proptest::prelude::*;
use shoal_transport::feedback::{
    ArrivalRecord, CcFeedbackReport, FeedbackBuilder, MinimalFeedback, StreamReportBlock,
};

// ─── Strategies ──────────────────────────────────────────────────────────────

fn arb_record() -> impl Strategy<Value = ArrivalRecord> {
    any::<u16>().prop_map(ArrivalRecord::from_u16)
}

fn arb_block() -> impl Strategy<Value = StreamReportBlock> {
    (
        any::<u32>(),
        any::<u16>(),
        proptest::collection::vec(arb_record(), 0..40),
    )
        .prop_map(|(ssrc, begin, records)| StreamReportBlock::new(ssrc, begin, records))
}

fn arb_report() -> impl Strategy<Value = CcFeedbackReport> {
    (
        any::<u32>(),
        proptest::collection::vec(arb_block(), 0..6),
        any::<u32>(),
    )
        .prop_map(|(sender_ssrc, blocks, report_timestamp)| CcFeedbackReport {
            sender_ssrc,
            blocks,
            report_timestamp,
        })
}

// ─── Round trip ──────────────────────────────────────────────────────────────

proptest! {
    /// Decoding an encoded report yields the same report, including reports
    /// with no blocks and blocks with an odd record count.
    #[test]
    fn report_roundtrip(report in arb_report()) {
        let bytes = report.to_bytes().unwrap();
        let decoded = CcFeedbackReport::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, report);
    }

    /// Encoded length is 8 + Σ(8 + 2·n rounded up to even) + 4.
    #[test]
    fn encoded_length_matches_layout(report in arb_report()) {
        let expected = 8
            + report
                .blocks
                .iter()
                .map(|b| {
                    let n = b.records.len();
                    8 + 2 * (n + n % 2)
                })
                .sum::<usize>()
            + 4;
        let bytes = report.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), expected);
        prop_assert_eq!(report.encoded_len(), expected);
        prop_assert_eq!(bytes.len() % 4, 0);
    }

    /// Every proper prefix of an encoded report fails to decode.
    #[test]
    fn truncation_is_rejected(report in arb_report(), cut in any::<prop::sample::Index>()) {
        let bytes = report.to_bytes().unwrap();
        let len = cut.index(bytes.len());
        prop_assert!(CcFeedbackReport::decode(&bytes[..len]).is_err());
    }

    /// Trailing bytes after the declared length are ignored.
    #[test]
    fn trailing_bytes_are_ignored(report in arb_report(), extra in proptest::collection::vec(any::<u8>(), 1..16)) {
        let mut bytes = report.to_bytes().unwrap().to_vec();
        bytes.extend_from_slice(&extra);
        prop_assert_eq!(CcFeedbackReport::decode(&bytes).unwrap(), report);
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = CcFeedbackReport::decode(&data);
        let _ = MinimalFeedback::decode(&data);
    }

    #[test]
    fn minimal_feedback_roundtrip(timestamp in any::<u32>(), seq in any::<u16>()) {
        let m = MinimalFeedback { timestamp, seq };
        let bytes: Bytes = m.to_bytes();
        prop_assert_eq!(bytes.len(), 6);
        prop_assert_eq!(MinimalFeedback::decode(&bytes).unwrap(), m);
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

proptest! {
    /// Every recorded packet appears as received in the built report, and
    /// the block spans exactly the recorded range.
    #[test]
    fn builder_reports_every_arrival(start in any::<u16>(), steps in proptest::collection::vec(1u16..4, 1..60)) {
        let mut builder = FeedbackBuilder::new(1);
        let mut seqs = vec![start];
        for step in steps {
            let next = seqs[seqs.len() - 1].wrapping_add(step);
            seqs.push(next);
        }
        for (i, &seq) in seqs.iter().enumerate() {
            builder.record(9, seq, i as u32 * 10, 0);
        }
        let report = builder.build(10_000).unwrap();
        prop_assert_eq!(report.blocks.len(), 1);
        let block = &report.blocks[0];
        prop_assert_eq!(block.begin_seq, start);
        let last = seqs[seqs.len() - 1];
        prop_assert_eq!(block.records.len(), last.wrapping_sub(start) as usize + 1);
        for &seq in &seqs {
            let idx = seq.wrapping_sub(start) as usize;
            prop_assert!(block.records[idx].received);
        }
        prop_assert!(builder.build(10_001).is_none());
    }
}
