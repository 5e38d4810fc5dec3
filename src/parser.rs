//! Byte-stream finite-state machine that turns raw bytes into typed
//!  [`Segment`] events. The parser assumes no framing at all: input may be
//!  split at arbitrary byte boundaries and state is carried across calls, so
//!  feeding a valid byte sequence in any partition yields the same events in
//!  the same order as feeding it whole.
//!
//! SDNV fields are normally decoded straight from the input slice; only when
//!  a value straddles the end of the available input does it spill into a
//!  small per-parser accumulator and finish on the next call.

use anyhow::{anyhow, bail};

use crate::sdnv;
use crate::sdnv::SdnvError;
use crate::segment::{
    CancelReason, Checkpoint, Extension, ReceptionClaim, ReportSegment, SegmentType, SessionId,
    LTP_VERSION,
};

/// A fully parsed segment, ready for engine dispatch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Segment {
    pub session_id: SessionId,
    pub header_extensions: Vec<Extension>,
    pub trailer_extensions: Vec<Extension>,
    pub body: SegmentBody,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataSegment {
    pub segment_type: SegmentType,
    pub client_service_id: u64,
    pub offset: u64,
    pub checkpoint: Option<Checkpoint>,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SegmentBody {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck { report_serial: u64 },
    Cancel { from_sender: bool, reason: CancelReason },
    CancelAck { to_sender: bool },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    ControlByte,
    SessionEngineId,
    SessionNumber,
    ExtensionCounts,
    HeaderExtTag,
    HeaderExtLength,
    HeaderExtValue,
    DataClientServiceId,
    DataOffset,
    DataLength,
    DataCheckpointSerial,
    DataReportSerial,
    DataPayload,
    ReportSerial,
    ReportCheckpointSerial,
    ReportUpperBound,
    ReportLowerBound,
    ReportClaimCount,
    ReportClaimOffset,
    ReportClaimLength,
    ReportAckSerial,
    CancelReasonByte,
    TrailerExtTag,
    TrailerExtLength,
    TrailerExtValue,
}

/// Caps speculative allocation for attacker-controlled length fields; the
///  vectors still grow to the declared size as bytes actually arrive.
const MAX_SPECULATIVE_RESERVE: usize = 65536;

pub struct SegmentParser {
    state: State,

    // spill buffer for an SDNV split across input chunks
    sdnv_accum: [u8; sdnv::MAX_ENCODED_LEN_U64],
    sdnv_accum_len: usize,

    segment_type_flags: u8,
    session_id: SessionId,
    num_header_extensions: u8,
    num_trailer_extensions: u8,
    header_extensions: Vec<Extension>,
    trailer_extensions: Vec<Extension>,
    current_extension_length: u64,

    data_client_service_id: u64,
    data_offset: u64,
    data_length: u64,
    data_checkpoint_serial: u64,
    data_report_serial: u64,
    data_payload: Vec<u8>,

    report: ReportSegment,
    report_claim_count: u64,
    report_claim_offset: u64,

    report_ack_serial: u64,
    cancel_reason: u8,
}

impl Default for SegmentParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentParser {
    pub fn new() -> SegmentParser {
        SegmentParser {
            state: State::ControlByte,
            sdnv_accum: [0; sdnv::MAX_ENCODED_LEN_U64],
            sdnv_accum_len: 0,
            segment_type_flags: 0,
            session_id: SessionId::new(0, 0),
            num_header_extensions: 0,
            num_trailer_extensions: 0,
            header_extensions: Vec::new(),
            trailer_extensions: Vec::new(),
            current_extension_length: 0,
            data_client_service_id: 0,
            data_offset: 0,
            data_length: 0,
            data_checkpoint_serial: 0,
            data_report_serial: 0,
            data_payload: Vec::new(),
            report: ReportSegment {
                report_serial: 0,
                checkpoint_serial: 0,
                upper_bound: 0,
                lower_bound: 0,
                claims: Vec::new(),
            },
            report_claim_count: 0,
            report_claim_offset: 0,
            report_ack_serial: 0,
            cancel_reason: 0,
        }
    }

    /// True between segments, i.e. the next byte fed in starts a new segment.
    pub fn is_at_start(&self) -> bool {
        self.state == State::ControlByte
    }

    /// Discards any partially parsed segment, e.g. after a parse error or a
    ///  datagram that ended mid-segment.
    pub fn reset(&mut self) {
        *self = SegmentParser::new();
    }

    /// Consumes bytes from the front of `input` until a segment completes or
    ///  the input runs out.
    ///
    /// * `Ok(Some(segment))` - a segment is ready; unconsumed bytes stay in
    ///   `input` for the next call, and the parser is back at its start state
    /// * `Ok(None)` - all input consumed, mid-segment state retained
    /// * `Err(_)` - malformed input; the caller decides whether to [`reset`]
    ///
    /// [`reset`]: SegmentParser::reset
    pub fn parse(&mut self, input: &mut &[u8]) -> anyhow::Result<Option<Segment>> {
        while !input.is_empty() {
            if let Some(segment) = self.step(input)? {
                return Ok(Some(segment));
            }
        }
        Ok(None)
    }

    fn step(&mut self, input: &mut &[u8]) -> anyhow::Result<Option<Segment>> {
        match self.state {
            State::ControlByte => {
                let control_byte = take_byte(input);
                let version = control_byte >> 4;
                if version != LTP_VERSION {
                    bail!("unsupported LTP version {}", version);
                }
                self.segment_type_flags = control_byte & 0x0f;
                self.state = State::SessionEngineId;
            }
            State::SessionEngineId => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.session_id.engine_id = value;
                    self.state = State::SessionNumber;
                }
            }
            State::SessionNumber => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.session_id.session_number = value;
                    self.state = State::ExtensionCounts;
                }
            }
            State::ExtensionCounts => {
                let counts = take_byte(input);
                self.num_header_extensions = counts >> 4;
                self.num_trailer_extensions = counts & 0x0f;
                self.header_extensions.clear();
                self.trailer_extensions.clear();
                if self.num_header_extensions > 0 {
                    self.state = State::HeaderExtTag;
                } else {
                    return self.enter_body();
                }
            }
            State::HeaderExtTag => {
                let tag = take_byte(input);
                self.header_extensions.push(Extension { tag, value: Vec::new() });
                self.state = State::HeaderExtLength;
            }
            State::HeaderExtLength => {
                if let Some(length) = self.take_sdnv(input)? {
                    self.current_extension_length = length;
                    if length == 0 {
                        return self.after_header_extension();
                    }
                    reserve_capped(
                        &mut self.header_extensions.last_mut().unwrap().value,
                        length,
                    );
                    self.state = State::HeaderExtValue;
                }
            }
            State::HeaderExtValue => {
                let value = &mut self.header_extensions.last_mut().unwrap().value;
                if take_payload(input, value, self.current_extension_length as usize) {
                    return self.after_header_extension();
                }
            }
            State::DataClientServiceId => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.data_client_service_id = value;
                    self.state = State::DataOffset;
                }
            }
            State::DataOffset => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.data_offset = value;
                    self.state = State::DataLength;
                }
            }
            State::DataLength => {
                if let Some(value) = self.take_sdnv(input)? {
                    if value == 0 {
                        bail!("data segment with zero length");
                    }
                    self.data_length = value;
                    let is_checkpoint =
                        self.segment_type_flags >= 1 && self.segment_type_flags <= 3;
                    if is_checkpoint {
                        self.state = State::DataCheckpointSerial;
                    } else {
                        self.begin_payload();
                    }
                }
            }
            State::DataCheckpointSerial => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.data_checkpoint_serial = value;
                    self.state = State::DataReportSerial;
                }
            }
            State::DataReportSerial => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.data_report_serial = value;
                    self.begin_payload();
                }
            }
            State::DataPayload => {
                if take_payload(input, &mut self.data_payload, self.data_length as usize) {
                    return self.after_body();
                }
            }
            State::ReportSerial => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report.report_serial = value;
                    self.state = State::ReportCheckpointSerial;
                }
            }
            State::ReportCheckpointSerial => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report.checkpoint_serial = value;
                    self.state = State::ReportUpperBound;
                }
            }
            State::ReportUpperBound => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report.upper_bound = value;
                    self.state = State::ReportLowerBound;
                }
            }
            State::ReportLowerBound => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report.lower_bound = value;
                    self.state = State::ReportClaimCount;
                }
            }
            State::ReportClaimCount => {
                if let Some(count) = self.take_sdnv(input)? {
                    if count == 0 {
                        bail!("report segment with zero reception claims");
                    }
                    self.report_claim_count = count;
                    self.report.claims.clear();
                    self.report
                        .claims
                        .reserve((count as usize).min(MAX_SPECULATIVE_RESERVE / 16));
                    self.state = State::ReportClaimOffset;
                }
            }
            State::ReportClaimOffset => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report_claim_offset = value;
                    self.state = State::ReportClaimLength;
                }
            }
            State::ReportClaimLength => {
                if let Some(length) = self.take_sdnv(input)? {
                    if length == 0 {
                        bail!("reception claim with zero length");
                    }
                    self.report.claims.push(ReceptionClaim {
                        offset: self.report_claim_offset,
                        length,
                    });
                    if (self.report.claims.len() as u64) < self.report_claim_count {
                        self.state = State::ReportClaimOffset;
                    } else {
                        return self.after_body();
                    }
                }
            }
            State::ReportAckSerial => {
                if let Some(value) = self.take_sdnv(input)? {
                    self.report_ack_serial = value;
                    return self.after_body();
                }
            }
            State::CancelReasonByte => {
                self.cancel_reason = take_byte(input);
                return self.after_body();
            }
            State::TrailerExtTag => {
                let tag = take_byte(input);
                self.trailer_extensions.push(Extension { tag, value: Vec::new() });
                self.state = State::TrailerExtLength;
            }
            State::TrailerExtLength => {
                if let Some(length) = self.take_sdnv(input)? {
                    self.current_extension_length = length;
                    if length == 0 {
                        return self.after_trailer_extension();
                    }
                    reserve_capped(
                        &mut self.trailer_extensions.last_mut().unwrap().value,
                        length,
                    );
                    self.state = State::TrailerExtValue;
                }
            }
            State::TrailerExtValue => {
                let value = &mut self.trailer_extensions.last_mut().unwrap().value;
                if take_payload(input, value, self.current_extension_length as usize) {
                    return self.after_trailer_extension();
                }
            }
        }
        Ok(None)
    }

    /// Pulls one SDNV, decoding straight from `input` when it can and
    ///  spilling into the accumulator when the value straddles a chunk
    ///  boundary. `Ok(None)` means the input ran out mid-value.
    fn take_sdnv(&mut self, input: &mut &[u8]) -> anyhow::Result<Option<u64>> {
        if self.sdnv_accum_len == 0 {
            match sdnv::decode_u64(input) {
                Ok((value, consumed)) => {
                    *input = &input[consumed..];
                    return Ok(Some(value));
                }
                Err(SdnvError::Invalid) => bail!("invalid SDNV in segment"),
                Err(SdnvError::NeedMoreBytes) => {} // fall through to the accumulator
            }
        }
        while let Some((&byte, rest)) = input.split_first() {
            *input = rest;
            if self.sdnv_accum_len == sdnv::MAX_ENCODED_LEN_U64 {
                bail!("SDNV longer than {} bytes", sdnv::MAX_ENCODED_LEN_U64);
            }
            self.sdnv_accum[self.sdnv_accum_len] = byte;
            self.sdnv_accum_len += 1;
            if byte & 0x80 == 0 {
                let accumulated = &self.sdnv_accum[..self.sdnv_accum_len];
                let (value, _) = sdnv::decode_u64(accumulated)
                    .map_err(|e| anyhow!("invalid SDNV in segment: {}", e))?;
                self.sdnv_accum_len = 0;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn begin_payload(&mut self) {
        self.data_payload.clear();
        reserve_capped(&mut self.data_payload, self.data_length);
        self.state = State::DataPayload;
    }

    fn after_header_extension(&mut self) -> anyhow::Result<Option<Segment>> {
        if self.header_extensions.len() < self.num_header_extensions as usize {
            self.state = State::HeaderExtTag;
            Ok(None)
        } else {
            self.enter_body()
        }
    }

    fn after_trailer_extension(&mut self) -> anyhow::Result<Option<Segment>> {
        if self.trailer_extensions.len() < self.num_trailer_extensions as usize {
            self.state = State::TrailerExtTag;
            Ok(None)
        } else {
            Ok(Some(self.finish()?))
        }
    }

    /// Chooses the body sub-machine once the header (including extensions) is
    ///  complete. This is also where undefined type flags surface as errors.
    fn enter_body(&mut self) -> anyhow::Result<Option<Segment>> {
        match self.segment_type_flags {
            // cancel acks carry no body at all
            13 | 15 => self.after_body(),
            5 | 6 | 10 | 11 => bail!(
                "undefined segment type flags {}",
                self.segment_type_flags
            ),
            0..=7 => {
                self.state = State::DataClientServiceId;
                Ok(None)
            }
            8 => {
                self.state = State::ReportSerial;
                Ok(None)
            }
            9 => {
                self.state = State::ReportAckSerial;
                Ok(None)
            }
            _ => {
                // 12 or 14
                self.state = State::CancelReasonByte;
                Ok(None)
            }
        }
    }

    fn after_body(&mut self) -> anyhow::Result<Option<Segment>> {
        if self.num_trailer_extensions > 0 {
            self.state = State::TrailerExtTag;
            Ok(None)
        } else {
            Ok(Some(self.finish()?))
        }
    }

    fn finish(&mut self) -> anyhow::Result<Segment> {
        let segment_type = SegmentType::try_from(self.segment_type_flags)
            .expect("undefined flags rejected before the body is parsed");

        let body = match segment_type {
            t if t.is_data() => {
                let checkpoint = t.is_checkpoint().then_some(Checkpoint {
                    serial: self.data_checkpoint_serial,
                    report_serial: self.data_report_serial,
                });
                SegmentBody::Data(DataSegment {
                    segment_type: t,
                    client_service_id: self.data_client_service_id,
                    offset: self.data_offset,
                    checkpoint,
                    data: std::mem::take(&mut self.data_payload),
                })
            }
            SegmentType::Report => SegmentBody::Report(ReportSegment {
                report_serial: self.report.report_serial,
                checkpoint_serial: self.report.checkpoint_serial,
                upper_bound: self.report.upper_bound,
                lower_bound: self.report.lower_bound,
                claims: std::mem::take(&mut self.report.claims),
            }),
            SegmentType::ReportAck => SegmentBody::ReportAck {
                report_serial: self.report_ack_serial,
            },
            SegmentType::CancelFromSender | SegmentType::CancelFromReceiver => {
                let reason = CancelReason::try_from(self.cancel_reason)
                    .map_err(|_| anyhow!("unknown cancel reason code {}", self.cancel_reason))?;
                SegmentBody::Cancel {
                    from_sender: segment_type == SegmentType::CancelFromSender,
                    reason,
                }
            }
            SegmentType::CancelAckToSender | SegmentType::CancelAckToReceiver => {
                SegmentBody::CancelAck {
                    to_sender: segment_type == SegmentType::CancelAckToSender,
                }
            }
            _ => unreachable!(),
        };

        let segment = Segment {
            session_id: self.session_id,
            header_extensions: std::mem::take(&mut self.header_extensions),
            trailer_extensions: std::mem::take(&mut self.trailer_extensions),
            body,
        };
        self.state = State::ControlByte;
        Ok(segment)
    }
}

fn take_byte(input: &mut &[u8]) -> u8 {
    let byte = input[0];
    *input = &input[1..];
    byte
}

/// Appends up to `target_len - value.len()` bytes from `input`; true once the
///  value is complete. Bulk-copies instead of going byte by byte.
fn take_payload(input: &mut &[u8], value: &mut Vec<u8>, target_len: usize) -> bool {
    let missing = target_len - value.len();
    let take = missing.min(input.len());
    value.extend_from_slice(&input[..take]);
    *input = &input[take..];
    value.len() == target_len
}

fn reserve_capped(value: &mut Vec<u8>, declared_len: u64) {
    value.reserve((declared_len as usize).min(MAX_SPECULATIVE_RESERVE));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{
        serialize_cancel_ack, serialize_cancel_segment, serialize_data_segment,
        serialize_report_ack, serialize_report_segment,
    };
    use bytes::BytesMut;
    use rstest::rstest;

    fn parse_all(input: &[u8]) -> anyhow::Result<Vec<Segment>> {
        let mut parser = SegmentParser::new();
        let mut rest = input;
        let mut segments = Vec::new();
        while let Some(segment) = parser.parse(&mut rest)? {
            segments.push(segment);
        }
        assert!(rest.is_empty());
        assert!(parser.is_at_start(), "trailing partial segment");
        Ok(segments)
    }

    fn sample_segments() -> BytesMut {
        let session_id = SessionId::new(1000, 0xf000_0001);
        let mut buf = BytesMut::new();
        serialize_data_segment(
            &mut buf,
            SegmentType::RedDataCheckpointEorpEob,
            session_id,
            4,
            100,
            Some(Checkpoint { serial: 900, report_serial: 0 }),
            b"the payload",
        );
        serialize_report_segment(
            &mut buf,
            session_id,
            &ReportSegment {
                report_serial: 500,
                checkpoint_serial: 900,
                upper_bound: 111,
                lower_bound: 0,
                claims: vec![
                    ReceptionClaim { offset: 0, length: 100 },
                    ReceptionClaim { offset: 105, length: 6 },
                ],
            },
        );
        serialize_report_ack(&mut buf, session_id, 500);
        serialize_cancel_segment(&mut buf, session_id, false, CancelReason::SystemCancelled);
        serialize_cancel_ack(&mut buf, session_id, true);
        buf
    }

    #[test]
    fn test_parse_data_segment() {
        let mut buf = BytesMut::new();
        serialize_data_segment(
            &mut buf,
            SegmentType::GreenData,
            SessionId::new(7, 8),
            2,
            5,
            None,
            &[1, 2, 3],
        );

        let segments = parse_all(&buf).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].session_id, SessionId::new(7, 8));
        assert_eq!(
            segments[0].body,
            SegmentBody::Data(DataSegment {
                segment_type: SegmentType::GreenData,
                client_service_id: 2,
                offset: 5,
                checkpoint: None,
                data: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn test_parse_segment_sequence() {
        let buf = sample_segments();
        let segments = parse_all(&buf).unwrap();
        assert_eq!(segments.len(), 5);

        assert!(matches!(&segments[0].body, SegmentBody::Data(ds)
            if ds.checkpoint == Some(Checkpoint { serial: 900, report_serial: 0 })
                && ds.data == b"the payload"));
        assert!(matches!(&segments[1].body, SegmentBody::Report(rs)
            if rs.report_serial == 500 && rs.claims.len() == 2));
        assert_eq!(segments[2].body, SegmentBody::ReportAck { report_serial: 500 });
        assert_eq!(
            segments[3].body,
            SegmentBody::Cancel { from_sender: false, reason: CancelReason::SystemCancelled }
        );
        assert_eq!(segments[4].body, SegmentBody::CancelAck { to_sender: true });
    }

    /// The parser must be ignorant of input splits: every way of cutting the
    ///  byte sequence in two yields the same events.
    #[test]
    fn test_parse_split_independence() {
        let buf = sample_segments();
        let expected = parse_all(&buf).unwrap();

        for split_at in 0..=buf.len() {
            let mut parser = SegmentParser::new();
            let mut segments = Vec::new();
            for mut chunk in [&buf[..split_at], &buf[split_at..]] {
                while let Some(segment) = parser.parse(&mut chunk).unwrap() {
                    segments.push(segment);
                }
            }
            assert_eq!(segments, expected, "split at {}", split_at);
        }
    }

    #[test]
    fn test_parse_byte_at_a_time() {
        let buf = sample_segments();
        let expected = parse_all(&buf).unwrap();

        let mut parser = SegmentParser::new();
        let mut segments = Vec::new();
        for byte in buf.iter() {
            let mut chunk = std::slice::from_ref(byte);
            while let Some(segment) = parser.parse(&mut chunk).unwrap() {
                segments.push(segment);
            }
        }
        assert_eq!(segments, expected);
    }

    #[test]
    fn test_parse_extensions() {
        // hand-crafted report ack with one header and one trailer extension
        let input = vec![
            0x09, // report ack
            0x01, 0x02, // session 1:2
            0x11, // one header, one trailer extension
            0xaa, 0x02, 0xde, 0xad, // header ext tag 0xaa, 2 value bytes
            0x07, // report serial
            0xbb, 0x00, // trailer ext tag 0xbb, empty value
        ];
        let segments = parse_all(&input).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].header_extensions,
            vec![Extension { tag: 0xaa, value: vec![0xde, 0xad] }]
        );
        assert_eq!(
            segments[0].trailer_extensions,
            vec![Extension { tag: 0xbb, value: vec![] }]
        );
        assert_eq!(segments[0].body, SegmentBody::ReportAck { report_serial: 7 });
    }

    #[rstest]
    #[case::bad_version(vec![0x10, 0x01, 0x02, 0x00])]
    #[case::undefined_flags_5(vec![0x05, 0x01, 0x02, 0x00])]
    #[case::undefined_flags_6(vec![0x06, 0x01, 0x02, 0x00])]
    #[case::undefined_flags_10(vec![0x0a, 0x01, 0x02, 0x00])]
    #[case::undefined_flags_11(vec![0x0b, 0x01, 0x02, 0x00])]
    // data segment declaring length 0
    #[case::zero_data_length(vec![0x00, 0x01, 0x02, 0x00, 0x01, 0x00, 0x00])]
    // report with claim count 0
    #[case::zero_claim_count(vec![0x08, 0x01, 0x02, 0x00, 0x01, 0x01, 0x0a, 0x00, 0x00])]
    // report with a zero-length claim
    #[case::zero_claim_length(vec![0x08, 0x01, 0x02, 0x00, 0x01, 0x01, 0x0a, 0x00, 0x01, 0x00, 0x00])]
    // session number SDNV with more than 10 continuation bytes
    #[case::oversized_sdnv(vec![0x00, 0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f])]
    fn test_parse_errors(#[case] input: Vec<u8>) {
        assert!(parse_all(&input).is_err());
    }

    #[test]
    fn test_oversized_sdnv_detected_across_splits() {
        let input = vec![0x00u8, 0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut parser = SegmentParser::new();
        let mut result = Ok(None);
        for byte in &input {
            let mut chunk = std::slice::from_ref(byte);
            result = parser.parse(&mut chunk);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_reset_after_error() {
        let mut parser = SegmentParser::new();
        let mut bad: &[u8] = &[0xf0];
        assert!(parser.parse(&mut bad).is_err());
        parser.reset();

        let mut buf = BytesMut::new();
        serialize_report_ack(&mut buf, SessionId::new(1, 1), 3);
        let mut rest: &[u8] = &buf;
        assert!(parser.parse(&mut rest).unwrap().is_some());
    }
}
