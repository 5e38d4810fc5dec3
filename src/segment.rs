//! Typed representation of LTP segments plus their serializers. The wire
//!  layout is documented in the crate-level docs; serialization is
//!  deterministic - identical input produces byte-identical output, which the
//!  protocol relies on for interoperability.

use std::fmt::{Display, Formatter};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::sdnv::PutSdnv;

/// The 4 version bits of every control byte. Only version 0 exists.
pub const LTP_VERSION: u8 = 0;

/// Identifies one block-in-flight: the originator's engine id plus a session
///  number chosen by the originator. Sender and receiver of the same block
///  share this id.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SessionId {
    pub engine_id: u64,
    pub session_number: u64,
}
impl SessionId {
    pub fn new(engine_id: u64, session_number: u64) -> SessionId {
        SessionId { engine_id, session_number }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_sdnv_u64(self.engine_id);
        buf.put_sdnv_u64(self.session_number);
    }
}
impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.engine_id, self.session_number)
    }
}

/// The low nibble of the control byte. Values 5, 6, 10 and 11 are undefined
///  and absent here, so `try_from` doubles as the validity check.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    RedData = 0,
    RedDataCheckpoint = 1,
    RedDataCheckpointEorp = 2,
    RedDataCheckpointEorpEob = 3,
    GreenData = 4,
    GreenDataEob = 7,
    Report = 8,
    ReportAck = 9,
    CancelFromSender = 12,
    CancelAckToSender = 13,
    CancelFromReceiver = 14,
    CancelAckToReceiver = 15,
}
impl SegmentType {
    const SENDER_TO_RECEIVER_MASK: u16 = (1 << SegmentType::RedData as u8)
        | (1 << SegmentType::RedDataCheckpoint as u8)
        | (1 << SegmentType::RedDataCheckpointEorp as u8)
        | (1 << SegmentType::RedDataCheckpointEorpEob as u8)
        | (1 << SegmentType::GreenData as u8)
        | (1 << SegmentType::GreenDataEob as u8)
        | (1 << SegmentType::ReportAck as u8)
        | (1 << SegmentType::CancelFromSender as u8)
        | (1 << SegmentType::CancelAckToReceiver as u8);

    pub fn is_data(self) -> bool {
        (self as u8) <= 7
    }

    pub fn is_red_data(self) -> bool {
        (self as u8) <= 3
    }

    pub fn is_green_data(self) -> bool {
        matches!(self, SegmentType::GreenData | SegmentType::GreenDataEob)
    }

    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpoint
                | SegmentType::RedDataCheckpointEorp
                | SegmentType::RedDataCheckpointEorpEob
        )
    }

    pub fn is_end_of_red_part(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpointEorp | SegmentType::RedDataCheckpointEorpEob
        )
    }

    pub fn is_end_of_block(self) -> bool {
        matches!(
            self,
            SegmentType::RedDataCheckpointEorpEob | SegmentType::GreenDataEob
        )
    }

    /// Segments travel either block-sender -> block-receiver or the reverse;
    ///  the engine uses this to discard segments that contradict a session's
    ///  role.
    pub fn is_sender_to_receiver(self) -> bool {
        (1u16 << self as u8) & Self::SENDER_TO_RECEIVER_MASK != 0
    }

    fn control_byte(self) -> u8 {
        (LTP_VERSION << 4) | self as u8
    }
}

/// RFC 5326 cancel segment reason codes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CancelReason {
    /// Client service cancelled the session.
    UserCancelled = 0,
    /// Unreachable client service.
    Unreachable = 1,
    /// Retransmission limit exceeded (RLEXC).
    RetransmissionLimitExceeded = 2,
    /// A red segment at an offset above a green segment, or vice versa.
    Miscolored = 3,
    /// A system error condition caused unexpected session termination.
    SystemCancelled = 4,
    /// Retransmission-cycles limit exceeded (RXMTCYCEXC).
    RetransmissionCyclesExceeded = 5,
}

/// One contiguous received range in a report segment, `offset` relative to
///  the report's lower bound. Lengths are never 0 on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReportSegment {
    pub report_serial: u64,
    pub checkpoint_serial: u64,
    pub upper_bound: u64,
    pub lower_bound: u64,
    pub claims: Vec<ReceptionClaim>,
}
impl ReportSegment {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_sdnv_u64(self.report_serial);
        buf.put_sdnv_u64(self.checkpoint_serial);
        buf.put_sdnv_u64(self.upper_bound);
        buf.put_sdnv_u64(self.lower_bound);
        buf.put_sdnv_u64(self.claims.len() as u64);
        for claim in &self.claims {
            buf.put_sdnv_u64(claim.offset);
            buf.put_sdnv_u64(claim.length);
        }
    }
}

/// Header or trailer extension TLV. The engine emits none itself but parses
///  and preserves whatever a peer sends.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Extension {
    pub tag: u8,
    pub value: Vec<u8>,
}
impl Extension {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        buf.put_sdnv_u64(self.value.len() as u64);
        buf.put_slice(&self.value);
    }
}

/// Checkpoint serial numbers carried by data segments of types 1-3. The
///  `report_serial` is 0 unless the checkpoint closes a retransmission cycle,
///  in which case it names the report being answered.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Checkpoint {
    pub serial: u64,
    pub report_serial: u64,
}

fn ser_segment_header(
    buf: &mut BytesMut,
    segment_type: SegmentType,
    session_id: SessionId,
    header_extensions: &[Extension],
    trailer_extensions: &[Extension],
) {
    debug_assert!(header_extensions.len() <= 15 && trailer_extensions.len() <= 15);

    buf.put_u8(segment_type.control_byte());
    session_id.ser(buf);
    buf.put_u8(((header_extensions.len() as u8) << 4) | trailer_extensions.len() as u8);
    for ext in header_extensions {
        ext.ser(buf);
    }
}

/// Serializes a complete data segment. `segment_type` must be one of the six
///  data types; `checkpoint` must be present exactly for types 1-3.
pub fn serialize_data_segment(
    buf: &mut BytesMut,
    segment_type: SegmentType,
    session_id: SessionId,
    client_service_id: u64,
    offset: u64,
    checkpoint: Option<Checkpoint>,
    payload: &[u8],
) {
    debug_assert!(segment_type.is_data());
    debug_assert_eq!(segment_type.is_checkpoint(), checkpoint.is_some());

    ser_segment_header(buf, segment_type, session_id, &[], &[]);
    buf.put_sdnv_u64(client_service_id);
    buf.put_sdnv_u64(offset);
    buf.put_sdnv_u64(payload.len() as u64);
    if let Some(checkpoint) = checkpoint {
        buf.put_sdnv_u64(checkpoint.serial);
        buf.put_sdnv_u64(checkpoint.report_serial);
    }
    buf.put_slice(payload);
}

pub fn serialize_report_segment(
    buf: &mut BytesMut,
    session_id: SessionId,
    report: &ReportSegment,
) {
    ser_segment_header(buf, SegmentType::Report, session_id, &[], &[]);
    report.ser(buf);
}

pub fn serialize_report_ack(buf: &mut BytesMut, session_id: SessionId, report_serial: u64) {
    ser_segment_header(buf, SegmentType::ReportAck, session_id, &[], &[]);
    buf.put_sdnv_u64(report_serial);
}

pub fn serialize_cancel_segment(
    buf: &mut BytesMut,
    session_id: SessionId,
    from_sender: bool,
    reason: CancelReason,
) {
    let segment_type = if from_sender {
        SegmentType::CancelFromSender
    } else {
        SegmentType::CancelFromReceiver
    };
    ser_segment_header(buf, segment_type, session_id, &[], &[]);
    buf.put_u8(reason.into());
}

pub fn serialize_cancel_ack(buf: &mut BytesMut, session_id: SessionId, to_sender: bool) {
    let segment_type = if to_sender {
        SegmentType::CancelAckToSender
    } else {
        SegmentType::CancelAckToReceiver
    };
    ser_segment_header(buf, segment_type, session_id, &[], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::red(SegmentType::RedData, true)]
    #[case::checkpoint(SegmentType::RedDataCheckpoint, true)]
    #[case::eob(SegmentType::RedDataCheckpointEorpEob, true)]
    #[case::green(SegmentType::GreenData, true)]
    #[case::green_eob(SegmentType::GreenDataEob, true)]
    #[case::report(SegmentType::Report, false)]
    #[case::report_ack(SegmentType::ReportAck, true)]
    #[case::cancel_from_sender(SegmentType::CancelFromSender, true)]
    #[case::cancel_ack_to_sender(SegmentType::CancelAckToSender, false)]
    #[case::cancel_from_receiver(SegmentType::CancelFromReceiver, false)]
    #[case::cancel_ack_to_receiver(SegmentType::CancelAckToReceiver, true)]
    fn test_direction(#[case] segment_type: SegmentType, #[case] sender_to_receiver: bool) {
        assert_eq!(segment_type.is_sender_to_receiver(), sender_to_receiver);
    }

    #[rstest]
    #[case(5)]
    #[case(6)]
    #[case(10)]
    #[case(11)]
    fn test_undefined_type_flags(#[case] flags: u8) {
        assert!(SegmentType::try_from(flags).is_err());
    }

    #[test]
    fn test_session_id_ordering() {
        let a = SessionId::new(1, 99);
        let b = SessionId::new(2, 1);
        let c = SessionId::new(2, 2);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_serialize_plain_data_segment() {
        let mut buf = BytesMut::new();
        serialize_data_segment(
            &mut buf,
            SegmentType::RedData,
            SessionId::new(5, 200),
            1,
            3,
            None,
            &[0xaa, 0xbb],
        );
        assert_eq!(
            &buf[..],
            &[
                0x00, // version 0, type 0
                0x05, // engine id
                0x81, 0x48, // session number 200
                0x00, // no extensions
                0x01, // client service id
                0x03, // offset
                0x02, // length
                0xaa, 0xbb, // payload
            ]
        );
    }

    #[test]
    fn test_serialize_checkpoint_data_segment() {
        let mut buf = BytesMut::new();
        serialize_data_segment(
            &mut buf,
            SegmentType::RedDataCheckpointEorpEob,
            SessionId::new(1, 2),
            4,
            0,
            Some(Checkpoint { serial: 7, report_serial: 0 }),
            &[0x42],
        );
        assert_eq!(
            &buf[..],
            &[0x03, 0x01, 0x02, 0x00, 0x04, 0x00, 0x01, 0x07, 0x00, 0x42]
        );
    }

    #[test]
    fn test_serialize_report_segment() {
        let report = ReportSegment {
            report_serial: 130,
            checkpoint_serial: 6,
            upper_bound: 44,
            lower_bound: 0,
            claims: vec![
                ReceptionClaim { offset: 0, length: 10 },
                ReceptionClaim { offset: 11, length: 33 },
            ],
        };
        let mut buf = BytesMut::new();
        serialize_report_segment(&mut buf, SessionId::new(9, 1), &report);
        assert_eq!(
            &buf[..],
            &[
                0x08, 0x09, 0x01, 0x00, // header
                0x81, 0x02, // report serial 130
                0x06, // checkpoint serial
                0x2c, // upper bound 44
                0x00, // lower bound
                0x02, // claim count
                0x00, 0x0a, // claim (0, 10)
                0x0b, 0x21, // claim (11, 33)
            ]
        );
    }

    #[test]
    fn test_serialize_report_ack() {
        let mut buf = BytesMut::new();
        serialize_report_ack(&mut buf, SessionId::new(9, 1), 128);
        assert_eq!(&buf[..], &[0x09, 0x09, 0x01, 0x00, 0x81, 0x00]);
    }

    #[test]
    fn test_serialize_cancel_and_ack() {
        let mut buf = BytesMut::new();
        serialize_cancel_segment(&mut buf, SessionId::new(3, 4), true, CancelReason::Miscolored);
        assert_eq!(&buf[..], &[0x0c, 0x03, 0x04, 0x00, 0x03]);

        let mut buf = BytesMut::new();
        serialize_cancel_ack(&mut buf, SessionId::new(3, 4), false);
        assert_eq!(&buf[..], &[0x0f, 0x03, 0x04, 0x00]);
    }
}
