//! State machine for one outbound block. The sender owns the client service
//!  data for the life of the session and emits it cursor-driven: red bytes
//!  first (closing with an EORP or EOB checkpoint), then green bytes. Report
//!  segments from the peer acknowledge red ranges; gaps are retransmitted,
//!  each retransmission cycle closed by a checkpoint carrying a fresh serial
//!  and the serial of the report it answers.
//!
//! Like the receiver, the sender borrows a [`TxCtx`] from the engine per
//!  call and never holds references into engine state.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::config::LtpConfig;
use crate::engine::ClientServiceNotices;
use crate::fragment_set::{FragmentRange, FragmentSet};
use crate::segment::{
    serialize_cancel_ack, serialize_cancel_segment, serialize_data_segment, serialize_report_ack,
    CancelReason, Checkpoint, ReportSegment, SegmentType, SessionId,
};
use crate::timer::TimerManager;

/// Serial 0 is reserved for the cancel-segment retry timer; real checkpoint
///  serials are always non-zero.
pub const CANCEL_TIMER_SERIAL: u64 = 0;

/// User data of a checkpoint (or cancel) retransmission timer.
#[derive(Debug)]
pub struct CheckpointRetryInfo {
    pub retry_count: u32,
}

/// Engine facilities lent to the sender for the duration of one call.
pub(crate) struct TxCtx<'a> {
    pub now: Duration,
    pub config: &'a LtpConfig,
    pub checkpoint_timers: &'a mut TimerManager<CheckpointRetryInfo>,
    pub notices: &'a dyn ClientServiceNotices,
}

#[derive(Debug, Default)]
pub(crate) struct SenderStats {
    pub checkpoint_timer_expiries: u64,
    pub segments_resent: u64,
}

/// A checkpoint whose report has not arrived yet: the red range it covered
///  and the report serial it answered (0 for primaries).
struct OutstandingCheckpoint {
    begin: u64,
    end: u64,
    report_serial: u64,
}

/// One red range awaiting retransmission. The range closing a report's
///  retransmission cycle becomes a checkpoint.
struct ResendRange {
    begin: u64,
    end: u64,
    report_serial: u64,
    closes_cycle: bool,
}

pub(crate) struct SessionSender {
    session_id: SessionId,
    destination_engine_id: u64,
    client_service_id: u64,

    data: Vec<u8>,
    red_part_length: u64,

    /// next byte of the initial transmission to emit
    send_cursor: u64,
    red_segments_emitted: u64,

    outstanding_checkpoints: FxHashMap<u64, OutstandingCheckpoint>,
    awaiting_resend: VecDeque<ResendRange>,
    reports_processed: FxHashSet<u64>,
    /// red bytes the peer has claimed across all reports so far
    acked_by_receiver: FragmentSet,
    next_checkpoint_serial: u64,

    pending_out: VecDeque<Bytes>,

    initial_transmission_completed: bool,
    cancel_in_progress: bool,
    cancel_reason: CancelReason,
    did_notify_for_deletion: bool,

    pub(crate) stats: SenderStats,
}

impl SessionSender {
    pub(crate) fn new(
        session_id: SessionId,
        destination_engine_id: u64,
        client_service_id: u64,
        data: Vec<u8>,
        red_part_length: u64,
        initial_checkpoint_serial: u64,
    ) -> SessionSender {
        debug_assert!(red_part_length <= data.len() as u64);
        SessionSender {
            session_id,
            destination_engine_id,
            client_service_id,
            data,
            red_part_length,
            send_cursor: 0,
            red_segments_emitted: 0,
            outstanding_checkpoints: FxHashMap::default(),
            awaiting_resend: VecDeque::new(),
            reports_processed: FxHashSet::default(),
            acked_by_receiver: FragmentSet::new(),
            next_checkpoint_serial: initial_checkpoint_serial,
            pending_out: VecDeque::new(),
            initial_transmission_completed: false,
            cancel_in_progress: false,
            cancel_reason: CancelReason::UserCancelled,
            did_notify_for_deletion: false,
            stats: SenderStats::default(),
        }
    }

    pub(crate) fn destination_engine_id(&self) -> u64 {
        self.destination_engine_id
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.did_notify_for_deletion
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.pending_out.is_empty()
    }

    fn total_length(&self) -> u64 {
        self.data.len() as u64
    }

    // ------------------------------------------------------------------
    // egress
    // ------------------------------------------------------------------

    /// The next serialized segment to hand to the transport: queued control
    ///  segments first, then retransmissions, then fresh data from the
    ///  cursor. Checkpoint timers start here, when the bytes leave the
    ///  session.
    pub(crate) fn next_outbound(&mut self, ctx: &mut TxCtx) -> Option<Bytes> {
        if let Some(buf) = self.pending_out.pop_front() {
            return Some(buf);
        }
        if self.cancel_in_progress || self.did_notify_for_deletion {
            return None;
        }
        if let Some(resend) = self.awaiting_resend.pop_front() {
            return Some(self.serialize_resend(ctx, resend));
        }
        if self.send_cursor < self.total_length() {
            return Some(self.serialize_next_fresh_segment(ctx));
        }
        None
    }

    fn serialize_next_fresh_segment(&mut self, ctx: &mut TxCtx) -> Bytes {
        let cursor = self.send_cursor;
        let mtu = ctx.config.mtu_bytes as u64;
        // a segment never spans the red/green boundary
        let buf = if cursor < self.red_part_length {
            let end = (cursor + mtu).min(self.red_part_length);
            self.red_segments_emitted += 1;
            let every_nth = ctx.config.checkpoint_every_nth_data_segment as u64;
            let is_discretionary_checkpoint =
                every_nth > 0 && self.red_segments_emitted % every_nth == 0;
            let segment_type = self.red_segment_type(end, is_discretionary_checkpoint);
            let checkpoint = segment_type
                .is_checkpoint()
                .then(|| self.new_checkpoint(ctx, cursor, end, 0));
            self.send_cursor = end;
            self.ser_data_segment(segment_type, cursor, end, checkpoint)
        } else {
            let end = (cursor + mtu).min(self.total_length());
            let segment_type = if end == self.total_length() {
                SegmentType::GreenDataEob
            } else {
                SegmentType::GreenData
            };
            self.send_cursor = end;
            self.ser_data_segment(segment_type, cursor, end, None)
        };

        if self.send_cursor == self.total_length() && !self.initial_transmission_completed {
            self.initial_transmission_completed = true;
            debug!("session {}: initial transmission completed", self.session_id);
            ctx.notices.initial_transmission_completed(self.session_id);
            if self.red_part_length == 0 {
                // green-only block: nothing to acknowledge, we are done
                ctx.notices.transmission_session_completed(self.session_id);
                self.did_notify_for_deletion = true;
            }
        }
        buf
    }

    fn serialize_resend(&mut self, ctx: &mut TxCtx, resend: ResendRange) -> Bytes {
        self.stats.segments_resent += 1;
        let segment_type = self.red_segment_type(resend.end, resend.closes_cycle);
        let checkpoint = segment_type
            .is_checkpoint()
            .then(|| self.new_checkpoint(ctx, resend.begin, resend.end, resend.report_serial));
        trace!(
            "session {}: resending [{},{}) checkpoint={:?}",
            self.session_id, resend.begin, resend.end, checkpoint
        );
        self.ser_data_segment(segment_type, resend.begin, resend.end, checkpoint)
    }

    /// Data segment type for a red range ending at `end`: reaching the end of
    ///  the red part always makes a checkpoint (EORP, EOB if there is no
    ///  green part), everything else is a checkpoint only when requested.
    fn red_segment_type(&self, end: u64, checkpoint: bool) -> SegmentType {
        if end == self.red_part_length {
            if self.red_part_length == self.total_length() {
                SegmentType::RedDataCheckpointEorpEob
            } else {
                SegmentType::RedDataCheckpointEorp
            }
        } else if checkpoint {
            SegmentType::RedDataCheckpoint
        } else {
            SegmentType::RedData
        }
    }

    fn new_checkpoint(&mut self, ctx: &mut TxCtx, begin: u64, end: u64, report_serial: u64) -> Checkpoint {
        let serial = self.next_checkpoint_serial;
        self.next_checkpoint_serial += 1;
        self.outstanding_checkpoints
            .insert(serial, OutstandingCheckpoint { begin, end, report_serial });
        if !ctx.checkpoint_timers.start(
            ctx.now,
            (self.session_id, serial),
            CheckpointRetryInfo { retry_count: 0 },
        ) {
            warn!(
                "session {}: timer for checkpoint {} already running",
                self.session_id, serial
            );
        }
        Checkpoint { serial, report_serial }
    }

    fn ser_data_segment(
        &self,
        segment_type: SegmentType,
        begin: u64,
        end: u64,
        checkpoint: Option<Checkpoint>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        serialize_data_segment(
            &mut buf,
            segment_type,
            self.session_id,
            self.client_service_id,
            begin,
            checkpoint,
            &self.data[begin as usize..end as usize],
        );
        buf.freeze()
    }

    // ------------------------------------------------------------------
    // report processing
    // ------------------------------------------------------------------

    pub(crate) fn on_report(&mut self, ctx: &mut TxCtx, report: &ReportSegment) {
        if self.cancel_in_progress || self.did_notify_for_deletion {
            return;
        }
        if self.reports_processed.contains(&report.report_serial) {
            trace!(
                "session {}: duplicate report {} - acknowledging again",
                self.session_id, report.report_serial
            );
            self.queue_report_ack(report.report_serial);
            return;
        }
        if report.upper_bound <= report.lower_bound || report.upper_bound > self.red_part_length {
            warn!(
                "session {}: report {} with nonsensical bounds [{},{}) - ignoring",
                self.session_id, report.report_serial, report.lower_bound, report.upper_bound
            );
            return;
        }
        self.reports_processed.insert(report.report_serial);
        self.queue_report_ack(report.report_serial);

        // the answered checkpoint is no longer outstanding
        ctx.checkpoint_timers
            .cancel(&(self.session_id, report.checkpoint_serial));
        self.outstanding_checkpoints.remove(&report.checkpoint_serial);

        let mut claimed = FragmentSet::new();
        for claim in &report.claims {
            let claim_end = report
                .lower_bound
                .checked_add(claim.offset)
                .and_then(|begin| begin.checked_add(claim.length - 1));
            match claim_end {
                Some(claim_end) if claim_end < report.upper_bound => {
                    claimed.insert(FragmentRange::new(
                        report.lower_bound + claim.offset,
                        claim_end,
                    ));
                }
                _ => {
                    warn!(
                        "session {}: report {} claim beyond its upper bound - ignoring report",
                        self.session_id, report.report_serial
                    );
                    return;
                }
            }
        }
        for range in claimed.iter() {
            self.acked_by_receiver.insert(range);
        }

        let window = FragmentRange::new(report.lower_bound, report.upper_bound - 1);
        let missing = FragmentSet::bounds_minus(window, &claimed);
        if missing.is_empty() {
            if self
                .acked_by_receiver
                .contains_entirely(FragmentRange::new(0, self.red_part_length - 1))
            {
                debug!("session {}: red part fully acknowledged", self.session_id);
                ctx.notices.transmission_session_completed(self.session_id);
                self.did_notify_for_deletion = true;
            }
            return;
        }

        // queue the gaps, fragmented by MTU; the last range of this cycle
        //  will carry the answering checkpoint
        let mtu = ctx.config.mtu_bytes as u64;
        for gap in missing.iter() {
            let mut begin = gap.begin;
            while begin <= gap.end {
                let end = (begin + mtu).min(gap.end + 1);
                self.awaiting_resend.push_back(ResendRange {
                    begin,
                    end,
                    report_serial: report.report_serial,
                    closes_cycle: false,
                });
                begin = end;
            }
        }
        if let Some(last) = self.awaiting_resend.back_mut() {
            last.closes_cycle = true;
        }
    }

    fn queue_report_ack(&mut self, report_serial: u64) {
        let mut buf = BytesMut::new();
        serialize_report_ack(&mut buf, self.session_id, report_serial);
        self.pending_out.push_back(buf.freeze());
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    pub(crate) fn on_timer_expired(&mut self, ctx: &mut TxCtx, serial: u64, info: CheckpointRetryInfo) {
        if self.did_notify_for_deletion {
            return;
        }
        if serial == CANCEL_TIMER_SERIAL {
            self.on_cancel_timer_expired(ctx, info);
            return;
        }
        if self.cancel_in_progress {
            return;
        }
        let Some((begin, end, report_serial)) = self
            .outstanding_checkpoints
            .get(&serial)
            .map(|cp| (cp.begin, cp.end, cp.report_serial))
        else {
            trace!(
                "session {}: timer expiry for replaced checkpoint {} - discarding",
                self.session_id, serial
            );
            return;
        };
        self.stats.checkpoint_timer_expiries += 1;

        if info.retry_count >= ctx.config.max_retries_per_serial_number {
            warn!(
                "session {}: checkpoint {} exhausted its {} retries - cancelling",
                self.session_id, serial, info.retry_count
            );
            self.begin_cancel(ctx, CancelReason::RetransmissionLimitExceeded);
            return;
        }

        debug!(
            "session {}: checkpoint {} unacknowledged, retry {}",
            self.session_id,
            serial,
            info.retry_count + 1
        );
        let segment_type = self.red_segment_type(end, true);
        let buf = self.ser_data_segment(
            segment_type,
            begin,
            end,
            Some(Checkpoint { serial, report_serial }),
        );
        self.pending_out.push_back(buf);
        if !ctx.checkpoint_timers.start(
            ctx.now,
            (self.session_id, serial),
            CheckpointRetryInfo { retry_count: info.retry_count + 1 },
        ) {
            warn!(
                "session {}: retry timer for checkpoint {} already running",
                self.session_id, serial
            );
        }
    }

    fn on_cancel_timer_expired(&mut self, ctx: &mut TxCtx, info: CheckpointRetryInfo) {
        if !self.cancel_in_progress {
            return;
        }
        if info.retry_count >= ctx.config.max_retries_per_serial_number {
            warn!(
                "session {}: cancel segment never acknowledged - closing anyway",
                self.session_id
            );
            self.did_notify_for_deletion = true;
            return;
        }
        let mut buf = BytesMut::new();
        serialize_cancel_segment(&mut buf, self.session_id, true, self.cancel_reason);
        self.pending_out.push_back(buf.freeze());
        if !ctx.checkpoint_timers.start(
            ctx.now,
            (self.session_id, CANCEL_TIMER_SERIAL),
            CheckpointRetryInfo { retry_count: info.retry_count + 1 },
        ) {
            warn!("session {}: cancel retry timer already running", self.session_id);
        }
    }

    // ------------------------------------------------------------------
    // cancellation
    // ------------------------------------------------------------------

    /// Sender-side cancellation: application request or retry exhaustion.
    ///  Emits CANCEL_FROM_SENDER, delivers the terminal callback right away
    ///  and awaits the peer's ack with a bounded retry.
    pub(crate) fn begin_cancel(&mut self, ctx: &mut TxCtx, reason: CancelReason) {
        if self.cancel_in_progress || self.did_notify_for_deletion {
            return;
        }
        self.cancel_in_progress = true;
        self.cancel_reason = reason;
        self.awaiting_resend.clear();

        let mut buf = BytesMut::new();
        serialize_cancel_segment(&mut buf, self.session_id, true, reason);
        self.pending_out.push_back(buf.freeze());
        ctx.notices.transmission_session_cancelled(self.session_id, reason);

        if !ctx.checkpoint_timers.start(
            ctx.now,
            (self.session_id, CANCEL_TIMER_SERIAL),
            CheckpointRetryInfo { retry_count: 0 },
        ) {
            warn!("session {}: cancel timer already running", self.session_id);
        }
    }

    pub(crate) fn on_cancel_from_receiver(&mut self, ctx: &mut TxCtx, reason: CancelReason) {
        let mut buf = BytesMut::new();
        serialize_cancel_ack(&mut buf, self.session_id, false);
        self.pending_out.push_back(buf.freeze());

        if !self.cancel_in_progress && !self.did_notify_for_deletion {
            ctx.notices.transmission_session_cancelled(self.session_id, reason);
        }
        self.awaiting_resend.clear();
        self.did_notify_for_deletion = true;
    }

    pub(crate) fn on_cancel_ack(&mut self, ctx: &mut TxCtx) {
        if self.cancel_in_progress {
            ctx.checkpoint_timers
                .cancel(&(self.session_id, CANCEL_TIMER_SERIAL));
            self.did_notify_for_deletion = true;
        }
    }
}
