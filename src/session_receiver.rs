//! State machine for one inbound block. The receiver writes red-part bytes
//!  into a random-access buffer, tracks received ranges in a fragment set,
//!  answers checkpoints with (possibly coalesced, possibly split) report
//!  segments, retries unacknowledged reports, and delivers the red part to
//!  the client service exactly once.
//!
//! The receiver never talks to the transport or the timer managers directly -
//!  every operation borrows an [`RxCtx`] from the engine, which keeps
//!  ownership acyclic: the engine owns the receiver, the receiver borrows
//!  engine facilities for the duration of one call.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::config::LtpConfig;
use crate::engine::ClientServiceNotices;
use crate::fragment_set::{FragmentRange, FragmentSet};
use crate::parser::DataSegment;
use crate::segment::{
    serialize_cancel_ack, serialize_cancel_segment, serialize_report_segment, CancelReason,
    ReceptionClaim, ReportSegment, SessionId,
};
use crate::timer::TimerManager;

/// User data of a report retransmission timer.
#[derive(Debug)]
pub struct ReportRetryInfo {
    pub retry_count: u32,
}

/// User data of a delayed-report coalescing timer, keyed by the checkpoint
///  serial the report will answer.
#[derive(Debug)]
pub struct DelayedReportInfo {
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub is_secondary: bool,
}

/// Engine facilities lent to the receiver for the duration of one call.
pub(crate) struct RxCtx<'a> {
    pub now: Duration,
    pub config: &'a LtpConfig,
    pub report_timers: &'a mut TimerManager<ReportRetryInfo>,
    pub delayed_report_timers: &'a mut TimerManager<DelayedReportInfo>,
    pub notices: &'a dyn ClientServiceNotices,
}

#[derive(Debug, Default)]
pub(crate) struct ReceiverStats {
    pub report_timer_expiries: u64,
    pub reports_unable_to_be_issued: u64,
    pub reports_created_via_split: u64,
    pub gaps_filled_by_out_of_order_segments: u64,
}

pub(crate) struct SessionReceiver {
    session_id: SessionId,
    client_service_id: u64,

    received_red_ranges: FragmentSet,
    red_buffer: Vec<u8>,
    /// known only once an EORP checkpoint has been seen
    length_of_red_part: Option<u64>,
    lowest_green_offset_received: u64,
    /// running maximum of `offset + length` over all red segments seen
    current_red_length: u64,

    checkpoint_serials_seen: FxHashSet<u64>,
    /// every report ever issued, by report serial; entries are never removed
    ///  so that secondary checkpoints can look up the bounds they answer
    reports_sent: BTreeMap<u64, ReportSegment>,
    /// serial of the last report generated for a primary (unsolicited)
    ///  checkpoint; its upper bound is the next primary lower bound
    last_primary_report_serial: Option<u64>,
    acked_report_serials: FxHashSet<u64>,
    /// reports awaiting (re)transmission: (report serial, retry count)
    pending_report_queue: VecDeque<(u64, u32)>,
    /// delayed generation windows `(lb, ub)` -> (checkpoint serial, secondary)
    pending_report_generations: BTreeMap<(u64, u64), (u64, bool)>,
    next_report_serial: u64,

    pending_out: VecDeque<Bytes>,

    did_red_part_reception_callback: bool,
    did_notify_for_deletion: bool,
    called_cancelled_callback: bool,
    received_eob: bool,

    pub(crate) last_segment_received: Duration,
    pub(crate) stats: ReceiverStats,
}

impl SessionReceiver {
    pub(crate) fn new(
        session_id: SessionId,
        client_service_id: u64,
        initial_report_serial: u64,
        now: Duration,
        config: &LtpConfig,
    ) -> SessionReceiver {
        let red_buffer = Vec::with_capacity(
            (config.estimated_bytes_to_receive_per_session)
                .min(config.max_red_rx_bytes_per_session) as usize,
        );
        SessionReceiver {
            session_id,
            client_service_id,
            received_red_ranges: FragmentSet::new(),
            red_buffer,
            length_of_red_part: None,
            lowest_green_offset_received: u64::MAX,
            current_red_length: 0,
            checkpoint_serials_seen: FxHashSet::default(),
            reports_sent: BTreeMap::new(),
            last_primary_report_serial: None,
            acked_report_serials: FxHashSet::default(),
            pending_report_queue: VecDeque::new(),
            pending_report_generations: BTreeMap::new(),
            next_report_serial: initial_report_serial,
            pending_out: VecDeque::new(),
            did_red_part_reception_callback: false,
            did_notify_for_deletion: false,
            called_cancelled_callback: false,
            received_eob: false,
            last_segment_received: now,
            stats: ReceiverStats::default(),
        }
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.did_notify_for_deletion
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.called_cancelled_callback
    }

    /// All queued egress handed over; a graceful close additionally waits
    ///  for the engine to see no running timers for this session.
    pub(crate) fn is_flushed(&self) -> bool {
        self.pending_out.is_empty() && self.pending_report_queue.is_empty()
    }

    // ------------------------------------------------------------------
    // segment handling
    // ------------------------------------------------------------------

    pub(crate) fn on_data_segment(&mut self, ctx: &mut RxCtx, segment: &DataSegment) {
        self.last_segment_received = ctx.now;
        if self.called_cancelled_callback {
            trace!("session {}: data segment after cancellation - ignoring", self.session_id);
            return;
        }

        if segment.segment_type.is_green_data() {
            self.on_green_segment(ctx, segment);
        } else {
            self.on_red_segment(ctx, segment);
        }
    }

    fn on_green_segment(&mut self, ctx: &mut RxCtx, segment: &DataSegment) {
        let is_eob = segment.segment_type.is_end_of_block();
        ctx.notices.green_part_segment_arrival(
            self.session_id,
            &segment.data,
            segment.offset,
            segment.client_service_id,
            is_eob,
        );
        self.lowest_green_offset_received =
            self.lowest_green_offset_received.min(segment.offset);

        if segment.offset < self.current_red_length {
            warn!(
                "session {}: green segment at offset {} below red length {} - cancelling",
                self.session_id, segment.offset, self.current_red_length
            );
            self.cancel_session(ctx, CancelReason::Miscolored);
            return;
        }
        if is_eob {
            self.received_eob = true;
        }
        self.check_for_session_completion();
    }

    fn on_red_segment(&mut self, ctx: &mut RxCtx, segment: &DataSegment) {
        let offset = segment.offset;
        let length = segment.data.len() as u64;
        let Some(end) = offset.checked_add(length) else {
            warn!("session {}: red segment offset overflow - cancelling", self.session_id);
            self.cancel_session(ctx, CancelReason::SystemCancelled);
            return;
        };

        if end > self.lowest_green_offset_received {
            warn!(
                "session {}: red segment ending at {} above lowest green offset {} - cancelling",
                self.session_id, end, self.lowest_green_offset_received
            );
            self.cancel_session(ctx, CancelReason::Miscolored);
            return;
        }
        if end > ctx.config.max_red_rx_bytes_per_session {
            warn!(
                "session {}: red part would exceed the {} byte budget - cancelling",
                self.session_id, ctx.config.max_red_rx_bytes_per_session
            );
            self.cancel_session(ctx, CancelReason::SystemCancelled);
            return;
        }

        if self.red_buffer.len() < end as usize {
            self.red_buffer.resize(end as usize, 0);
        }
        self.red_buffer[offset as usize..end as usize].copy_from_slice(&segment.data);
        let newly_received = self
            .received_red_ranges
            .insert(FragmentRange::from_offset_and_length(offset, length));
        if newly_received && end <= self.current_red_length {
            self.stats.gaps_filled_by_out_of_order_segments += 1;
        }
        self.current_red_length = self.current_red_length.max(end);

        if segment.segment_type.is_end_of_red_part() {
            self.length_of_red_part = Some(end);
        }
        if segment.segment_type.is_end_of_block() {
            self.received_eob = true;
        }

        if let Some(checkpoint) = segment.checkpoint {
            self.on_checkpoint(ctx, checkpoint.serial, checkpoint.report_serial, end);
        }

        if self.is_red_part_fully_received() && !self.did_red_part_reception_callback {
            self.deliver_red_part(ctx);
        }
        self.check_for_session_completion();
    }

    fn on_checkpoint(&mut self, ctx: &mut RxCtx, serial: u64, report_serial: u64, segment_end: u64) {
        if !self.checkpoint_serials_seen.insert(serial) {
            debug!(
                "session {}: duplicate checkpoint serial {} - not generating a new report",
                self.session_id, serial
            );
            return;
        }

        // A checkpoint answering one of our reports claims that report's
        //  window again; an unsolicited (primary) checkpoint starts where the
        //  last primary report ended. Reports are never dropped from
        //  reports_sent, so a report serial we cannot find was never ours -
        //  the checkpoint is corrupt or forged and gets no report.
        let (lower_bound, is_secondary) = if report_serial != 0 {
            let Some(answered) = self.reports_sent.get(&report_serial) else {
                warn!(
                    "session {}: checkpoint {} answers unknown report {} - discarding",
                    self.session_id, serial, report_serial
                );
                return;
            };
            (answered.lower_bound, true)
        } else {
            (self.last_primary_upper_bound(), false)
        };
        // for EORP/EOB checkpoints the segment end is the red-part length
        let upper_bound = segment_end;

        if ctx.config.delay_sending_of_report_segments.is_zero() {
            self.generate_reports(ctx, serial, lower_bound, upper_bound, is_secondary);
        } else {
            self.schedule_delayed_report(ctx, serial, lower_bound, upper_bound, is_secondary);
        }
    }

    fn last_primary_upper_bound(&self) -> u64 {
        self.last_primary_report_serial
            .and_then(|serial| self.reports_sent.get(&serial))
            .map(|report| report.upper_bound)
            .unwrap_or(0)
    }

    fn is_red_part_fully_received(&self) -> bool {
        match self.length_of_red_part {
            Some(0) => true,
            Some(length) => self
                .received_red_ranges
                .contains_entirely(FragmentRange::new(0, length - 1)),
            None => false,
        }
    }

    fn deliver_red_part(&mut self, ctx: &mut RxCtx) {
        let length = self
            .length_of_red_part
            .expect("red part is only deliverable once its length is known");
        self.did_red_part_reception_callback = true;
        ctx.notices.red_part_reception(
            self.session_id,
            &self.red_buffer[..length as usize],
            self.client_service_id,
            self.received_eob,
        );
    }

    /// Red part delivered (or absent) plus end of block seen: ask the engine
    ///  to delete this session. The engine defers the actual close until all
    ///  queued reports are sent and acknowledged.
    fn check_for_session_completion(&mut self) {
        if self.did_notify_for_deletion || !self.received_eob {
            return;
        }
        let red_part_done = match self.length_of_red_part {
            Some(_) => self.did_red_part_reception_callback,
            // green-only block: no red byte was ever seen
            None => self.current_red_length == 0,
        };
        if red_part_done {
            debug!("session {}: block fully received", self.session_id);
            self.did_notify_for_deletion = true;
        }
    }

    // ------------------------------------------------------------------
    // report generation
    // ------------------------------------------------------------------

    fn schedule_delayed_report(
        &mut self,
        ctx: &mut RxCtx,
        checkpoint_serial: u64,
        lower_bound: u64,
        upper_bound: u64,
        is_secondary: bool,
    ) {
        // coalescing: a pending window covering this one will claim our
        //  range anyway; windows nested inside this one are subsumed
        if self
            .pending_report_generations
            .iter()
            .any(|(&(lb, ub), _)| lb <= lower_bound && ub >= upper_bound)
        {
            trace!(
                "session {}: report for [{},{}) covered by a pending window - coalesced",
                self.session_id, lower_bound, upper_bound
            );
            return;
        }
        let subsumed: Vec<(u64, u64)> = self
            .pending_report_generations
            .iter()
            .filter(|(&(lb, ub), _)| lb >= lower_bound && ub <= upper_bound)
            .map(|(&w, _)| w)
            .collect();
        for window in subsumed {
            if let Some((csn, _)) = self.pending_report_generations.remove(&window) {
                ctx.delayed_report_timers.cancel(&(self.session_id, csn));
            }
        }

        self.pending_report_generations
            .insert((lower_bound, upper_bound), (checkpoint_serial, is_secondary));
        if !ctx.delayed_report_timers.start(
            ctx.now,
            (self.session_id, checkpoint_serial),
            DelayedReportInfo { lower_bound, upper_bound, is_secondary },
        ) {
            warn!(
                "session {}: delayed-report timer for checkpoint {} already running",
                self.session_id, checkpoint_serial
            );
        }
    }

    pub(crate) fn on_delayed_report_due(
        &mut self,
        ctx: &mut RxCtx,
        checkpoint_serial: u64,
        info: DelayedReportInfo,
    ) {
        if self.called_cancelled_callback {
            return;
        }
        let window = (info.lower_bound, info.upper_bound);
        if self.pending_report_generations.remove(&window).is_none() {
            // superseded by a primary report that covered this window
            return;
        }

        if !info.is_secondary {
            // primary wins: drop pending secondary windows this one covers
            let covered: Vec<(u64, u64)> = self
                .pending_report_generations
                .iter()
                .filter(|(&(lb, ub), _)| lb >= info.lower_bound && ub <= info.upper_bound)
                .map(|(&w, _)| w)
                .collect();
            for w in covered {
                if let Some((csn, _)) = self.pending_report_generations.remove(&w) {
                    ctx.delayed_report_timers.cancel(&(self.session_id, csn));
                }
            }
        }

        self.generate_reports(
            ctx,
            checkpoint_serial,
            info.lower_bound,
            info.upper_bound,
            info.is_secondary,
        );
    }

    /// Builds the report(s) answering one checkpoint and queues them for
    ///  egress. Splits by the claim budget, each split with its own serial
    ///  and a window tiling `[lower_bound, upper_bound)` so no gap
    ///  information is lost.
    fn generate_reports(
        &mut self,
        ctx: &mut RxCtx,
        checkpoint_serial: u64,
        lower_bound: u64,
        upper_bound: u64,
        is_secondary: bool,
    ) {
        if upper_bound <= lower_bound {
            self.stats.reports_unable_to_be_issued += 1;
            return;
        }
        let window = FragmentRange::new(lower_bound, upper_bound - 1);
        let received: Vec<FragmentRange> = self
            .received_red_ranges
            .iter()
            .filter(|r| r.end >= window.begin && r.begin <= window.end)
            .map(|r| FragmentRange::new(r.begin.max(window.begin), r.end.min(window.end)))
            .collect();
        if received.is_empty() {
            debug!(
                "session {}: nothing received in [{},{}) - report not issued",
                self.session_id, lower_bound, upper_bound
            );
            self.stats.reports_unable_to_be_issued += 1;
            return;
        }

        let max_claims = ctx.config.max_reception_claims_per_report as usize;
        let chunks: Vec<&[FragmentRange]> = received.chunks(max_claims).collect();
        let num_chunks = chunks.len();
        if num_chunks > 1 {
            self.stats.reports_created_via_split += num_chunks as u64;
        }

        for (i, chunk) in chunks.into_iter().enumerate() {
            let chunk_lower = if i == 0 { lower_bound } else { chunk[0].begin };
            let chunk_upper = if i + 1 == num_chunks {
                upper_bound
            } else {
                received[(i + 1) * max_claims].begin
            };
            let claims = chunk
                .iter()
                .map(|r| ReceptionClaim { offset: r.begin - chunk_lower, length: r.len() })
                .collect();

            let serial = self.next_report_serial;
            self.next_report_serial += 1;
            let report = ReportSegment {
                report_serial: serial,
                checkpoint_serial,
                upper_bound: chunk_upper,
                lower_bound: chunk_lower,
                claims,
            };
            trace!("session {}: issuing report {:?}", self.session_id, report);
            self.reports_sent.insert(serial, report);
            if !is_secondary {
                self.last_primary_report_serial = Some(serial);
            }
            self.pending_report_queue.push_back((serial, 0));
        }
    }

    // ------------------------------------------------------------------
    // acknowledgement, retry, cancellation
    // ------------------------------------------------------------------

    pub(crate) fn on_report_ack(&mut self, ctx: &mut RxCtx, report_serial: u64) {
        self.last_segment_received = ctx.now;
        let Some((lower_bound, upper_bound)) = self
            .reports_sent
            .get(&report_serial)
            .map(|report| (report.lower_bound, report.upper_bound))
        else {
            trace!(
                "session {}: report ack for unknown serial {} - ignoring",
                self.session_id, report_serial
            );
            return;
        };

        ctx.report_timers.cancel(&(self.session_id, report_serial));
        self.acked_report_serials.insert(report_serial);
        self.pending_report_queue.retain(|(serial, _)| *serial != report_serial);

        if lower_bound == 0
            && Some(upper_bound) == self.length_of_red_part
            && self.is_red_part_fully_received()
        {
            if !self.did_red_part_reception_callback {
                self.deliver_red_part(ctx);
            }
            debug!(
                "session {}: fully claimed report {} acknowledged",
                self.session_id, report_serial
            );
            self.did_notify_for_deletion = true;
        }
    }

    pub(crate) fn on_report_timer_expired(
        &mut self,
        ctx: &mut RxCtx,
        report_serial: u64,
        info: ReportRetryInfo,
    ) {
        if self.called_cancelled_callback || self.acked_report_serials.contains(&report_serial) {
            return;
        }
        self.stats.report_timer_expiries += 1;
        if info.retry_count >= ctx.config.max_retries_per_serial_number {
            warn!(
                "session {}: report {} exhausted its {} retries - cancelling",
                self.session_id, report_serial, info.retry_count
            );
            self.cancel_session(ctx, CancelReason::RetransmissionLimitExceeded);
            return;
        }
        debug!(
            "session {}: report {} unacknowledged, retry {}",
            self.session_id,
            report_serial,
            info.retry_count + 1
        );
        self.pending_report_queue
            .push_back((report_serial, info.retry_count + 1));
    }

    pub(crate) fn on_cancel_from_sender(&mut self, ctx: &mut RxCtx, reason: CancelReason) {
        self.last_segment_received = ctx.now;
        let mut buf = BytesMut::new();
        serialize_cancel_ack(&mut buf, self.session_id, true);
        self.pending_out.push_back(buf.freeze());

        if !self.called_cancelled_callback {
            self.called_cancelled_callback = true;
            ctx.notices.reception_session_cancelled(self.session_id, reason);
        }
        self.pending_report_queue.clear();
        self.did_notify_for_deletion = true;
    }

    /// Receiver-side cancellation (miscolored block, budget breach, retry
    ///  exhaustion, stagnation, application request).
    pub(crate) fn cancel_session(&mut self, ctx: &mut RxCtx, reason: CancelReason) {
        if self.did_notify_for_deletion {
            return;
        }
        let mut buf = BytesMut::new();
        serialize_cancel_segment(&mut buf, self.session_id, false, reason);
        self.pending_out.push_back(buf.freeze());

        if !self.called_cancelled_callback {
            self.called_cancelled_callback = true;
            ctx.notices.reception_session_cancelled(self.session_id, reason);
        }
        self.pending_report_queue.clear();
        self.did_notify_for_deletion = true;
    }

    // ------------------------------------------------------------------
    // egress
    // ------------------------------------------------------------------

    /// The next serialized segment to hand to the transport, if any. Report
    ///  (re)transmissions start their retry timer here, at the moment the
    ///  bytes actually leave the session.
    pub(crate) fn next_outbound(&mut self, ctx: &mut RxCtx) -> Option<Bytes> {
        if let Some(buf) = self.pending_out.pop_front() {
            return Some(buf);
        }
        while let Some((serial, retry_count)) = self.pending_report_queue.pop_front() {
            let Some(report) = self.reports_sent.get(&serial) else {
                continue;
            };
            let mut buf = BytesMut::new();
            serialize_report_segment(&mut buf, self.session_id, report);
            if !ctx.report_timers.start(
                ctx.now,
                (self.session_id, serial),
                ReportRetryInfo { retry_count },
            ) {
                warn!(
                    "session {}: retry timer for report {} already running",
                    self.session_id, serial
                );
            }
            return Some(buf.freeze());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockClientServiceNotices;
    use crate::segment::{Checkpoint, SegmentType};

    const SESSION: SessionId = SessionId { engine_id: 9, session_number: 77 };

    struct Fixture {
        config: LtpConfig,
        report_timers: TimerManager<ReportRetryInfo>,
        delayed_report_timers: TimerManager<DelayedReportInfo>,
        notices: MockClientServiceNotices,
    }
    impl Fixture {
        fn new(mut tweak: impl FnMut(&mut LtpConfig)) -> Fixture {
            let mut config = LtpConfig::new(1);
            tweak(&mut config);
            Fixture {
                report_timers: TimerManager::new(
                    config.one_way_light_time,
                    config.one_way_margin_time,
                ),
                delayed_report_timers: TimerManager::new(
                    config.delay_sending_of_report_segments / 2,
                    Duration::ZERO,
                ),
                notices: MockClientServiceNotices::new(),
                config,
            }
        }

        fn ctx(&mut self, now: Duration) -> RxCtx {
            RxCtx {
                now,
                config: &self.config,
                report_timers: &mut self.report_timers,
                delayed_report_timers: &mut self.delayed_report_timers,
                notices: &self.notices,
            }
        }
    }

    fn receiver(config: &LtpConfig) -> SessionReceiver {
        SessionReceiver::new(SESSION, 4, 1000, Duration::ZERO, config)
    }

    fn data_segment(offset: u64, data: &[u8], checkpoint: Option<Checkpoint>, segment_type: SegmentType) -> DataSegment {
        DataSegment {
            segment_type,
            client_service_id: 4,
            offset,
            checkpoint,
            data: data.to_vec(),
        }
    }

    /// More received ranges than the claim budget: the report splits, each
    ///  split with its own serial and windows tiling the whole span.
    #[test]
    fn test_report_splitting_by_claim_budget() {
        let mut fixture = Fixture::new(|c| c.max_reception_claims_per_report = 2);
        let mut rx = receiver(&fixture.config);

        // bytes 0,2,4,6,8 of a 10-byte red part: five one-byte ranges
        for offset in [0u64, 2, 4, 6] {
            let seg = data_segment(offset, b"x", None, SegmentType::RedData);
            rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &seg);
        }
        let seg = data_segment(
            8,
            b"xx",
            Some(Checkpoint { serial: 5, report_serial: 0 }),
            SegmentType::RedDataCheckpointEorpEob,
        );
        fixture.notices.expect_red_part_reception().never();
        rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &seg);

        let mut ctx = fixture.ctx(Duration::ZERO);
        while rx.next_outbound(&mut ctx).is_some() {}
        let reports: Vec<ReportSegment> = rx.reports_sent.values().cloned().collect();
        assert_eq!(reports.len(), 3);
        assert_eq!(rx.stats.reports_created_via_split, 3);

        // windows tile [0, 10) without losing gap information
        assert_eq!(reports[0].lower_bound, 0);
        assert_eq!(reports[0].upper_bound, reports[1].lower_bound);
        assert_eq!(reports[1].upper_bound, reports[2].lower_bound);
        assert_eq!(reports[2].upper_bound, 10);
        for report in &reports {
            assert!(report.claims.len() <= 2);
            assert_eq!(report.checkpoint_serial, 5);
        }
        // distinct serials
        assert_ne!(reports[0].report_serial, reports[1].report_serial);
        assert_ne!(reports[1].report_serial, reports[2].report_serial);
    }

    #[test]
    fn test_duplicate_checkpoint_generates_no_second_report() {
        let mut fixture = Fixture::new(|_| ());
        let mut rx = receiver(&fixture.config);
        fixture.notices.expect_red_part_reception().times(1).return_const(());

        let seg = data_segment(
            0,
            b"abc",
            Some(Checkpoint { serial: 11, report_serial: 0 }),
            SegmentType::RedDataCheckpointEorpEob,
        );
        rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &seg);
        assert_eq!(rx.pending_report_queue.len(), 1);

        rx.on_data_segment(&mut fixture.ctx(Duration::from_millis(1)), &seg);
        assert_eq!(rx.pending_report_queue.len(), 1, "duplicate checkpoint coalesced");
        assert_eq!(rx.reports_sent.len(), 1);
    }

    #[test]
    fn test_green_below_red_cancels_miscolored() {
        let mut fixture = Fixture::new(|_| ());
        let mut rx = receiver(&fixture.config);
        fixture
            .notices
            .expect_reception_session_cancelled()
            .withf(|_, reason| *reason == CancelReason::Miscolored)
            .times(1)
            .return_const(());
        fixture.notices.expect_green_part_segment_arrival().times(1).return_const(());

        let red = data_segment(0, b"abcd", None, SegmentType::RedData);
        rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &red);

        let green = data_segment(1, b"g", None, SegmentType::GreenData);
        rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &green);

        assert!(rx.wants_close());
        assert!(rx.was_cancelled());
        // the cancel segment is queued for egress
        assert_eq!(rx.pending_out.len(), 1);
    }

    #[test]
    fn test_red_budget_breach_cancels() {
        let mut fixture = Fixture::new(|c| c.max_red_rx_bytes_per_session = 4);
        let mut rx = receiver(&fixture.config);
        fixture
            .notices
            .expect_reception_session_cancelled()
            .withf(|_, reason| *reason == CancelReason::SystemCancelled)
            .times(1)
            .return_const(());
        fixture.notices.expect_red_part_reception().never();

        let seg = data_segment(0, b"abcde", None, SegmentType::RedData);
        rx.on_data_segment(&mut fixture.ctx(Duration::ZERO), &seg);
        assert!(rx.was_cancelled());
    }
}
