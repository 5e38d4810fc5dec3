//! The engine owns every session and multiplexes between them: decoded
//!  segments are dispatched to the right sender or receiver, timer expiries
//!  are routed back into the sessions, outbound segments are pumped to the
//!  transport in bounded batches, and housekeeping reaps stagnant sessions.
//!
//! Everything here runs on one task; the transport and the application are
//!  reached only through the injected [`PacketTransport`] and
//!  [`ClientServiceNotices`] collaborators. Time is a monotonic [`Duration`]
//!  since an arbitrary baseline supplied by the caller on every entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::config::LtpConfig;
use crate::parser::{Segment, SegmentBody, SegmentParser};
use crate::random::RandomNumberSource;
use crate::recreation_preventer::SessionRecreationPreventer;
use crate::segment::{serialize_cancel_ack, serialize_cancel_segment, CancelReason, SessionId};
use crate::session_receiver::{DelayedReportInfo, ReportRetryInfo, RxCtx, SessionReceiver};
use crate::session_sender::{CheckpointRetryInfo, SessionSender, TxCtx};
use crate::timer::TimerManager;

/// Callbacks into the client service. Every method has a no-op default, so
///  applications implement only what they care about.
#[cfg_attr(test, mockall::automock)]
pub trait ClientServiceNotices: Send + Sync {
    /// Once per session, on both endpoints, when the session is created.
    fn session_start(&self, _session_id: SessionId) {}

    /// Exactly once per completed red part. The buffer is lent for the
    ///  duration of the call only.
    fn red_part_reception(
        &self,
        _session_id: SessionId,
        _data: &[u8],
        _client_service_id: u64,
        _is_end_of_block: bool,
    ) {
    }

    /// Once per arriving green segment, in arrival order.
    fn green_part_segment_arrival(
        &self,
        _session_id: SessionId,
        _data: &[u8],
        _offset: u64,
        _client_service_id: u64,
        _is_end_of_block: bool,
    ) {
    }

    /// All initial segments of a block have been handed to the transport.
    fn initial_transmission_completed(&self, _session_id: SessionId) {}

    /// The red part of an outbound block is fully acknowledged.
    fn transmission_session_completed(&self, _session_id: SessionId) {}

    fn transmission_session_cancelled(&self, _session_id: SessionId, _reason: CancelReason) {}

    fn reception_session_cancelled(&self, _session_id: SessionId, _reason: CancelReason) {}

    /// The session's state is gone; informs a higher layer.
    fn session_closed(&self, _session_id: SessionId) {}
}

/// The outbound half of the transport collaborator. Delivery is
///  at-most-once and failures are not reported back; the engine compensates
///  with its retransmission timers.
#[cfg_attr(test, mockall::automock)]
pub trait PacketTransport: Send {
    fn send_packets(&mut self, destination_engine_id: u64, packets: Vec<Bytes>);
}

pub struct LtpEngine {
    config: LtpConfig,
    parser: SegmentParser,

    senders: FxHashMap<SessionId, SessionSender>,
    receivers: FxHashMap<SessionId, SessionReceiver>,

    checkpoint_timers: TimerManager<CheckpointRetryInfo>,
    report_timers: TimerManager<ReportRetryInfo>,
    delayed_report_timers: TimerManager<DelayedReportInfo>,

    recently_closed: SessionRecreationPreventer,
    random: RandomNumberSource,

    transport: Box<dyn PacketTransport>,
    notices: Arc<dyn ClientServiceNotices>,
}

impl LtpEngine {
    pub fn new(
        config: LtpConfig,
        transport: Box<dyn PacketTransport>,
        notices: Arc<dyn ClientServiceNotices>,
    ) -> anyhow::Result<LtpEngine> {
        config.validate()?;
        info!("creating LTP engine {}", config.engine_id);

        let owlt = config.one_way_light_time;
        let margin = config.one_way_margin_time;
        Ok(LtpEngine {
            parser: SegmentParser::new(),
            senders: FxHashMap::default(),
            receivers: FxHashMap::default(),
            checkpoint_timers: TimerManager::new(owlt, margin),
            report_timers: TimerManager::new(owlt, margin),
            delayed_report_timers: TimerManager::new(
                config.delay_sending_of_report_segments / 2,
                Duration::ZERO,
            ),
            recently_closed: SessionRecreationPreventer::new(
                config.rx_session_recreation_preventer_history_size,
            ),
            random: RandomNumberSource::new(config.force_32_bit_random_session_numbers),
            transport,
            notices,
            config,
        })
    }

    pub fn engine_id(&self) -> u64 {
        self.config.engine_id
    }

    pub fn num_active_senders(&self) -> usize {
        self.senders.len()
    }

    pub fn num_active_receivers(&self) -> usize {
        self.receivers.len()
    }

    // ------------------------------------------------------------------
    // application API
    // ------------------------------------------------------------------

    /// Starts transmission of one block. Red bytes are `[0, red_part_length)`
    ///  of `data`, the rest is green.
    pub fn transmission_request(
        &mut self,
        now: Duration,
        destination_engine_id: u64,
        client_service_id: u64,
        data: Vec<u8>,
        red_part_length: u64,
    ) -> anyhow::Result<SessionId> {
        if red_part_length > data.len() as u64 {
            bail!(
                "red part length {} exceeds the block length {}",
                red_part_length,
                data.len()
            );
        }
        if data.is_empty() {
            bail!("cannot transmit an empty block");
        }
        if self.senders.len() + self.receivers.len() >= self.config.max_simultaneous_sessions {
            bail!(
                "refusing to create a session beyond the limit of {}",
                self.config.max_simultaneous_sessions
            );
        }

        let mut session_number = self.random.session_number();
        while self
            .senders
            .contains_key(&SessionId::new(self.config.engine_id, session_number))
        {
            session_number = self.random.session_number();
        }
        let session_id = SessionId::new(self.config.engine_id, session_number);

        let sender = SessionSender::new(
            session_id,
            destination_engine_id,
            client_service_id,
            data,
            red_part_length,
            self.random.initial_serial_number(),
        );
        self.senders.insert(session_id, sender);
        debug!("session {}: transmission request accepted", session_id);
        self.notices.session_start(session_id);

        self.pump(now);
        Ok(session_id)
    }

    /// Cooperative cancellation of either session kind. The terminal
    ///  callback is delivered synchronously before this returns. False if
    ///  the session is unknown.
    pub fn cancellation_request(&mut self, now: Duration, session_id: SessionId) -> bool {
        let known = if let Some(sender) = self.senders.get_mut(&session_id) {
            let mut ctx = TxCtx {
                now,
                config: &self.config,
                checkpoint_timers: &mut self.checkpoint_timers,
                notices: self.notices.as_ref(),
            };
            sender.begin_cancel(&mut ctx, CancelReason::UserCancelled);
            true
        } else if let Some(receiver) = self.receivers.get_mut(&session_id) {
            let mut ctx = RxCtx {
                now,
                config: &self.config,
                report_timers: &mut self.report_timers,
                delayed_report_timers: &mut self.delayed_report_timers,
                notices: self.notices.as_ref(),
            };
            receiver.cancel_session(&mut ctx, CancelReason::UserCancelled);
            true
        } else {
            false
        };
        if known {
            self.pump(now);
        }
        known
    }

    /// Cancels every open session with `SYSTEM_CANCELLED` and flushes the
    ///  resulting cancel segments.
    pub fn shutdown(&mut self, now: Duration) {
        info!(
            "engine {}: shutting down with {} send and {} receive sessions open",
            self.config.engine_id,
            self.senders.len(),
            self.receivers.len()
        );
        for sender in self.senders.values_mut() {
            let mut ctx = TxCtx {
                now,
                config: &self.config,
                checkpoint_timers: &mut self.checkpoint_timers,
                notices: self.notices.as_ref(),
            };
            sender.begin_cancel(&mut ctx, CancelReason::SystemCancelled);
        }
        for receiver in self.receivers.values_mut() {
            let mut ctx = RxCtx {
                now,
                config: &self.config,
                report_timers: &mut self.report_timers,
                delayed_report_timers: &mut self.delayed_report_timers,
                notices: self.notices.as_ref(),
            };
            receiver.cancel_session(&mut ctx, CancelReason::SystemCancelled);
        }
        self.pump(now);
        // whatever is left does not get to wait for acks
        let sender_ids: Vec<SessionId> = self.senders.keys().copied().collect();
        for session_id in sender_ids {
            self.destroy_sender(session_id);
        }
        let receiver_ids: Vec<SessionId> = self.receivers.keys().copied().collect();
        for session_id in receiver_ids {
            self.destroy_receiver(session_id);
        }
    }

    // ------------------------------------------------------------------
    // inbound
    // ------------------------------------------------------------------

    /// Feed one received datagram into the engine. Datagrams carry whole
    ///  segments; a parse error discards the remainder of the datagram.
    pub fn on_packet_in(&mut self, now: Duration, datagram: &[u8]) {
        let mut rest = datagram;
        loop {
            match self.parser.parse(&mut rest) {
                Ok(Some(segment)) => self.dispatch(now, segment),
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping rest of unparsable datagram: {:#}", e);
                    self.parser.reset();
                    break;
                }
            }
        }
        if !self.parser.is_at_start() {
            warn!("datagram ended mid-segment - discarding the fragment");
            self.parser.reset();
        }
        self.pump(now);
    }

    fn dispatch(&mut self, now: Duration, segment: Segment) {
        let session_id = segment.session_id;
        trace!("dispatching {:?} for session {}", segment.body, session_id);
        match segment.body {
            SegmentBody::Data(data_segment) => {
                if self.senders.contains_key(&session_id) {
                    debug!(
                        "session {}: data segment for a session we are sending - discarding",
                        session_id
                    );
                    return;
                }
                if !self.ensure_receiver(now, session_id, data_segment.client_service_id) {
                    return;
                }
                let receiver = self.receivers.get_mut(&session_id).expect("just ensured");
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                receiver.on_data_segment(&mut ctx, &data_segment);
            }
            SegmentBody::Report(report) => {
                if self.receivers.contains_key(&session_id) {
                    debug!(
                        "session {}: report segment for a session we are receiving - discarding",
                        session_id
                    );
                    return;
                }
                let Some(sender) = self.senders.get_mut(&session_id) else {
                    debug!("session {}: report for unknown session - discarding", session_id);
                    return;
                };
                let mut ctx = TxCtx {
                    now,
                    config: &self.config,
                    checkpoint_timers: &mut self.checkpoint_timers,
                    notices: self.notices.as_ref(),
                };
                sender.on_report(&mut ctx, &report);
            }
            SegmentBody::ReportAck { report_serial } => {
                let Some(receiver) = self.receivers.get_mut(&session_id) else {
                    trace!(
                        "session {}: report ack for unknown session - discarding",
                        session_id
                    );
                    return;
                };
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                receiver.on_report_ack(&mut ctx, report_serial);
            }
            SegmentBody::Cancel { from_sender, reason } => {
                self.dispatch_cancel(now, session_id, from_sender, reason)
            }
            SegmentBody::CancelAck { to_sender } => {
                if to_sender {
                    if let Some(sender) = self.senders.get_mut(&session_id) {
                        let mut ctx = TxCtx {
                            now,
                            config: &self.config,
                            checkpoint_timers: &mut self.checkpoint_timers,
                            notices: self.notices.as_ref(),
                        };
                        sender.on_cancel_ack(&mut ctx);
                    }
                }
                // an ack to a receiver needs no action: the receiver never
                //  retries its cancel segment
            }
        }
    }

    fn dispatch_cancel(
        &mut self,
        now: Duration,
        session_id: SessionId,
        from_sender: bool,
        reason: CancelReason,
    ) {
        if from_sender {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                receiver.on_cancel_from_sender(&mut ctx, reason);
                return;
            }
            if self.senders.contains_key(&session_id) {
                debug!(
                    "session {}: sender-side cancel for a session we are sending - discarding",
                    session_id
                );
                return;
            }
        } else {
            if let Some(sender) = self.senders.get_mut(&session_id) {
                let mut ctx = TxCtx {
                    now,
                    config: &self.config,
                    checkpoint_timers: &mut self.checkpoint_timers,
                    notices: self.notices.as_ref(),
                };
                sender.on_cancel_from_receiver(&mut ctx, reason);
                return;
            }
            if self.receivers.contains_key(&session_id) {
                debug!(
                    "session {}: receiver-side cancel for a session we are receiving - discarding",
                    session_id
                );
                return;
            }
        }

        // cancel for an unknown (or already closed) session: acknowledge so
        //  the peer can stop retrying, nothing else to do
        debug!(
            "session {}: cancel (reason {:?}) for unknown session - acknowledging",
            session_id, reason
        );
        let mut buf = BytesMut::new();
        serialize_cancel_ack(&mut buf, session_id, from_sender);
        let destination = session_id.engine_id;
        self.transport.send_packets(destination, vec![buf.freeze()]);
    }

    /// Creates the receiving session for an unknown session id, unless the
    ///  recently-closed history or the session limit forbids it.
    fn ensure_receiver(
        &mut self,
        now: Duration,
        session_id: SessionId,
        client_service_id: u64,
    ) -> bool {
        if self.receivers.contains_key(&session_id) {
            return true;
        }
        if self.recently_closed.contains(&session_id) {
            debug!(
                "session {}: data segment for recently closed session - discarding",
                session_id
            );
            return false;
        }
        if self.senders.len() + self.receivers.len() >= self.config.max_simultaneous_sessions {
            warn!(
                "session {}: session limit {} reached - refusing reception",
                session_id, self.config.max_simultaneous_sessions
            );
            let mut buf = BytesMut::new();
            serialize_cancel_segment(&mut buf, session_id, false, CancelReason::SystemCancelled);
            self.transport
                .send_packets(session_id.engine_id, vec![buf.freeze()]);
            return false;
        }

        debug!("session {}: creating receiving session", session_id);
        self.receivers.insert(
            session_id,
            SessionReceiver::new(
                session_id,
                client_service_id,
                self.random.initial_serial_number(),
                now,
                &self.config,
            ),
        );
        self.notices.session_start(session_id);
        true
    }

    // ------------------------------------------------------------------
    // timers & housekeeping
    // ------------------------------------------------------------------

    /// Drives timer expiry and housekeeping; called periodically by the
    ///  hosting task.
    pub fn on_tick(&mut self, now: Duration) {
        for ((session_id, serial), info) in self.checkpoint_timers.advance(now) {
            if let Some(sender) = self.senders.get_mut(&session_id) {
                let mut ctx = TxCtx {
                    now,
                    config: &self.config,
                    checkpoint_timers: &mut self.checkpoint_timers,
                    notices: self.notices.as_ref(),
                };
                sender.on_timer_expired(&mut ctx, serial, info);
            }
        }
        for ((session_id, serial), info) in self.report_timers.advance(now) {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                receiver.on_report_timer_expired(&mut ctx, serial, info);
            }
        }
        for ((session_id, serial), info) in self.delayed_report_timers.advance(now) {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                receiver.on_delayed_report_due(&mut ctx, serial, info);
            }
        }

        self.reap_stagnant_receivers(now);
        self.pump(now);
    }

    /// A receiving session with no traffic for the stagnation window and no
    ///  running timers will never make progress on its own.
    fn reap_stagnant_receivers(&mut self, now: Duration) {
        let window = self.config.effective_stagnation_timeout();
        let stagnant: Vec<SessionId> = self
            .receivers
            .iter()
            .filter(|&(session_id, receiver)| {
                !receiver.wants_close()
                    && receiver.last_segment_received + window <= now
                    && !self.report_timers.has_timers_for_session(session_id)
                    && !self.delayed_report_timers.has_timers_for_session(session_id)
            })
            .map(|(session_id, _)| *session_id)
            .collect();

        for session_id in stagnant {
            warn!("session {}: stagnant receiving session - cancelling", session_id);
            let receiver = self.receivers.get_mut(&session_id).expect("collected above");
            let mut ctx = RxCtx {
                now,
                config: &self.config,
                report_timers: &mut self.report_timers,
                delayed_report_timers: &mut self.delayed_report_timers,
                notices: self.notices.as_ref(),
            };
            receiver.cancel_session(&mut ctx, CancelReason::SystemCancelled);
        }
    }

    // ------------------------------------------------------------------
    // outbound pump & session teardown
    // ------------------------------------------------------------------

    /// Drains every session's egress to the transport in batches of at most
    ///  `max_udp_packets_to_send_per_system_call`, then closes sessions that
    ///  have finished their business.
    fn pump(&mut self, now: Duration) {
        let batch_limit = self.config.max_udp_packets_to_send_per_system_call;

        let sender_ids: Vec<SessionId> = self.senders.keys().copied().collect();
        for session_id in sender_ids {
            loop {
                let sender = self.senders.get_mut(&session_id).expect("not removed here");
                let destination = sender.destination_engine_id();
                let mut batch = Vec::new();
                let mut ctx = TxCtx {
                    now,
                    config: &self.config,
                    checkpoint_timers: &mut self.checkpoint_timers,
                    notices: self.notices.as_ref(),
                };
                while batch.len() < batch_limit {
                    match sender.next_outbound(&mut ctx) {
                        Some(packet) => batch.push(packet),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    break;
                }
                let full = batch.len() == batch_limit;
                self.transport.send_packets(destination, batch);
                if !full {
                    break;
                }
            }
        }

        let receiver_ids: Vec<SessionId> = self.receivers.keys().copied().collect();
        for session_id in receiver_ids {
            loop {
                let receiver = self.receivers.get_mut(&session_id).expect("not removed here");
                // receiving sessions always talk back to the originator
                let destination = session_id.engine_id;
                let mut batch = Vec::new();
                let mut ctx = RxCtx {
                    now,
                    config: &self.config,
                    report_timers: &mut self.report_timers,
                    delayed_report_timers: &mut self.delayed_report_timers,
                    notices: self.notices.as_ref(),
                };
                while batch.len() < batch_limit {
                    match receiver.next_outbound(&mut ctx) {
                        Some(packet) => batch.push(packet),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    break;
                }
                let full = batch.len() == batch_limit;
                self.transport.send_packets(destination, batch);
                if !full {
                    break;
                }
            }
        }

        self.close_finished_sessions();
    }

    fn close_finished_sessions(&mut self) {
        let finished_senders: Vec<SessionId> = self
            .senders
            .iter()
            .filter(|(_, sender)| sender.wants_close() && sender.is_flushed())
            .map(|(session_id, _)| *session_id)
            .collect();
        for session_id in finished_senders {
            self.destroy_sender(session_id);
        }

        let finished_receivers: Vec<SessionId> = self
            .receivers
            .iter()
            .filter(|&(session_id, receiver)| {
                receiver.wants_close()
                    && receiver.is_flushed()
                    && (receiver.was_cancelled()
                        || (!self.report_timers.has_timers_for_session(session_id)
                            && !self.delayed_report_timers.has_timers_for_session(session_id)))
            })
            .map(|(session_id, _)| *session_id)
            .collect();
        for session_id in finished_receivers {
            self.destroy_receiver(session_id);
        }
    }

    fn destroy_sender(&mut self, session_id: SessionId) {
        if let Some(sender) = self.senders.remove(&session_id) {
            self.checkpoint_timers.cancel_session(&session_id);
            debug!(
                "session {}: closing send session ({} timer expiries, {} segments resent)",
                session_id, sender.stats.checkpoint_timer_expiries, sender.stats.segments_resent
            );
            self.notices.session_closed(session_id);
        }
    }

    fn destroy_receiver(&mut self, session_id: SessionId) {
        if let Some(receiver) = self.receivers.remove(&session_id) {
            self.report_timers.cancel_session(&session_id);
            self.delayed_report_timers.cancel_session(&session_id);
            self.recently_closed.add(session_id);
            debug!(
                "session {}: closing receive session ({} report timer expiries, {} reports split, \
                 {} unable to be issued, {} gaps filled out of order)",
                session_id,
                receiver.stats.report_timer_expiries,
                receiver.stats.reports_created_via_split,
                receiver.stats.reports_unable_to_be_issued,
                receiver.stats.gaps_filled_by_out_of_order_segments
            );
            self.notices.session_closed(session_id);
        }
    }
}
