//! Hosts an [`LtpEngine`] on a tokio task. The core engine is synchronous
//!  and single-threaded by design; this driver supplies the event loop:
//!  inbound datagrams and application commands arrive over channels, a
//!  housekeeping interval drives timer expiry, and all of them are funnelled
//!  into engine calls with a monotonic time baseline owned here.
//!
//! Applications that embed the engine in their own event loop do not need
//!  this module at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::config::LtpConfig;
use crate::engine::{LtpEngine, PacketTransport};
use crate::segment::SessionId;

/// Async outbound collaborator: typically a thin wrapper around a
///  `UdpSocket` plus a peer-address lookup by engine id.
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send(&self, destination_engine_id: u64, packets: Vec<Bytes>);
}

/// Engine-facing side of [`spawn_datagram_forwarder`]: enqueues batches
///  without blocking, so the engine never suspends with session state in
///  flight.
pub struct ChannelPacketTransport {
    outbound: mpsc::UnboundedSender<(u64, Vec<Bytes>)>,
}
impl PacketTransport for ChannelPacketTransport {
    fn send_packets(&mut self, destination_engine_id: u64, packets: Vec<Bytes>) {
        if self.outbound.send((destination_engine_id, packets)).is_err() {
            warn!("dropping outbound batch: datagram forwarder is gone");
        }
    }
}

/// Bridges the engine's synchronous transport interface to an async
///  [`DatagramSender`]: batches are queued by the engine task and awaited by
///  a dedicated forwarder task.
pub fn spawn_datagram_forwarder(
    sender: Arc<dyn DatagramSender>,
) -> (ChannelPacketTransport, JoinHandle<()>) {
    let (outbound, mut batches) = mpsc::unbounded_channel::<(u64, Vec<Bytes>)>();
    let handle = tokio::spawn(async move {
        while let Some((destination, packets)) = batches.recv().await {
            sender.send(destination, packets).await;
        }
    });
    (ChannelPacketTransport { outbound }, handle)
}

pub enum EngineCommand {
    TransmissionRequest {
        destination_engine_id: u64,
        client_service_id: u64,
        data: Vec<u8>,
        red_part_length: u64,
    },
    CancellationRequest(SessionId),
    Shutdown,
}

/// Cloneable handle for talking to a running [`LtpEngineDriver`].
#[derive(Clone)]
pub struct LtpEngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    datagrams: mpsc::UnboundedSender<Bytes>,
}

impl LtpEngineHandle {
    /// Called by the transport for each received datagram.
    pub fn on_datagram_received(&self, datagram: Bytes) {
        if self.datagrams.send(datagram).is_err() {
            warn!("dropping datagram: engine task is gone");
        }
    }

    pub fn transmission_request(
        &self,
        destination_engine_id: u64,
        client_service_id: u64,
        data: Vec<u8>,
        red_part_length: u64,
    ) {
        self.send_command(EngineCommand::TransmissionRequest {
            destination_engine_id,
            client_service_id,
            data,
            red_part_length,
        });
    }

    pub fn cancellation_request(&self, session_id: SessionId) {
        self.send_command(EngineCommand::CancellationRequest(session_id));
    }

    pub fn shutdown(&self) {
        self.send_command(EngineCommand::Shutdown);
    }

    fn send_command(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            warn!("dropping command: engine task is gone");
        }
    }
}

pub struct LtpEngineDriver {
    engine: LtpEngine,
    housekeeping_interval: Duration,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    datagrams: mpsc::UnboundedReceiver<Bytes>,
    baseline: Instant,
}

impl LtpEngineDriver {
    pub fn new(engine: LtpEngine, config: &LtpConfig) -> (LtpEngineDriver, LtpEngineHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let driver = LtpEngineDriver {
            engine,
            housekeeping_interval: config.housekeeping_interval,
            commands: command_rx,
            datagrams: datagram_rx,
            baseline: Instant::now(),
        };
        let handle = LtpEngineHandle { commands: command_tx, datagrams: datagram_tx };
        (driver, handle)
    }

    fn now(&self) -> Duration {
        self.baseline.elapsed()
    }

    /// The engine's event loop; runs until [`LtpEngineHandle::shutdown`] is
    ///  called or every handle is dropped.
    pub async fn run(mut self) {
        info!("starting LTP engine loop for engine {}", self.engine.engine_id());
        let mut housekeeping = interval(self.housekeeping_interval);

        loop {
            select! {
                datagram = self.datagrams.recv() => {
                    let now = self.now();
                    match datagram {
                        Some(datagram) => self.engine.on_packet_in(now, &datagram),
                        None => {
                            debug!("all handles dropped - shutting down");
                            self.engine.shutdown(now);
                            break;
                        }
                    }
                }
                command = self.commands.recv() => {
                    let now = self.now();
                    match command {
                        Some(EngineCommand::TransmissionRequest {
                            destination_engine_id,
                            client_service_id,
                            data,
                            red_part_length,
                        }) => {
                            if let Err(e) = self.engine.transmission_request(
                                now,
                                destination_engine_id,
                                client_service_id,
                                data,
                                red_part_length,
                            ) {
                                warn!("transmission request rejected: {:#}", e);
                            }
                        }
                        Some(EngineCommand::CancellationRequest(session_id)) => {
                            if !self.engine.cancellation_request(now, session_id) {
                                debug!("cancellation request for unknown session {}", session_id);
                            }
                        }
                        Some(EngineCommand::Shutdown) | None => {
                            self.engine.shutdown(now);
                            break;
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    self.engine.on_tick(self.now());
                }
            }
        }
        info!("LTP engine loop for engine {} terminated", self.engine.engine_id());
    }
}
