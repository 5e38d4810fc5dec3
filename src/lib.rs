//! Core of a Licklider Transmission Protocol (LTP, RFC 5326) engine: reliable,
//!  session-oriented delivery of data blocks over long-delay, high-loss links
//!  (the classic example being deep-space UDP, where a round trip is minutes
//!  or hours and every retransmission decision has to be budgeted in one-way
//!  light time).
//!
//! ## Design goals
//!
//! * One *block* of client service data per session, split into a *red* part
//!   (delivered reliably via selective acknowledgement and retransmission) and
//!   a *green* part (best effort, no acknowledgement)
//!   * the red part is the prefix `[0, red_part_length)`; green is the rest
//! * The engine is transport-agnostic: it consumes datagrams and emits
//!   datagrams, and everything UDP-shaped (sockets, rate limiting, batching
//!   system calls) lives in an injected collaborator
//! * All per-session state machine transitions run on a single engine task -
//!   no locks in the core, suspension only at the transport boundary
//! * Timers are budgeted as `2 * (one-way light time + margin)`, i.e. one
//!   round trip plus slack, and are driven from the engine's own tick rather
//!   than per-timer alarms
//! * Sessions are created implicitly: a sender session by an application
//!   transmission request, a receiver session by the first segment of an
//!   unknown session arriving from the wire
//!
//! ## Segment layout
//!
//! Every LTP segment is built from SDNVs (self-delimiting numeric values,
//! 7-bit big-endian groups with a continuation bit) and looks like this on
//! the wire:
//!
//! ```ascii
//! 0:  control byte: 4-bit version (always 0) | 4-bit segment type flags
//! 1:  session originator engine id (SDNV, 1-10 bytes)
//! *:  session number (SDNV, 1-10 bytes)
//! *:  extension counts: numHeaderExtensions << 4 | numTrailerExtensions
//! *:  header extensions: (tag byte, length SDNV, value bytes) each
//! *:  type-specific body:
//!      * data segments (types 0-4, 7): client service id, offset, length
//!         (SDNVs), for checkpoints (1-3) checkpoint + report serial numbers
//!         (SDNVs), then `length` payload bytes
//!      * report segment (8): report serial, checkpoint serial, upper bound,
//!         lower bound, claim count, then (offset, length) SDNV pairs
//!      * report ack (9): report serial (SDNV)
//!      * cancel (12, 14): one reason-code byte
//!      * cancel ack (13, 15): empty
//! *:  trailer extensions, same shape as header extensions
//! ```
//!
//! Types 5, 6, 10 and 11 are undefined and rejected by the parser.
//!
//! ## Reliability protocol
//!
//! The sender marks some red data segments as *checkpoints*; each checkpoint
//! solicits a *report segment* from the receiver claiming the contiguous byte
//! ranges received so far. The sender acknowledges every report, computes the
//! gaps from the claims, and retransmits exactly the missing bytes, closing
//! each retransmission cycle with a fresh checkpoint that references the
//! report it answers. Checkpoints and reports are timed independently and
//! retried up to a configured limit, after which the session is cancelled
//! with reason `RLEXC`.

pub mod config;
pub mod driver;
pub mod engine;
pub mod fragment_set;
pub mod parser;
pub mod random;
pub mod recreation_preventer;
pub mod sdnv;
pub mod segment;
pub mod session_receiver;
pub mod session_sender;
pub mod timer;

pub use config::LtpConfig;
pub use engine::{ClientServiceNotices, LtpEngine, PacketTransport};
pub use segment::{CancelReason, SessionId};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    }
}
