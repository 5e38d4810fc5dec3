//! Per-engine configuration. All fields are public; [`LtpConfig::new`]
//!  provides production-ready defaults for a near-Earth link and
//!  [`LtpConfig::validate`] is called from engine construction.

use std::time::Duration;

use anyhow::bail;

#[derive(Clone, Debug)]
pub struct LtpConfig {
    /// This engine's id, the one used as session originator for outbound
    ///  blocks. Must be agreed upon out of band with all peers.
    pub engine_id: u64,

    /// Maximum client-service payload bytes per data segment. The segment
    ///  header (control byte, session id, field SDNVs) comes on top, so this
    ///  must leave headroom below the link's datagram size. As with any
    ///  UDP-based protocol there is no reliable path MTU discovery; choosing
    ///  this is the operator's job.
    pub mtu_bytes: usize,

    /// Reports with more claims than this are split into several reports,
    ///  each with its own serial number.
    pub max_reception_claims_per_report: u64,

    /// Initial red-buffer reservation for a new receiving session.
    pub estimated_bytes_to_receive_per_session: u64,

    /// Hard cap on a receiving session's red part. A red segment reaching
    ///  beyond this cancels the session with `SYSTEM_CANCELLED`.
    pub max_red_rx_bytes_per_session: u64,

    /// One-way signal propagation delay to the peer.
    pub one_way_light_time: Duration,
    /// Slack added to the light time for processing and queueing; timers
    ///  expire after `2 * (light time + margin)`.
    pub one_way_margin_time: Duration,

    /// How often a checkpoint or report is retransmitted before the session
    ///  is cancelled with `RLEXC`.
    pub max_retries_per_serial_number: u32,

    /// Emit every Nth red data segment as a checkpoint (async reception
    ///  reports). 0 means only the mandatory EORP/EOB checkpoint.
    pub checkpoint_every_nth_data_segment: u32,

    /// Refuse to create sessions (either direction) beyond this count.
    pub max_simultaneous_sessions: usize,

    /// How many recently closed receiving sessions to remember so that
    ///  stale or delayed data segments cannot resurrect them. 0 disables.
    pub rx_session_recreation_preventer_history_size: usize,

    /// Upper bound on the packet batch handed to the transport per
    ///  `send_packets` call.
    pub max_udp_packets_to_send_per_system_call: usize,

    /// Hold back reception reports this long to coalesce claims across
    ///  several arriving checkpoints. ZERO sends reports immediately.
    pub delay_sending_of_report_segments: Duration,

    /// Generate session numbers (and initial serial numbers) below 2^32 for
    ///  peers that only implement 32-bit SDNV fields.
    pub force_32_bit_random_session_numbers: bool,

    /// Token-bucket rate for outbound data, enforced by the transport
    ///  collaborator (the engine itself never paces). 0 disables.
    pub max_send_rate_bits_per_sec: u64,

    /// Period of the housekeeping tick when running under the driver.
    pub housekeeping_interval: Duration,

    /// Receiving sessions with no traffic for this long and no running
    ///  timers are cancelled with `SYSTEM_CANCELLED` by housekeeping.
    ///  ZERO derives `2 * (light time + margin) * (max retries + 1)`.
    pub stagnant_rx_session_timeout: Duration,
}

impl LtpConfig {
    pub fn new(engine_id: u64) -> LtpConfig {
        LtpConfig {
            engine_id,
            mtu_bytes: 1360,
            max_reception_claims_per_report: 20,
            estimated_bytes_to_receive_per_session: 128 * 1024,
            max_red_rx_bytes_per_session: 16 * 1024 * 1024,
            one_way_light_time: Duration::from_millis(1000),
            one_way_margin_time: Duration::from_millis(200),
            max_retries_per_serial_number: 5,
            checkpoint_every_nth_data_segment: 0,
            max_simultaneous_sessions: 5000,
            rx_session_recreation_preventer_history_size: 1000,
            max_udp_packets_to_send_per_system_call: 100,
            delay_sending_of_report_segments: Duration::ZERO,
            force_32_bit_random_session_numbers: false,
            max_send_rate_bits_per_sec: 0,
            housekeeping_interval: Duration::from_secs(1),
            stagnant_rx_session_timeout: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu_bytes == 0 {
            bail!("mtu_bytes must be at least 1");
        }
        if self.max_reception_claims_per_report == 0 {
            bail!("max_reception_claims_per_report must be at least 1");
        }
        if self.max_simultaneous_sessions == 0 {
            bail!("max_simultaneous_sessions must be at least 1");
        }
        if self.max_udp_packets_to_send_per_system_call == 0 {
            bail!("max_udp_packets_to_send_per_system_call must be at least 1");
        }
        if self.one_way_light_time + self.one_way_margin_time == Duration::ZERO {
            bail!("the retransmission timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn effective_stagnation_timeout(&self) -> Duration {
        if self.stagnant_rx_session_timeout > Duration::ZERO {
            return self.stagnant_rx_session_timeout;
        }
        (self.one_way_light_time + self.one_way_margin_time)
            * 2
            * (self.max_retries_per_serial_number + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LtpConfig::new(7).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_fields() {
        let mut config = LtpConfig::new(7);
        config.mtu_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = LtpConfig::new(7);
        config.max_reception_claims_per_report = 0;
        assert!(config.validate().is_err());

        let mut config = LtpConfig::new(7);
        config.one_way_light_time = Duration::ZERO;
        config.one_way_margin_time = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stagnation_timeout_derivation() {
        let mut config = LtpConfig::new(7);
        config.one_way_light_time = Duration::from_millis(100);
        config.one_way_margin_time = Duration::from_millis(25);
        config.max_retries_per_serial_number = 5;
        assert_eq!(config.effective_stagnation_timeout(), Duration::from_millis(1500));

        config.stagnant_rx_session_timeout = Duration::from_secs(60);
        assert_eq!(config.effective_stagnation_timeout(), Duration::from_secs(60));
    }
}
