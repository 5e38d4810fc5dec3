//! Randomness for session and serial numbers. Session numbers must be hard
//!  to guess (they are the only session handle on the wire) and serial
//!  numbers start random and increment monotonically, so this is a thin
//!  wrapper over the thread RNG with the value-range rules in one place.

use rand::Rng;

pub struct RandomNumberSource {
    force_32_bit: bool,
}

impl RandomNumberSource {
    pub fn new(force_32_bit: bool) -> RandomNumberSource {
        RandomNumberSource { force_32_bit }
    }

    /// A non-zero session number. Kept below 2^63 (or 2^32 in 32-bit interop
    ///  mode) so that arithmetic on derived values cannot wrap.
    pub fn session_number(&mut self) -> u64 {
        if self.force_32_bit {
            rand::thread_rng().gen_range(1..u32::MAX as u64)
        } else {
            rand::thread_rng().gen_range(1..1u64 << 63)
        }
    }

    /// A non-zero starting point for a checkpoint or report serial number
    ///  sequence. Always below 2^32 to leave increment headroom within any
    ///  peer's SDNV field width.
    pub fn initial_serial_number(&mut self) -> u64 {
        rand::thread_rng().gen_range(1..u32::MAX as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_numbers_are_non_zero_and_bounded() {
        let mut source = RandomNumberSource::new(true);
        for _ in 0..1000 {
            let n = source.session_number();
            assert!(n >= 1 && n < u32::MAX as u64);
        }

        let mut source = RandomNumberSource::new(false);
        for _ in 0..1000 {
            let n = source.session_number();
            assert!(n >= 1 && n < 1u64 << 63);
        }
    }

    #[test]
    fn test_serial_numbers_are_non_zero() {
        let mut source = RandomNumberSource::new(false);
        for _ in 0..1000 {
            assert!(source.initial_serial_number() >= 1);
        }
    }
}
