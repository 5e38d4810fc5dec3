//! Countdown timers for checkpoints, reports and cancel segments, keyed by
//!  `(session id, serial number)`. The manager never schedules wall-clock
//!  alarms itself - the engine calls [`TimerManager::advance`] from its own
//!  tick with a monotonic "now" - and it never owns session state, only the
//!  keys plus a small per-timer user-data payload.
//!
//! Expiry is budgeted as one round trip plus slack:
//!  `2 * (one-way light time + one-way margin)`. Deep-space links can have
//!  their light time updated mid-flight, so the base durations are
//!  adjustable; already-started timers keep their original expiry.

use std::collections::BTreeMap;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::segment::SessionId;

pub type TimerKey = (SessionId, u64);

pub struct TimerManager<U> {
    one_way_light_time: Duration,
    one_way_margin: Duration,

    /// presence check and handle for cancellation
    active: FxHashMap<TimerKey, (Duration, u64)>,
    /// firing order: by expiry, ties broken by insertion sequence
    queue: BTreeMap<(Duration, u64), (TimerKey, U)>,
    next_sequence: u64,
}

impl<U> TimerManager<U> {
    pub fn new(one_way_light_time: Duration, one_way_margin: Duration) -> TimerManager<U> {
        TimerManager {
            one_way_light_time,
            one_way_margin,
            active: FxHashMap::default(),
            queue: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// The round-trip budget applied to every started timer.
    pub fn retransmission_timeout(&self) -> Duration {
        (self.one_way_light_time + self.one_way_margin) * 2
    }

    /// Adjusts the budget for timers started from now on.
    pub fn set_delays(&mut self, one_way_light_time: Duration, one_way_margin: Duration) {
        self.one_way_light_time = one_way_light_time;
        self.one_way_margin = one_way_margin;
    }

    /// Starts a timer expiring at `now + retransmission_timeout()`. Starting
    ///  a key that is already running fails and leaves the running timer
    ///  untouched.
    #[must_use]
    pub fn start(&mut self, now: Duration, key: TimerKey, user_data: U) -> bool {
        if self.active.contains_key(&key) {
            return false;
        }
        let expiry = now + self.retransmission_timeout();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.active.insert(key, (expiry, sequence));
        self.queue.insert((expiry, sequence), (key, user_data));
        true
    }

    /// Stops the timer if it is running, handing back its user data.
    pub fn cancel(&mut self, key: &TimerKey) -> Option<U> {
        let (expiry, sequence) = self.active.remove(key)?;
        self.queue
            .remove(&(expiry, sequence))
            .map(|(_, user_data)| user_data)
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    /// True if any timer is running for the given session. Linear in the
    ///  number of active timers; used only by housekeeping.
    pub fn has_timers_for_session(&self, session_id: &SessionId) -> bool {
        self.active.keys().any(|(sid, _)| sid == session_id)
    }

    /// Stops every timer of a session (session teardown).
    pub fn cancel_session(&mut self, session_id: &SessionId) {
        let keys: Vec<TimerKey> = self
            .active
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .copied()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// Pops every timer with `expiry <= now`, preserving insertion order
    ///  among timers that expire together.
    pub fn advance(&mut self, now: Duration) -> Vec<(TimerKey, U)> {
        let mut expired = Vec::new();
        while let Some((&(expiry, sequence), _)) = self.queue.first_key_value() {
            if expiry > now {
                break;
            }
            let (key, user_data) = self
                .queue
                .remove(&(expiry, sequence))
                .expect("first_key_value just returned this entry");
            self.active.remove(&key);
            expired.push((key, user_data));
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
