//! Remembers the most recently closed receiving sessions. Badly delayed or
//!  duplicated data segments can arrive long after their session closed; a
//!  naive engine would re-create the session, buffer a fragment of a block
//!  that will never complete, and eventually time it out. This bounded FIFO
//!  breaks that cycle.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::segment::SessionId;

pub struct SessionRecreationPreventer {
    capacity: usize,
    seen: FxHashSet<SessionId>,
    fifo: VecDeque<SessionId>,
}

impl SessionRecreationPreventer {
    /// `capacity` 0 disables remembering entirely.
    pub fn new(capacity: usize) -> SessionRecreationPreventer {
        SessionRecreationPreventer {
            capacity,
            seen: FxHashSet::default(),
            fifo: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    /// Records a closed session, evicting the oldest remembered one when
    ///  full. Returns false if it was already remembered.
    pub fn add(&mut self, session_id: SessionId) -> bool {
        if self.capacity == 0 || !self.seen.insert(session_id) {
            return false;
        }
        if self.fifo.len() == self.capacity {
            if let Some(evicted) = self.fifo.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.fifo.push_back(session_id);
        true
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.seen.contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(1, n)
    }

    #[test]
    fn test_remembers_and_evicts_fifo() {
        let mut preventer = SessionRecreationPreventer::new(3);
        assert!(preventer.add(sid(1)));
        assert!(preventer.add(sid(2)));
        assert!(preventer.add(sid(3)));
        assert!(!preventer.add(sid(2)), "duplicate add");

        assert!(preventer.add(sid(4))); // evicts 1
        assert!(!preventer.contains(&sid(1)));
        assert!(preventer.contains(&sid(2)));
        assert!(preventer.contains(&sid(3)));
        assert!(preventer.contains(&sid(4)));
        assert_eq!(preventer.len(), 3);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut preventer = SessionRecreationPreventer::new(0);
        assert!(!preventer.add(sid(1)));
        assert!(!preventer.contains(&sid(1)));
        assert!(preventer.is_empty());
    }
}
