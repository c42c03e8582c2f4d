//! Sequential-node leader election.
//!
//! One participant per round owns one ephemeral sequential node. The
//! holder of the smallest live sequence number is the leader; everyone
//! else watches its immediate predecessor and recomputes from a fresh
//! child listing when that node disappears.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Where one participant stands after examining the live sequence set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionState {
    /// Smallest live sequence: leadership is ours until the session dies.
    Leader,
    /// Watching the largest sequence smaller than ours.
    Watching { predecessor: u32 },
}

/// Pure transition over the live sequence set.
///
/// Ties to the leadership invariant: with live sequences s1 < s2 < ... < sK,
/// exactly the holder of s1 computes `Leader`, and each other holder watches
/// its immediate predecessor, so a deletion wakes exactly one participant.
pub(crate) fn transition(self_seq: u32, live: &[u32]) -> ElectionState {
    match live.iter().copied().filter(|&seq| seq < self_seq).max() {
        None => ElectionState::Leader,
        Some(predecessor) => ElectionState::Watching { predecessor },
    }
}

/// Parses the sequence suffix of a member node name, e.g.
/// `member-0000000007` -> 7. Unparsable names are discarded by the caller.
pub(crate) fn path_to_seq(name: &str) -> Option<u32> {
    name.rsplit('-').next()?.parse().ok()
}

/// Local handle on one round: the cached leadership flag, written only by
/// the round's single watch task.
#[derive(Debug, Default)]
pub(crate) struct RoundHandle {
    leader: AtomicBool,
}

impl RoundHandle {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, value: bool) {
        self.leader.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_smallest_leads() {
        assert_eq!(transition(3, &[3]), ElectionState::Leader);
        assert_eq!(transition(3, &[3, 5, 9]), ElectionState::Leader);
        // ordering of the listing is irrelevant
        assert_eq!(
            transition(9, &[9, 3, 5]),
            ElectionState::Watching { predecessor: 5 }
        );
        assert_eq!(
            transition(5, &[9, 3, 5]),
            ElectionState::Watching { predecessor: 3 }
        );
    }

    #[test]
    fn test_transition_after_predecessor_death() {
        // 5 watched 3; 3 died but 1 is still alive, so 5 must not lead
        assert_eq!(
            transition(5, &[1, 5, 9]),
            ElectionState::Watching { predecessor: 1 }
        );
        // everyone smaller died at once
        assert_eq!(transition(5, &[5, 9]), ElectionState::Leader);
    }

    #[test]
    fn test_path_to_seq() {
        assert_eq!(path_to_seq("member-0000000007"), Some(7));
        assert_eq!(path_to_seq("member-42"), Some(42));
        assert_eq!(path_to_seq("member-"), None);
        assert_eq!(path_to_seq("garbage"), None);
    }
}
