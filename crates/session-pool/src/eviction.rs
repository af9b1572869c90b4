//! Victim selection for saturated accounts
//!
//! Pure function over a snapshot of the group's slots; the caller removes the
//! victim under the same lock and logs it out afterwards.

use crate::registry::{Candidate, Purpose, SlotId};

/// Outcome of trying to make room in a saturated group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Room {
    /// Close this idle slot and take its place.
    Evict(SlotId),
    /// Push only: open one slot beyond the cap.
    Overflow,
    /// Nothing can be done; the caller waits or gives up.
    Full,
}

/// Pick how to make room for a `requester` in a group at or above `max`.
///
/// 1. Least-recently-released idle Transient slot.
/// 2. For Push requesters, least-recently-released idle Push slot.
/// 3. For Push requesters with nothing idle, one overflow slot per account.
pub(crate) fn make_room(candidates: &[Candidate], requester: Purpose, max: usize) -> Room {
    let oldest_idle = |purpose: Purpose| {
        candidates
            .iter()
            .filter(|c| c.idle && c.purpose == purpose)
            .min_by_key(|c| c.last_released_at)
            .map(|c| c.id)
    };

    if let Some(id) = oldest_idle(Purpose::Transient) {
        return Room::Evict(id);
    }
    if requester == Purpose::Transient {
        return Room::Full;
    }
    if let Some(id) = oldest_idle(Purpose::Push) {
        return Room::Evict(id);
    }
    if candidates.len() <= max {
        return Room::Overflow;
    }
    Room::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn candidate(
        id: SlotId,
        purpose: Purpose,
        idle: bool,
        released_secs: u64,
        base: Instant,
    ) -> Candidate {
        Candidate {
            id,
            purpose,
            idle,
            last_released_at: base + Duration::from_secs(released_secs),
        }
    }

    #[test]
    fn evicts_least_recently_released_idle_transient() {
        let t = Instant::now();
        let slots = [
            candidate(1, Purpose::Transient, true, 30, t),
            candidate(2, Purpose::Transient, true, 10, t),
            candidate(3, Purpose::Transient, false, 0, t),
        ];
        assert_eq!(make_room(&slots, Purpose::Push, 3), Room::Evict(2));
        assert_eq!(make_room(&slots, Purpose::Transient, 3), Room::Evict(2));
    }

    #[test]
    fn transient_requester_never_evicts_push() {
        let t = Instant::now();
        let slots = [
            candidate(1, Purpose::Push, true, 0, t),
            candidate(2, Purpose::Transient, false, 0, t),
        ];
        assert_eq!(make_room(&slots, Purpose::Transient, 2), Room::Full);
    }

    #[test]
    fn push_requester_falls_back_to_idle_push() {
        let t = Instant::now();
        let slots = [
            candidate(1, Purpose::Push, true, 20, t),
            candidate(2, Purpose::Push, true, 5, t),
            candidate(3, Purpose::Transient, false, 0, t),
        ];
        assert_eq!(make_room(&slots, Purpose::Push, 3), Room::Evict(2));
    }

    #[test]
    fn transient_victim_preferred_over_older_push() {
        let t = Instant::now();
        let slots = [
            candidate(1, Purpose::Push, true, 0, t),
            candidate(2, Purpose::Transient, true, 50, t),
        ];
        assert_eq!(make_room(&slots, Purpose::Push, 2), Room::Evict(2));
    }

    #[test]
    fn push_overflows_once_when_nothing_idle() {
        let t = Instant::now();
        let at_cap = [
            candidate(1, Purpose::Transient, false, 0, t),
            candidate(2, Purpose::Push, false, 0, t),
        ];
        assert_eq!(make_room(&at_cap, Purpose::Push, 2), Room::Overflow);

        let over_cap = [
            candidate(1, Purpose::Transient, false, 0, t),
            candidate(2, Purpose::Push, false, 0, t),
            candidate(3, Purpose::Push, false, 0, t),
        ];
        assert_eq!(make_room(&over_cap, Purpose::Push, 2), Room::Full);
    }
}
