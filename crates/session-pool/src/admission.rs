//! Admission decisions
//!
//! `decide` runs under the account group's lock and only rearranges
//! bookkeeping: it may hand out an idle session, reserve a slot, or pull an
//! eviction victim out of the group. Everything that touches the network
//! (probing, opening, logging out) is done by the caller after the lock is
//! released.

use imap_session::Session;
use tokio::time::Instant;

use crate::eviction::{self, Room};
use crate::registry::{Purpose, Reused, SlotId, Slots};

pub(crate) enum Admission {
    /// Idle Transient slot taken; probe it before handing it out.
    Reuse(Reused),
    /// Slot `slot_id` reserved. Log out `victim` first if there is one.
    Open {
        slot_id: SlotId,
        victim: Option<(SlotId, Box<dyn Session>)>,
        overflow: bool,
    },
    /// Saturated; wait for a release.
    Wait,
    /// Saturated after the wait expired and eviction found nothing.
    Exhausted { slots: usize },
}

pub(crate) fn decide(
    slots: &mut Slots,
    purpose: Purpose,
    now: Instant,
    max: usize,
    timed_out: bool,
    next_id: impl FnOnce() -> SlotId,
) -> Admission {
    if purpose == Purpose::Transient {
        if let Some(reused) = slots.take_reusable(now) {
            return Admission::Reuse(reused);
        }
    }

    if slots.len() < max {
        let slot_id = next_id();
        slots.reserve(slot_id, purpose, now);
        return Admission::Open {
            slot_id,
            victim: None,
            overflow: false,
        };
    }

    // Push makes room immediately; Transient only once its wait has expired.
    if purpose == Purpose::Push || timed_out {
        match eviction::make_room(&slots.candidates(), purpose, max) {
            Room::Evict(victim_id) => {
                if let Some(session) = slots.remove_idle(victim_id) {
                    let slot_id = next_id();
                    slots.reserve(slot_id, purpose, now);
                    return Admission::Open {
                        slot_id,
                        victim: Some((victim_id, session)),
                        overflow: false,
                    };
                }
            }
            Room::Overflow => {
                let slot_id = next_id();
                slots.reserve(slot_id, purpose, now);
                return Admission::Open {
                    slot_id,
                    victim: None,
                    overflow: true,
                };
            }
            Room::Full => {}
        }
    }

    if timed_out {
        Admission::Exhausted { slots: slots.len() }
    } else {
        Admission::Wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use std::time::Duration;

    fn idle(slots: &mut Slots, id: SlotId, purpose: Purpose, at: Instant) {
        slots.reserve(id, purpose, at);
        slots.activate(id);
        assert!(slots.mark_idle(id, Box::new(FakeSession::detached(id)), at).is_ok());
    }

    fn busy(slots: &mut Slots, id: SlotId, purpose: Purpose, at: Instant) {
        slots.reserve(id, purpose, at);
        slots.activate(id);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_reuses_before_opening() {
        let now = Instant::now();
        let mut slots = Slots::default();
        idle(&mut slots, 1, Purpose::Transient, now);

        let admission = decide(&mut slots, Purpose::Transient, now, 3, false, || 99);
        match admission {
            Admission::Reuse(reused) => assert_eq!(reused.slot_id, 1),
            _ => panic!("expected reuse"),
        }
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_opens_even_with_idle_transient_available() {
        let now = Instant::now();
        let mut slots = Slots::default();
        idle(&mut slots, 1, Purpose::Transient, now);

        let admission = decide(&mut slots, Purpose::Push, now, 3, false, || 99);
        match admission {
            Admission::Open {
                slot_id,
                victim,
                overflow,
            } => {
                assert_eq!(slot_id, 99);
                assert!(victim.is_none());
                assert!(!overflow);
            }
            _ => panic!("expected open"),
        }
        assert_eq!(slots.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_transient_waits_then_exhausts() {
        let now = Instant::now();
        let mut slots = Slots::default();
        busy(&mut slots, 1, Purpose::Transient, now);
        busy(&mut slots, 2, Purpose::Transient, now);

        assert!(matches!(
            decide(&mut slots, Purpose::Transient, now, 2, false, || 99),
            Admission::Wait
        ));
        assert!(matches!(
            decide(&mut slots, Purpose::Transient, now, 2, true, || 99),
            Admission::Exhausted { slots: 2 }
        ));
        assert_eq!(slots.len(), 2, "no reservation on wait or exhaustion");
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_push_swaps_victim_for_reservation() {
        let now = Instant::now();
        let mut slots = Slots::default();
        idle(&mut slots, 1, Purpose::Transient, now);
        idle(&mut slots, 2, Purpose::Transient, now + Duration::from_secs(1));

        let later = now + Duration::from_secs(2);
        let admission = decide(&mut slots, Purpose::Push, later, 2, false, || 99);
        match admission {
            Admission::Open { slot_id, victim, .. } => {
                assert_eq!(slot_id, 99);
                assert_eq!(victim.map(|(id, _)| id), Some(1));
            }
            _ => panic!("expected open with victim"),
        }
        assert_eq!(slots.len(), 2, "victim removal and reservation are one step");
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_push_overflows_when_all_busy() {
        let now = Instant::now();
        let mut slots = Slots::default();
        busy(&mut slots, 1, Purpose::Transient, now);

        let admission = decide(&mut slots, Purpose::Push, now, 1, false, || 99);
        match admission {
            Admission::Open { overflow, victim, .. } => {
                assert!(overflow);
                assert!(victim.is_none());
            }
            _ => panic!("expected overflow"),
        }
        assert_eq!(slots.len(), 2);

        assert!(matches!(
            decide(&mut slots, Purpose::Push, now, 1, false, || 100),
            Admission::Wait
        ));
    }
}
