// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Expiry timers. Rather than firing callbacks that mutate descriptor
//! state from a second context, expirations are surfaced as events and
//! folded into the same serialized boundary that processes hardware
//! completions, so there is a single arbiter of state transitions.

use crate::scb::ScbId;

/// Monotonic logical time, advanced by the embedder.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Ticks(pub u64);

/// Handle for a single armed timer; stale handles (already fired or
/// cancelled) are ignored on cancel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerId(u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    /// An ordinary command exceeded its completion window.
    CommandExpiry(ScbId),
    /// A posted recovery command exceeded its step-specific window.
    RecoveryExpiry(ScbId),
}

struct Armed {
    id: TimerId,
    deadline: Ticks,
    kind: TimerKind,
}

/// Pending-timer set. Small enough that a scan per event beats a heap.
#[derive(Default)]
pub struct TimerWheel {
    armed: Vec<Armed>,
    next_id: u64,
    now: Ticks,
}

impl TimerWheel {
    pub fn arm(&mut self, after: u64, kind: TimerKind) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.armed.push(Armed {
            id,
            deadline: Ticks(self.now.0 + after),
            kind,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.armed.retain(|t| t.id != id);
    }

    /// Advance time and collect every expiry that fired, in deadline order.
    /// Time never moves backwards.
    pub fn advance(&mut self, to: Ticks) -> Vec<TimerKind> {
        assert!(to >= self.now, "time moved backwards");
        self.now = to;
        let mut fired: Vec<(Ticks, TimerKind)> = Vec::new();
        self.armed.retain(|t| {
            if t.deadline <= to {
                fired.push((t.deadline, t.kind));
                false
            } else {
                true
            }
        });
        fired.sort_by_key(|(deadline, _)| *deadline);
        fired.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_in_deadline_order() {
        let mut wheel = TimerWheel::default();
        wheel.arm(8, TimerKind::CommandExpiry(ScbId(1)));
        wheel.arm(4, TimerKind::RecoveryExpiry(ScbId(2)));
        assert_eq!(wheel.advance(Ticks(3)), vec![]);
        assert_eq!(
            wheel.advance(Ticks(10)),
            vec![
                TimerKind::RecoveryExpiry(ScbId(2)),
                TimerKind::CommandExpiry(ScbId(1)),
            ]
        );
        assert_eq!(wheel.armed_count(), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut wheel = TimerWheel::default();
        let id = wheel.arm(4, TimerKind::CommandExpiry(ScbId(0)));
        wheel.cancel(id);
        wheel.cancel(id);
        assert_eq!(wheel.advance(Ticks(5)), vec![]);
    }
}
