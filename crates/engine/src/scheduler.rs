use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_types::EngineOwner;
use strategies::Cadence;

/// How often an `EventTriggered` slot is polled. The strategy itself decides
/// whether its real trigger condition (drawdown-from-ATH, near-funding
/// window) actually holds on that poll (spec.md §4.2).
fn event_poll_interval() -> ChronoDuration {
    ChronoDuration::minutes(5)
}

/// The min-heap `(next_due, owner)` dispatcher of spec.md §4.2. `Reverse`
/// turns `BinaryHeap`'s default max-heap ordering into earliest-due-first.
/// Exactly one of the four hosted owners may be due at a time; the engine's
/// cooperative loop never ticks two owners concurrently.
pub struct Scheduler {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, EngineOwner)>>,
}

impl Scheduler {
    pub fn new(owners: impl IntoIterator<Item = EngineOwner>, now: DateTime<Utc>) -> Self {
        let heap = owners.into_iter().map(|owner| Reverse((now, owner))).collect();
        Self { heap }
    }

    /// The next due time across all slots, or `None` if the scheduler holds
    /// no slots.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Pops and reschedules the earliest-due slot if it is actually due by
    /// `now`; otherwise leaves the heap untouched.
    pub fn pop_due(
        &mut self,
        now: DateTime<Utc>,
        cadence_of: impl Fn(EngineOwner) -> Cadence,
    ) -> Option<EngineOwner> {
        let Reverse((due, owner)) = *self.heap.peek()?;
        if due > now {
            return None;
        }
        self.heap.pop();
        let next_due = match cadence_of(owner) {
            Cadence::Interval(interval) => now + interval,
            Cadence::EventTriggered => now + event_poll_interval(),
        };
        self.heap.push(Reverse((next_due, owner)));
        Some(owner)
    }

    /// Pushes a slot's next run back by `by`, the soft-budget-overrun
    /// penalty of spec.md §4.2 ("its next cadence is delayed by the
    /// overrun").
    pub fn delay(&mut self, owner: EngineOwner, by: ChronoDuration) {
        let rest: Vec<_> = self
            .heap
            .drain()
            .map(|Reverse((due, o))| if o == owner { Reverse((due + by, o)) } else { Reverse((due, o)) })
            .collect();
        self.heap = rest.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_slots_in_earliest_due_order() {
        let now = Utc::now();
        let mut scheduler = Scheduler::new([EngineOwner::CoreHodl, EngineOwner::Trend], now);

        let first = scheduler.pop_due(now, |owner| match owner {
            EngineOwner::CoreHodl => Cadence::Interval(ChronoDuration::hours(24)),
            _ => Cadence::Interval(ChronoDuration::hours(4)),
        });
        assert!(first.is_some());

        // Nothing else is due yet at the same instant since both were
        // rescheduled into the future.
        assert!(scheduler.pop_due(now, |_| Cadence::Interval(ChronoDuration::hours(1))).is_none());
    }

    #[test]
    fn delay_pushes_only_the_named_owner_back() {
        let now = Utc::now();
        let mut scheduler = Scheduler::new([EngineOwner::Trend], now);
        scheduler.delay(EngineOwner::Trend, ChronoDuration::seconds(30));
        assert!(scheduler.next_due().unwrap() > now);
    }
}
