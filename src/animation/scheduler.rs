use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use ulid::Ulid;

use super::template::TemplateId;

#[derive(Debug, Clone, Copy)]
struct PendingReturn {
    template: TemplateId,
    deadline_us: u64,
    token: u64,
}

/// A due return, only honored while its token is still the armed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnTicket {
    pub instance: Ulid,
    pub template: TemplateId,
    token: u64,
}

/// Deferred, cancellable return-to-pool timers keyed by instance.
///
/// At most one timer is pending per instance. Cancelling is a map removal;
/// nothing runs until `due` is polled by the owning tick.
pub struct ReturnScheduler {
    pending: DashMap<Ulid, PendingReturn>,
    next_token: AtomicU64,
}

impl ReturnScheduler {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Arm a one-shot return for `instance` at `deadline_us`.
    /// Any timer already pending for the instance is cancelled.
    pub fn arm(&self, instance: Ulid, template: TemplateId, deadline_us: u64) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let replaced = self.pending.insert(
            instance,
            PendingReturn {
                template,
                deadline_us,
                token,
            },
        );
        if replaced.is_some() {
            tracing::trace!(%instance, "re-armed return timer, previous timer cancelled");
        }
    }

    /// Abort the pending return for `instance` without firing it
    pub fn cancel(&self, instance: Ulid) -> bool {
        self.pending.remove(&instance).is_some()
    }

    /// Abort every pending return; returns how many were dropped
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Timers whose deadline is at or before `now_us`, earliest first.
    /// They stay pending until claimed.
    pub fn due(&self, now_us: u64) -> Vec<ReturnTicket> {
        let mut due: Vec<(u64, ReturnTicket)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline_us <= now_us)
            .map(|entry| {
                let pending = entry.value();
                (
                    pending.deadline_us,
                    ReturnTicket {
                        instance: *entry.key(),
                        template: pending.template,
                        token: pending.token,
                    },
                )
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, ticket)| ticket).collect()
    }

    /// Consume a due ticket. Fails if the timer was cancelled or re-armed
    /// since the ticket was issued.
    pub fn claim(&self, ticket: &ReturnTicket) -> bool {
        self.pending
            .remove_if(&ticket.instance, |_, pending| pending.token == ticket.token)
            .is_some()
    }

    pub fn is_pending(&self, instance: Ulid) -> bool {
        self.pending.contains_key(&instance)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ReturnScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::template::EffectTemplate;

    fn template_id() -> TemplateId {
        EffectTemplate::new("t", "", Vec::new()).id()
    }

    #[test]
    fn test_due_respects_deadline() {
        let scheduler = ReturnScheduler::new();
        let template = template_id();
        let early = Ulid::new();
        let late = Ulid::new();
        scheduler.arm(late, template, 2_000);
        scheduler.arm(early, template, 1_000);

        assert!(scheduler.due(999).is_empty());
        let due = scheduler.due(2_000);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].instance, early);
        assert_eq!(due[1].instance, late);
    }

    #[test]
    fn test_rearm_cancels_previous_timer() {
        let scheduler = ReturnScheduler::new();
        let template = template_id();
        let instance = Ulid::new();

        scheduler.arm(instance, template, 1_000);
        let stale = scheduler.due(1_000).pop().unwrap();

        scheduler.arm(instance, template, 5_000);
        assert_eq!(scheduler.pending_count(), 1);
        assert!(!scheduler.claim(&stale));
        assert!(scheduler.due(1_000).is_empty());

        let fresh = scheduler.due(5_000).pop().unwrap();
        assert!(scheduler.claim(&fresh));
        assert!(!scheduler.claim(&fresh));
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let scheduler = ReturnScheduler::new();
        let instance = Ulid::new();
        scheduler.arm(instance, template_id(), 10);

        assert!(scheduler.cancel(instance));
        assert!(!scheduler.cancel(instance));
        assert!(scheduler.due(u64::MAX).is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let scheduler = ReturnScheduler::new();
        let template = template_id();
        for _ in 0..4 {
            scheduler.arm(Ulid::new(), template, 10);
        }
        assert_eq!(scheduler.cancel_all(), 4);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(scheduler.due(u64::MAX).is_empty());
    }
}
