//! The Event Bus (C10): typed topics, in-process subscribers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::{NodeId, PlanId};
use crate::model::plan::{NodeStatus, PlanStatus};

/// One published event. Cheap to clone; subscribers receive an owned copy.
#[derive(Clone, Debug)]
pub enum Event {
    PlanCreated { plan_id: PlanId },
    PlanCompleted { plan_id: PlanId, status: PlanStatus },
    PlanDeleted { plan_id: PlanId },
    NodeTransition { plan_id: PlanId, node_id: NodeId, from: NodeStatus, to: NodeStatus },
    Pulse,
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// In-process publish/subscribe bus. Subscribers run synchronously on the
/// publishing thread; keep handlers fast (queue work elsewhere if not).
#[derive(Default, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. There is no unsubscribe; subscribers live as
    /// long as the bus.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(handler));
    }

    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.lock();
        for sub in subs.iter() {
            sub(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn subscribers_observe_published_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::Pulse);
        bus.publish(Event::PlanCreated { plan_id: PlanId::new() });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn multiple_subscribers_all_receive_events() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        bus.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::Pulse);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
