//! Per-project broadcast built on bounded flume channels.
//!
//! Each subscriber gets its own bounded queue so one slow consumer can
//! never stall the publisher or its siblings. Overflow drops the oldest
//! frames and injects a `gap` marker; a subscriber that overflows on
//! several consecutive publishes is evicted outright.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use cf_core::types::Id;

use crate::protocol::{EventFrame, EventKind};

// ---------------------------------------------------------------------------
// Subscriber slot
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    id: u64,
    tx: flume::Sender<EventFrame>,
    /// Kept so the publisher can drop-oldest on overflow; flume receivers
    /// are multi-consumer clones of the same queue.
    rx: flume::Receiver<EventFrame>,
    overflow_ticks: u32,
}

// ---------------------------------------------------------------------------
// ProjectBus
// ---------------------------------------------------------------------------

/// The push-telemetry fan-out channel: one topic per project.
pub struct ProjectBus {
    topics: DashMap<Id, Mutex<Vec<SubscriberSlot>>>,
    queue_size: usize,
    eviction_ticks: u32,
    next_subscriber: AtomicU64,
    ready: AtomicBool,
}

impl ProjectBus {
    pub fn new(queue_size: usize, eviction_ticks: u32) -> Self {
        Self {
            topics: DashMap::new(),
            queue_size: queue_size.max(2),
            eviction_ticks: eviction_ticks.max(1),
            next_subscriber: AtomicU64::new(1),
            ready: AtomicBool::new(false),
        }
    }

    /// Flip the readiness probe once startup wiring has completed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Register a subscriber on a project topic. The receiver sees every
    /// frame published after this call, in order.
    pub fn subscribe(&self, project_id: Id) -> flume::Receiver<EventFrame> {
        let (tx, rx) = flume::bounded(self.queue_size);
        let slot = SubscriberSlot {
            id: self.next_subscriber.fetch_add(1, Ordering::Relaxed),
            tx,
            rx: rx.clone(),
            overflow_ticks: 0,
        };
        self.topics
            .entry(project_id)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .expect("topic lock poisoned")
            .push(slot);
        rx
    }

    /// Publish a frame to every subscriber of the project topic.
    /// Non-blocking: a full queue sheds its oldest frames instead of
    /// slowing the publisher.
    pub fn publish(&self, project_id: Id, kind: EventKind) {
        let frame = EventFrame::new(project_id, kind);
        let Some(topic) = self.topics.get(&project_id) else {
            return;
        };
        let mut slots = topic.lock().expect("topic lock poisoned");
        slots.retain_mut(|slot| Self::deliver(slot, &frame, self.eviction_ticks));
    }

    /// Deliver one frame to one subscriber. Returns `false` when the
    /// subscriber should be removed (disconnected or persistently slow).
    fn deliver(slot: &mut SubscriberSlot, frame: &EventFrame, eviction_ticks: u32) -> bool {
        if slot.tx.is_disconnected() {
            return false;
        }
        match slot.tx.try_send(frame.clone()) {
            Ok(()) => {
                slot.overflow_ticks = 0;
                true
            }
            Err(flume::TrySendError::Full(_)) => {
                slot.overflow_ticks += 1;
                if slot.overflow_ticks >= eviction_ticks {
                    tracing::warn!(
                        subscriber = slot.id,
                        project_id = frame.project_id,
                        "evicting slow subscriber"
                    );
                    return false;
                }
                // Drop the two oldest frames to make room for the gap
                // marker plus the new frame, preserving FIFO order.
                let mut dropped = 0u64;
                for _ in 0..2 {
                    if slot.rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                }
                let gap = EventFrame::new(frame.project_id, EventKind::Gap { dropped });
                let _ = slot.tx.try_send(gap);
                let _ = slot.tx.try_send(frame.clone());
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of live subscribers on a project topic.
    pub fn subscriber_count(&self, project_id: Id) -> usize {
        self.topics
            .get(&project_id)
            .map(|topic| {
                topic
                    .lock()
                    .expect("topic lock poisoned")
                    .iter()
                    .filter(|s| !s.tx.is_disconnected())
                    .count()
            })
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::TaskStatus;

    fn status_frame(task_id: Id) -> EventKind {
        EventKind::TaskStatusChanged {
            task_id,
            from: TaskStatus::Ready,
            to: TaskStatus::InProgress,
        }
    }

    #[test]
    fn subscribers_receive_in_publish_order() {
        let bus = ProjectBus::new(16, 3);
        let rx = bus.subscribe(1);
        for i in 0..5 {
            bus.publish(1, status_frame(i));
        }
        let ids: Vec<Id> = rx
            .try_iter()
            .map(|f| match f.kind {
                EventKind::TaskStatusChanged { task_id, .. } => task_id,
                other => panic!("unexpected frame: {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn topics_are_isolated_per_project() {
        let bus = ProjectBus::new(16, 3);
        let rx1 = bus.subscribe(1);
        let rx2 = bus.subscribe(2);
        bus.publish(1, status_frame(10));
        assert_eq!(rx1.try_iter().count(), 1);
        assert_eq!(rx2.try_iter().count(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_inserts_gap() {
        let bus = ProjectBus::new(4, 10);
        let rx = bus.subscribe(1);
        for i in 0..6 {
            bus.publish(1, status_frame(i));
        }
        let frames: Vec<EventFrame> = rx.try_iter().collect();
        // Queue of 4: frames 0..4 fill it, frame 4 overflows (drops 0 and 1,
        // adds gap + 4), frame 5 overflows again (drops 2 and 3, adds gap + 5).
        let has_gap = frames
            .iter()
            .any(|f| matches!(f.kind, EventKind::Gap { .. }));
        assert!(has_gap, "expected a gap marker, got {:?}", frames);
        // newest frame survives
        let last_ids: Vec<Id> = frames
            .iter()
            .filter_map(|f| match f.kind {
                EventKind::TaskStatusChanged { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect();
        assert!(last_ids.contains(&5));
        assert!(!last_ids.contains(&0));
    }

    #[test]
    fn persistently_slow_subscriber_is_evicted() {
        let bus = ProjectBus::new(2, 3);
        let _rx = bus.subscribe(1);
        // Never drain: every publish past the queue overflows.
        for i in 0..20 {
            bus.publish(1, status_frame(i));
        }
        assert_eq!(bus.subscriber_count(1), 0);
    }

    #[test]
    fn fast_subscriber_resets_overflow_counter() {
        let bus = ProjectBus::new(2, 3);
        let rx = bus.subscribe(1);
        for round in 0..10 {
            bus.publish(1, status_frame(round));
            // Drain each round: overflow ticks never accumulate.
            while rx.try_recv().is_ok() {}
        }
        assert_eq!(bus.subscriber_count(1), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = ProjectBus::new(4, 3);
        let rx = bus.subscribe(1);
        drop(rx);
        bus.publish(1, status_frame(1));
        assert_eq!(bus.subscriber_count(1), 0);
    }

    #[test]
    fn readiness_starts_false() {
        let bus = ProjectBus::new(4, 3);
        assert!(!bus.is_ready());
        bus.mark_ready();
        assert!(bus.is_ready());
    }
}
