//! Progress Hub: per-process publish/subscribe bus keyed by job id
//!
//! Delivery contract:
//! - per-subscriber ordering preserved; subscribers are independent
//! - bounded per-subscriber queues; on overflow the newest queued progress
//!   event is coalesced with the arriving one, terminal events never drop
//! - a subscriber that has not drained within the lag window is detached
//!   with a `Lagged` marker on its own stream only
//! - publishing never blocks and never fails
//!
//! The hub also owns the per-job cancellation tokens observed by workers.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shootout_common::Clock;

use crate::domain::entities::{ErrorKind, JobStatus};

/// Event delivered to job subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress {
        progress: i16,
        message: Option<String>,
    },
    Terminal {
        status: JobStatus,
        result_path: Option<String>,
        error_kind: Option<ErrorKind>,
        error_detail: Option<String>,
    },
    /// This subscriber stopped draining and was detached
    Lagged,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Terminal { .. } | ProgressEvent::Lagged)
    }
}

struct SubQueue {
    events: VecDeque<ProgressEvent>,
    last_drained: DateTime<Utc>,
    closed: bool,
}

struct SubState {
    queue: Mutex<SubQueue>,
    notify: Notify,
}

impl SubState {
    /// Offer an event; returns false once the subscriber is detached
    fn offer(
        &self,
        event: ProgressEvent,
        now: DateTime<Utc>,
        capacity: usize,
        lag_window: Duration,
    ) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.closed {
            return false;
        }

        let full = queue.events.len() >= capacity;
        if full {
            let lagged = now
                .signed_duration_since(queue.last_drained)
                .to_std()
                .map_or(false, |stalled| stalled >= lag_window);
            if lagged {
                queue.events.clear();
                queue.events.push_back(ProgressEvent::Lagged);
                queue.closed = true;
                drop(queue);
                self.notify.notify_one();
                return false;
            }
        }

        match (&event, full) {
            (ProgressEvent::Progress { .. }, true) => {
                // Coalesce: replace the newest queued progress event
                let replaced = queue
                    .events
                    .iter_mut()
                    .rev()
                    .find(|queued| matches!(queued, ProgressEvent::Progress { .. }));
                match replaced {
                    Some(slot) => *slot = event,
                    None => return true, // queue full of terminal markers; drop
                }
            }
            // Terminal events always land, even past capacity
            _ => queue.events.push_back(event),
        }

        drop(queue);
        self.notify.notify_one();
        true
    }
}

/// A bounded per-subscriber event stream
pub struct Subscription {
    job_id: Uuid,
    state: Arc<SubState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event; `None` after a terminal event or detachment
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut queue = self.state.queue.lock().unwrap();
                if let Some(event) = queue.events.pop_front() {
                    queue.last_drained = self.clock.now();
                    if event.is_terminal() {
                        queue.closed = true;
                    }
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            self.state.notify.notified().await;
        }
    }
}

struct Topic {
    subscribers: Vec<Weak<SubState>>,
    cancel: CancellationToken,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Per-process progress fan-out
pub struct ProgressHub {
    topics: Mutex<HashMap<Uuid, Topic>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    lag_window: Duration,
}

impl ProgressHub {
    pub const DEFAULT_CAPACITY: usize = 64;
    pub const DEFAULT_LAG_WINDOW: Duration = Duration::from_secs(30);

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(clock, Self::DEFAULT_CAPACITY, Self::DEFAULT_LAG_WINDOW)
    }

    pub fn with_limits(clock: Arc<dyn Clock>, capacity: usize, lag_window: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            clock,
            capacity,
            lag_window,
        }
    }

    /// Fan an event out to the job's subscribers; never blocks
    pub fn publish(&self, job_id: Uuid, event: ProgressEvent) {
        let now = self.clock.now();
        let terminal = event.is_terminal();
        let mut topics = self.topics.lock().unwrap();
        let Some(topic) = topics.get_mut(&job_id) else {
            return;
        };

        topic.subscribers.retain(|weak| match weak.upgrade() {
            Some(subscriber) => subscriber.offer(event.clone(), now, self.capacity, self.lag_window),
            None => false,
        });

        // The terminal event is the last word on this topic
        if terminal {
            topics.remove(&job_id);
        }
    }

    /// Register a subscriber stream for a job
    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let state = Arc::new(SubState {
            queue: Mutex::new(SubQueue {
                events: VecDeque::new(),
                last_drained: self.clock.now(),
                closed: false,
            }),
            notify: Notify::new(),
        });

        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(job_id)
            .or_insert_with(Topic::new)
            .subscribers
            .push(Arc::downgrade(&state));

        Subscription {
            job_id,
            state,
            clock: self.clock.clone(),
        }
    }

    /// Shared cancellation handle for a job
    pub fn cancel_token(&self, job_id: Uuid) -> CancellationToken {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(job_id)
            .or_insert_with(Topic::new)
            .cancel
            .clone()
    }

    /// Number of live subscribers across all jobs (test helper)
    pub fn subscriber_count(&self) -> usize {
        let topics = self.topics.lock().unwrap();
        topics
            .values()
            .map(|topic| {
                topic
                    .subscribers
                    .iter()
                    .filter(|weak| weak.strong_count() > 0)
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shootout_common::{ManualClock, SystemClock};

    fn hub() -> ProgressHub {
        ProgressHub::new(Arc::new(SystemClock))
    }

    fn progress(pct: i16) -> ProgressEvent {
        ProgressEvent::Progress {
            progress: pct,
            message: None,
        }
    }

    fn terminal(status: JobStatus) -> ProgressEvent {
        ProgressEvent::Terminal {
            status,
            result_path: None,
            error_kind: None,
            error_detail: None,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let hub = hub();
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id);

        hub.publish(job_id, progress(10));
        hub.publish(job_id, progress(40));
        hub.publish(job_id, terminal(JobStatus::Succeeded));

        assert_eq!(sub.next().await, Some(progress(10)));
        assert_eq!(sub.next().await, Some(progress(40)));
        assert!(matches!(
            sub.next().await,
            Some(ProgressEvent::Terminal {
                status: JobStatus::Succeeded,
                ..
            })
        ));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let hub = hub();
        let job_id = Uuid::new_v4();
        let mut a = hub.subscribe(job_id);
        let mut b = hub.subscribe(job_id);

        hub.publish(job_id, progress(5));

        assert_eq!(a.next().await, Some(progress(5)));
        assert_eq!(b.next().await, Some(progress(5)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = hub();
        hub.publish(Uuid::new_v4(), progress(50));
    }

    #[tokio::test]
    async fn test_overflow_coalesces_newest_progress() {
        let clock = Arc::new(SystemClock);
        let hub = ProgressHub::with_limits(clock, 4, Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id);

        for pct in [10, 20, 30, 40] {
            hub.publish(job_id, progress(pct));
        }
        // Queue full: these coalesce into the newest slot, monotone pct
        hub.publish(job_id, progress(50));
        hub.publish(job_id, progress(60));
        hub.publish(job_id, terminal(JobStatus::Succeeded));

        assert_eq!(sub.next().await, Some(progress(10)));
        assert_eq!(sub.next().await, Some(progress(20)));
        assert_eq!(sub.next().await, Some(progress(30)));
        assert_eq!(sub.next().await, Some(progress(60)));
        assert!(matches!(
            sub.next().await,
            Some(ProgressEvent::Terminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_never_dropped_on_full_queue() {
        let hub = ProgressHub::with_limits(Arc::new(SystemClock), 2, Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id);

        hub.publish(job_id, progress(10));
        hub.publish(job_id, progress(20));
        hub.publish(job_id, terminal(JobStatus::Failed));

        assert_eq!(sub.next().await, Some(progress(10)));
        assert_eq!(sub.next().await, Some(progress(20)));
        assert!(matches!(
            sub.next().await,
            Some(ProgressEvent::Terminal {
                status: JobStatus::Failed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_detached_without_blocking_publisher() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hub = ProgressHub::with_limits(clock.clone(), 2, Duration::from_secs(30));
        let job_id = Uuid::new_v4();
        let mut stalled = hub.subscribe(job_id);
        let mut healthy = hub.subscribe(job_id);

        hub.publish(job_id, progress(10));
        hub.publish(job_id, progress(20));
        assert_eq!(healthy.next().await, Some(progress(10)));
        assert_eq!(healthy.next().await, Some(progress(20)));

        // The stalled subscriber sits on a full queue past the lag window
        clock.advance(chrono::Duration::seconds(31));
        hub.publish(job_id, progress(30));

        assert_eq!(stalled.next().await, Some(ProgressEvent::Lagged));
        assert_eq!(stalled.next().await, None);

        // The healthy subscriber keeps receiving
        assert_eq!(healthy.next().await, Some(progress(30)));
        hub.publish(job_id, terminal(JobStatus::Succeeded));
        assert!(matches!(
            healthy.next().await,
            Some(ProgressEvent::Terminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_token_shared_per_job() {
        let hub = hub();
        let job_id = Uuid::new_v4();

        let token = hub.cancel_token(job_id);
        assert!(!token.is_cancelled());

        hub.cancel_token(job_id).cancel();
        assert!(token.is_cancelled());

        // Other jobs are unaffected
        assert!(!hub.cancel_token(Uuid::new_v4()).is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let hub = hub();
        let job_id = Uuid::new_v4();

        let sub = hub.subscribe(job_id);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);

        hub.publish(job_id, progress(10));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_removed_after_terminal() {
        let hub = hub();
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id);

        hub.publish(job_id, terminal(JobStatus::Cancelled));
        assert!(matches!(
            sub.next().await,
            Some(ProgressEvent::Terminal { .. })
        ));

        // Publishing after terminal reaches nobody; topic is gone
        hub.publish(job_id, progress(99));
        assert_eq!(sub.next().await, None);
    }
}
