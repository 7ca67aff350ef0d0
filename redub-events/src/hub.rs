use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use redub_core::JobId;

use crate::event::{JobEvent, SequencedEvent};

/// Topic address: one per job, plus the global jobs feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Global,
    Job(JobId),
}

/// Tuning for the hub. Replay must not exceed buffer, or a reconnecting
/// subscriber could overflow before reading its first live event.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber channel capacity
    pub buffer: usize,
    /// Events retained per topic for `Last-Event-ID` replay
    pub replay: usize,
    /// Minimum spacing of progress events per subscriber
    pub coalesce_interval: Duration,
    /// Consecutive drops after which a subscriber is disconnected
    pub drop_limit: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            replay: 64,
            coalesce_interval: Duration::from_millis(200),
            drop_limit: 64,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SequencedEvent>,
    last_progress_at: Option<Instant>,
    dropped: u64,
    notice_sent: bool,
}

struct TopicState {
    next_seq: u64,
    replay: VecDeque<SequencedEvent>,
    subscribers: Vec<Subscriber>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            next_seq: 1,
            replay: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

struct HubInner {
    topics: HashMap<Topic, TopicState>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Bounded fan-out of job events. Cloning shares the hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<RwLock<HubInner>>,
    config: HubConfig,
}

/// One subscription: a bounded stream of sequenced events. Dropping it
/// unsubscribes implicitly (the hub notices the closed channel on the next
/// publish).
pub struct Subscription {
    rx: mpsc::Receiver<SequencedEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SequencedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SequencedEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubInner {
                topics: HashMap::new(),
                next_subscriber_id: 1,
                closed: false,
            })),
            config,
        }
    }

    /// Publish to a job topic, forwarding everything except log batches to
    /// the global feed as well.
    pub fn publish_job(&self, job_id: &JobId, event: JobEvent) {
        self.publish(&Topic::Job(job_id.clone()), event.clone());
        if !matches!(event, JobEvent::Log { .. }) {
            self.publish(&Topic::Global, event);
        }
    }

    pub fn publish_global(&self, event: JobEvent) {
        self.publish(&Topic::Global, event);
    }

    /// Publish one event. Never blocks; slow subscribers lose the newest
    /// events and are disconnected after `drop_limit` consecutive losses.
    pub fn publish(&self, topic: &Topic, event: JobEvent) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        let state = inner
            .topics
            .entry(topic.clone())
            .or_insert_with(TopicState::new);

        let seq = state.next_seq;
        state.next_seq += 1;
        let sequenced = SequencedEvent { seq, event };

        state.replay.push_back(sequenced.clone());
        while state.replay.len() > self.config.replay {
            state.replay.pop_front();
        }

        let coalesce = self.config.coalesce_interval;
        let drop_limit = self.config.drop_limit;
        let now = Instant::now();

        state.subscribers.retain_mut(|sub| {
            if sequenced.event.is_coalescible() {
                if let Some(last) = sub.last_progress_at {
                    if now.duration_since(last) < coalesce {
                        // Coalesced away for this subscriber; not a drop.
                        return true;
                    }
                }
                sub.last_progress_at = Some(now);
            }

            // A pending drop notice takes the next free slot before any
            // further live events.
            if sub.dropped > 0 && !sub.notice_sent {
                let notice = SequencedEvent {
                    seq,
                    event: JobEvent::DropNotice {
                        dropped: sub.dropped,
                        at: Utc::now(),
                    },
                };
                sub.notice_sent = sub.tx.try_send(notice).is_ok();
            }

            match sub.tx.try_send(sequenced.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Drop-newest: the event is simply not delivered.
                    sub.dropped += 1;
                    if sub.dropped >= drop_limit {
                        debug!(subscriber = sub.id, "disconnecting saturated subscriber");
                        return false;
                    }
                    true
                }
            }
        });
    }

    /// Subscribe to a topic. With `since_seq`, events still inside the
    /// replay window with a higher sequence are delivered first.
    pub fn subscribe(&self, topic: Topic, since_seq: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.buffer);
        let mut inner = self.inner.write();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;

        let state = inner.topics.entry(topic).or_insert_with(TopicState::new);

        if let Some(since) = since_seq {
            for event in state.replay.iter().filter(|e| e.seq > since) {
                let _ = tx.try_send(event.clone());
            }
        }

        state.subscribers.push(Subscriber {
            id,
            tx,
            last_progress_at: None,
            dropped: 0,
            notice_sent: false,
        });

        Subscription { rx }
    }

    /// Number of live subscribers across all topics (admin introspection).
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .topics
            .values()
            .map(|t| t.subscribers.len())
            .sum()
    }

    /// Close the hub: every subscriber receives a terminal `shutdown`
    /// event and its channel is closed. Later publishes are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let at = Utc::now();
        for state in inner.topics.values_mut() {
            let seq = state.next_seq;
            for sub in state.subscribers.drain(..) {
                let _ = sub.tx.try_send(SequencedEvent {
                    seq,
                    event: JobEvent::Shutdown { at },
                });
            }
        }
        inner.topics.clear();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
