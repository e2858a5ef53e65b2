//! Per-run publish/subscribe with ordered delivery and a bounded replay log.
//!
//! Every run gets a topic. `publish` assigns a per-run sequence number and
//! fans the message out to every joined observer while holding the topic
//! lock, so all observers see one run's events in publish order. `join`
//! replays the log under that same lock before registering the observer,
//! which makes the catch-up to live handover gap-free and duplicate-free.
//!
//! Publishing a terminal event closes every observer's stream after the
//! event is delivered. Terminal topics without observers are evicted by
//! [`EventChannel::reap`] once `ttl` has passed.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use runbook_core::run::RunMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// A message stamped with its position in the run's stream (starting at 1).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sequenced {
    pub seq: u64,
    pub message: RunMessage,
}

struct Subscriber {
    generation: u64,
    tx: mpsc::UnboundedSender<Sequenced>,
}

struct Topic {
    next_seq: u64,
    log: VecDeque<Sequenced>,
    subscribers: HashMap<String, Subscriber>,
    terminal: bool,
    idle_since: Option<Instant>,
}

impl Topic {
    fn new() -> Self {
        Self {
            next_seq: 1,
            log: VecDeque::new(),
            subscribers: HashMap::new(),
            terminal: false,
            idle_since: None,
        }
    }

    fn mark_idle_if_empty(&mut self) {
        if self.terminal && self.subscribers.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }
}

/// Counts returned by a reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub observers: usize,
    pub topics: usize,
}

pub struct EventChannel {
    topics: RwLock<HashMap<String, Arc<Mutex<Topic>>>>,
    replay_capacity: usize,
    generation: AtomicU64,
}

impl EventChannel {
    pub fn new(replay_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            replay_capacity,
            generation: AtomicU64::new(0),
        })
    }

    fn topic(&self, run_id: &str) -> Option<Arc<Mutex<Topic>>> {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
    }

    /// Create the topic for a run. Idempotent.
    pub fn open(&self, run_id: &str) {
        self.topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Topic::new())));
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.topic(run_id).is_some()
    }

    /// Publish to every observer of `run_id`. Returns the assigned sequence
    /// number, or `None` if the run has no open topic.
    pub fn publish(&self, run_id: &str, message: RunMessage) -> Option<u64> {
        let topic = self.topic(run_id)?;
        let mut topic = topic.lock().unwrap_or_else(|e| e.into_inner());

        let terminal = message.event.is_terminal();
        let item = Sequenced {
            seq: topic.next_seq,
            message,
        };
        topic.next_seq += 1;

        topic.subscribers.retain(|observer, sub| {
            let alive = sub.tx.send(item.clone()).is_ok();
            if !alive {
                debug!(run_id, observer = %observer, "dropping disconnected observer");
            }
            alive
        });

        if self.replay_capacity > 0 {
            if topic.log.len() == self.replay_capacity {
                topic.log.pop_front();
            }
            topic.log.push_back(item.clone());
        }

        if terminal {
            topic.terminal = true;
            // Dropping the senders ends every stream after the terminal event.
            topic.subscribers.clear();
            topic.mark_idle_if_empty();
        }
        Some(item.seq)
    }

    /// Join `run_id` as `observer_id`, replaying logged events with
    /// `seq > after` before live delivery.
    ///
    /// Joining again with the same observer id replaces the previous
    /// delivery stream, so an observer never holds two. Returns `None` when
    /// the run has no topic (unknown, or already evicted).
    pub fn join(
        self: &Arc<Self>,
        run_id: &str,
        observer_id: &str,
        after: Option<u64>,
    ) -> Option<Subscription> {
        let topic = self.topic(run_id)?;
        let mut topic = topic.lock().unwrap_or_else(|e| e.into_inner());

        let (tx, rx) = mpsc::unbounded_channel();
        let after = after.unwrap_or(0);
        for item in topic.log.iter().filter(|i| i.seq > after) {
            let _ = tx.send(item.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if topic.terminal {
            // Nothing live will follow; `tx` drops here and the stream ends
            // after the replay.
            debug!(run_id, observer = observer_id, "joined terminal run, replay only");
        } else {
            let replaced = topic
                .subscribers
                .insert(observer_id.to_string(), Subscriber { generation, tx })
                .is_some();
            topic.idle_since = None;
            debug!(run_id, observer = observer_id, replaced, "observer joined");
        }

        Some(Subscription {
            channel: Arc::clone(self),
            run_id: run_id.to_string(),
            observer_id: observer_id.to_string(),
            generation,
            rx,
        })
    }

    /// Remove `observer_id` from `run_id`, whatever stream it holds.
    pub fn leave(&self, run_id: &str, observer_id: &str) {
        self.release(run_id, observer_id, None);
    }

    fn release(&self, run_id: &str, observer_id: &str, generation: Option<u64>) {
        let Some(topic) = self.topic(run_id) else {
            return;
        };
        let mut topic = topic.lock().unwrap_or_else(|e| e.into_inner());
        let matches = match (topic.subscribers.get(observer_id), generation) {
            (Some(_), None) => true,
            (Some(sub), Some(g)) => sub.generation == g,
            (None, _) => false,
        };
        if matches {
            topic.subscribers.remove(observer_id);
            debug!(run_id, observer = observer_id, "observer left");
        }
        topic.mark_idle_if_empty();
    }

    #[cfg(test)]
    pub fn observer_count(&self, run_id: &str) -> usize {
        match self.topic(run_id) {
            Some(topic) => {
                let topic = topic.lock().unwrap_or_else(|e| e.into_inner());
                topic.subscribers.len()
            }
            None => 0,
        }
    }

    /// Drop observers whose receiving side is gone, and evict terminal topics
    /// that have had no observers for at least `ttl`.
    pub fn reap(&self, ttl: Duration) -> ReapStats {
        let mut stats = ReapStats::default();
        let mut expired = Vec::new();
        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            for (run_id, topic) in topics.iter() {
                let mut topic = topic.lock().unwrap_or_else(|e| e.into_inner());
                let before = topic.subscribers.len();
                topic.subscribers.retain(|_, sub| !sub.tx.is_closed());
                stats.observers += before - topic.subscribers.len();
                topic.mark_idle_if_empty();
                if topic.idle_since.is_some_and(|t| t.elapsed() >= ttl) {
                    expired.push(run_id.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
            for run_id in &expired {
                let still_idle = topics.get(run_id).is_some_and(|t| {
                    let t = t.lock().unwrap_or_else(|e| e.into_inner());
                    t.subscribers.is_empty() && t.terminal
                });
                if still_idle {
                    topics.remove(run_id);
                    stats.topics += 1;
                }
            }
        }
        if stats.observers > 0 || stats.topics > 0 {
            debug!(
                observers = stats.observers,
                topics = stats.topics,
                "event channel reaped"
            );
        }
        stats
    }

    /// Run [`reap`](Self::reap) every `interval` on the current runtime.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                channel.reap(ttl);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One observer's membership in a run. Dropping it leaves the run.
pub struct Subscription {
    channel: Arc<EventChannel>,
    run_id: String,
    observer_id: String,
    generation: u64,
    rx: mpsc::UnboundedReceiver<Sequenced>,
}

impl Subscription {
    /// Next event, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Sequenced> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Sequenced> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Sequenced;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel
            .release(&self.run_id, &self.observer_id, Some(self.generation));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
