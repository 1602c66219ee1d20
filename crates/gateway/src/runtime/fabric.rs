//! Streaming fabric — per-run pub/sub with ordered replay.
//!
//! Every run owns a broadcast channel plus an append-only response list in
//! the KV substrate (`run:<id>:responses`). Publishing assigns the next
//! sequence number, records the event in the list, then broadcasts — all
//! under one lock, so a subscriber that snapshots the replay and registers
//! its receiver inside the same lock observes no gap and no duplicate
//! between replay tail and first live event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use relay_domain::event::{EventKind, RunEvent};
use relay_store::KvStore;

const CHANNEL_CAPACITY: usize = 256;

/// A subscription: everything already published, plus the live receiver.
/// The receiver is `None` when the run already closed its channel (late
/// subscriber) — the replay is the full event history.
pub struct Subscription {
    pub replay: Vec<RunEvent>,
    pub live: Option<broadcast::Receiver<RunEvent>>,
}

pub struct StreamingFabric {
    kv: Arc<KvStore>,
    channels: Mutex<HashMap<Uuid, RunChannel>>,
    /// Runs whose channel was torn down after their closing `done`.
    /// Publishing for one of these is refused — recreating the channel
    /// would restart `seq` at 0 and put events after the terminal `done`.
    /// Tombstones age out alongside the replay list.
    closed: Mutex<HashMap<Uuid, Instant>>,
    response_ttl: Duration,
}

struct RunChannel {
    tx: broadcast::Sender<RunEvent>,
    next_seq: u64,
}

impl StreamingFabric {
    pub fn new(kv: Arc<KvStore>, response_ttl: Duration) -> Self {
        Self {
            kv,
            channels: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashMap::new()),
            response_ttl,
        }
    }

    fn responses_key(run_id: Uuid) -> String {
        format!("run:{run_id}:responses")
    }

    /// Publish one event on a run's channel, assigning the next sequence
    /// number. Events for a closed run are dropped.
    pub fn publish(&self, run_id: Uuid, kind: EventKind, payload: serde_json::Value) {
        {
            let mut closed = self.closed.lock();
            closed.retain(|_, at| at.elapsed() < self.response_ttl);
            if closed.contains_key(&run_id) {
                tracing::warn!(%run_id, kind = kind.as_str(), "dropping event published after stream close");
                return;
            }
        }

        let mut channels = self.channels.lock();
        let channel = channels.entry(run_id).or_insert_with(|| RunChannel {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            next_seq: 0,
        });

        let event = RunEvent {
            seq: channel.next_seq,
            run_id,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        channel.next_seq += 1;

        // Record in the replay list before broadcasting so a concurrent
        // subscriber never sees a live event missing from its replay.
        if let Ok(json) = serde_json::to_string(&event) {
            self.kv.rpush(&Self::responses_key(run_id), json, Some(self.response_ttl));
        }

        let _ = channel.tx.send(event);
    }

    /// Subscribe to a run: replay of everything so far, then live events.
    pub fn subscribe(&self, run_id: Uuid) -> Subscription {
        let channels = self.channels.lock();
        let replay = self.replay_locked(run_id);
        let live = channels.get(&run_id).map(|c| c.tx.subscribe());
        Subscription { replay, live }
    }

    /// The recorded event history of a run, in sequence order.
    pub fn replay(&self, run_id: Uuid) -> Vec<RunEvent> {
        let _channels = self.channels.lock();
        self.replay_locked(run_id)
    }

    fn replay_locked(&self, run_id: Uuid) -> Vec<RunEvent> {
        self.kv
            .lrange(&Self::responses_key(run_id))
            .iter()
            .filter_map(|line| serde_json::from_str::<RunEvent>(line).ok())
            .collect()
    }

    /// Whether the run has any recorded events (live or expired channel).
    pub fn has_history(&self, run_id: Uuid) -> bool {
        !self.kv.lrange(&Self::responses_key(run_id)).is_empty()
    }

    /// Drop the live channel after the terminal `done` event and refuse
    /// further publishes. The replay list stays behind for late
    /// subscribers until its TTL lapses.
    pub fn close(&self, run_id: Uuid) {
        self.channels.lock().remove(&run_id);
        let mut closed = self.closed.lock();
        closed.retain(|_, at| at.elapsed() < self.response_ttl);
        closed.insert(run_id, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::run::RunStatus;

    fn fabric() -> StreamingFabric {
        StreamingFabric::new(Arc::new(KvStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn publish_assigns_increasing_seq() {
        let fabric = fabric();
        let run = Uuid::new_v4();

        fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "content": "a" }));
        fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "content": "b" }));

        let seqs: Vec<u64> = fabric.replay(run).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn seq_is_per_run() {
        let fabric = fabric();
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();

        fabric.publish(r1, EventKind::Status, serde_json::json!({}));
        fabric.publish(r2, EventKind::Status, serde_json::json!({}));
        assert_eq!(fabric.replay(r2)[0].seq, 0);
    }

    #[test]
    fn publish_after_close_is_dropped() {
        let fabric = fabric();
        let run = Uuid::new_v4();

        fabric.publish(run, EventKind::Status, serde_json::json!({}));
        fabric.publish(run, EventKind::Done, serde_json::json!({}));
        fabric.close(run);

        // A straggler publish must not reopen the channel at seq 0 or
        // land behind the terminal done in the replay.
        fabric.publish(run, EventKind::Done, serde_json::json!({}));

        let replay = fabric.replay(run);
        assert_eq!(replay.len(), 2);
        assert!(replay.last().unwrap().is_done());

        let sub = fabric.subscribe(run);
        assert!(sub.live.is_none());
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams_live() {
        let fabric = fabric();
        let run = Uuid::new_v4();

        fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "content": "early" }));

        let mut sub = fabric.subscribe(run);
        assert_eq!(sub.replay.len(), 1);
        assert_eq!(sub.replay[0].seq, 0);

        fabric.publish(run, EventKind::Done, serde_json::json!({}));
        let live = sub.live.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(live.seq, 1);
        assert!(live.is_done());
    }

    #[tokio::test]
    async fn no_gap_between_replay_and_live() {
        let fabric = Arc::new(fabric());
        let run = Uuid::new_v4();

        for i in 0..10 {
            fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "i": i }));
        }
        let mut sub = fabric.subscribe(run);
        for i in 10..20 {
            fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "i": i }));
        }

        let mut seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
        let rx = sub.live.as_mut().unwrap();
        while let Ok(event) = rx.try_recv() {
            seqs.push(event.seq);
        }

        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn late_subscriber_gets_full_replay_no_live() {
        let fabric = fabric();
        let run = Uuid::new_v4();

        fabric.publish(run, EventKind::Status, RunEvent::status_payload(RunStatus::Completed, None));
        fabric.publish(run, EventKind::Done, serde_json::json!({}));
        fabric.close(run);

        let sub = fabric.subscribe(run);
        assert_eq!(sub.replay.len(), 2);
        assert!(sub.live.is_none());
        assert!(sub.replay.last().unwrap().is_done());
    }

    #[test]
    fn replay_survives_channel_close() {
        let fabric = fabric();
        let run = Uuid::new_v4();

        fabric.publish(run, EventKind::AssistantChunk, serde_json::json!({ "content": "x" }));
        fabric.close(run);

        assert!(fabric.has_history(run));
        assert_eq!(fabric.replay(run).len(), 1);
    }

    #[test]
    fn unknown_run_has_no_history() {
        let fabric = fabric();
        let run = Uuid::new_v4();
        assert!(!fabric.has_history(run));
        let sub = fabric.subscribe(run);
        assert!(sub.replay.is_empty());
        assert!(sub.live.is_none());
    }

    #[test]
    fn response_list_respects_ttl() {
        let fabric = StreamingFabric::new(Arc::new(KvStore::new()), Duration::from_millis(0));
        let run = Uuid::new_v4();
        fabric.publish(run, EventKind::Status, serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(fabric.replay(run).is_empty());
    }
}
