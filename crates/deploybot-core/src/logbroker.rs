//! Log ingest and fan-out.
//!
//! Each active job gets a bounded in-memory ring of recent chunks plus a
//! broadcast channel. Publishing persists every chunk, appends to the ring,
//! and broadcasts; writers never wait on subscribers. A subscriber is served
//! by a forwarder task that bridges persisted backfill, the ring snapshot,
//! and the live broadcast into one sequence-monotonic mpsc-backed stream.
//! A subscriber that falls behind the broadcast capacity observes `Lagged`
//! and receives a terminal `Dropped` marker on its own stream only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::store::Store;
use crate::types::ChunkStream;

pub const DEFAULT_RING_CAPACITY: usize = 4096;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Capacity of the per-subscriber bridge channel. Backpressure is governed
/// by the broadcast capacity, not this constant.
const BRIDGE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// LogChunk / LogEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: ChunkStream,
    pub data: String,
}

/// What a subscriber sees: chunks, then either the terminal close sentinel
/// or a backpressure drop marker.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Chunk(LogChunk),
    Dropped,
    Closed,
}

// ---------------------------------------------------------------------------
// LogBroker
// ---------------------------------------------------------------------------

struct Ring {
    chunks: VecDeque<LogChunk>,
    closed: bool,
}

struct JobChannel {
    ring: Mutex<Ring>,
    tx: broadcast::Sender<LogEvent>,
}

pub struct LogBroker {
    store: Arc<Store>,
    channels: Mutex<HashMap<Uuid, Arc<JobChannel>>>,
    ring_capacity: usize,
    subscriber_buffer: usize,
}

impl LogBroker {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_capacity(store, DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_capacity(store: Arc<Store>, ring_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    fn channel(&self, job_id: Uuid) -> Arc<JobChannel> {
        let mut channels = self.channels.lock().expect("broker lock poisoned");
        channels
            .entry(job_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.subscriber_buffer);
                Arc::new(JobChannel {
                    ring: Mutex::new(Ring {
                        chunks: VecDeque::new(),
                        closed: false,
                    }),
                    tx,
                })
            })
            .clone()
    }

    /// Ingest a batch of chunks for one job. Each chunk is persisted, pushed
    /// onto the ring (evicting the oldest past capacity), and broadcast.
    /// Chunks for a terminal job are persisted but not fanned out.
    pub fn publish(&self, job_id: Uuid, chunks: Vec<LogChunk>) -> Result<usize> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| DeployError::JobNotFound(job_id.to_string()))?;
        let fan_out = !job.status.is_terminal();

        let mut accepted = 0;
        for chunk in chunks {
            self.store.append_log(&chunk)?;
            accepted += 1;
            if !fan_out {
                continue;
            }
            let channel = self.channel(job_id);
            {
                let mut ring = channel.ring.lock().expect("ring lock poisoned");
                ring.chunks.push_back(chunk.clone());
                while ring.chunks.len() > self.ring_capacity {
                    ring.chunks.pop_front();
                }
            }
            let _ = channel.tx.send(LogEvent::Chunk(chunk));
        }
        Ok(accepted)
    }

    /// Emit the close sentinel to live subscribers and free the ring. The
    /// persisted log is untouched; later subscribers replay it from the store.
    pub fn close(&self, job_id: Uuid) {
        let removed = self
            .channels
            .lock()
            .expect("broker lock poisoned")
            .remove(&job_id);
        if let Some(channel) = removed {
            channel.ring.lock().expect("ring lock poisoned").closed = true;
            let _ = channel.tx.send(LogEvent::Closed);
        }
    }

    /// Subscribe to a job's log stream from `from_sequence`.
    ///
    /// Yields persisted chunks up to the live head, then live chunks, in
    /// strictly increasing sequence order with no gaps; ends with `Closed`
    /// when the job terminalizes, or `Dropped` if this subscriber fell more
    /// than the backpressure limit behind.
    pub fn subscribe(&self, job_id: Uuid, from_sequence: u64) -> Result<ReceiverStream<LogEvent>> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| DeployError::JobNotFound(job_id.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel(BRIDGE_CAPACITY);

        if job.status.is_terminal() {
            let replay = self.store.read_logs(job_id, from_sequence)?;
            tokio::spawn(async move {
                for chunk in replay {
                    if out_tx.send(LogEvent::Chunk(chunk)).await.is_err() {
                        return;
                    }
                }
                let _ = out_tx.send(LogEvent::Closed).await;
            });
            return Ok(ReceiverStream::new(out_rx));
        }

        let channel = self.channel(job_id);
        // Subscribe before snapshotting the ring so nothing published in
        // between is missed; the cursor below dedupes the overlap.
        let mut rx = channel.tx.subscribe();
        let (snapshot, already_closed, ring_tail) = {
            let ring = channel.ring.lock().expect("ring lock poisoned");
            let tail = ring.chunks.front().map(|c| c.sequence);
            let snapshot: Vec<LogChunk> = ring
                .chunks
                .iter()
                .filter(|c| c.sequence >= from_sequence)
                .cloned()
                .collect();
            (snapshot, ring.closed, tail)
        };
        // The requested sequence predates the ring (or the ring is empty,
        // e.g. after a controller restart): backfill from the store.
        let backfill = if ring_tail.map_or(true, |tail| from_sequence < tail) {
            self.store.read_logs(job_id, from_sequence)?
        } else {
            Vec::new()
        };

        tokio::spawn(async move {
            let mut cursor: Option<u64> = None;
            for chunk in backfill.into_iter().chain(snapshot) {
                if cursor.is_some_and(|seen| chunk.sequence <= seen) {
                    continue;
                }
                cursor = Some(chunk.sequence);
                if out_tx.send(LogEvent::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
            if already_closed {
                let _ = out_tx.send(LogEvent::Closed).await;
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(LogEvent::Chunk(chunk)) => {
                        if cursor.is_some_and(|seen| chunk.sequence <= seen) {
                            continue;
                        }
                        cursor = Some(chunk.sequence);
                        if out_tx.send(LogEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Ok(LogEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = out_tx.send(LogEvent::Closed).await;
                        return;
                    }
                    Ok(LogEvent::Dropped) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(job = %job_id, missed, "log subscriber lagged; dropping");
                        let _ = out_tx.send(LogEvent::Dropped).await;
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(out_rx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobCreate};
    use crate::types::JobStatus;
    use tempfile::TempDir;
    use tokio_stream::StreamExt as _;

    fn make_store(dir: &TempDir) -> Arc<Store> {
        Arc::new(Store::open(&dir.path().join("broker.redb")).unwrap())
    }

    fn running_job(store: &Store) -> Job {
        let job = Job::new(
            JobCreate {
                repo: "myorg/web".into(),
                git_ref: "abc123".into(),
                host: "web-01".into(),
                payload: serde_json::json!({}),
            },
            Utc::now(),
        );
        store.insert_job(&job).unwrap();
        store.claim_job(job.id, Uuid::new_v4(), Utc::now()).unwrap()
    }

    fn chunk(job_id: Uuid, sequence: u64) -> LogChunk {
        LogChunk {
            job_id,
            sequence,
            timestamp: Utc::now(),
            stream: ChunkStream::Stdout,
            data: format!("line {sequence}"),
        }
    }

    fn chunks(job_id: Uuid, range: std::ops::RangeInclusive<u64>) -> Vec<LogChunk> {
        range.map(|seq| chunk(job_id, seq)).collect()
    }

    fn sequences(events: &[LogEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Chunk(c) => Some(c.sequence),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn subscribe_mid_stream_then_live_then_close() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store.clone());
        let job = running_job(&store);

        broker.publish(job.id, chunks(job.id, 1..=100)).unwrap();
        let stream = broker.subscribe(job.id, 50).unwrap();

        broker.publish(job.id, chunks(job.id, 101..=105)).unwrap();
        broker.close(job.id);

        let events: Vec<LogEvent> = stream.collect().await;
        let seqs = sequences(&events);
        assert_eq!(seqs, (50..=105).collect::<Vec<u64>>());
        assert!(matches!(events.last(), Some(LogEvent::Closed)));
    }

    #[tokio::test]
    async fn sequence_is_gap_free_across_ring_eviction() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        // Tiny ring: everything before seq 91 is evicted.
        let broker = LogBroker::with_capacity(store.clone(), 10, DEFAULT_SUBSCRIBER_BUFFER);
        let job = running_job(&store);

        broker.publish(job.id, chunks(job.id, 1..=100)).unwrap();
        let stream = broker.subscribe(job.id, 1).unwrap();
        broker.close(job.id);

        let events: Vec<LogEvent> = stream.collect().await;
        let seqs = sequences(&events);
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn terminal_job_replays_persisted_and_closes() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store.clone());
        let job = running_job(&store);
        broker.publish(job.id, chunks(job.id, 1..=5)).unwrap();
        store
            .complete_job(job.id, JobStatus::Success, None, None, Utc::now())
            .unwrap();
        broker.close(job.id);

        let events: Vec<LogEvent> = broker.subscribe(job.id, 3).unwrap().collect().await;
        assert_eq!(sequences(&events), vec![3, 4, 5]);
        assert!(matches!(events.last(), Some(LogEvent::Closed)));
    }

    #[tokio::test]
    async fn subscribe_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store);
        let err = broker.subscribe(Uuid::new_v4(), 0).unwrap_err();
        assert!(matches!(err, DeployError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn publish_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store);
        let id = Uuid::new_v4();
        let err = broker.publish(id, chunks(id, 1..=1)).unwrap_err();
        assert!(matches!(err, DeployError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn publish_after_terminal_persists_without_fan_out() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store.clone());
        let job = running_job(&store);
        store
            .complete_job(job.id, JobStatus::Success, None, None, Utc::now())
            .unwrap();
        broker.close(job.id);

        // Late post from the worker after the ack landed.
        broker.publish(job.id, chunks(job.id, 1..=3)).unwrap();
        assert_eq!(store.read_logs(job.id, 0).unwrap().len(), 3);

        let events: Vec<LogEvent> = broker.subscribe(job.id, 0).unwrap().collect().await;
        assert_eq!(sequences(&events), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn two_subscribers_get_independent_streams() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let broker = LogBroker::new(store.clone());
        let job = running_job(&store);

        broker.publish(job.id, chunks(job.id, 1..=10)).unwrap();
        let early = broker.subscribe(job.id, 1).unwrap();
        let late = broker.subscribe(job.id, 8).unwrap();
        broker.close(job.id);

        let early: Vec<LogEvent> = early.collect().await;
        let late: Vec<LogEvent> = late.collect().await;
        assert_eq!(sequences(&early), (1..=10).collect::<Vec<u64>>());
        assert_eq!(sequences(&late), vec![8, 9, 10]);
    }
}
