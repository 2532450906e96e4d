//! In-memory `MessageBus`, used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::bus::{MessageBus, QueueEntry};
use crate::error::QueueError;

#[derive(Default)]
struct GroupState {
    /// Highest entry id ever delivered to this group.
    cursor: u64,
    /// Delivered but unacked, keyed by entry id, valued by consumer name.
    pending: HashMap<u64, String>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    entries: Vec<(u64, serde_json::Value)>,
    groups: HashMap<String, GroupState>,
}

/// Mutex-guarded in-memory streams with a wakeup for blocked readers.
#[derive(Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamState>>,
    wakeup: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: total entries ever appended to a stream.
    pub async fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn collect_ready(
        state: &mut StreamState,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let entries_snapshot = state.entries.clone();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: String::new(),
                group: group.to_string(),
            })?;

        let mut out = Vec::new();

        // Redeliver this consumer's own unacked entries first.
        let mut own: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, c)| c.as_str() == consumer)
            .map(|(id, _)| *id)
            .collect();
        own.sort_unstable();
        for id in own.into_iter().take(count) {
            if let Some((_, payload)) = entries_snapshot.iter().find(|(eid, _)| *eid == id) {
                out.push(QueueEntry {
                    id,
                    payload: payload.clone(),
                });
            }
        }

        // Then fresh entries past the group cursor.
        for (id, payload) in entries_snapshot.iter() {
            if out.len() >= count {
                break;
            }
            if *id > group_state.cursor {
                group_state.cursor = *id;
                group_state.pending.insert(*id, consumer.to_string());
                out.push(QueueEntry {
                    id: *id,
                    payload: payload.clone(),
                });
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn append(
        &self,
        stream: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, QueueError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push((id, payload.clone()));
        drop(streams);
        self.wakeup.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let tail = state.next_id;
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: tail,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.streams.lock().await;
                let state = streams.entry(stream.to_string()).or_default();
                if !state.groups.contains_key(group) {
                    return Err(QueueError::NoSuchGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    });
                }
                let ready = Self::collect_ready(state, group, consumer, count)?;
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, self.wakeup.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<(), QueueError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        if group_state.pending.remove(&entry_id).is_none() {
            return Err(QueueError::NotPending {
                stream: stream.to_string(),
                group: group.to_string(),
                entry_id,
            });
        }
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, QueueError> {
        let streams = self.streams.lock().await;
        let state = streams.get(stream).ok_or_else(|| QueueError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(group_state.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn read_without_group_errors() {
        let bus = MemoryBus::new();
        bus.append("s", &json!({"n": 1})).await.unwrap();
        let err = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoSuchGroup { .. }));
    }

    #[tokio::test]
    async fn delivery_is_exclusive_within_a_group() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &json!({"n": 1})).await.unwrap();
        bus.append("s", &json!({"n": 2})).await.unwrap();

        let a = bus
            .read_group("s", "g", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        let b = bus
            .read_group("s", "g", "c2", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);
    }

    #[tokio::test]
    async fn unacked_entries_redeliver_to_same_consumer() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &json!({"n": 1})).await.unwrap();

        let first = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Another consumer never sees the pending entry.
        let other = bus
            .read_group("s", "g", "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_empty());

        // Same consumer gets it again until ack.
        let again = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(again, first);

        bus.ack("s", "g", first[0].id).await.unwrap();
        let after = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(after.is_empty());
        assert_eq!(bus.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_ack_errors_not_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &json!({})).await.unwrap();
        let entries = bus
            .read_group("s", "g", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        bus.ack("s", "g", entries[0].id).await.unwrap();
        let err = bus.ack("s", "g", entries[0].id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotPending { .. }));
    }

    #[tokio::test]
    async fn new_group_starts_at_stream_tail() {
        let bus = MemoryBus::new();
        bus.append("s", &json!({"old": true})).await.unwrap();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &json!({"new": true})).await.unwrap();

        let entries = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["new"], true);
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let bus = MemoryBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", &json!({})).await.unwrap();
        // Re-ensuring must not reset the cursor past the undelivered entry.
        bus.ensure_group("s", "g").await.unwrap();
        let entries = bus
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let bus = std::sync::Arc::new(MemoryBus::new());
        bus.ensure_group("s", "g").await.unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.read_group("s", "g", "c1", 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.append("s", &json!({"n": 7})).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["n"], 7);
    }
}
