use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify};

use crate::model::{SecurityEvent, SecurityMetric};
use crate::store::{self, OVERFLOW_TTL, OverflowStore, QueueKind, StoreError};
use crate::util::{clamp_str, current_timestamp, redact_headers};

/// Queue fill ratio (in percent) at which the flusher is woken early.
const HIGH_WATER_PERCENT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferStats {
	pub events_len: usize,
	pub metrics_len: usize,
	pub capacity: usize,
	pub dropped_events: u64,
	pub dropped_metrics: u64,
	pub store_errors: u64,
	pub recovery_skipped: u64,
	/// Entries believed to be sitting in the durable store.
	pub overflow_events: u64,
	pub overflow_metrics: u64,
	pub last_flush_ts: Option<f64>,
}

struct BufferState {
	events: VecDeque<(u64, SecurityEvent)>,
	metrics: VecDeque<(u64, SecurityMetric)>,
	store: Option<Arc<dyn OverflowStore>>,
	/// Shared across both queues; assigned per enqueue, used as the
	/// overflow key suffix.
	sequence: u64,
	dropped_events: u64,
	dropped_metrics: u64,
	store_errors: u64,
	recovery_skipped: u64,
	overflow_events: u64,
	overflow_metrics: u64,
	last_flush_ts: Option<f64>,
}

/// Two bounded FIFO queues with overflow-to-store, atomic flush, and
/// start-time recovery. All mutation happens under one async mutex;
/// producers never block on transport.
pub struct EventBuffer {
	capacity: usize,
	sensitive_headers: HashSet<String>,
	/// Byte budget for individual metadata values.
	max_value_bytes: usize,
	state: Mutex<BufferState>,
	flush_signal: Notify,
}

async fn spill<T: Serialize>(
	store: &dyn OverflowStore,
	kind: QueueKind,
	sequence: u64,
	item: &T,
) -> Result<(), StoreError> {
	let json = serde_json::to_string(item).map_err(|e| StoreError(e.to_string()))?;
	store
		.set(&store::overflow_key(kind, sequence), &json, Some(OVERFLOW_TTL))
		.await
}

/// Pop items off the back of an over-capacity queue, spilling them to the
/// store when one is attached and dropping them otherwise.
async fn trim_to_capacity<T: Serialize>(
	queue: &mut VecDeque<(u64, T)>,
	capacity: usize,
	kind: QueueKind,
	store: Option<&Arc<dyn OverflowStore>>,
	dropped: &mut u64,
	store_errors: &mut u64,
	overflow: &mut u64,
) {
	while queue.len() > capacity {
		let Some((seq, item)) = queue.pop_back() else {
			break;
		};
		match store {
			Some(s) => match spill(s.as_ref(), kind, seq, &item).await {
				Ok(()) => *overflow += 1,
				Err(e) => {
					warn!("failed to spill {} overflow entry {}: {}", kind.as_str(), seq, e);
					*store_errors += 1;
					*dropped += 1;
				}
			},
			None => *dropped += 1,
		}
	}
}

impl EventBuffer {
	/// `sensitive_headers` must hold lowercase names; matching metadata
	/// values are redacted before an event is queued. Remaining metadata
	/// values are clamped to `max_value_bytes`.
	pub fn new(capacity: usize, sensitive_headers: HashSet<String>, max_value_bytes: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			sensitive_headers,
			max_value_bytes: max_value_bytes.max(1),
			state: Mutex::new(BufferState {
				events: VecDeque::new(),
				metrics: VecDeque::new(),
				store: None,
				sequence: 0,
				dropped_events: 0,
				dropped_metrics: 0,
				store_errors: 0,
				recovery_skipped: 0,
				overflow_events: 0,
				overflow_metrics: 0,
				last_flush_ts: None,
			}),
			flush_signal: Notify::new(),
		}
	}

	/// Signalled when either queue crosses the high-water mark. The flusher
	/// selects on this alongside its timer; notifications coalesce.
	pub fn flush_signal(&self) -> &Notify {
		&self.flush_signal
	}

	pub async fn attach_store(&self, store: Arc<dyn OverflowStore>) {
		self.state.lock().await.store = Some(store);
	}

	pub async fn has_store(&self) -> bool {
		self.state.lock().await.store.is_some()
	}

	/// Queue an event. When the queue is full the oldest item makes room:
	/// it is spilled to the store when one is attached, dropped and counted
	/// otherwise.
	pub async fn add_event(&self, mut event: SecurityEvent) {
		if !event.metadata.is_empty() {
			event.metadata = redact_headers(&event.metadata, &self.sensitive_headers)
				.into_iter()
				.map(|(k, v)| {
					let v = clamp_str(&v, self.max_value_bytes);
					(k, v)
				})
				.collect();
		}

		let mut st = self.state.lock().await;
		st.sequence += 1;
		let seq = st.sequence;

		if st.events.len() >= self.capacity {
			if let Some((old_seq, oldest)) = st.events.pop_front() {
				match st.store.clone() {
					Some(s) => match spill(s.as_ref(), QueueKind::Events, old_seq, &oldest).await {
						Ok(()) => st.overflow_events += 1,
						Err(e) => {
							warn!("failed to spill event {}: {}", old_seq, e);
							st.store_errors += 1;
							st.dropped_events += 1;
						}
					},
					None => st.dropped_events += 1,
				}
			}
		}
		st.events.push_back((seq, event));
		let len = st.events.len();
		drop(st);

		self.signal_if_high_water(len);
	}

	pub async fn add_metric(&self, metric: SecurityMetric) {
		let mut st = self.state.lock().await;
		st.sequence += 1;
		let seq = st.sequence;

		if st.metrics.len() >= self.capacity {
			if let Some((old_seq, oldest)) = st.metrics.pop_front() {
				match st.store.clone() {
					Some(s) => match spill(s.as_ref(), QueueKind::Metrics, old_seq, &oldest).await {
						Ok(()) => st.overflow_metrics += 1,
						Err(e) => {
							warn!("failed to spill metric {}: {}", old_seq, e);
							st.store_errors += 1;
							st.dropped_metrics += 1;
						}
					},
					None => st.dropped_metrics += 1,
				}
			}
		}
		st.metrics.push_back((seq, metric));
		let len = st.metrics.len();
		drop(st);

		self.signal_if_high_water(len);
	}

	fn signal_if_high_water(&self, len: usize) {
		if len * 100 >= self.capacity * HIGH_WATER_PERCENT {
			self.flush_signal.notify_one();
		}
	}

	/// Atomically swap both queues with empty ones and return the contents
	/// in insertion order.
	pub async fn flush(&self) -> (Vec<SecurityEvent>, Vec<SecurityMetric>) {
		let mut st = self.state.lock().await;
		let events = std::mem::take(&mut st.events)
			.into_iter()
			.map(|(_, e)| e)
			.collect();
		let metrics = std::mem::take(&mut st.metrics)
			.into_iter()
			.map(|(_, m)| m)
			.collect();
		st.last_flush_ts = Some(current_timestamp());
		(events, metrics)
	}

	/// Put a failed delivery back at the front of the queues, preserving
	/// order relative to anything enqueued in the meantime. Combined
	/// overflow beyond capacity leaves from the back: spilled when a store
	/// is attached, dropped and counted otherwise.
	pub async fn requeue(&self, events: Vec<SecurityEvent>, metrics: Vec<SecurityMetric>) {
		let mut st = self.state.lock().await;
		let st = &mut *st;

		if !events.is_empty() {
			let mut restored = VecDeque::with_capacity(events.len() + st.events.len());
			for e in events {
				st.sequence += 1;
				restored.push_back((st.sequence, e));
			}
			restored.append(&mut st.events);
			st.events = restored;
			trim_to_capacity(
				&mut st.events,
				self.capacity,
				QueueKind::Events,
				st.store.as_ref(),
				&mut st.dropped_events,
				&mut st.store_errors,
				&mut st.overflow_events,
			)
			.await;
		}

		if !metrics.is_empty() {
			let mut restored = VecDeque::with_capacity(metrics.len() + st.metrics.len());
			for m in metrics {
				st.sequence += 1;
				restored.push_back((st.sequence, m));
			}
			restored.append(&mut st.metrics);
			st.metrics = restored;
			trim_to_capacity(
				&mut st.metrics,
				self.capacity,
				QueueKind::Metrics,
				st.store.as_ref(),
				&mut st.dropped_metrics,
				&mut st.store_errors,
				&mut st.overflow_metrics,
			)
			.await;
		}
	}

	/// Drain spilled entries from the store back into memory, oldest
	/// sequence first, stopping at capacity. Recovered and malformed keys
	/// are deleted; entries that do not fit stay in the store.
	pub async fn recover(&self) -> usize {
		let mut st = self.state.lock().await;
		let Some(store) = st.store.clone() else {
			return 0;
		};
		let st = &mut *st;

		let mut recovered = 0;
		recovered += recover_queue::<SecurityEvent>(
			store.as_ref(),
			QueueKind::Events,
			&mut st.events,
			self.capacity,
			&mut st.sequence,
			&mut st.recovery_skipped,
			&mut st.store_errors,
			&mut st.overflow_events,
		)
		.await;
		recovered += recover_queue::<SecurityMetric>(
			store.as_ref(),
			QueueKind::Metrics,
			&mut st.metrics,
			self.capacity,
			&mut st.sequence,
			&mut st.recovery_skipped,
			&mut st.store_errors,
			&mut st.overflow_metrics,
		)
		.await;

		if recovered > 0 {
			debug!("recovered {} buffered items from the overflow store", recovered);
		}
		recovered
	}

	pub async fn stats(&self) -> BufferStats {
		let st = self.state.lock().await;
		BufferStats {
			events_len: st.events.len(),
			metrics_len: st.metrics.len(),
			capacity: self.capacity,
			dropped_events: st.dropped_events,
			dropped_metrics: st.dropped_metrics,
			store_errors: st.store_errors,
			recovery_skipped: st.recovery_skipped,
			overflow_events: st.overflow_events,
			overflow_metrics: st.overflow_metrics,
			last_flush_ts: st.last_flush_ts,
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn recover_queue<T: DeserializeOwned>(
	store: &dyn OverflowStore,
	kind: QueueKind,
	queue: &mut VecDeque<(u64, T)>,
	capacity: usize,
	sequence: &mut u64,
	skipped: &mut u64,
	store_errors: &mut u64,
	overflow: &mut u64,
) -> usize {
	let prefix = store::overflow_prefix(kind);
	let keys = match store.keys(&prefix).await {
		Ok(keys) => keys,
		Err(e) => {
			warn!("failed to list {} overflow keys: {}", kind.as_str(), e);
			*store_errors += 1;
			return 0;
		}
	};

	let mut entries: Vec<(u64, String)> = keys
		.into_iter()
		.filter_map(|k| store::sequence_of(&k).map(|seq| (seq, k)))
		.collect();
	entries.sort_by_key(|(seq, _)| *seq);

	let mut recovered = 0;
	let mut remaining: u64 = 0;
	for (seq, key) in entries {
		if queue.len() >= capacity {
			remaining += 1;
			continue;
		}
		match store.get(&key).await {
			Ok(Some(json)) => match serde_json::from_str::<T>(&json) {
				Ok(item) => {
					queue.push_back((seq, item));
					*sequence = (*sequence).max(seq);
					let _ = store.delete(&key).await;
					recovered += 1;
				}
				Err(e) => {
					debug!("skipping malformed overflow entry {}: {}", key, e);
					*skipped += 1;
					let _ = store.delete(&key).await;
				}
			},
			Ok(None) => *skipped += 1,
			Err(e) => {
				warn!("failed to read overflow entry {}: {}", key, e);
				*store_errors += 1;
			}
		}
	}
	*overflow = remaining;
	recovered
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{EventType, MetricType};
	use crate::store::MemoryStore;
	use crate::util::REDACTED;
	use std::collections::HashMap;

	fn sensitive() -> HashSet<String> {
		["authorization", "cookie", "x-api-key"]
			.iter()
			.map(|s| s.to_string())
			.collect()
	}

	fn event(tag: &str) -> SecurityEvent {
		SecurityEvent::new(EventType::SuspiciousRequest, "10.0.0.1", "logged", tag)
	}

	fn metric(value: f64) -> SecurityMetric {
		SecurityMetric::new(MetricType::RequestCount, value)
	}

	fn reasons(events: &[SecurityEvent]) -> Vec<String> {
		events.iter().map(|e| e.reason.clone()).collect()
	}

	#[tokio::test]
	async fn flush_returns_items_in_insertion_order() {
		let buffer = EventBuffer::new(10, sensitive(), 1024);
		for tag in ["e1", "e2", "e3"] {
			buffer.add_event(event(tag)).await;
		}
		buffer.add_metric(metric(1.0)).await;

		let (events, metrics) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e1", "e2", "e3"]);
		assert_eq!(metrics.len(), 1);

		let (events, metrics) = buffer.flush().await;
		assert!(events.is_empty() && metrics.is_empty());
		assert!(buffer.stats().await.last_flush_ts.is_some());
	}

	#[tokio::test]
	async fn without_store_oldest_items_are_dropped() {
		let buffer = EventBuffer::new(2, sensitive(), 1024);
		for tag in ["e1", "e2", "e3", "e4", "e5"] {
			buffer.add_event(event(tag)).await;
		}

		let stats = buffer.stats().await;
		assert_eq!(stats.events_len, 2);
		assert_eq!(stats.dropped_events, 3);

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e4", "e5"]);
	}

	#[tokio::test]
	async fn with_store_oldest_items_spill_instead_of_dropping() {
		let store = Arc::new(MemoryStore::new());
		let buffer = EventBuffer::new(2, sensitive(), 1024);
		buffer.attach_store(store.clone()).await;

		for tag in ["e1", "e2", "e3", "e4", "e5"] {
			buffer.add_event(event(tag)).await;
		}

		let stats = buffer.stats().await;
		assert_eq!(stats.events_len, 2);
		assert_eq!(stats.dropped_events, 0);
		assert_eq!(stats.overflow_events, 3);

		let mut keys = store.keys("agent:overflow:events:").await.unwrap();
		keys.sort();
		assert_eq!(
			keys,
			vec![
				"agent:overflow:events:1",
				"agent:overflow:events:2",
				"agent:overflow:events:3"
			]
		);

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e4", "e5"]);
	}

	#[tokio::test]
	async fn recovery_restores_oldest_first_up_to_capacity() {
		let store = Arc::new(MemoryStore::new());

		// First process: overflow e1..e3 into the store.
		let buffer = EventBuffer::new(2, sensitive(), 1024);
		buffer.attach_store(store.clone()).await;
		for tag in ["e1", "e2", "e3", "e4", "e5"] {
			buffer.add_event(event(tag)).await;
		}
		drop(buffer);

		// Crash: in-memory state is gone, the store survives.
		let buffer = EventBuffer::new(2, sensitive(), 1024);
		buffer.attach_store(store.clone()).await;
		let recovered = buffer.recover().await;
		assert_eq!(recovered, 2);

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e1", "e2"]);

		// e3 stayed behind for the next recovery pass.
		let keys = store.keys("agent:overflow:events:").await.unwrap();
		assert_eq!(keys, vec!["agent:overflow:events:3"]);
	}

	#[tokio::test]
	async fn recovery_skips_and_deletes_malformed_entries() {
		let store = Arc::new(MemoryStore::new());
		store
			.set("agent:overflow:events:1", "not json", None)
			.await
			.unwrap();
		store
			.set(
				"agent:overflow:events:2",
				&serde_json::to_string(&event("good")).unwrap(),
				None,
			)
			.await
			.unwrap();

		let buffer = EventBuffer::new(10, sensitive(), 1024);
		buffer.attach_store(store.clone()).await;
		let recovered = buffer.recover().await;
		assert_eq!(recovered, 1);

		let stats = buffer.stats().await;
		assert_eq!(stats.recovery_skipped, 1);
		assert!(store.keys("agent:overflow:events:").await.unwrap().is_empty());

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["good"]);
	}

	#[tokio::test]
	async fn sensitive_metadata_is_redacted_on_enqueue() {
		let buffer = EventBuffer::new(10, sensitive(), 1024);
		let mut e = event("e1");
		e.metadata = HashMap::from([
			("Authorization".to_string(), "Bearer abc".to_string()),
			("X-Api-Key".to_string(), "secret".to_string()),
			("path".to_string(), "/login".to_string()),
		]);
		buffer.add_event(e).await;

		let (events, _) = buffer.flush().await;
		assert_eq!(events[0].metadata["Authorization"], REDACTED);
		assert_eq!(events[0].metadata["X-Api-Key"], REDACTED);
		assert_eq!(events[0].metadata["path"], "/login");
	}

	#[tokio::test]
	async fn oversized_metadata_values_are_clamped() {
		let buffer = EventBuffer::new(10, sensitive(), 16);
		let mut e = event("e1");
		e.metadata.insert("body".to_string(), "x".repeat(100));
		e.metadata.insert("short".to_string(), "ok".to_string());
		buffer.add_event(e).await;

		let (events, _) = buffer.flush().await;
		assert_eq!(events[0].metadata["body"].len(), 16 + 3);
		assert!(events[0].metadata["body"].ends_with("..."));
		assert_eq!(events[0].metadata["short"], "ok");
	}

	#[tokio::test]
	async fn requeue_preserves_order_ahead_of_new_arrivals() {
		let buffer = EventBuffer::new(10, sensitive(), 1024);
		buffer.add_event(event("e1")).await;
		buffer.add_event(event("e2")).await;

		let (failed, _) = buffer.flush().await;
		buffer.add_event(event("e3")).await;
		buffer.requeue(failed, Vec::new()).await;

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e1", "e2", "e3"]);
	}

	#[tokio::test]
	async fn requeue_overflow_spills_from_the_back() {
		let store = Arc::new(MemoryStore::new());
		let buffer = EventBuffer::new(3, sensitive(), 1024);
		buffer.attach_store(store.clone()).await;

		buffer.add_event(event("e1")).await;
		buffer.add_event(event("e2")).await;
		let (failed, _) = buffer.flush().await;

		buffer.add_event(event("e3")).await;
		buffer.add_event(event("e4")).await;
		buffer.requeue(failed, Vec::new()).await;

		let stats = buffer.stats().await;
		assert_eq!(stats.events_len, 3);
		assert_eq!(stats.dropped_events, 0);
		assert_eq!(stats.overflow_events, 1);

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e1", "e2", "e3"]);
	}

	#[tokio::test]
	async fn requeue_without_store_drops_the_back() {
		let buffer = EventBuffer::new(2, sensitive(), 1024);
		buffer.add_event(event("e1")).await;
		buffer.add_event(event("e2")).await;
		let (failed, _) = buffer.flush().await;

		buffer.add_event(event("e3")).await;
		buffer.requeue(failed, Vec::new()).await;

		let stats = buffer.stats().await;
		assert_eq!(stats.events_len, 2);
		assert_eq!(stats.dropped_events, 1);

		let (events, _) = buffer.flush().await;
		assert_eq!(reasons(&events), vec!["e1", "e2"]);
	}

	#[tokio::test]
	async fn high_water_wakes_the_flush_signal() {
		let buffer = EventBuffer::new(5, sensitive(), 1024);
		let notified = buffer.flush_signal().notified();
		tokio::pin!(notified);

		for tag in ["e1", "e2", "e3"] {
			buffer.add_event(event(tag)).await;
		}
		// 3/5 = 60%, below the mark
		assert!(
			tokio::time::timeout(std::time::Duration::from_millis(20), notified.as_mut())
				.await
				.is_err()
		);

		buffer.add_event(event("e4")).await; // 80%
		assert!(
			tokio::time::timeout(std::time::Duration::from_millis(20), notified)
				.await
				.is_ok()
		);
	}
}
