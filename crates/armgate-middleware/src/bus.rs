//! Topic-scoped fan-out to observer connections.
//!
//! Every observer connection joins exactly one [`Topic`] when it subscribes
//! and keeps it for its lifetime:
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Periodic robot snapshots from the pump |
//! | [`Topic::Alerts`] | State-changing events (connected, homed, e-stop, …) |
//! | [`Topic::Job`] | Progress of long-running jobs |
//! | [`Topic::Analysis`] | Results pushed by the external evaluator |
//!
//! # Delivery model
//!
//! Each connection owns a bounded outbound queue (drop-oldest on overflow)
//! drained by its own task.  [`TelemetryBus::publish`] serializes the
//! envelope once, snapshots the topic's queues under the bus lock and
//! enqueues outside it, so a slow or dead socket never blocks the publisher
//! or its siblings.  Frames reach a given connection in publish order.
//! A write failure tears down only that connection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use armgate_types::{
    ArmError, ConnectionId, Envelope, JobStatus, Severity, TelemetrySnapshot, Topic,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sink::ConnectionSink;

/// Default per-connection queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Frames buffered per connection before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound queue
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Arc<str>>,
    closed: bool,
}

/// Single-consumer, drop-oldest frame queue.
struct OutboundQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
}

/// Result of offering a frame to a queue.
#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Queued,
    /// Queued after discarding the oldest frame.
    Displaced,
    Closed,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer(&self, frame: Arc<str>) -> Offer {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Offer::Closed;
            }
            let displaced = state.frames.len() >= self.capacity;
            if displaced {
                state.frames.pop_front();
            }
            state.frames.push_back(frame);
            if displaced { Offer::Displaced } else { Offer::Queued }
        };
        self.ready.notify_one();
        outcome
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Next frame, or `None` once the queue is closed.
    async fn next(&self) -> Option<Arc<str>> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
            }
            self.ready.notified().await;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bookkeeping
// ────────────────────────────────────────────────────────────────────────────

struct Connection {
    topic: Topic,
    peer: String,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    messages_sent: u64,
    queue: Arc<OutboundQueue>,
}

/// Per-connection view returned by [`TelemetryBus::connections`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    #[serde(rename = "type")]
    pub topic: Topic,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages_sent: u64,
    pub queue_size: usize,
}

/// Counters returned by [`TelemetryBus::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub telemetry_connections: usize,
    pub alert_connections: usize,
    pub job_connections: usize,
    pub analysis_connections: usize,
    pub total_active: usize,
    /// Connections ever accepted.
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    /// Frames discarded by full queues.
    pub messages_dropped: u64,
    pub connections_dropped: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: u64,
    messages_sent: u64,
    messages_failed: u64,
    messages_dropped: u64,
    connections_dropped: u64,
}

#[derive(Default)]
struct BusState {
    connections: HashMap<ConnectionId, Connection>,
    /// Subscription order per topic.
    topics: HashMap<Topic, Vec<ConnectionId>>,
    counters: Counters,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<BusState>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let Some(conn) = state.connections.remove(&id) else {
                return false;
            };
            if let Some(ids) = state.topics.get_mut(&conn.topic) {
                ids.retain(|c| *c != id);
            }
            state.counters.connections_dropped += 1;
            conn
        };
        removed.queue.close();
        info!(
            connection_id = %id,
            topic = %removed.topic,
            peer = %removed.peer,
            sent = removed.messages_sent,
            "observer disconnected"
        );
        true
    }

    fn record_sent(&self, id: ConnectionId) {
        let mut state = self.lock();
        state.counters.messages_sent += 1;
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.messages_sent += 1;
            conn.last_activity = Utc::now();
        }
    }

    fn record_failed(&self) {
        self.lock().counters.messages_failed += 1;
    }

    fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.lock().counters.messages_dropped += count;
        }
    }
}

/// Write `hello` (if any), then drain one connection's queue into its sink
/// until the queue closes or a write fails.
///
/// The hello never enters the queue, so a publish burst cannot displace it.
async fn drain(
    inner: Arc<BusInner>,
    id: ConnectionId,
    hello: Option<String>,
    queue: Arc<OutboundQueue>,
    mut sink: Box<dyn ConnectionSink>,
) {
    let mut open = match hello {
        Some(hello) => deliver(&inner, id, sink.as_mut(), hello).await,
        None => true,
    };
    while open && let Some(frame) = queue.next().await {
        open = deliver(&inner, id, sink.as_mut(), frame.to_string()).await;
    }
    sink.close().await;
    debug!(connection_id = %id, "drain task finished");
}

/// One write; a failure tears the connection down and returns `false`.
async fn deliver(
    inner: &BusInner,
    id: ConnectionId,
    sink: &mut dyn ConnectionSink,
    text: String,
) -> bool {
    match sink.send_text(text).await {
        Ok(()) => {
            inner.record_sent(id);
            true
        }
        Err(e) => {
            warn!(connection_id = %id, error = %e, "observer send failed; dropping connection");
            inner.record_failed();
            inner.remove(id);
            false
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TelemetryBus
// ────────────────────────────────────────────────────────────────────────────

/// Shared observer bus.  Clone it cheaply: all clones share the same
/// connection table.
///
/// # Example
///
/// ```
/// use armgate_middleware::{ChannelSink, TelemetryBus};
/// use armgate_types::{Envelope, Topic};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let bus = TelemetryBus::default();
/// let (sink, mut rx) = ChannelSink::new();
/// bus.subscribe(Topic::Alerts, Box::new(sink), "console");
///
/// bus.publish(Topic::Alerts, &Envelope::ping()).unwrap();
/// let hello = rx.recv().await.unwrap();
/// assert!(hello.contains("\"connection\""));
/// let ping = rx.recv().await.unwrap();
/// assert!(ping.contains("\"ping\""));
/// # });
/// ```
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<BusInner>,
}

impl TelemetryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Register `sink` under `topic` and spawn its drain task.  The
    /// connection envelope is written ahead of any queued frame.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        topic: Topic,
        sink: Box<dyn ConnectionSink>,
        peer: impl Into<String>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        let peer = peer.into();
        let queue = Arc::new(OutboundQueue::new(self.inner.config.queue_capacity));

        let hello = match serde_json::to_string(&Envelope::connection(topic)) {
            Ok(hello) => Some(hello),
            Err(e) => {
                warn!(error = %e, "failed to encode connection envelope");
                None
            }
        };

        {
            let now = Utc::now();
            let mut state = self.inner.lock();
            state.connections.insert(
                id,
                Connection {
                    topic,
                    peer: peer.clone(),
                    connected_at: now,
                    last_activity: now,
                    messages_sent: 0,
                    queue: Arc::clone(&queue),
                },
            );
            state.topics.entry(topic).or_default().push(id);
            state.counters.total_connections += 1;
        }

        tokio::spawn(drain(Arc::clone(&self.inner), id, hello, queue, sink));
        info!(connection_id = %id, topic = %topic, peer = %peer, "observer connected");
        id
    }

    /// Remove a connection.  Safe to call any number of times; returns
    /// `true` only for the call that actually removed it.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        self.inner.remove(id)
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Queue `envelope` for every subscriber of `topic`.  Returns the number
    /// of connections it was queued for.
    pub fn publish(&self, topic: Topic, envelope: &Envelope) -> Result<usize, ArmError> {
        let frame: Arc<str> = serde_json::to_string(envelope)?.into();
        let targets: Vec<(ConnectionId, Arc<OutboundQueue>)> = {
            let state = self.inner.lock();
            state
                .topics
                .get(&topic)
                .into_iter()
                .flatten()
                .filter_map(|id| {
                    state
                        .connections
                        .get(id)
                        .map(|c| (*id, Arc::clone(&c.queue)))
                })
                .collect()
        };
        Ok(self.offer_all(targets, frame))
    }

    fn offer_all(&self, targets: Vec<(ConnectionId, Arc<OutboundQueue>)>, frame: Arc<str>) -> usize {
        let mut queued = 0;
        let mut displaced = 0;
        for (id, queue) in targets {
            match queue.offer(Arc::clone(&frame)) {
                Offer::Queued => queued += 1,
                Offer::Displaced => {
                    queued += 1;
                    displaced += 1;
                }
                Offer::Closed => {
                    self.inner.remove(id);
                }
            }
        }
        self.inner.record_dropped(displaced);
        queued
    }

    /// Queue `envelope` for one connection only.
    pub fn send_to(&self, id: ConnectionId, envelope: &Envelope) -> Result<(), ArmError> {
        let frame: Arc<str> = serde_json::to_string(envelope)?.into();
        let queue = self
            .inner
            .lock()
            .connections
            .get(&id)
            .map(|c| Arc::clone(&c.queue))
            .ok_or_else(|| ArmError::Delivery(format!("unknown connection {id}")))?;
        if self.offer_all(vec![(id, queue)], frame) == 0 {
            return Err(ArmError::Delivery(format!("connection {id} is closed")));
        }
        Ok(())
    }

    pub fn publish_telemetry(&self, snapshot: &TelemetrySnapshot) -> Result<usize, ArmError> {
        self.publish(Topic::Telemetry, &Envelope::telemetry(snapshot)?)
    }

    pub fn publish_alert(
        &self,
        alert_type: &str,
        message: &str,
        severity: Severity,
        data: Value,
    ) -> Result<usize, ArmError> {
        self.publish(
            Topic::Alerts,
            &Envelope::alert(alert_type, message, severity, data),
        )
    }

    pub fn publish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: f64,
        data: Value,
    ) -> Result<usize, ArmError> {
        self.publish(Topic::Job, &Envelope::job(job_id, status, progress, data))
    }

    pub fn publish_analysis(&self, analysis_type: &str, result: Value) -> Result<usize, ArmError> {
        self.publish(Topic::Analysis, &Envelope::analysis(analysis_type, result))
    }

    /// Liveness ping to every connection on every topic.
    pub fn ping_all(&self) -> Result<usize, ArmError> {
        let frame: Arc<str> = serde_json::to_string(&Envelope::ping())?.into();
        let targets: Vec<_> = self
            .inner
            .lock()
            .connections
            .iter()
            .map(|(id, c)| (*id, Arc::clone(&c.queue)))
            .collect();
        Ok(self.offer_all(targets, frame))
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.inner.lock();
        let count = |topic: Topic| state.topics.get(&topic).map_or(0, Vec::len);
        BusStats {
            telemetry_connections: count(Topic::Telemetry),
            alert_connections: count(Topic::Alerts),
            job_connections: count(Topic::Job),
            analysis_connections: count(Topic::Analysis),
            total_active: state.connections.len(),
            total_connections: state.counters.total_connections,
            messages_sent: state.counters.messages_sent,
            messages_failed: state.counters.messages_failed,
            messages_dropped: state.counters.messages_dropped,
            connections_dropped: state.counters.connections_dropped,
        }
    }

    /// Every live connection, in subscription order per topic.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.lock();
        Topic::ALL
            .iter()
            .flat_map(|topic| state.topics.get(topic).into_iter().flatten())
            .filter_map(|id| {
                state.connections.get(id).map(|c| ConnectionInfo {
                    id: *id,
                    peer: c.peer.clone(),
                    topic: c.topic,
                    connected_at: c.connected_at,
                    last_activity: c.last_activity,
                    messages_sent: c.messages_sent,
                    queue_size: c.queue.len(),
                })
            })
            .collect()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// A socket that is already gone.
    struct BrokenSink;

    #[async_trait]
    impl ConnectionSink for BrokenSink {
        async fn send_text(&mut self, _text: String) -> Result<(), ArmError> {
            Err(ArmError::Delivery("broken pipe".into()))
        }
    }

    fn kind_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["type"].as_str().unwrap_or_default().to_string()
    }

    async fn next(rx: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within 1s")
            .expect("channel open")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn connection_envelope_arrives_first() {
        let bus = TelemetryBus::default();
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Job, Box::new(sink), "test");

        let hello: Value = serde_json::from_str(&next(&mut rx).await).unwrap();
        assert_eq!(hello["type"], "connection");
        assert_eq!(hello["data"]["status"], "connected");
        assert_eq!(hello["data"]["stream"], "job");
        assert!(hello["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = TelemetryBus::default();
        let (sink, _rx) = ChannelSink::new();
        let id = bus.subscribe(Topic::Alerts, Box::new(sink), "test");
        assert_eq!(bus.connection_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(!bus.unsubscribe(Uuid::new_v4()));
        assert_eq!(bus.connection_count(), 0);
        assert_eq!(bus.stats().connections_dropped, 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = TelemetryBus::default();
        let (alerts, mut alerts_rx) = ChannelSink::new();
        let (jobs, mut jobs_rx) = ChannelSink::new();
        bus.subscribe(Topic::Alerts, Box::new(alerts), "a");
        bus.subscribe(Topic::Job, Box::new(jobs), "j");
        next(&mut alerts_rx).await;
        next(&mut jobs_rx).await;

        let sent = bus
            .publish_alert("robot_homed", "Robot homed", Severity::Success, json!({}))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(kind_of(&next(&mut alerts_rx).await), "alert");

        settle().await;
        assert!(jobs_rx.try_recv().is_err());
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn broken_connection_is_removed_without_affecting_sibling() {
        let bus = TelemetryBus::default();
        let (healthy, mut rx) = ChannelSink::new();
        let healthy_id = bus.subscribe(Topic::Telemetry, Box::new(healthy), "ok");
        let broken_id = bus.subscribe(Topic::Telemetry, Box::new(BrokenSink), "dead");
        next(&mut rx).await;
        settle().await;

        bus.publish(Topic::Telemetry, &Envelope::ping()).unwrap();
        assert_eq!(kind_of(&next(&mut rx).await), "ping");
        settle().await;

        let ids: Vec<_> = bus.connections().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![healthy_id]);
        assert!(!bus.unsubscribe(broken_id));

        let stats = bus.stats();
        assert_eq!(stats.telemetry_connections, 1);
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.connections_dropped, 1);
        assert_eq!(stats.total_connections, 2);
    }

    #[tokio::test]
    async fn frames_arrive_in_publish_order() {
        let bus = TelemetryBus::default();
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Analysis, Box::new(sink), "test");
        next(&mut rx).await;

        for i in 0..50 {
            bus.publish_analysis("eval", json!({ "seq": i })).unwrap();
        }
        for i in 0..50 {
            let frame: Value = serde_json::from_str(&next(&mut rx).await).unwrap();
            assert_eq!(frame["data"]["result"]["seq"], i);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let bus = TelemetryBus::new(BusConfig { queue_capacity: 4 });
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Analysis, Box::new(sink), "slow");

        // The drain task has not run yet: everything lands in the queue.
        for i in 0..10 {
            bus.publish_analysis("eval", json!({ "seq": i })).unwrap();
        }
        assert_eq!(bus.connections()[0].queue_size, 4);

        // The connection envelope survives the burst and still leads.
        assert_eq!(kind_of(&next(&mut rx).await), "connection");
        for i in 6..10 {
            let frame: Value = serde_json::from_str(&next(&mut rx).await).unwrap();
            assert_eq!(frame["data"]["result"]["seq"], i);
        }
        assert_eq!(bus.stats().messages_dropped, 6);
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_addressed_connection() {
        let bus = TelemetryBus::default();
        let (a, mut a_rx) = ChannelSink::new();
        let (b, mut b_rx) = ChannelSink::new();
        let a_id = bus.subscribe(Topic::Telemetry, Box::new(a), "a");
        bus.subscribe(Topic::Telemetry, Box::new(b), "b");
        next(&mut a_rx).await;
        next(&mut b_rx).await;

        let reply = Envelope::reply("robot.home", Ok(json!(true)));
        bus.send_to(a_id, &reply).unwrap();
        assert_eq!(kind_of(&next(&mut a_rx).await), "reply");
        settle().await;
        assert!(b_rx.try_recv().is_err());

        assert!(bus.send_to(Uuid::new_v4(), &reply).is_err());
    }

    #[tokio::test]
    async fn ping_reaches_every_topic() {
        let bus = TelemetryBus::default();
        let mut receivers = Vec::new();
        for topic in Topic::ALL {
            let (sink, rx) = ChannelSink::new();
            bus.subscribe(topic, Box::new(sink), "p");
            receivers.push(rx);
        }
        assert_eq!(bus.ping_all().unwrap(), 4);
        for rx in &mut receivers {
            next(rx).await;
            assert_eq!(kind_of(&next(rx).await), "ping");
        }
    }

    #[tokio::test]
    async fn sent_counters_track_delivery() {
        let bus = TelemetryBus::default();
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Job, Box::new(sink), "j");
        bus.publish_job("home", JobStatus::Started, 0.0, json!({}))
            .unwrap();
        next(&mut rx).await;
        next(&mut rx).await;
        settle().await;

        assert_eq!(bus.stats().messages_sent, 2);
        assert_eq!(bus.connections()[0].messages_sent, 2);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let bus = TelemetryBus::default();
        assert_eq!(bus.publish(Topic::Alerts, &Envelope::ping()).unwrap(), 0);
    }
}
