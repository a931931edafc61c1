use crate::auth::{key_prefix, AuthScope, Identity};
use crate::cache::Cache;
use crate::config::{MqttConfig, RateScope, TsdbConfig};
use crate::metrics::{MQTT_DROPPED_TOTAL, MQTT_INVALID_TOTAL, MQTT_MESSAGES_TOTAL, QUEUE_DEPTH};
use crate::model::{DeviceCommand, MqttEnvelope};
use crate::pipeline::{IngestOutcome, Pipeline, Submission};
use crate::topics::{self, InboundTopic, StatusKind};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// One message accepted off the broker, waiting for the dispatcher.
#[derive(Debug)]
pub struct InboundMessage {
    pub topic: InboundTopic,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest status message.
    QueuedAfterEviction,
    /// Queue full of telemetry; the caller must not ack so the broker
    /// redelivers.
    Refused,
}

/// Bounded queue between the broker event loop and the pipeline. When full,
/// the oldest non-telemetry message goes first; telemetry is never evicted.
pub struct InboundQueue {
    inner: Mutex<VecDeque<InboundMessage>>,
    capacity: usize,
    notify: Notify,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, msg: InboundMessage) -> PushOutcome {
        let mut queue = self.inner.lock().unwrap();
        let outcome = if queue.len() < self.capacity {
            queue.push_back(msg);
            PushOutcome::Queued
        } else if let Some(pos) = queue.iter().position(|m| !m.topic.is_telemetry()) {
            queue.remove(pos);
            queue.push_back(msg);
            MQTT_DROPPED_TOTAL.inc();
            PushOutcome::QueuedAfterEviction
        } else {
            MQTT_DROPPED_TOTAL.inc();
            PushOutcome::Refused
        };
        QUEUE_DEPTH.set(queue.len() as i64);
        drop(queue);
        if outcome != PushOutcome::Refused {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn pop_now(&self) -> Option<InboundMessage> {
        let mut queue = self.inner.lock().unwrap();
        let msg = queue.pop_front();
        QUEUE_DEPTH.set(queue.len() as i64);
        msg
    }

    pub async fn pop(&self) -> InboundMessage {
        loop {
            if let Some(msg) = self.pop_now() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Handle held by the rest of the process: publish access, liveness flag,
/// queue depth for health reporting.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    pub connected: Arc<AtomicBool>,
    pub queue: Arc<InboundQueue>,
}

impl MqttHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Publishes a control command to one device, QoS 1, not retained.
    pub async fn publish_command(
        &self,
        device_id: i64,
        command: &DeviceCommand,
    ) -> crate::errors::Result<()> {
        let payload = serde_json::to_vec(command)?;
        self.client
            .publish(
                topics::command_topic(device_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Starts the broker session supervisor and the dispatch worker. The session
/// survives broker restarts; subscriptions are replayed on every reconnect.
pub fn start(
    cfg: &MqttConfig,
    batch_cfg: &TsdbConfig,
    identity: Identity,
    pipeline: Pipeline,
    cache: Cache,
) -> (MqttHandle, JoinHandle<()>, JoinHandle<()>) {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(false);
    options.set_manual_acks(true);
    options.set_last_will(LastWill::new(
        topics::LWT_TOPIC,
        cfg.client_id.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        options.set_credentials(user, pass);
    }

    let (client, eventloop) = AsyncClient::new(options, 10_000);
    let handle = MqttHandle {
        client: client.clone(),
        connected: Arc::new(AtomicBool::new(false)),
        queue: Arc::new(InboundQueue::new(cfg.queue_capacity)),
    };

    let supervisor = tokio::spawn(run_session(
        client,
        eventloop,
        handle.connected.clone(),
        handle.queue.clone(),
    ));
    let dispatcher = tokio::spawn(run_dispatcher(
        handle.queue.clone(),
        identity,
        pipeline,
        cache,
        batch_cfg.batch_size,
        batch_cfg.batch_window,
    ));

    (handle, supervisor, dispatcher)
}

async fn run_session(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    queue: Arc<InboundQueue>,
) {
    let mut backoff = INITIAL_RECONNECT_BACKOFF;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to MQTT broker");
                connected.store(true, Ordering::Relaxed);
                backoff = INITIAL_RECONNECT_BACKOFF;
                for topic in topics::SUBSCRIPTIONS {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        error!("subscribe to {topic} failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MQTT_MESSAGES_TOTAL.inc();
                debug!(
                    "message on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );

                let Some(topic) = topics::parse(&publish.topic) else {
                    MQTT_INVALID_TOTAL.inc();
                    warn!("message on unrecognized topic {}", publish.topic);
                    let _ = client.ack(&publish).await;
                    continue;
                };

                // Command loopback only confirms our own publishes made it
                // to the broker.
                if let InboundTopic::Command { device_id } = topic {
                    debug!("command loopback for device {device_id}");
                    let _ = client.ack(&publish).await;
                    continue;
                }

                let msg = InboundMessage {
                    topic,
                    payload: publish.payload.to_vec(),
                    received_at: Utc::now(),
                };
                match queue.push(msg) {
                    PushOutcome::Queued => {
                        let _ = client.ack(&publish).await;
                    }
                    PushOutcome::QueuedAfterEviction => {
                        warn!("dispatch queue full, evicted oldest status message");
                        let _ = client.ack(&publish).await;
                    }
                    PushOutcome::Refused => {
                        // No ack: the broker redelivers under QoS 1.
                        warn!(
                            "dispatch queue full, refusing message on {}",
                            publish.topic
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                error!("MQTT connection error: {e}, reconnecting in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
            }
        }
    }
}

/// Drains the queue in bounded batches and feeds the pipeline. A slow store
/// backs pressure up into the queue rather than into the broker callback.
async fn run_dispatcher(
    queue: Arc<InboundQueue>,
    identity: Identity,
    pipeline: Pipeline,
    cache: Cache,
    batch_size: usize,
    batch_window: Duration,
) {
    info!(
        "dispatcher started (batch_size={batch_size}, batch_window={}ms)",
        batch_window.as_millis()
    );
    loop {
        let first = queue.pop().await;
        let deadline = tokio::time::Instant::now() + batch_window;
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, queue.pop()).await {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        for msg in batch {
            handle_message(&identity, &pipeline, &cache, msg).await;
        }
    }
}

async fn handle_message(identity: &Identity, pipeline: &Pipeline, cache: &Cache, msg: InboundMessage) {
    let device_id = msg.topic.device_id();
    let envelope: MqttEnvelope = match serde_json::from_slice(&msg.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            MQTT_INVALID_TOTAL.inc();
            warn!("device {device_id}: malformed envelope: {e}");
            return;
        }
    };

    let (rate_scope, auth_scope) = if msg.topic.is_telemetry() {
        (RateScope::Telemetry, AuthScope::Telemetry)
    } else {
        (RateScope::Heartbeat, AuthScope::Heartbeat)
    };

    if let Err(e) = identity
        .check_rate(rate_scope, key_prefix(&envelope.api_key))
        .await
    {
        debug!("device {device_id}: {e}");
        return;
    }

    let ctx = match identity.authenticate(&envelope.api_key, auth_scope).await {
        Ok(ctx) => ctx,
        Err(e) => {
            MQTT_INVALID_TOTAL.inc();
            warn!("device {device_id}: {e}");
            return;
        }
    };
    if ctx.device_id != device_id || envelope.device_id.is_some_and(|id| id != ctx.device_id) {
        MQTT_INVALID_TOTAL.inc();
        warn!(
            "key for device {} used on topic of device {device_id}",
            ctx.device_id
        );
        return;
    }

    match msg.topic {
        InboundTopic::Telemetry { .. } => {
            let submission = Submission {
                data: envelope.data,
                metadata: envelope.metadata,
                timestamp: envelope.timestamp,
            };
            match pipeline.ingest(ctx.device_id, submission).await {
                Ok(IngestOutcome::Accepted { written, .. }) => {
                    debug!("device {device_id}: {written} points via MQTT");
                }
                Ok(IngestOutcome::Partial { written, rejected, .. }) => {
                    warn!(
                        "device {device_id}: partial MQTT write, {written} stored, {} rejected",
                        rejected.len()
                    );
                }
                Err(e) => {
                    error!("device {device_id}: MQTT telemetry lost: {e}");
                }
            }
        }
        InboundTopic::Status { kind, .. } => {
            let result = match kind {
                StatusKind::Heartbeat | StatusKind::Online => {
                    cache
                        .set_online(ctx.device_id, msg.received_at, cache.heartbeat_ttl)
                        .await
                }
                StatusKind::Offline => cache.set_offline(ctx.device_id).await,
            };
            if let Err(e) = result {
                warn!("device {device_id}: status update skipped: {e}");
            }
        }
        InboundTopic::Command { .. } => unreachable!("commands are acked at the session"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TelemetryChannel;

    fn telemetry_msg(device_id: i64) -> InboundMessage {
        InboundMessage {
            topic: InboundTopic::Telemetry {
                device_id,
                channel: TelemetryChannel::Sensors,
            },
            payload: b"{}".to_vec(),
            received_at: Utc::now(),
        }
    }

    fn status_msg(device_id: i64) -> InboundMessage {
        InboundMessage {
            topic: InboundTopic::Status {
                device_id,
                kind: StatusKind::Heartbeat,
            },
            payload: b"{}".to_vec(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_queue_accepts_until_capacity() {
        let queue = InboundQueue::new(2);
        assert_eq!(queue.push(telemetry_msg(1)), PushOutcome::Queued);
        assert_eq!(queue.push(telemetry_msg(2)), PushOutcome::Queued);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_full_queue_evicts_oldest_status_first() {
        let queue = InboundQueue::new(2);
        queue.push(status_msg(1));
        queue.push(telemetry_msg(2));
        assert_eq!(queue.push(telemetry_msg(3)), PushOutcome::QueuedAfterEviction);
        // The status message is gone; telemetry survived.
        let drained: Vec<i64> = std::iter::from_fn(|| queue.pop_now())
            .map(|m| m.topic.device_id())
            .collect();
        assert_eq!(drained, vec![2, 3]);
    }

    #[test]
    fn test_full_telemetry_queue_refuses_newest() {
        let queue = InboundQueue::new(2);
        queue.push(telemetry_msg(1));
        queue.push(telemetry_msg(2));
        assert_eq!(queue.push(telemetry_msg(3)), PushOutcome::Refused);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        tokio_test::block_on(async {
            let queue = Arc::new(InboundQueue::new(4));
            let popper = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await.topic.device_id() })
            };
            tokio::task::yield_now().await;
            queue.push(telemetry_msg(5));
            assert_eq!(popper.await.unwrap(), 5);
        });
    }
}
