//! Redis Streams-backed intake queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream per queue**: `flashsale:queue:{queue}`; publishing routes through
//!   the declared topology and appends to every bound queue's stream
//! - **Consumer group**: one group (`flashsale`) per stream; each worker is a
//!   named consumer in it
//! - **Unacknowledged = pending**: a delivered entry stays in the group's
//!   pending list until it is acked (XACK + XDEL)
//! - **Requeue**: the entry stays pending and the same consumer claims it back
//!   before reading anything new; entries idle on another consumer for longer
//!   than the claim timeout are taken over
//! - **Dead-lettering**: entries rejected without requeue, or past the queue's
//!   delivery limit, are appended to the streams bound to the queue's
//!   dead-letter exchange with their death record, then removed
//!
//! Reads never use `BLOCK`: the connection is multiplexed and shared, so the
//! wait for new entries is a short polling loop instead.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Value};
use tracing::{debug, info, instrument, warn};

use flashsale_events::{
    DeathReason, DeathRecord, Delivery, IntakeQueue, QueueError, QueueSpec, Topology,
};

const STREAM_PREFIX: &str = "flashsale:queue:";
const GROUP: &str = "flashsale";

/// Pending entries idle this long on another consumer are taken over.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Interval between reads while waiting for new entries.
const POLL_STEP: Duration = Duration::from_millis(100);

const FIELD_ROUTING_KEY: &str = "routing_key";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_DEATH_QUEUE: &str = "death_queue";
const FIELD_DEATH_REASON: &str = "death_reason";
const FIELD_DEATH_COUNT: &str = "death_count";

fn stream_key(queue: &str) -> String {
    format!("{STREAM_PREFIX}{queue}")
}

fn reason_str(reason: DeathReason) -> &'static str {
    match reason {
        DeathReason::Rejected => "rejected",
        DeathReason::DeliveryLimit => "delivery_limit",
    }
}

fn parse_reason(raw: &str) -> DeathReason {
    if raw == "delivery_limit" {
        DeathReason::DeliveryLimit
    } else {
        DeathReason::Rejected
    }
}

fn map_redis_error(operation: &str, err: RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        QueueError::Connection(format!("{operation}: {err}"))
    } else {
        QueueError::Command(format!("{operation} failed: {err}"))
    }
}

/// A message as written to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamMessage {
    routing_key: String,
    payload: Vec<u8>,
    death: Option<DeathRecord>,
}

/// A stream entry as read back: id plus raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl RawEntry {
    fn text(&self, field: &str) -> Option<String> {
        self.fields
            .get(field)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Missing fields decode as empty; the consumer decides what an empty
    /// payload means.
    fn into_delivery(mut self, queue: &str, delivery_count: u32) -> Delivery {
        let routing_key = self.text(FIELD_ROUTING_KEY).unwrap_or_default();
        let death = self.text(FIELD_DEATH_QUEUE).map(|death_queue| DeathRecord {
            queue: death_queue,
            reason: parse_reason(&self.text(FIELD_DEATH_REASON).unwrap_or_default()),
            original_routing_key: routing_key.clone(),
            count: self
                .text(FIELD_DEATH_COUNT)
                .and_then(|c| c.parse().ok())
                .unwrap_or(1),
        });
        Delivery {
            tag: self.id,
            queue: queue.to_string(),
            routing_key,
            body: self.fields.remove(FIELD_PAYLOAD).unwrap_or_default(),
            delivery_count,
            death,
        }
    }
}

fn unexpected(what: &str, value: &Value) -> QueueError {
    QueueError::Command(format!("unexpected {what} reply: {value:?}"))
}

/// Parse `[id, [field, value, ...]]`.
fn parse_entry(value: Value) -> Result<RawEntry, QueueError> {
    let parts = match value {
        Value::Bulk(parts) => parts,
        other => return Err(unexpected("stream entry", &other)),
    };
    let mut parts = parts.into_iter();
    let (Some(Value::Data(id)), Some(Value::Bulk(flat))) = (parts.next(), parts.next()) else {
        return Err(QueueError::Command("stream entry without id or fields".to_string()));
    };

    let mut fields = HashMap::new();
    let mut flat = flat.into_iter();
    while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
        if let (Value::Data(key), Value::Data(value)) = (key, value) {
            fields.insert(String::from_utf8_lossy(&key).into_owned(), value);
        }
    }

    Ok(RawEntry {
        id: String::from_utf8_lossy(&id).into_owned(),
        fields,
    })
}

/// Parse a list of entries (XCLAIM reply). Nil slots are entries deleted
/// while still pending.
fn parse_entries(value: Value) -> Result<Vec<RawEntry>, QueueError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => items
            .into_iter()
            .filter(|v| !matches!(v, Value::Nil))
            .map(parse_entry)
            .collect(),
        other => Err(unexpected("entry list", &other)),
    }
}

/// Parse `[[stream, [entry, ...]], ...]` (XREADGROUP reply); nil when nothing is new.
fn parse_read_reply(value: Value) -> Result<Vec<RawEntry>, QueueError> {
    let streams = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(unexpected("XREADGROUP", &other)),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let parts = match stream {
            Value::Bulk(parts) => parts,
            other => return Err(unexpected("XREADGROUP stream", &other)),
        };
        if let Some(list) = parts.into_iter().nth(1) {
            entries.extend(parse_entries(list)?);
        }
    }
    Ok(entries)
}

/// Append one XADD per queue the message routes to. Returns how many.
fn append_routed(
    pipe: &mut redis::Pipeline,
    topology: &Topology,
    exchange: &str,
    msg: &StreamMessage,
) -> usize {
    let mut reached = 0;
    for queue in topology.routes(exchange, &msg.routing_key) {
        pipe.cmd("XADD")
            .arg(stream_key(&queue.name))
            .arg("*")
            .arg(FIELD_ROUTING_KEY)
            .arg(&msg.routing_key)
            .arg(FIELD_PAYLOAD)
            .arg(&msg.payload[..]);
        if let Some(death) = &msg.death {
            pipe.arg(FIELD_DEATH_QUEUE)
                .arg(&death.queue)
                .arg(FIELD_DEATH_REASON)
                .arg(reason_str(death.reason))
                .arg(FIELD_DEATH_COUNT)
                .arg(death.count);
        }
        pipe.ignore();
        reached += 1;
    }
    reached
}

type PendingEntry = (String, String, u64, u64);

pub struct RedisStreamsQueue {
    conn: ConnectionManager,
    topology: RwLock<Option<Topology>>,
    claim_idle: Duration,
}

impl std::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("claim_idle", &self.claim_idle)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsQueue {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            topology: RwLock::new(None),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    fn topology(&self) -> Result<Topology, QueueError> {
        self.topology
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| QueueError::Topology("queue used before declare".to_string()))
    }

    fn spec(&self, queue: &str) -> Result<(Topology, QueueSpec), QueueError> {
        let topology = self.topology()?;
        let spec = topology
            .queue(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        Ok((topology, spec))
    }

    /// Take back a pending entry: our own first, then one stale on another
    /// consumer. Entries past the delivery limit are dead-lettered on the way.
    async fn claim_pending(
        &self,
        topology: &Topology,
        spec: &QueueSpec,
        consumer: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let key = stream_key(&spec.name);
        let mut conn = self.conn.clone();
        let stale_ms = u64::try_from(self.claim_idle.as_millis()).unwrap_or(u64::MAX);

        loop {
            let own: Vec<PendingEntry> = redis::cmd("XPENDING")
                .arg(&key)
                .arg(GROUP)
                .arg("-")
                .arg("+")
                .arg(1)
                .arg(consumer)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("XPENDING", e))?;

            let candidate = match own.into_iter().next() {
                Some(entry) => Some((entry, 0)),
                None => {
                    let stale: Vec<PendingEntry> = redis::cmd("XPENDING")
                        .arg(&key)
                        .arg(GROUP)
                        .arg("IDLE")
                        .arg(stale_ms)
                        .arg("-")
                        .arg("+")
                        .arg(1)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("XPENDING IDLE", e))?;
                    stale.into_iter().next().map(|entry| (entry, stale_ms))
                }
            };
            let Some(((id, owner, _idle, times_delivered), min_idle)) = candidate else {
                return Ok(None);
            };

            let claimed: Value = redis::cmd("XCLAIM")
                .arg(&key)
                .arg(GROUP)
                .arg(consumer)
                .arg(min_idle)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("XCLAIM", e))?;

            let Some(entry) = parse_entries(claimed)?.into_iter().next() else {
                // Deleted while pending: nothing left to deliver.
                redis::cmd("XACK")
                    .arg(&key)
                    .arg(GROUP)
                    .arg(&id)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("XACK", e))?;
                continue;
            };

            let delivery_count = u32::try_from(times_delivered + 1).unwrap_or(u32::MAX);
            let delivery = entry.into_delivery(&spec.name, delivery_count);
            if owner != consumer {
                info!(queue = %spec.name, id = %id, from = %owner, "took over stale delivery");
            }

            match spec.max_deliveries {
                Some(max) if delivery_count > max => {
                    self.dead_letter(topology, spec, &delivery, DeathReason::DeliveryLimit)
                        .await?;
                }
                _ => return Ok(Some(delivery)),
            }
        }
    }

    async fn read_new(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(stream_key(queue))
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        Ok(parse_read_reply(reply)?
            .into_iter()
            .next()
            .map(|entry| entry.into_delivery(queue, 1)))
    }

    /// Route the message through the queue's dead-letter exchange and remove
    /// it from the queue, in one transaction.
    async fn dead_letter(
        &self,
        topology: &Topology,
        spec: &QueueSpec,
        delivery: &Delivery,
        reason: DeathReason,
    ) -> Result<(), QueueError> {
        let key = stream_key(&spec.name);
        let mut pipe = redis::pipe();
        pipe.atomic();

        match &spec.dead_letter_exchange {
            Some(dlx) => {
                let count = match &delivery.death {
                    Some(d) if d.queue == spec.name => d.count + 1,
                    _ => 1,
                };
                let msg = StreamMessage {
                    routing_key: delivery.routing_key.clone(),
                    payload: delivery.body.clone(),
                    death: Some(DeathRecord {
                        queue: spec.name.clone(),
                        reason,
                        original_routing_key: delivery.routing_key.clone(),
                        count,
                    }),
                };
                if append_routed(&mut pipe, topology, dlx, &msg) == 0 {
                    warn!(queue = %spec.name, exchange = %dlx, "dead-letter exchange has no matching queue; message dropped");
                }
            }
            None => {
                warn!(queue = %spec.name, routing_key = %delivery.routing_key, "no dead-letter exchange; message dropped");
            }
        }

        pipe.cmd("XACK").arg(&key).arg(GROUP).arg(&delivery.tag).ignore();
        pipe.cmd("XDEL").arg(&key).arg(&delivery.tag).ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("dead-letter MULTI/EXEC", e))?;

        warn!(
            queue = %spec.name,
            id = %delivery.tag,
            delivery_count = delivery.delivery_count,
            reason = reason_str(reason),
            "message dead-lettered"
        );
        Ok(())
    }
}

#[async_trait]
impl IntakeQueue for RedisStreamsQueue {
    #[instrument(skip(self, topology), fields(queues = topology.queues.len()), err)]
    async fn declare(&self, topology: &Topology) -> Result<(), QueueError> {
        topology.validate()?;
        let mut conn = self.conn.clone();

        for queue in &topology.queues {
            let created = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream_key(&queue.name))
                .arg(GROUP)
                .arg("0")
                .arg("MKSTREAM")
                .query_async::<_, ()>(&mut conn)
                .await;
            match created {
                Ok(()) => debug!(queue = %queue.name, "consumer group created"),
                Err(err) if err.code() == Some("BUSYGROUP") => {
                    debug!(queue = %queue.name, "consumer group already exists")
                }
                Err(err) => return Err(map_redis_error("XGROUP CREATE", err)),
            }
        }

        *self.topology.write().unwrap_or_else(|p| p.into_inner()) = Some(topology.clone());
        Ok(())
    }

    #[instrument(skip(self, payload), fields(payload_len = payload.len()), err)]
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        let topology = self.topology()?;
        let msg = StreamMessage {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            death: None,
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        if append_routed(&mut pipe, &topology, &topology.exchange, &msg) == 0 {
            debug!("message matched no queue; dropped");
            return Ok(());
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))
    }

    async fn next_delivery(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let (topology, spec) = self.spec(queue)?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(delivery) = self.claim_pending(&topology, &spec, consumer).await? {
                return Ok(Some(delivery));
            }
            if let Some(delivery) = self.read_new(queue, consumer).await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let key = stream_key(&delivery.queue);
        let mut conn = self.conn.clone();
        let (acked, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&key)
            .arg(GROUP)
            .arg(&delivery.tag)
            .cmd("XDEL")
            .arg(&key)
            .arg(&delivery.tag)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))?;

        if acked == 0 {
            return Err(QueueError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let (topology, spec) = self.spec(&delivery.queue)?;

        if !requeue {
            return self
                .dead_letter(&topology, &spec, delivery, DeathReason::Rejected)
                .await;
        }
        match spec.max_deliveries {
            Some(max) if delivery.delivery_count >= max => {
                self.dead_letter(&topology, &spec, delivery, DeathReason::DeliveryLimit)
                    .await
            }
            // Left pending; this consumer claims it back before reading new entries.
            _ => Ok(()),
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.spec(queue)?;
        let mut conn = self.conn.clone();
        redis::cmd("XLEN")
            .arg(stream_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XLEN", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(fields.iter().flat_map(|(k, v)| [data(k), data(v)]).collect()),
        ])
    }

    #[test]
    fn read_reply_yields_deliveries() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("flashsale:queue:order_seckill_queue"),
            Value::Bulk(vec![entry(
                "1700000000000-0",
                &[("routing_key", "order.seckill"), ("payload", "{}")],
            )]),
        ])]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries.len(), 1);
        let delivery = entries[0].clone().into_delivery("order_seckill_queue", 1);
        assert_eq!(delivery.tag, "1700000000000-0");
        assert_eq!(delivery.routing_key, "order.seckill");
        assert_eq!(delivery.body, b"{}");
        assert!(delivery.death.is_none());
    }

    #[test]
    fn nothing_new_is_nil() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn deleted_claims_are_skipped() {
        let reply = Value::Bulk(vec![Value::Nil, entry("1-0", &[("routing_key", "x")])]);
        let entries = parse_entries(reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
    }

    #[test]
    fn death_fields_round_trip() {
        let e = parse_entry(entry(
            "2-0",
            &[
                ("routing_key", "order.seckill"),
                ("payload", "x"),
                ("death_queue", "order_seckill_queue"),
                ("death_reason", "delivery_limit"),
                ("death_count", "2"),
            ],
        ))
        .unwrap();
        let death = e.into_delivery("dlq_queue", 1).death.unwrap();
        assert_eq!(
            death,
            DeathRecord {
                queue: "order_seckill_queue".to_string(),
                reason: DeathReason::DeliveryLimit,
                original_routing_key: "order.seckill".to_string(),
                count: 2,
            }
        );
    }

    #[test]
    fn routed_xadds_follow_bindings() {
        let topology = Topology::standard(5);
        let msg = StreamMessage {
            routing_key: "order.seckill".to_string(),
            payload: b"{}".to_vec(),
            death: None,
        };
        let mut pipe = redis::pipe();
        assert_eq!(append_routed(&mut pipe, &topology, &topology.exchange, &msg), 1);
        assert_eq!(append_routed(&mut pipe, &topology, "flashsale.dlx", &msg), 1);
        assert_eq!(append_routed(&mut pipe, &topology, &topology.exchange, &StreamMessage {
            routing_key: "unbound.key".to_string(),
            ..msg
        }), 0);
    }

    #[test]
    fn malformed_entry_is_an_error() {
        assert!(parse_entry(Value::Int(3)).is_err());
        assert!(parse_entry(Value::Bulk(vec![data("1-0")])).is_err());
    }
}
