//! Message envelope, wire format and pending-store records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

pub const WRAP_ITEM_FIELD: &str = "queMsgItem";
pub const WRAP_WEIGHT_FIELD: &str = "queMsgWeight";
pub const WRAP_EXPIRE_FIELD: &str = "queMsgExpire";

pub const MAX_WEIGHT: i64 = 99;

/// A user message: a JSON object.
pub type Payload = serde_json::Map<String, Value>;

/// Successive ticks differ by at least this many microseconds, which is
/// more than one f64 ulp at the magnitude of an order weight.
const TICK_SPACING_MICROS: i64 = 4;

static LAST_TICK: AtomicI64 = AtomicI64::new(0);

/// Strictly increasing wall-clock microseconds for this process.
pub(crate) fn next_tick_micros() -> i64 {
    let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
    let mut prev = LAST_TICK.load(Ordering::SeqCst);
    loop {
        let next = now.max(prev + TICK_SPACING_MICROS);
        match LAST_TICK.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "queMsgItem")]
    pub item: Payload,
    /// Sorted-set score: priority band plus insertion time
    #[serde(rename = "queMsgWeight")]
    pub weight: f64,
    /// Unix seconds, 0 = never
    #[serde(rename = "queMsgExpire")]
    pub expire_at: i64,
}

impl Envelope {
    /// Envelope around an entry that was stored without one
    fn bare(item: Payload) -> Self {
        Self {
            item,
            weight: order_weight(0, 0),
            expire_at: 0,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_at > 0 && self.expire_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_unix())
    }

    pub fn fingerprint(&self, queue_name: &str) -> String {
        fingerprint(queue_name, &self.item)
    }

    pub fn into_payload(self) -> Payload {
        self.item
    }
}

/// Score for a message: `(100 - weight) * 1e8` plus seconds-within-1e8 of `tick_micros`.
///
/// Lower scores are shifted first, so higher weights come out earlier and
/// equal weights keep insertion order.
pub fn order_weight(weight: i64, tick_micros: i64) -> f64 {
    let weight = weight.clamp(0, MAX_WEIGHT);
    let band = (100 - weight) as f64 * 1e8;
    let sub = tick_micros.rem_euclid(100_000_000_000_000) as f64 / 1e6;
    band + sub
}

/// True when `msg` has exactly the three envelope fields.
pub fn is_wrapped(msg: &Payload) -> bool {
    msg.len() == 3
        && msg.contains_key(WRAP_ITEM_FIELD)
        && msg.contains_key(WRAP_WEIGHT_FIELD)
        && msg.contains_key(WRAP_EXPIRE_FIELD)
}

fn as_envelope(msg: &Payload) -> Option<Envelope> {
    if !is_wrapped(msg) {
        return None;
    }
    serde_json::from_value(Value::Object(msg.clone())).ok()
}

/// Wraps `msg` with an order weight and expiry. Already-wrapped input is returned as is.
pub fn wrap(msg: Payload, weight: i64, expire_secs: i64) -> Envelope {
    if let Some(envelope) = as_envelope(&msg) {
        return envelope;
    }

    let expire_at = if expire_secs > 0 {
        now_unix() + expire_secs
    } else {
        0
    };

    Envelope {
        item: msg,
        weight: order_weight(weight, next_tick_micros()),
        expire_at,
    }
}

/// Inner payload of a wrapped message; anything else is returned unchanged.
pub fn unwrap(msg: Payload) -> Payload {
    match as_envelope(&msg) {
        Some(envelope) => envelope.item,
        None => msg,
    }
}

pub fn envelope_to_payload(envelope: &Envelope) -> Payload {
    match serde_json::to_value(envelope) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

/// Wire text for an envelope
pub fn pack(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Wire text for a payload, wrapping it with weight 0 first when needed.
pub fn pack_payload(msg: Payload, expire_secs: i64) -> String {
    pack(&wrap(msg, 0, expire_secs))
}

/// Envelope from wire text. Bare JSON objects get a default envelope;
/// empty, malformed or non-object input yields `None`.
pub fn decode(raw: &str) -> Option<Envelope> {
    if raw.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) if map.is_empty() => None,
        Ok(Value::Object(map)) => Some(as_envelope(&map).unwrap_or_else(|| Envelope::bare(map))),
        _ => None,
    }
}

/// Inner payload from wire text; empty on malformed input.
pub fn unpack(raw: &str) -> Payload {
    decode(raw).map(Envelope::into_payload).unwrap_or_default()
}

/// Pending-store key of a message: SHA-256 over `{"msg": .., "queue": ..}`.
///
/// Only the unwrapped payload takes part, so re-wrapping keeps the key.
pub fn fingerprint(queue_name: &str, msg: &Payload) -> String {
    let inner = unwrap(msg.clone());
    let mut data = serde_json::Map::new();
    data.insert("queue".to_string(), Value::String(queue_name.to_string()));
    data.insert("msg".to_string(), Value::Object(inner));
    let json = serde_json::to_string(&Value::Object(data)).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A dequeued message parked in the pending store until confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(rename = "queue")]
    pub queue_name: String,
    #[serde(rename = "msg")]
    pub envelope: Envelope,
}

impl TransferRecord {
    pub fn new(queue_name: &str, envelope: Envelope) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            envelope,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.envelope.fingerprint(&self.queue_name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `None` for anything that is not a complete record
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
