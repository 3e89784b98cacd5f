//! Routing keys, the bus trait and the in-process implementation.

use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("publish failed: {0}")]
    Publish(String),
}

pub type MqResult<T> = std::result::Result<T, MqError>;

/// A tuple-shaped routing key. In a subscription pattern, a `*` segment
/// matches any single segment; arity must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(Vec<String>);

impl RoutingKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this key matches the given pattern.
    pub fn matches(&self, pattern: &RoutingKey) -> bool {
        self.0.len() == pattern.0.len()
            && self
                .0
                .iter()
                .zip(&pattern.0)
                .all(|(seg, pat)| pat == "*" || seg == pat)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for RoutingKey {
    fn from(segments: [S; N]) -> Self {
        Self::new(segments)
    }
}

/// A message delivered to subscribers.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub key: RoutingKey,
    pub payload: serde_json::Value,
}

/// Publish/subscribe seam. Production clusters put a broker behind this;
/// a single process uses [`LocalBus`].
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, key: RoutingKey, payload: serde_json::Value) -> MqResult<()>;

    /// Subscribe to all keys matching `pattern`. Dropping the receiver
    /// cancels the subscription.
    fn subscribe(&self, pattern: RoutingKey) -> mpsc::UnboundedReceiver<BusMessage>;
}

/// In-process bus: fan-out over unbounded channels.
#[derive(Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<(RoutingKey, mpsc::UnboundedSender<BusMessage>)>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, key: RoutingKey, payload: serde_json::Value) -> MqResult<()> {
        let mut subscribers = self.subscribers.lock().unwrap();
        // Closed receivers are dropped as we go.
        subscribers.retain(|(pattern, tx)| {
            if key.matches(pattern) {
                tx.send(BusMessage {
                    key: key.clone(),
                    payload: payload.clone(),
                })
                .is_ok()
            } else {
                !tx.is_closed()
            }
        });
        Ok(())
    }

    fn subscribe(&self, pattern: RoutingKey) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push((pattern, tx));
        rx
    }
}
