//! Publishing finished messages

use crate::node::MessageNode;
use crate::pairing::{PairingAnomaly, PairingRecord};
use crate::record::ConnectionInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// A message after it was forwarded
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
  /// top-level tree of what went on the wire
  pub node: Arc<MessageNode>,
  /// set when `node` is a response that was matched to its request
  pub pairing: Option<PairingRecord>,
}

/// Everything observers are told about
#[derive(Clone, Debug, PartialEq)]
pub enum TrafficEvent {
  /// a message was forwarded
  Message(PublishedMessage),
  /// the pairing rule could not match a message
  Anomaly(PairingAnomaly),
  /// a rewrite stage failed; the frame went out without it
  ModifierFailed {
    /// connection id
    connection: u64,
    /// sequence number of the affected message
    sequence: u64,
    /// failure description
    reason: String,
  },
  /// both directions are done
  ConnectionClosed(ConnectionInfo),
}

/// Trait for consumers of intercepted traffic
pub trait TrafficObserver: Send + Sync {
  /// Called in publication order; must not block
  fn on_event(&self, event: &TrafficEvent);
}

/// Ordered set of observers
#[derive(Clone, Default)]
pub struct ObserverHandler {
  observers: Vec<Arc<dyn TrafficObserver>>,
}

impl ObserverHandler {
  /// Create a new observer handler
  pub fn new() -> Self {
    Self::default()
  }
  /// Add an observer
  pub fn add_observer(&mut self, observer: Arc<dyn TrafficObserver>) {
    self.observers.push(observer);
  }
  /// Number of observers
  pub fn len(&self) -> usize {
    self.observers.len()
  }
  /// Whether no observer is registered
  pub fn is_empty(&self) -> bool {
    self.observers.is_empty()
  }
  /// Hand `event` to every observer in registration order
  pub fn publish(&self, event: &TrafficEvent) {
    for observer in &self.observers {
      observer.on_event(event);
    }
  }
}

/// Built-in observers
pub struct Observer;

impl Observer {
  /// Observer logging every event through `tracing`
  pub fn logging() -> LoggingObserver {
    LoggingObserver
  }
  /// Observer keeping every event in memory
  pub fn log() -> Arc<MessageLog> {
    Arc::new(MessageLog::default())
  }
  /// Observer sending every event down a channel
  pub fn channel() -> (ChannelObserver, mpsc::UnboundedReceiver<TrafficEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelObserver { sender }, receiver)
  }
}

/// Logging observer implementation
pub struct LoggingObserver;

impl TrafficObserver for LoggingObserver {
  fn on_event(&self, event: &TrafficEvent) {
    match event {
      TrafficEvent::Message(message) => {
        let (connection, sequence, direction) = message
          .node
          .transmission()
          .map(|t| (t.connection, t.sequence, t.direction.label()))
          .unwrap_or((0, 0, "?"));
        tracing::info!(
          "[linetap] #{} {} {} {:?}{}",
          connection,
          sequence,
          direction,
          message.node.raw_str(),
          if message.pairing.is_some() { " (paired)" } else { "" }
        );
        tracing::trace!("{}", message.node.print_tree());
      }
      TrafficEvent::Anomaly(PairingAnomaly::OrphanResponse { connection, response }) => {
        tracing::warn!("[linetap] #{} orphan response {:?}", connection, response.raw_str())
      }
      TrafficEvent::Anomaly(PairingAnomaly::UnansweredRequest { connection, request }) => {
        tracing::warn!("[linetap] #{} unanswered request {:?}", connection, request.raw_str())
      }
      TrafficEvent::ModifierFailed {
        connection,
        sequence,
        reason,
      } => tracing::warn!("[linetap] #{} {} {}", connection, sequence, reason),
      TrafficEvent::ConnectionClosed(info) => tracing::info!("[linetap] closed {}", info),
    }
  }
}

/// Observer forwarding events to a tokio channel
#[derive(Clone, Debug)]
pub struct ChannelObserver {
  sender: mpsc::UnboundedSender<TrafficEvent>,
}

impl ChannelObserver {
  /// Wrap an existing sender
  pub fn new(sender: mpsc::UnboundedSender<TrafficEvent>) -> Self {
    Self { sender }
  }
}

impl TrafficObserver for ChannelObserver {
  fn on_event(&self, event: &TrafficEvent) {
    if self.sender.send(event.clone()).is_err() {
      tracing::trace!("[linetap] event receiver dropped");
    }
  }
}

/// In-memory, ordered record of everything published
#[derive(Default)]
pub struct MessageLog {
  events: Mutex<Vec<TrafficEvent>>,
  notify: Notify,
}

impl MessageLog {
  /// Every event so far
  pub fn events(&self) -> Vec<TrafficEvent> {
    self.events.lock().clone()
  }

  /// Published messages in publication order
  pub fn messages(&self) -> Vec<Arc<MessageNode>> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        TrafficEvent::Message(message) => Some(message.node.clone()),
        _ => None,
      })
      .collect()
  }

  /// Every pair made so far
  pub fn pairings(&self) -> Vec<PairingRecord> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        TrafficEvent::Message(message) => message.pairing.clone(),
        _ => None,
      })
      .collect()
  }

  /// The pair `node` takes part in, as request or response
  pub fn pairing_for(&self, node: &MessageNode) -> Option<PairingRecord> {
    self.pairings().into_iter().find(|record| {
      std::ptr::eq(record.request.as_ref(), node) || std::ptr::eq(record.response.as_ref(), node)
    })
  }

  /// Pairing anomalies so far
  pub fn anomalies(&self) -> Vec<PairingAnomaly> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        TrafficEvent::Anomaly(anomaly) => Some(anomaly.clone()),
        _ => None,
      })
      .collect()
  }

  /// Wait until `count` messages were published; `false` on timeout
  pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
    self.wait_until(timeout, |events| {
      events.iter().filter(|e| matches!(e, TrafficEvent::Message(_))).count() >= count
    })
    .await
  }

  /// Wait until a connection was closed; `false` on timeout
  pub async fn wait_for_close(&self, timeout: Duration) -> bool {
    self
      .wait_until(timeout, |events| {
        events.iter().any(|e| matches!(e, TrafficEvent::ConnectionClosed(_)))
      })
      .await
  }

  async fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
  where
    F: Fn(&[TrafficEvent]) -> bool,
  {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let notified = self.notify.notified();
      if done(&self.events.lock()) {
        return true;
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return done(&self.events.lock());
      }
    }
  }
}

impl TrafficObserver for MessageLog {
  fn on_event(&self, event: &TrafficEvent) {
    self.events.lock().push(event.clone());
    self.notify.notify_waiters();
  }
}
