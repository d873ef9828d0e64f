//! Matching responses to requests
//!
//! Line protocols answer in order, so the pairing rule is a FIFO queue: a
//! request waits until a response arrives, a response takes the oldest
//! waiting request. Responses arriving with nothing queued are orphans;
//! requests still queued when the connection closes are unanswered.
use crate::framing::ExchangeView;
use crate::node::{Capability, MessageNode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A request and the response that answered it
#[derive(Clone, Debug, PartialEq)]
pub struct PairingRecord {
  /// the request
  pub request: Arc<MessageNode>,
  /// its response
  pub response: Arc<MessageNode>,
}

/// A message the FIFO rule could not match
#[derive(Clone, Debug, PartialEq)]
pub enum PairingAnomaly {
  /// a response with no request waiting
  OrphanResponse {
    /// connection id
    connection: u64,
    /// the response
    response: Arc<MessageNode>,
  },
  /// a request still waiting when the connection closed
  UnansweredRequest {
    /// connection id
    connection: u64,
    /// the request
    request: Arc<MessageNode>,
  },
}

/// Result of framing a response
#[derive(Clone, Debug, PartialEq)]
pub enum Pairing {
  /// matched with the oldest waiting request
  Matched(PairingRecord),
  /// nothing was waiting
  Orphan(Arc<MessageNode>),
}

/// Per-connection request queue
#[derive(Debug)]
pub struct PairingEngine {
  connection: u64,
  waiting: VecDeque<Arc<MessageNode>>,
  last: Option<PairingRecord>,
  paired: u64,
  closed: bool,
}

impl PairingEngine {
  /// Engine for connection `connection`
  pub fn new(connection: u64) -> Self {
    Self {
      connection,
      waiting: VecDeque::new(),
      last: None,
      paired: 0,
      closed: false,
    }
  }

  /// Queue a framed request.
  ///
  /// Once the engine is closed nothing can answer the request any more, so it
  /// comes straight back as [`PairingAnomaly::UnansweredRequest`].
  pub fn on_request_framed(&mut self, request: Arc<MessageNode>) -> Option<PairingAnomaly> {
    if self.closed {
      tracing::warn!("[linetap] #{} request framed after close: {:?}", self.connection, request.raw_str());
      return Some(PairingAnomaly::UnansweredRequest {
        connection: self.connection,
        request,
      });
    }
    self.waiting.push_back(request);
    None
  }

  /// Match a framed response with the oldest waiting request.
  ///
  /// A matched response is tagged [`Capability::PAIRED`] and records the
  /// request's sequence number.
  pub fn on_response_framed(&mut self, mut response: MessageNode) -> Pairing {
    let Some(request) = self.waiting.pop_front() else {
      tracing::warn!(
        "[linetap] #{} response without a waiting request: {:?}",
        self.connection,
        response.raw_str()
      );
      return Pairing::Orphan(Arc::new(response));
    };
    response.tag(Capability::PAIRED);
    let request_sequence = request.transmission().map(|t| t.sequence);
    if let Some(transmission) = response.transmission_mut() {
      transmission.paired_with = request_sequence;
    }
    self.paired += 1;
    let record = PairingRecord {
      request,
      response: Arc::new(response),
    };
    self.last = Some(record.clone());
    Pairing::Matched(record)
  }

  /// The most recent pair
  pub fn last_exchange(&self) -> Option<&PairingRecord> {
    self.last.as_ref()
  }

  /// The `skip`-th oldest waiting request
  pub fn unanswered(&self, skip: usize) -> Option<&Arc<MessageNode>> {
    self.waiting.get(skip)
  }

  /// Number of waiting requests
  pub fn pending(&self) -> usize {
    self.waiting.len()
  }

  /// Number of pairs made so far
  pub fn paired(&self) -> u64 {
    self.paired
  }

  /// Release the queue; every waiting request becomes an anomaly
  pub fn close(&mut self) -> Vec<PairingAnomaly> {
    self.closed = true;
    let connection = self.connection;
    self
      .waiting
      .drain(..)
      .map(|request| PairingAnomaly::UnansweredRequest { connection, request })
      .collect()
  }
}

impl ExchangeView for Mutex<PairingEngine> {
  fn unanswered(&self, skip: usize) -> Option<Arc<MessageNode>> {
    self.lock().unanswered(skip).cloned()
  }

  fn last_exchange(&self) -> Option<(Arc<MessageNode>, Arc<MessageNode>)> {
    self
      .lock()
      .last_exchange()
      .map(|record| (record.request.clone(), record.response.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Direction, FrameRole, Transmission};
  use bytes::Bytes;

  fn message(raw: &'static [u8], sequence: u64, direction: Direction) -> MessageNode {
    let mut node = MessageNode::new(Bytes::from_static(raw), 0);
    node.set_transmission(Transmission {
      connection: 1,
      sequence,
      direction,
      timestamp: 0,
      role: FrameRole::for_direction(direction),
      paired_with: None,
    });
    node
  }

  #[test]
  fn responses_take_requests_in_order() {
    let mut engine = PairingEngine::new(1);
    engine.on_request_framed(Arc::new(message(b"RETR 1\r\n", 0, Direction::ClientToServer)));
    engine.on_request_framed(Arc::new(message(b"QUIT\r\n", 1, Direction::ClientToServer)));
    let Pairing::Matched(first) = engine.on_response_framed(message(b"+OK\r\n.\r\n", 2, Direction::ServerToClient)) else {
      panic!("expected a match");
    };
    assert_eq!(first.request.raw_str(), "RETR 1\r\n");
    assert!(first.response.has(Capability::PAIRED));
    assert_eq!(first.response.transmission().unwrap().paired_with, Some(0));
    assert_eq!(engine.unanswered(0).unwrap().raw_str(), "QUIT\r\n");
    assert_eq!(engine.pending(), 1);
  }

  #[test]
  fn unexpected_response_is_an_orphan() {
    let mut engine = PairingEngine::new(1);
    let pairing = engine.on_response_framed(message(b"+OK\r\n", 0, Direction::ServerToClient));
    match pairing {
      Pairing::Orphan(node) => assert!(!node.has(Capability::PAIRED)),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn close_reports_waiting_requests() {
    let mut engine = PairingEngine::new(9);
    engine.on_request_framed(Arc::new(message(b"NOOP\r\n", 0, Direction::ClientToServer)));
    let anomalies = engine.close();
    assert_eq!(anomalies.len(), 1);
    assert!(matches!(
      &anomalies[0],
      PairingAnomaly::UnansweredRequest { connection: 9, .. }
    ));
  }

  #[test]
  fn requests_after_close_are_unanswered() {
    let mut engine = PairingEngine::new(9);
    engine.close();
    let anomaly = engine.on_request_framed(Arc::new(message(b"NOOP\r\n", 1, Direction::ClientToServer)));
    match anomaly {
      Some(PairingAnomaly::UnansweredRequest { connection, request }) => {
        assert_eq!(connection, 9);
        assert_eq!(request.raw_str(), "NOOP\r\n");
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(engine.pending(), 0);
  }

  #[test]
  fn last_exchange_follows_the_latest_pair() {
    let engine = Mutex::new(PairingEngine::new(1));
    let view: &dyn ExchangeView = &engine;
    assert!(view.last_exchange().is_none());
    let exchanges: [(&'static [u8], &'static [u8]); 2] =
      [(b"MAIL FROM:<a@b>\r\n", b"250 ok\r\n"), (b"DATA\r\n", b"354 go\r\n")];
    for (request, response) in exchanges {
      let mut locked = engine.lock();
      assert!(locked
        .on_request_framed(Arc::new(MessageNode::new(Bytes::from_static(request), 0)))
        .is_none());
      locked.on_response_framed(MessageNode::new(Bytes::from_static(response), 0));
    }
    let (request, response) = view.last_exchange().unwrap();
    assert_eq!(request.raw_str(), "DATA\r\n");
    assert_eq!(response.raw_str(), "354 go\r\n");
  }

  #[test]
  fn locked_engine_is_an_exchange_view() {
    let engine = Mutex::new(PairingEngine::new(1));
    engine
      .lock()
      .on_request_framed(Arc::new(message(b"CAPA\r\n", 0, Direction::ClientToServer)));
    let view: &dyn ExchangeView = &engine;
    assert_eq!(view.unanswered(0).unwrap().raw_str(), "CAPA\r\n");
    assert!(view.unanswered(1).is_none());
  }
}
