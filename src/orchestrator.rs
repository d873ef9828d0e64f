//! Driving both directions of a connection
//!
//! Each direction runs the same pipeline: accumulate, frame, build, rewrite,
//! forward, publish. The two pipelines of a connection share the pairing
//! engine and the sequence counter and nothing else.
//!
//! [`Connection`] processes inbound events synchronously and hands back the
//! bytes to write, which makes whole sessions replayable in tests.
//! [`DuplexOrchestrator`] runs the same pipelines over two async streams.
use crate::builder::ParseContext;
use crate::errors::{Error, Result};
use crate::framing::{ByteAccumulator, Frame};
use crate::modifier::{ModifierPipeline, ModifierRegistry};
use crate::observer::{ObserverHandler, PublishedMessage, TrafficEvent, TrafficObserver};
use crate::pairing::{Pairing, PairingAnomaly, PairingEngine};
use crate::protocol::{ActiveProtocols, ProtocolRegistry};
use crate::proxy::ProxyConfig;
use crate::record::{now_millis, ConnectionInfo, Direction, FrameRole, Transmission};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Everything connections share read-only: protocols, rewrite stages,
/// observers and limits.
pub struct Interception {
  protocols: ActiveProtocols,
  modifiers: ModifierPipeline,
  observers: ObserverHandler,
  max_frame_size: usize,
  read_buffer_size: usize,
  shutdown_grace: Duration,
}

impl Interception {
  /// Create an interception with default limits and no observers
  pub fn new(protocols: ActiveProtocols, modifiers: ModifierPipeline) -> Self {
    let defaults = ProxyConfig::default();
    Self {
      protocols,
      modifiers,
      observers: ObserverHandler::new(),
      max_frame_size: defaults.max_frame_size,
      read_buffer_size: defaults.read_buffer_size,
      shutdown_grace: Duration::from_millis(defaults.shutdown_grace),
    }
  }

  /// Resolve activations and modifier descriptors of `config`
  pub fn from_config(
    config: &ProxyConfig,
    protocols: &ProtocolRegistry,
    modifiers: &ModifierRegistry,
  ) -> Result<Self> {
    let active = protocols.activate(&config.activations)?;
    let pipeline = modifiers.pipeline(&config.modifiers)?;
    Ok(
      Self::new(active, pipeline)
        .with_max_frame_size(config.max_frame_size)
        .with_read_buffer_size(config.read_buffer_size)
        .with_shutdown_grace(Duration::from_millis(config.shutdown_grace)),
    )
  }

  /// Add an observer
  pub fn with_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
    self.observers.add_observer(observer);
    self
  }
  /// Bound on bytes pending without a complete frame
  pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
    self.max_frame_size = max_frame_size.max(1);
    self
  }
  /// Size of socket reads
  pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
    self.read_buffer_size = read_buffer_size.max(1);
    self
  }
  /// How long the second direction may run on after the first finished
  pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
    self.shutdown_grace = shutdown_grace;
    self
  }

  /// Registered observers
  pub fn observers(&self) -> &ObserverHandler {
    &self.observers
  }
  /// Resolved protocols
  pub fn protocols(&self) -> &ActiveProtocols {
    &self.protocols
  }
}

struct ConnectionState {
  info: ConnectionInfo,
  pairing: Mutex<PairingEngine>,
  sequence: AtomicU64,
  closed: AtomicBool,
}

impl ConnectionState {
  fn new(info: ConnectionInfo) -> Self {
    Self {
      pairing: Mutex::new(PairingEngine::new(info.id)),
      info,
      sequence: AtomicU64::new(0),
      closed: AtomicBool::new(false),
    }
  }

  /// Release pairing state and tell observers; only the first call counts
  fn close(&self, observers: &ObserverHandler) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let anomalies = self.pairing.lock().close();
    for anomaly in anomalies {
      observers.publish(&TrafficEvent::Anomaly(anomaly));
    }
    tracing::debug!("[linetap] connection {} closed", self.info);
    observers.publish(&TrafficEvent::ConnectionClosed(self.info.clone()));
  }
}

/// A frame ready to go out and what to tell observers once it did
struct ProcessedFrame {
  forward: Bytes,
  events: Vec<TrafficEvent>,
}

struct DirectionPipeline {
  direction: Direction,
  accumulator: ByteAccumulator,
  interception: Arc<Interception>,
  state: Arc<ConnectionState>,
  forwarded: u64,
  finished: bool,
}

impl DirectionPipeline {
  fn new(direction: Direction, interception: Arc<Interception>, state: Arc<ConnectionState>) -> Self {
    let accumulator = ByteAccumulator::new(
      direction,
      interception.protocols.detector.clone(),
      interception.max_frame_size,
    );
    Self {
      direction,
      accumulator,
      interception,
      state,
      forwarded: 0,
      finished: false,
    }
  }

  fn ingest(&mut self, chunk: &[u8], timestamp: u64) -> Vec<ProcessedFrame> {
    if self.finished {
      tracing::debug!("[linetap] {} bytes after end of {} stream dropped", chunk.len(), self.direction);
      return Vec::new();
    }
    let frames = self.accumulator.accumulate(chunk, &self.state.pairing);
    frames.into_iter().map(|frame| self.process(frame, timestamp)).collect()
  }

  fn finish(&mut self, timestamp: u64) -> Vec<ProcessedFrame> {
    if self.finished {
      return Vec::new();
    }
    self.finished = true;
    let leftover = self.accumulator.finish();
    leftover.into_iter().map(|frame| self.process(frame, timestamp)).collect()
  }

  fn process(&mut self, frame: Frame, timestamp: u64) -> ProcessedFrame {
    let interception = &self.interception;
    let context = ParseContext::of(&frame);
    let offset = self.forwarded;
    let sequence = self.state.sequence.fetch_add(1, Ordering::SeqCst);
    let connection = self.state.info.id;
    let builder = &interception.protocols.builder;
    let mut node = builder.build(frame.bytes.clone(), offset, &context);
    let mut events = Vec::new();
    if !interception.modifiers.is_empty() {
      let outcome = interception
        .modifiers
        .apply(&node, |bytes| builder.build(bytes, offset, &context));
      for failure in outcome.failures {
        events.push(TrafficEvent::ModifierFailed {
          connection,
          sequence,
          reason: failure.to_string(),
        });
      }
      if let Some(rewritten) = outcome.rewritten {
        tracing::debug!(
          "[linetap] #{} {} frame {} rewritten by {}",
          connection,
          self.direction,
          sequence,
          outcome.applied.join(", ")
        );
        node = rewritten;
      }
    }
    node.set_transmission(Transmission {
      connection,
      sequence,
      direction: self.direction,
      timestamp,
      role: frame.role,
      paired_with: None,
    });
    let forward = node.raw().clone();
    self.forwarded += forward.len() as u64;
    let (node, pairing) = match frame.role {
      FrameRole::Request => {
        let node = Arc::new(node);
        if let Some(anomaly) = self.state.pairing.lock().on_request_framed(node.clone()) {
          events.push(TrafficEvent::Anomaly(anomaly));
        }
        (node, None)
      }
      FrameRole::Response => {
        let pairing = self.state.pairing.lock().on_response_framed(node);
        match pairing {
          Pairing::Matched(record) => (record.response.clone(), Some(record)),
          Pairing::Orphan(node) => {
            events.push(TrafficEvent::Anomaly(PairingAnomaly::OrphanResponse {
              connection,
              response: node.clone(),
            }));
            (node, None)
          }
        }
      }
      FrameRole::Unsolicited | FrameRole::Fragment => (Arc::new(node), None),
    };
    events.insert(0, TrafficEvent::Message(PublishedMessage { node, pairing }));
    ProcessedFrame { forward, events }
  }

  fn publish(&self, events: Vec<TrafficEvent>) {
    for event in &events {
      self.interception.observers.publish(event);
    }
  }
}

/// Bytes to write to the peer on the receiving end of `direction`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
  /// travel direction: client-to-server bytes go to the server socket
  pub direction: Direction,
  /// bytes to write
  pub bytes: Bytes,
}

/// Synchronous driver of one intercepted connection
pub struct Connection {
  state: Arc<ConnectionState>,
  interception: Arc<Interception>,
  client: DirectionPipeline,
  server: DirectionPipeline,
}

impl Connection {
  /// Start tracking a connection
  pub fn new(interception: Arc<Interception>, info: ConnectionInfo) -> Self {
    let state = Arc::new(ConnectionState::new(info));
    Self {
      client: DirectionPipeline::new(Direction::ClientToServer, interception.clone(), state.clone()),
      server: DirectionPipeline::new(Direction::ServerToClient, interception.clone(), state.clone()),
      state,
      interception,
    }
  }

  /// Connection record
  pub fn info(&self) -> &ConnectionInfo {
    &self.state.info
  }

  /// Requests still waiting for a response
  pub fn pending_requests(&self) -> usize {
    self.state.pairing.lock().pending()
  }

  fn pipeline(&mut self, direction: Direction) -> &mut DirectionPipeline {
    match direction {
      Direction::ClientToServer => &mut self.client,
      Direction::ServerToClient => &mut self.server,
    }
  }

  fn emit(pipeline: &DirectionPipeline, processed: Vec<ProcessedFrame>) -> Vec<WriteRequest> {
    let mut writes = Vec::with_capacity(processed.len());
    for frame in processed {
      writes.push(WriteRequest {
        direction: pipeline.direction,
        bytes: frame.forward,
      });
      pipeline.publish(frame.events);
    }
    writes
  }

  /// Feed bytes read in `direction`; an empty chunk ends the stream
  pub fn on_bytes(&mut self, direction: Direction, chunk: &[u8], timestamp: u64) -> Vec<WriteRequest> {
    if chunk.is_empty() {
      return self.on_end_of_stream(direction, timestamp);
    }
    let pipeline = self.pipeline(direction);
    let processed = pipeline.ingest(chunk, timestamp);
    Self::emit(pipeline, processed)
  }

  /// The peer sending in `direction` closed its side
  pub fn on_end_of_stream(&mut self, direction: Direction, timestamp: u64) -> Vec<WriteRequest> {
    let pipeline = self.pipeline(direction);
    let processed = pipeline.finish(timestamp);
    Self::emit(pipeline, processed)
  }

  /// Flush both directions and release the connection
  pub fn close(&mut self, timestamp: u64) -> Vec<WriteRequest> {
    let mut writes = self.on_end_of_stream(Direction::ClientToServer, timestamp);
    writes.extend(self.on_end_of_stream(Direction::ServerToClient, timestamp));
    self.state.close(&self.interception.observers);
    writes
  }
}

/// Runs an intercepted connection over two async byte streams
#[derive(Clone)]
pub struct DuplexOrchestrator {
  interception: Arc<Interception>,
}

impl DuplexOrchestrator {
  /// Create an orchestrator
  pub fn new(interception: Arc<Interception>) -> Self {
    Self { interception }
  }

  /// Shared interception
  pub fn interception(&self) -> &Arc<Interception> {
    &self.interception
  }

  /// Forward `client` ↔ `server` until both directions are done.
  ///
  /// When one direction finishes the other gets the shutdown grace to finish
  /// on its own, then it is told to stop, then aborted. The first transport
  /// error is returned after the connection was closed.
  pub async fn run<C, S>(&self, info: ConnectionInfo, client: C, server: S) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let state = Arc::new(ConnectionState::new(info));
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let buffer_size = self.interception.read_buffer_size;
    let grace = self.interception.shutdown_grace;

    let upstream = DirectionPipeline::new(Direction::ClientToServer, self.interception.clone(), state.clone());
    let downstream = DirectionPipeline::new(Direction::ServerToClient, self.interception.clone(), state.clone());
    let mut client_to_server = tokio::spawn(pump(
      client_read,
      server_write,
      upstream,
      shutdown_rx.clone(),
      buffer_size,
    ));
    let mut server_to_client = tokio::spawn(pump(server_read, client_write, downstream, shutdown_rx, buffer_size));

    let (first_direction, first) = tokio::select! {
      result = &mut client_to_server => (Direction::ClientToServer, result),
      result = &mut server_to_client => (Direction::ServerToClient, result),
    };
    tracing::debug!("[linetap] {} {} stream finished", state.info, first_direction);
    let mut other = match first_direction {
      Direction::ClientToServer => server_to_client,
      Direction::ServerToClient => client_to_server,
    };
    let first = joined(first);
    if first.is_err() {
      let _ = shutdown_tx.send(true);
    }
    let second = match tokio::time::timeout(grace, &mut other).await {
      Ok(result) => joined(result),
      Err(_) => {
        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(grace, &mut other).await {
          Ok(result) => joined(result),
          Err(_) => {
            tracing::warn!("[linetap] {} did not stop in time; aborting", state.info);
            other.abort();
            Ok(())
          }
        }
      }
    };
    state.close(&self.interception.observers);
    first.and(second)
  }
}

fn joined(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
  result.map_err(|e| Error::connection_error(format!("forwarding task failed: {}", e)))?
}

/// Read, frame, forward and publish one direction until it ends
async fn pump<R, W>(
  mut reader: R,
  mut writer: W,
  mut pipeline: DirectionPipeline,
  mut shutdown: watch::Receiver<bool>,
  buffer_size: usize,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; buffer_size];
  let result = loop {
    let read = tokio::select! {
      read = reader.read(&mut buffer) => read,
      _ = shutdown.changed() => break Ok(()),
    };
    match read {
      Ok(0) => break Ok(()),
      Ok(n) => {
        let timestamp = now_millis();
        let mut failed = None;
        for processed in pipeline.ingest(&buffer[..n], timestamp) {
          if let Err(e) = writer.write_all(&processed.forward).await {
            failed = Some(e);
            break;
          }
          pipeline.publish(processed.events);
        }
        if let Some(e) = failed {
          tracing::error!("[linetap] error writing {} bytes onward: {}", pipeline.direction, e);
          break Err(Error::IO(e));
        }
      }
      Err(e) => {
        tracing::error!("[linetap] error reading {} stream: {}", pipeline.direction, e);
        break Err(Error::IO(e));
      }
    }
  };
  for processed in pipeline.finish(now_millis()) {
    if result.is_ok() {
      if let Err(e) = writer.write_all(&processed.forward).await {
        tracing::debug!("[linetap] leftover {} bytes not forwarded: {}", pipeline.direction, e);
      }
    }
    pipeline.publish(processed.events);
  }
  if let Err(e) = writer.shutdown().await {
    tracing::trace!("[linetap] shutdown of {} writer: {}", pipeline.direction, e);
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::modifier::ModifierDescriptor;
  use crate::node::Capability;
  use crate::observer::{MessageLog, Observer};
  use crate::protocol::pop3::POP3_COMMAND;

  fn pop3(modifiers: &[ModifierDescriptor]) -> (Connection, Arc<MessageLog>) {
    let log = Observer::log();
    let protocols = ProtocolRegistry::with_defaults().activate(&["pop3", "mime"]).unwrap();
    let pipeline = ModifierRegistry::with_defaults().pipeline(modifiers).unwrap();
    let interception = Interception::new(protocols, pipeline).with_observer(log.clone());
    let info = ConnectionInfo::new(1, "127.0.0.1:40000", "pop.example.com:110");
    (Connection::new(Arc::new(interception), info), log)
  }

  fn joined_bytes(writes: &[WriteRequest]) -> Vec<u8> {
    writes.iter().flat_map(|w| w.bytes.iter().copied()).collect()
  }

  #[test]
  fn requests_are_forwarded_and_queued() {
    let (mut connection, log) = pop3(&[]);
    connection.on_bytes(Direction::ServerToClient, b"+OK hi\r\n", 1);
    let writes = connection.on_bytes(Direction::ClientToServer, b"STAT\r\nLIST", 2);
    assert_eq!(joined_bytes(&writes), b"STAT\r\n");
    assert_eq!(writes[0].direction, Direction::ClientToServer);
    assert_eq!(connection.pending_requests(), 1);
    let messages = log.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].has(POP3_COMMAND));
    assert_eq!(messages[1].transmission().unwrap().sequence, 1);
  }

  #[test]
  fn responses_publish_their_pairing() {
    let (mut connection, log) = pop3(&[]);
    connection.on_bytes(Direction::ServerToClient, b"+OK hi\r\n", 1);
    connection.on_bytes(Direction::ClientToServer, b"STAT\r\n", 2);
    connection.on_bytes(Direction::ServerToClient, b"+OK 1 5\r\n", 3);
    let messages = log.messages();
    let response = messages.last().unwrap();
    assert!(response.has(Capability::PAIRED));
    let record = log.pairing_for(response).unwrap();
    assert_eq!(record.request.raw_str(), "STAT\r\n");
    assert_eq!(response.transmission().unwrap().paired_with, Some(1));
  }

  #[test]
  fn rewritten_frames_go_out_rebuilt() {
    let (mut connection, log) = pop3(&[ModifierDescriptor::replace_content("DELE", "NOOP")]);
    let writes = connection.on_bytes(Direction::ClientToServer, b"DELE 1\r\n", 1);
    assert_eq!(joined_bytes(&writes), b"NOOP 1\r\n");
    let node = log.messages().pop().unwrap();
    assert_eq!(node.find_first("$.pop3Command").unwrap().unwrap().text(), Some("NOOP"));
  }

  #[test]
  fn close_flushes_and_reports() {
    let (mut connection, log) = pop3(&[]);
    connection.on_bytes(Direction::ServerToClient, b"+OK hi\r\n", 1);
    connection.on_bytes(Direction::ClientToServer, b"NOOP\r\nQU", 2);
    let writes = connection.close(3);
    assert_eq!(joined_bytes(&writes), b"QU");
    let last = log.messages().pop().unwrap();
    assert!(last.has(Capability::UNPARSED));
    assert_eq!(last.transmission().unwrap().role, FrameRole::Fragment);
    assert_eq!(log.anomalies().len(), 1);
    assert!(matches!(log.events().last(), Some(TrafficEvent::ConnectionClosed(_))));
    connection.close(4);
    assert_eq!(log.anomalies().len(), 1);
  }

  #[test]
  fn requests_after_close_are_reported() {
    let (mut connection, log) = pop3(&[]);
    connection.state.close(&connection.interception.observers);
    let writes = connection.on_bytes(Direction::ClientToServer, b"NOOP\r\n", 1);
    assert_eq!(joined_bytes(&writes), b"NOOP\r\n");
    assert!(matches!(
      log.anomalies().as_slice(),
      [PairingAnomaly::UnansweredRequest { .. }]
    ));
  }

  #[test]
  fn orphan_responses_are_reported() {
    let (mut connection, log) = pop3(&[]);
    connection.on_bytes(Direction::ServerToClient, b"+OK hi\r\n-ERR what\r\n", 1);
    assert_eq!(log.messages().len(), 2);
    assert!(matches!(
      log.anomalies().as_slice(),
      [PairingAnomaly::OrphanResponse { .. }]
    ));
  }
}
