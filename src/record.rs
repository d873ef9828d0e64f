//! Connection identity, directions and per-frame transmission records
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, `0` if the clock is before it.
pub fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Which way bytes travel through the interception point
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
  /// client → server, carries requests
  ClientToServer,
  /// server → client, carries responses
  ServerToClient,
}

impl Direction {
  /// The direction forwarded bytes continue in on the other socket pair
  pub fn opposite(self) -> Direction {
    match self {
      Direction::ClientToServer => Direction::ServerToClient,
      Direction::ServerToClient => Direction::ClientToServer,
    }
  }
  /// Short label used in logs
  pub fn label(self) -> &'static str {
    match self {
      Direction::ClientToServer => "client",
      Direction::ServerToClient => "server",
    }
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// The part a framed message plays in the conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameRole {
  /// client frame, waits in the pairing queue
  Request,
  /// server frame, claims the oldest waiting request
  Response,
  /// server frame nobody asked for (greeting); never paired
  Unsolicited,
  /// bytes flushed without a complete frame; never paired
  Fragment,
}

impl FrameRole {
  /// Role of a complete frame read in `direction`
  pub fn for_direction(direction: Direction) -> FrameRole {
    match direction {
      Direction::ClientToServer => FrameRole::Request,
      Direction::ServerToClient => FrameRole::Response,
    }
  }
}

/// One observed TCP flow
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
  /// connection number, unique per proxy
  pub id: u64,
  /// client endpoint
  pub client: String,
  /// server endpoint (host:port)
  pub server: String,
  /// establishment time, unix millis
  pub established: u64,
}

impl ConnectionInfo {
  /// Record a connection established now
  pub fn new(id: u64, client: impl Into<String>, server: impl Into<String>) -> Self {
    Self {
      id,
      client: client.into(),
      server: server.into(),
      established: now_millis(),
    }
  }
  /// Record a connection from socket addresses
  pub fn from_addrs(id: u64, client: SocketAddr, server: impl Into<String>) -> Self {
    Self::new(id, client.to_string(), server)
  }
}

impl fmt::Display for ConnectionInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{} {} -> {}", self.id, self.client, self.server)
  }
}

/// Where and when a top-level message was seen
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmission {
  /// owning connection id
  pub connection: u64,
  /// publication sequence number within the connection, both directions
  pub sequence: u64,
  /// travel direction
  pub direction: Direction,
  /// arrival time of the chunk that completed the frame, unix millis
  pub timestamp: u64,
  /// role assigned by framing
  pub role: FrameRole,
  /// sequence number of the request this response was paired with
  pub paired_with: Option<u64>,
}
