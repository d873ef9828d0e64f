#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # linetap
//!
//! The `linetap` crate sits between a client and a server speaking a
//! line-oriented protocol and turns the two raw byte streams into typed,
//! navigable messages while forwarding them.
//!
//! - Reassembles messages split across reads and splits reads carrying
//!   several messages ([`framing`])
//! - Builds a [`MessageNode`] tree per message with pluggable parsers
//!   ([`protocol`]: POP3, SMTP, MIME bodies)
//! - Pairs every response with the request it answers ([`pairing`])
//! - Rewrites messages in flight ([`modifier`])
//! - Publishes everything to [`TrafficObserver`]s
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use linetap::{ForwardProxy, ModifierDescriptor, Observer, ProxyConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> linetap::Result<()> {
//! let config = ProxyConfig::new("pop.example.com:110")
//!   .with_activation("pop3")
//!   .with_activation("mime")
//!   .with_modifier(ModifierDescriptor::replace_content("RETR 1", "RETR 2"));
//! let proxy = ForwardProxy::from_config(config, vec![Arc::new(Observer::logging())])?;
//! proxy.run("127.0.0.1:1110").await
//! # }
//! ```
//!
//! ## Replaying a session
//!
//! [`Connection`] drives the same pipelines without sockets: feed it what
//! each side sent and it returns what would be forwarded.
//!
//! ```rust
//! use linetap::{Connection, ConnectionInfo, Direction, Interception, Observer, ProtocolRegistry};
//! use linetap::modifier::ModifierPipeline;
//! use std::sync::Arc;
//!
//! # fn run() -> linetap::Result<()> {
//! let log = Observer::log();
//! let protocols = ProtocolRegistry::with_defaults().activate(&["pop3"])?;
//! let interception = Interception::new(protocols, ModifierPipeline::new()).with_observer(log.clone());
//! let mut connection = Connection::new(Arc::new(interception), ConnectionInfo::new(1, "client", "server"));
//! connection.on_bytes(Direction::ServerToClient, b"+OK ready\r\n", 0);
//! connection.on_bytes(Direction::ClientToServer, b"STAT\r\n", 1);
//! connection.on_bytes(Direction::ServerToClient, b"+OK 2 320\r\n", 2);
//! assert_eq!(log.pairings().len(), 1);
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! ## Optional Features
//!
//! - **serde**: Provides serialization and deserialization of the
//!   configuration and record types.
//!
pub mod builder;
mod errors;
pub mod framing;
pub mod modifier;
pub mod node;
pub mod observer;
pub mod orchestrator;
pub mod pairing;
pub mod protocol;
pub mod proxy;
pub mod record;

pub use builder::{ContentParser, MessageBuilder, ParseContext, ParseError};
pub use errors::{Error, Result};
pub use framing::{ByteAccumulator, Continuation, Frame, FrameDecision, FrameDetector};
pub use modifier::{Modifier, ModifierDescriptor, ModifierPipeline, ModifierRegistry};
pub use node::{Capability, MessageNode, NodeValue};
pub use observer::{MessageLog, Observer, TrafficEvent, TrafficObserver};
pub use orchestrator::{Connection, DuplexOrchestrator, Interception, WriteRequest};
pub use pairing::{PairingAnomaly, PairingEngine, PairingRecord};
pub use protocol::{ProtocolPlugin, ProtocolRegistry};
pub use proxy::{ForwardProxy, ProxyConfig};
pub use record::{ConnectionInfo, Direction, FrameRole, Transmission};
