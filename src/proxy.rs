//! Forward proxy configuration and accept loop

use crate::errors::{Error, Result};
use crate::modifier::{ModifierDescriptor, ModifierRegistry};
use crate::observer::TrafficObserver;
use crate::orchestrator::{DuplexOrchestrator, Interception};
use crate::protocol::ProtocolRegistry;
use crate::record::ConnectionInfo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Configuration for the forward proxy
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct ProxyConfig {
  /// Server every accepted client is connected to, `host:port`
  pub upstream: String,
  /// Protocol activation names, in priority order
  pub activations: Vec<String>,
  /// Rewrite stages, in application order
  pub modifiers: Vec<ModifierDescriptor>,
  /// Size of socket reads in bytes
  pub read_buffer_size: usize,
  /// Bytes that may stay pending without a complete frame
  pub max_frame_size: usize,
  /// Upstream connect timeout in seconds
  pub connect_timeout: u64,
  /// Milliseconds the second direction may run on after the first ended
  pub shutdown_grace: u64,
  /// Enable TCP keepalive on both sockets
  pub tcp_keepalive: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      upstream: String::new(),
      activations: Vec::new(),
      modifiers: Vec::new(),
      read_buffer_size: 8192,
      max_frame_size: 1024 * 1024,
      connect_timeout: 30,
      shutdown_grace: 500,
      tcp_keepalive: false,
    }
  }
}

impl ProxyConfig {
  /// Configuration forwarding to `upstream`
  pub fn new(upstream: impl Into<String>) -> Self {
    Self {
      upstream: upstream.into(),
      ..Default::default()
    }
  }
  /// Enable a protocol
  pub fn with_activation(mut self, name: impl Into<String>) -> Self {
    self.activations.push(name.into());
    self
  }
  /// Append a rewrite stage
  pub fn with_modifier(mut self, modifier: ModifierDescriptor) -> Self {
    self.modifiers.push(modifier);
    self
  }
  /// Set the pending-bytes bound
  pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
    self.max_frame_size = max_frame_size;
    self
  }
  /// Set the upstream connect timeout in seconds
  pub fn with_connect_timeout(mut self, seconds: u64) -> Self {
    self.connect_timeout = seconds;
    self
  }
  /// Set the shutdown grace in milliseconds
  pub fn with_shutdown_grace(mut self, millis: u64) -> Self {
    self.shutdown_grace = millis;
    self
  }
  /// Enable TCP keepalive
  pub fn with_tcp_keepalive(mut self, enabled: bool) -> Self {
    self.tcp_keepalive = enabled;
    self
  }
}

/// Proxy server accepting clients and intercepting their sessions
pub struct ForwardProxy {
  config: ProxyConfig,
  orchestrator: DuplexOrchestrator,
  next_id: Arc<AtomicU64>,
}

impl ForwardProxy {
  /// Create a proxy around a resolved interception
  pub fn new(config: ProxyConfig, interception: Interception) -> Self {
    Self {
      config,
      orchestrator: DuplexOrchestrator::new(Arc::new(interception)),
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Create a proxy resolving `config` against the default registries
  pub fn from_config(config: ProxyConfig, observers: Vec<Arc<dyn TrafficObserver>>) -> Result<Self> {
    let mut interception = Interception::from_config(
      &config,
      &ProtocolRegistry::with_defaults(),
      &ModifierRegistry::with_defaults(),
    )?;
    for observer in observers {
      interception = interception.with_observer(observer);
    }
    Ok(Self::new(config, interception))
  }

  /// Configuration in use
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Bind `addr` and run the proxy server
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to bind to {}: {}", addr, e)))?;
    self.serve(listener).await
  }

  /// Accept clients from `listener` forever
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    if let Ok(local) = listener.local_addr() {
      tracing::info!("[linetap] listening on {} -> {}", local, self.config.upstream);
    }
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let config = self.config.clone();
          let orchestrator = self.orchestrator.clone();
          let id = self.next_id.fetch_add(1, Ordering::SeqCst);

          tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, peer_addr, id, config, orchestrator).await {
              tracing::error!("[linetap] Error handling connection #{}: {}", id, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[linetap] Failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Handle a client connection
  async fn handle_connection(
    client_stream: TcpStream,
    peer_addr: SocketAddr,
    id: u64,
    config: ProxyConfig,
    orchestrator: DuplexOrchestrator,
  ) -> Result<()> {
    let connect = TcpStream::connect(&config.upstream);
    let server_stream = tokio::time::timeout(Duration::from_secs(config.connect_timeout), connect)
      .await
      .map_err(|_| Error::connection_error(format!("Timed out connecting to {}", config.upstream)))?
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}: {}", config.upstream, e)))?;
    for stream in [&client_stream, &server_stream] {
      Self::tune(stream, config.tcp_keepalive)?;
    }
    let info = ConnectionInfo::from_addrs(id, peer_addr, config.upstream.clone());
    tracing::debug!("[linetap] intercepting {}", info);
    orchestrator.run(info, client_stream, server_stream).await
  }

  fn tune(stream: &TcpStream, keepalive: bool) -> Result<()> {
    stream.set_nodelay(true)?;
    if keepalive {
      socket2::SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
  }
}
