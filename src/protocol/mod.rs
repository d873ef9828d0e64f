//! Protocol plugins
//!
//! The engine itself knows nothing about any protocol. A plugin bundles the
//! frame detector and the parsers of one protocol under an activation name;
//! a [`ProtocolRegistry`] resolves the names enabled in the configuration
//! into the detector and message builder a connection runs with.
use crate::builder::{ContentParser, MessageBuilder};
use crate::errors::{Error, Result};
use crate::framing::{ChunkDetector, FrameDetector};
use std::sync::Arc;

mod line;
pub mod mime;
pub mod pop3;
pub mod smtp;

/// What one protocol contributes
#[derive(Clone, Default)]
pub struct ProtocolPlugin {
  /// frame boundaries, if the protocol frames streams
  pub detector: Option<Arc<dyn FrameDetector>>,
  /// parser for whole frames, used together with the detector
  pub message_parser: Option<Arc<dyn ContentParser>>,
  /// parser offered every body node
  pub body_parser: Option<Arc<dyn ContentParser>>,
}

impl ProtocolPlugin {
  /// Plugin that frames streams and parses the frames
  pub fn framing<P>(protocol: P) -> Self
  where
    P: FrameDetector + ContentParser + 'static,
  {
    let protocol = Arc::new(protocol);
    Self {
      detector: Some(protocol.clone()),
      message_parser: Some(protocol),
      body_parser: None,
    }
  }

  /// Plugin that only structures bodies
  pub fn body<P>(parser: P) -> Self
  where
    P: ContentParser + 'static,
  {
    Self {
      detector: None,
      message_parser: None,
      body_parser: Some(Arc::new(parser)),
    }
  }
}

/// Detector and builder resolved from a list of activations
#[derive(Clone)]
pub struct ActiveProtocols {
  /// frame detector every connection uses
  pub detector: Arc<dyn FrameDetector>,
  /// builder turning frames into trees
  pub builder: MessageBuilder,
}

impl Default for ActiveProtocols {
  fn default() -> Self {
    Self {
      detector: Arc::new(ChunkDetector),
      builder: MessageBuilder::default(),
    }
  }
}

/// Activation name → plugin
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
  plugins: Vec<(String, ProtocolPlugin)>,
}

impl ProtocolRegistry {
  /// Empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry knowing `pop3`, `smtp` and `mime`
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(pop3::NAME, ProtocolPlugin::framing(pop3::Pop3));
    registry.register(smtp::NAME, ProtocolPlugin::framing(smtp::Smtp));
    registry.register(mime::NAME, ProtocolPlugin::body(mime::MimeParser));
    registry
  }

  /// Add or replace a plugin
  pub fn register(&mut self, name: impl Into<String>, plugin: ProtocolPlugin) {
    let name = name.into();
    match self.plugins.iter_mut().find(|(n, _)| *n == name) {
      Some((_, existing)) => *existing = plugin,
      None => self.plugins.push((name, plugin)),
    }
  }

  /// Registered activation names
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.plugins.iter().map(|(n, _)| n.as_str())
  }

  /// Plugin registered under `name`
  pub fn get(&self, name: &str) -> Option<&ProtocolPlugin> {
    self
      .plugins
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, p)| p)
  }

  /// Resolve activations in order.
  ///
  /// The first activated plugin with a detector frames the streams; later
  /// detectors are ignored. Without any, reads pass through as raw frames.
  pub fn activate<S: AsRef<str>>(&self, activations: &[S]) -> Result<ActiveProtocols> {
    let mut framing: Option<(&str, &ProtocolPlugin)> = None;
    let mut body_parsers = Vec::new();
    for activation in activations {
      let name = activation.as_ref();
      let plugin = self
        .get(name)
        .ok_or_else(|| Error::UnknownProtocol(name.to_string()))?;
      if let Some(parser) = &plugin.body_parser {
        body_parsers.push(parser.clone());
      }
      if plugin.detector.is_some() {
        match framing {
          None => framing = Some((name, plugin)),
          Some((active, _)) => tracing::warn!(
            "[linetap] {} already frames the streams; ignoring the detector of {}",
            active,
            name
          ),
        }
      }
    }
    let (detector, message_parser) = match framing {
      Some((_, plugin)) => (
        plugin.detector.clone().unwrap_or_else(|| Arc::new(ChunkDetector)),
        plugin.message_parser.clone(),
      ),
      None => (Arc::new(ChunkDetector) as Arc<dyn FrameDetector>, None),
    };
    tracing::debug!("[linetap] framing with {}", detector.name());
    Ok(ActiveProtocols {
      detector,
      builder: MessageBuilder::new(message_parser, body_parsers),
    })
  }
}
