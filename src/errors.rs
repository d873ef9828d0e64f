//! engine error
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `linetap::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Transport error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// An activation name that no registered protocol answers to
  #[error("unknown protocol activation: {0}")]
  UnknownProtocol(String),
  /// A modifier descriptor whose name has no registered factory
  #[error("unknown modifier: {0}")]
  UnknownModifier(String),
  /// A modifier descriptor with missing or malformed parameters
  #[error("invalid modifier `{modifier}`: {reason}")]
  InvalidModifier {
    /// descriptor name
    modifier: String,
    /// what is wrong with it
    reason: String,
  },
  /// A typed accessor was used on a node lacking the capability
  #[error("node lacks capability `{0}`")]
  MissingCapability(&'static str),
  /// A malformed node path expression
  #[error("invalid path expression `{path}`: {reason}")]
  InvalidPath {
    /// the expression
    path: String,
    /// why it was rejected
    reason: String,
  },
  /// A rewrite stage gave up on a frame
  #[error("modifier `{modifier}` failed: {reason}")]
  Modifier {
    /// stage name
    modifier: String,
    /// failure description
    reason: String,
  },
  /// Connection error
  #[error("connection error: {0}")]
  Connection(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// Create an invalid modifier error and log it
  pub fn invalid_modifier(modifier: impl Into<String>, reason: impl Into<String>) -> Self {
    let error = Error::InvalidModifier {
      modifier: modifier.into(),
      reason: reason.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a modifier failure
  ///
  /// Not logged here: the pipeline reports it as an event and keeps going.
  pub fn modifier(modifier: impl Into<String>, reason: impl Into<String>) -> Self {
    Error::Modifier {
      modifier: modifier.into(),
      reason: reason.into(),
    }
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
    Error::InvalidPath {
      path: path.to_string(),
      reason: reason.into(),
    }
  }
}
