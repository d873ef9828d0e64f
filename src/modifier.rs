//! Rewriting messages before they are forwarded
//!
//! A [`ModifierPipeline`] is an ordered list of [`Modifier`] stages resolved
//! from [`ModifierDescriptor`]s through a [`ModifierRegistry`]. Each stage
//! sees the bytes the previous stage produced and the tree rebuilt from
//! them; a stage that fails is skipped and reported, the frame is still
//! forwarded.
use crate::errors::{Error, Result};
use crate::node::MessageNode;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the built-in substring replacement stage
pub const REPLACE_CONTENT: &str = "ReplaceContent";

/// Ordered key/value parameters of a descriptor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
  /// Value of `key`
  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
  }
  /// Set `key`, replacing an earlier value
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    let value = value.into();
    match self.0.iter_mut().find(|(k, _)| *k == key) {
      Some((_, existing)) => *existing = value,
      None => self.0.push((key, value)),
    }
  }
  /// Pairs in insertion order
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
  /// Number of parameters
  pub fn len(&self) -> usize {
    self.0.len()
  }
  /// Whether there are none
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Parameters {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(self.0.len()))?;
    for (k, v) in &self.0 {
      map.serialize_entry(k, v)?;
    }
    map.end()
  }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Parameters {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    struct ParametersVisitor;

    impl<'de> serde::de::Visitor<'de> for ParametersVisitor {
      type Value = Parameters;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of string parameters")
      }

      fn visit_map<A: serde::de::MapAccess<'de>>(self, mut access: A) -> std::result::Result<Parameters, A::Error> {
        let mut parameters = Parameters::default();
        while let Some((k, v)) = access.next_entry::<String, String>()? {
          parameters.insert(k, v);
        }
        Ok(parameters)
      }
    }

    deserializer.deserialize_map(ParametersVisitor)
  }
}

/// Configuration record naming a modifier and its parameters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModifierDescriptor {
  /// registered modifier name
  pub name: String,
  /// stage parameters
  #[cfg_attr(feature = "serde", serde(default))]
  pub parameters: Parameters,
}

impl ModifierDescriptor {
  /// Descriptor without parameters
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      parameters: Parameters::default(),
    }
  }
  /// Add a parameter
  pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.parameters.insert(key, value);
    self
  }
  /// Descriptor of the built-in replacement stage
  pub fn replace_content(target: impl Into<String>, replacement: impl Into<String>) -> Self {
    Self::new(REPLACE_CONTENT)
      .with_parameter("target", target)
      .with_parameter("replacement", replacement)
  }
  /// A parameter that must be present
  pub fn require(&self, key: &str) -> Result<&str> {
    self
      .parameters
      .get(key)
      .ok_or_else(|| Error::invalid_modifier(&self.name, format!("missing parameter `{}`", key)))
  }
}

/// One rewrite stage
pub trait Modifier: Send + Sync {
  /// Stage name used in reports
  fn name(&self) -> &str;
  /// Offer the current bytes of a frame together with its tree.
  ///
  /// `Ok(None)` declines. Returned bytes replace the frame on the wire.
  fn apply(&self, content: &[u8], node: &MessageNode) -> Result<Option<Bytes>>;
}

/// Literal substring replacement, every occurrence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplaceContent {
  target: Vec<u8>,
  replacement: Vec<u8>,
}

impl ReplaceContent {
  /// Replace `target` with `replacement`
  pub fn new(target: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Self {
    Self {
      target: target.into(),
      replacement: replacement.into(),
    }
  }

  /// Build the stage from a descriptor with `target` and `replacement`
  pub fn from_descriptor(descriptor: &ModifierDescriptor) -> Result<Self> {
    let target = descriptor.require("target")?;
    if target.is_empty() {
      return Err(Error::invalid_modifier(&descriptor.name, "`target` must not be empty"));
    }
    let replacement = descriptor.parameters.get("replacement").unwrap_or_default();
    Ok(Self::new(target, replacement))
  }
}

impl Modifier for ReplaceContent {
  fn name(&self) -> &str {
    REPLACE_CONTENT
  }

  fn apply(&self, content: &[u8], _node: &MessageNode) -> Result<Option<Bytes>> {
    let mut out = BytesMut::with_capacity(content.len());
    let mut rest = content;
    let mut replaced = false;
    while let Some(at) = rest.windows(self.target.len()).position(|w| w == self.target.as_slice()) {
      out.extend_from_slice(&rest[..at]);
      out.extend_from_slice(&self.replacement);
      rest = &rest[at + self.target.len()..];
      replaced = true;
    }
    if !replaced {
      return Ok(None);
    }
    out.extend_from_slice(rest);
    Ok(Some(out.freeze()))
  }
}

type Factory = Arc<dyn Fn(&ModifierDescriptor) -> Result<Arc<dyn Modifier>> + Send + Sync>;

/// Modifier name → factory
#[derive(Clone, Default)]
pub struct ModifierRegistry {
  factories: HashMap<String, Factory>,
}

impl fmt::Debug for ModifierRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<&String> = self.factories.keys().collect();
    names.sort();
    f.debug_struct("ModifierRegistry").field("factories", &names).finish()
  }
}

impl ModifierRegistry {
  /// Empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry knowing [`REPLACE_CONTENT`]
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(REPLACE_CONTENT, |descriptor| {
      Ok(Arc::new(ReplaceContent::from_descriptor(descriptor)?) as Arc<dyn Modifier>)
    });
    registry
  }

  /// Add or replace a factory
  pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
  where
    F: Fn(&ModifierDescriptor) -> Result<Arc<dyn Modifier>> + Send + Sync + 'static,
  {
    self.factories.insert(name.into(), Arc::new(factory));
  }

  /// Instantiate one stage
  pub fn resolve(&self, descriptor: &ModifierDescriptor) -> Result<Arc<dyn Modifier>> {
    let factory = self
      .factories
      .get(&descriptor.name)
      .ok_or_else(|| Error::UnknownModifier(descriptor.name.clone()))?;
    factory(descriptor)
  }

  /// Instantiate stages in configuration order
  pub fn pipeline(&self, descriptors: &[ModifierDescriptor]) -> Result<ModifierPipeline> {
    let mut pipeline = ModifierPipeline::new();
    for descriptor in descriptors {
      pipeline.push(self.resolve(descriptor)?);
    }
    Ok(pipeline)
  }
}

/// What a pipeline run did to one frame
#[derive(Debug, Default)]
pub struct ModifierOutcome {
  /// tree of the new frame bytes, if any stage changed them
  pub rewritten: Option<MessageNode>,
  /// names of the stages that changed the bytes
  pub applied: Vec<String>,
  /// stages that failed and were skipped
  pub failures: Vec<Error>,
}

/// Ordered rewrite stages
#[derive(Clone, Default)]
pub struct ModifierPipeline {
  stages: Vec<Arc<dyn Modifier>>,
}

impl ModifierPipeline {
  /// Pipeline without stages
  pub fn new() -> Self {
    Self::default()
  }
  /// Append a stage
  pub fn push(&mut self, stage: Arc<dyn Modifier>) {
    self.stages.push(stage);
  }
  /// Number of stages
  pub fn len(&self) -> usize {
    self.stages.len()
  }
  /// Whether the pipeline has no stages
  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  /// Run every stage over the frame `node` was built from.
  ///
  /// After a stage changed the bytes, `rebuild` turns them into the tree the
  /// next stage sees.
  pub fn apply<F>(&self, node: &MessageNode, rebuild: F) -> ModifierOutcome
  where
    F: Fn(Bytes) -> MessageNode,
  {
    let mut outcome = ModifierOutcome::default();
    let mut rewritten: Option<MessageNode> = None;
    for stage in &self.stages {
      let current = rewritten.as_ref().unwrap_or(node);
      match stage.apply(current.raw(), current) {
        Ok(Some(bytes)) if bytes != current.raw() => {
          outcome.applied.push(stage.name().to_string());
          rewritten = Some(rebuild(bytes));
        }
        Ok(_) => {}
        Err(e) => {
          tracing::warn!("[linetap] modifier {} skipped: {}", stage.name(), e);
          outcome.failures.push(e);
        }
      }
    }
    outcome.rewritten = rewritten;
    outcome
  }
}
