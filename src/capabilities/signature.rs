//! Signature metadata of shell-exposed classes and their methods.
//!
//! A [`ClassSpec`] is what a class declares at registration time, with any
//! per-method metadata left unset. The registry turns it into a
//! [`TypeSignature`] tree where every field is populated.
//!
//! Class specs can also be written in YAML:
//! ```yaml
//! class:
//!   name: Cursor
//!   extends: AbstractCursor
//!   has_help: true
//!   methods:
//!     - name: limit
//!       return_type: this
//!     - name: collation
//!       server_versions: { min: "3.4.0" }
//!     - name: count
//!       returns_promise: true
//!       return_type: { primitive: number }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ShellResult;

/// Earliest server version a method can be gated on.
pub const EARLIEST_SERVER_VERSION: &str = "0.0.0";
/// Latest server version a method can be gated on.
pub const LATEST_SERVER_VERSION: &str = "999.999.999";

/// Inclusive server-version range, as semver strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default = "earliest")]
    pub min: String,
    #[serde(default = "latest")]
    pub max: String,
}

fn earliest() -> String {
    EARLIEST_SERVER_VERSION.to_string()
}

fn latest() -> String {
    LATEST_SERVER_VERSION.to_string()
}

impl VersionRange {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// From `min` up to the latest version.
    pub fn since(min: impl Into<String>) -> Self {
        Self::new(min, LATEST_SERVER_VERSION)
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::new(EARLIEST_SERVER_VERSION, LATEST_SERVER_VERSION)
    }
}

/// Inclusive stable-API version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersionRange {
    #[serde(default)]
    pub min: u32,
    #[serde(default = "api_max")]
    pub max: u32,
}

fn api_max() -> u32 {
    u32::MAX
}

impl ApiVersionRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }
}

impl Default for ApiVersionRange {
    fn default() -> Self {
        Self::new(0, u32::MAX)
    }
}

/// Deployment topology of the connected server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    ReplSet,
    Standalone,
    Sharded,
    LoadBalanced,
}

impl Topology {
    pub const ALL: [Topology; 4] = [
        Topology::ReplSet,
        Topology::Standalone,
        Topology::Sharded,
        Topology::LoadBalanced,
    ];
}

/// Host product embedding the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    Compass,
    Browser,
    Cli,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Compass, Platform::Browser, Platform::Cli];
}

/// What a method returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// Not declared.
    Unknown,
    /// The receiving class. Resolved to [`ReturnType::Class`] at registration.
    This,
    /// A primitive tag such as `"number"` or `"boolean"`.
    Primitive(String),
    /// Another registered class, looked up as a nested signature.
    Class(String),
}

impl Default for ReturnType {
    fn default() -> Self {
        Self::Unknown
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Per-method metadata as declared. Unset fields take defaults at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub server_versions: Option<VersionRange>,
    #[serde(default)]
    pub api_versions: Option<ApiVersionRange>,
    #[serde(default)]
    pub topologies: Option<Vec<Topology>>,
    #[serde(default)]
    pub platforms: Option<Vec<Platform>>,
    #[serde(default)]
    pub returns_promise: Option<bool>,
    #[serde(default)]
    pub deprecated: Option<bool>,
    #[serde(default)]
    pub return_type: Option<ReturnType>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Mark the method asynchronous (its result is awaited).
    pub fn returns_promise(mut self) -> Self {
        self.returns_promise = Some(true);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = Some(true);
        self
    }

    pub fn returns(mut self, return_type: ReturnType) -> Self {
        self.return_type = Some(return_type);
        self
    }

    /// Chainable: returns the receiving class.
    pub fn returns_this(self) -> Self {
        self.returns(ReturnType::This)
    }

    pub fn returns_primitive(self, tag: impl Into<String>) -> Self {
        self.returns(ReturnType::Primitive(tag.into()))
    }

    pub fn returns_class(self, class: impl Into<String>) -> Self {
        self.returns(ReturnType::Class(class.into()))
    }

    pub fn server_versions(mut self, range: VersionRange) -> Self {
        self.server_versions = Some(range);
        self
    }

    pub fn api_versions(mut self, range: ApiVersionRange) -> Self {
        self.api_versions = Some(range);
        self
    }

    pub fn topologies(mut self, topologies: &[Topology]) -> Self {
        self.topologies = Some(topologies.to_vec());
        self
    }

    pub fn platforms(mut self, platforms: &[Platform]) -> Self {
        self.platforms = Some(platforms.to_vec());
        self
    }
}

/// A class as declared for registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSpec {
    pub name: String,
    /// Parent class. `None` means the class derives directly from the root.
    #[serde(default)]
    pub extends: Option<String>,
    /// Whether the class signature is published for help and completion.
    #[serde(default)]
    pub has_help: bool,
    #[serde(default)]
    pub returns_promise: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
}

#[derive(Debug, Deserialize)]
struct SingleClassWrapper {
    class: ClassSpec,
}

#[derive(Debug, Deserialize)]
struct ClassListWrapper {
    classes: Vec<ClassSpec>,
}

impl ClassSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn with_help(mut self, has_help: bool) -> Self {
        self.has_help = has_help;
        self
    }

    pub fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    /// Parse a YAML document holding one `class:` entry.
    pub fn from_yaml(yaml: &str) -> ShellResult<Self> {
        let wrapper: SingleClassWrapper = serde_yaml::from_str(yaml)?;
        Ok(wrapper.class)
    }

    /// Parse a YAML document holding either `class:` or a `classes:` list.
    pub fn list_from_yaml(yaml: &str) -> ShellResult<Vec<Self>> {
        if let Ok(single) = Self::from_yaml(yaml) {
            return Ok(vec![single]);
        }
        let list: ClassListWrapper = serde_yaml::from_str(yaml)?;
        Ok(list.classes)
    }
}

// ---------------------------------------------------------------------------
// Resolved signatures
// ---------------------------------------------------------------------------

/// Fully populated signature node.
///
/// A class node lists its methods in `attributes`; a method node has no
/// attributes of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSignature {
    #[serde(rename = "type")]
    pub name: String,
    pub server_versions: VersionRange,
    pub api_versions: ApiVersionRange,
    pub topologies: Vec<Topology>,
    pub platforms: Vec<Platform>,
    pub returns_promise: bool,
    pub deprecated: bool,
    pub return_type: ReturnType,
    /// Taken from an ancestor class rather than declared on this class.
    pub inherited: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, TypeSignature>,
}

impl TypeSignature {
    /// Resolve a method declaration owned by `class_name`.
    pub fn from_method(spec: &MethodSpec, class_name: &str, inherited: bool) -> Self {
        let return_type = match spec.return_type.clone().unwrap_or_default() {
            ReturnType::This => ReturnType::Class(class_name.to_string()),
            other => other,
        };
        Self {
            name: spec.name.clone(),
            server_versions: spec.server_versions.clone().unwrap_or_default(),
            api_versions: spec.api_versions.unwrap_or_default(),
            topologies: spec
                .topologies
                .clone()
                .unwrap_or_else(|| Topology::ALL.to_vec()),
            platforms: spec
                .platforms
                .clone()
                .unwrap_or_else(|| Platform::ALL.to_vec()),
            returns_promise: spec.returns_promise.unwrap_or(false),
            deprecated: spec.deprecated.unwrap_or(false),
            return_type,
            inherited,
            attributes: BTreeMap::new(),
        }
    }

    /// Class node with no attributes yet.
    pub fn class_node(spec: &ClassSpec) -> Self {
        Self {
            name: spec.name.clone(),
            server_versions: VersionRange::default(),
            api_versions: ApiVersionRange::default(),
            topologies: Topology::ALL.to_vec(),
            platforms: Platform::ALL.to_vec(),
            returns_promise: spec.returns_promise,
            deprecated: spec.deprecated,
            return_type: ReturnType::Class(spec.name.clone()),
            inherited: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&TypeSignature> {
        self.attributes.get(name)
    }
}
