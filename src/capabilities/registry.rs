//! Signature Registry: process-wide signature tree of shell-exposed classes.
//!
//! Classes are registered once at startup, from builders or YAML manifests.
//! Registration walks the class's own methods first, then each ancestor up
//! to the shared root, producing a fully populated [`TypeSignature`] and the
//! i18n help keys of every attribute. The tree is append-only: a class can
//! never be registered twice.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use super::builtin::builtin_classes;
use super::signature::{ClassSpec, TypeSignature};
use crate::error::{ShellError, ShellResult};

/// Name of the shared root every exposed class derives from.
pub const ROOT_CLASS: &str = "ShellApiClass";

/// Method names never exposed in signatures.
pub const IGNORED_MEMBERS: [&str; 2] = ["constructor", "help"];

/// Prefix of internal members excluded from signatures.
pub const INTERNAL_PREFIX: char = '_';

/// Whether a member name is eligible for a signature entry.
pub fn is_exposed_member(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(INTERNAL_PREFIX) && !IGNORED_MEMBERS.contains(&name)
}

/// Help key prefix of a class.
pub fn class_help_prefix(class: &str) -> String {
    format!("shell-api.classes.{class}.help")
}

// ---------------------------------------------------------------------------
// Help metadata
// ---------------------------------------------------------------------------

/// One attribute line of class help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeHelp {
    pub name: String,
    pub description: String,
}

/// Help keys of a class, resolved by the i18n layer at display time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassHelp {
    pub help: String,
    pub docs: String,
    pub attributes: Vec<AttributeHelp>,
}

/// Help keys of a single method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodHelp {
    pub example: String,
    pub docs: String,
    pub description: String,
}

impl MethodHelp {
    pub fn for_method(class: &str, method: &str) -> Self {
        let prefix = format!("{}.attributes.{method}", class_help_prefix(class));
        Self {
            example: format!("{prefix}.example"),
            docs: format!("{prefix}.link"),
            description: format!("{prefix}.description"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Signature tree keyed by class name.
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    /// Declarations, kept so subclasses can re-resolve inherited methods.
    specs: HashMap<String, ClassSpec>,
    /// Every registered class.
    classes: HashMap<String, TypeSignature>,
    /// Help keys per class.
    help: HashMap<String, ClassHelp>,
    /// Names of classes published for help and completion.
    published: HashSet<String>,
}

impl SignatureRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in cursor and result classes.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for spec in builtin_classes() {
            let name = spec.name.clone();
            if let Err(e) = reg.register(spec) {
                log::error!("failed to register built-in class {}: {}", name, e);
            }
        }
        reg
    }

    /// Register a class. Parents must be registered first.
    pub fn register(&mut self, spec: ClassSpec) -> ShellResult<&TypeSignature> {
        if spec.name.is_empty() {
            return Err(ShellError::invalid_input("class name must not be empty"));
        }
        if spec.name == ROOT_CLASS || self.classes.contains_key(&spec.name) {
            return Err(ShellError::invalid_input(format!(
                "class {} is already registered",
                spec.name
            )));
        }

        let class_name = spec.name.clone();
        let prefix = class_help_prefix(&class_name);
        let mut signature = TypeSignature::class_node(&spec);
        let mut help = ClassHelp {
            help: format!("{prefix}.description"),
            docs: format!("{prefix}.link"),
            attributes: Vec::new(),
        };

        for method in spec.methods.iter().filter(|m| is_exposed_member(&m.name)) {
            if signature.attributes.contains_key(&method.name) {
                return Err(ShellError::invalid_input(format!(
                    "method {}.{} is declared twice",
                    class_name, method.name
                )));
            }
            signature.attributes.insert(
                method.name.clone(),
                TypeSignature::from_method(method, &class_name, false),
            );
            help.attributes.push(AttributeHelp {
                name: method.name.clone(),
                description: MethodHelp::for_method(&class_name, &method.name).description,
            });
        }

        let mut parent = spec.extends.clone();
        let mut visited = HashSet::new();
        while let Some(ancestor) = parent {
            if ancestor == ROOT_CLASS {
                break;
            }
            if !visited.insert(ancestor.clone()) {
                return Err(ShellError::Internal(format!(
                    "inheritance cycle through {ancestor}"
                )));
            }
            let ancestor_spec = self.specs.get(&ancestor).ok_or_else(|| {
                ShellError::invalid_input(format!(
                    "class {class_name} extends unregistered class {ancestor}"
                ))
            })?;
            for method in ancestor_spec
                .methods
                .iter()
                .filter(|m| is_exposed_member(&m.name))
            {
                if signature.attributes.contains_key(&method.name) {
                    continue;
                }
                signature.attributes.insert(
                    method.name.clone(),
                    TypeSignature::from_method(method, &class_name, true),
                );
                help.attributes.push(AttributeHelp {
                    name: method.name.clone(),
                    description: MethodHelp::for_method(&ancestor, &method.name).description,
                });
            }
            parent = ancestor_spec.extends.clone();
        }

        log::debug!(
            "registered class {} with {} attributes",
            class_name,
            signature.attributes.len()
        );
        if spec.has_help {
            self.published.insert(class_name.clone());
        }
        self.help.insert(class_name.clone(), help);
        self.specs.insert(class_name.clone(), spec);
        Ok(self.classes.entry(class_name).or_insert(signature))
    }

    /// Register every class in a YAML manifest string, in document order.
    ///
    /// A manifest registers all of its classes or none of them.
    pub fn register_from_yaml(&mut self, yaml: &str) -> ShellResult<usize> {
        let specs = ClassSpec::list_from_yaml(yaml)?;
        self.atomically(|reg| {
            let count = specs.len();
            for spec in specs {
                reg.register(spec)?;
            }
            Ok(count)
        })
    }

    /// Run `load`, dropping every class it registered if it fails.
    fn atomically<T>(&mut self, load: impl FnOnce(&mut Self) -> ShellResult<T>) -> ShellResult<T> {
        let before: HashSet<String> = self.classes.keys().cloned().collect();
        let out = load(self);
        if out.is_err() {
            let added: Vec<String> = self
                .classes
                .keys()
                .filter(|name| !before.contains(*name))
                .cloned()
                .collect();
            for name in added {
                log::debug!("rolling back class {}", name);
                self.classes.remove(&name);
                self.specs.remove(&name);
                self.help.remove(&name);
                self.published.remove(&name);
            }
        }
        out
    }

    /// Register the classes of a YAML manifest file.
    pub fn register_from_file(&mut self, path: &Path) -> ShellResult<usize> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShellError::invalid_input(format!("cannot read {}: {e}", path.display()))
        })?;
        self.register_from_yaml(&content)
    }

    /// Load every `.yaml`/`.yml` manifest in a directory, sorted by file name.
    ///
    /// The load is all-or-nothing: a manifest that fails names its file in
    /// the error and leaves the registry as it was before the call.
    pub fn load_directory(&mut self, dir: &Path) -> ShellResult<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ShellError::invalid_input(format!("cannot read {}: {e}", dir.display()))
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map_or(false, |ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        paths.sort();

        self.atomically(|reg| {
            let mut count = 0;
            for path in paths {
                count += reg.register_from_file(&path).map_err(|e| {
                    ShellError::invalid_input(format!(
                        "failed to load class manifest {}: {e}",
                        path.display()
                    ))
                })?;
            }
            Ok(count)
        })
    }

    /// Signature of any registered class, published or not.
    pub fn resolve(&self, class: &str) -> Option<&TypeSignature> {
        self.classes.get(class)
    }

    /// Signature of one method of a class.
    pub fn method(&self, class: &str, method: &str) -> Option<&TypeSignature> {
        self.classes.get(class).and_then(|c| c.attributes.get(method))
    }

    /// Signature of the value a method returns, when it is a registered class.
    pub fn return_signature(&self, class: &str, method: &str) -> Option<&TypeSignature> {
        match &self.method(class, method)?.return_type {
            super::signature::ReturnType::Class(name) => self.classes.get(name),
            _ => None,
        }
    }

    /// Help keys of a class.
    pub fn help(&self, class: &str) -> Option<&ClassHelp> {
        self.help.get(class)
    }

    pub fn is_published(&self, class: &str) -> bool {
        self.published.contains(class)
    }

    /// The public signature map: published classes only.
    pub fn signatures(&self) -> BTreeMap<&str, &TypeSignature> {
        self.classes
            .iter()
            .filter(|(name, _)| self.published.contains(*name))
            .map(|(name, sig)| (name.as_str(), sig))
            .collect()
    }

    /// Every registered class name, sorted.
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

static SIGNATURES: Lazy<RwLock<SignatureRegistry>> =
    Lazy::new(|| RwLock::new(SignatureRegistry::with_builtins()));

/// Read access to the process-wide registry.
pub fn signatures() -> RwLockReadGuard<'static, SignatureRegistry> {
    SIGNATURES.read()
}

/// Register a class in the process-wide registry.
pub fn register_class(spec: ClassSpec) -> ShellResult<()> {
    SIGNATURES.write().register(spec).map(|_| ())
}

/// Whether `class.method` is declared deprecated in the process-wide registry.
pub fn is_deprecated(class: &str, method: &str) -> bool {
    signatures()
        .method(class, method)
        .map_or(false, |m| m.deprecated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::signature::{MethodSpec, ReturnType, Topology, VersionRange};

    fn base() -> ClassSpec {
        ClassSpec::new("Base")
            .method(MethodSpec::new("close").returns_promise())
            .method(MethodSpec::new("batchSize").returns_this())
            .method(MethodSpec::new("_internal"))
            .method(MethodSpec::new("help"))
    }

    fn child() -> ClassSpec {
        ClassSpec::new("Child")
            .extends("Base")
            .with_help(true)
            .method(MethodSpec::new("close").deprecated())
            .method(MethodSpec::new("limit").returns_this())
    }

    #[test]
    fn test_own_methods_take_precedence() {
        let mut reg = SignatureRegistry::new();
        reg.register(base()).unwrap();
        let sig = reg.register(child()).unwrap().clone();

        let close = sig.method("close").unwrap();
        assert!(close.deprecated);
        assert!(!close.returns_promise);
        assert!(!close.inherited);

        let batch = sig.method("batchSize").unwrap();
        assert!(batch.inherited);
        assert_eq!(batch.return_type, ReturnType::Class("Child".into()));
    }

    #[test]
    fn test_internal_and_ignored_members_excluded() {
        let mut reg = SignatureRegistry::new();
        let sig = reg.register(base()).unwrap();
        assert!(sig.method("_internal").is_none());
        assert!(sig.method("help").is_none());
        assert_eq!(sig.attributes.len(), 2);
    }

    #[test]
    fn test_append_only() {
        let mut reg = SignatureRegistry::new();
        reg.register(base()).unwrap();
        let err = reg.register(base()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert!(reg.register(ClassSpec::new(ROOT_CLASS)).is_err());
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut reg = SignatureRegistry::new();
        assert!(reg.register(child()).is_err());
        assert!(reg.resolve("Child").is_none());
    }

    #[test]
    fn test_help_participation() {
        let mut reg = SignatureRegistry::new();
        reg.register(base()).unwrap();
        reg.register(child()).unwrap();
        assert!(!reg.is_published("Base"));
        assert!(reg.is_published("Child"));
        assert!(reg.resolve("Base").is_some());
        let public = reg.signatures();
        assert_eq!(public.keys().copied().collect::<Vec<_>>(), vec!["Child"]);
    }

    #[test]
    fn test_help_keys() {
        let mut reg = SignatureRegistry::new();
        reg.register(base()).unwrap();
        reg.register(child()).unwrap();
        let help = reg.help("Child").unwrap();
        assert_eq!(help.help, "shell-api.classes.Child.help.description");
        assert_eq!(help.docs, "shell-api.classes.Child.help.link");
        let batch = help
            .attributes
            .iter()
            .find(|a| a.name == "batchSize")
            .unwrap();
        assert_eq!(
            batch.description,
            "shell-api.classes.Base.help.attributes.batchSize.description"
        );
        let m = MethodHelp::for_method("Child", "limit");
        assert_eq!(m.example, "shell-api.classes.Child.help.attributes.limit.example");
    }

    #[test]
    fn test_every_builtin_method_is_populated() {
        let reg = SignatureRegistry::with_builtins();
        assert!(!reg.is_empty());
        for name in reg.class_names() {
            let class = reg.resolve(name).unwrap();
            for (method, sig) in &class.attributes {
                assert_eq!(&sig.name, method);
                assert!(!sig.topologies.is_empty(), "{name}.{method}");
                assert!(!sig.platforms.is_empty(), "{name}.{method}");
                assert!(!sig.server_versions.min.is_empty(), "{name}.{method}");
                assert!(!sig.server_versions.max.is_empty(), "{name}.{method}");
                assert_ne!(sig.return_type, ReturnType::This, "{name}.{method}");
            }
        }
    }

    #[test]
    fn test_global_registry_has_cursor_classes() {
        let reg = signatures();
        let cursor = reg.resolve("Cursor").unwrap();
        assert_eq!(
            cursor.method("collation").unwrap().server_versions,
            VersionRange::since("3.4.0")
        );
        assert_eq!(
            cursor.method("limit").unwrap().return_type,
            ReturnType::Class("Cursor".into())
        );
        assert!(cursor.method("toArray").unwrap().inherited);
        assert!(reg.is_published("Cursor"));
        assert!(!reg.is_published("AbstractCursor"));
        assert_eq!(
            reg.return_signature("AggregationCursor", "map").map(|s| s.name.as_str()),
            Some("AggregationCursor")
        );
    }

    #[test]
    fn test_register_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "classes:\n  - name: Alpha\n    methods:\n      - name: run\n        topologies: [Sharded]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.yml"), "class:\n  name: Beta\n  extends: Alpha\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut reg = SignatureRegistry::new();
        let count = reg.load_directory(dir.path()).unwrap();
        assert_eq!(count, 2);
        let run = reg.method("Beta", "run").unwrap();
        assert!(run.inherited);
        assert_eq!(run.topologies, vec![Topology::Sharded]);
    }

    #[test]
    fn test_failing_manifest_registers_nothing() {
        let mut reg = SignatureRegistry::new();
        let err = reg
            .register_from_yaml(
                "classes:\n  - name: Gamma\n    has_help: true\n  - name: Delta\n    extends: Missing\n",
            )
            .unwrap_err();
        assert!(err.to_string().contains("Missing"));
        assert!(reg.resolve("Gamma").is_none());
        assert!(!reg.is_published("Gamma"));

        // Nothing was left behind, so the same names register cleanly.
        assert_eq!(
            reg.register_from_yaml("classes:\n  - name: Gamma\n  - name: Delta\n    extends: Gamma\n")
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_failing_directory_load_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "class:\n  name: Alpha\n").unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "classes:\n  - name: Beta\n  - name: Beta\n",
        )
        .unwrap();

        let mut reg = SignatureRegistry::new();
        reg.register(ClassSpec::new("Existing")).unwrap();
        let err = reg.load_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("b.yaml"));
        assert!(reg.resolve("Alpha").is_none());
        assert!(reg.resolve("Beta").is_none());
        assert!(reg.resolve("Existing").is_some());
    }

    #[test]
    fn test_unparseable_manifest_fails_directory_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "class: [").unwrap();
        let mut reg = SignatureRegistry::new();
        let err = reg.load_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let mut reg = SignatureRegistry::new();
        assert_eq!(
            reg.load_directory(Path::new("/definitely/not/here")).unwrap(),
            0
        );
    }
}
