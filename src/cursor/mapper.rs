//! Per-document transforms installed with `map()`.
//!
//! A mapper is either named, built from the process-wide [`MapperRegistry`]
//! with JSON arguments, or anonymous. Only named mappers survive a
//! construction record round trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use crate::error::{ShellError, ShellResult};

/// A per-document transform.
pub type MapFn = Arc<dyn Fn(Value) -> ShellResult<Value> + Send + Sync>;

/// Builds a transform from its recorded arguments.
pub type MapperFactory = fn(&Value) -> ShellResult<MapFn>;

/// Apply `first`, then `then`.
pub fn compose(first: MapFn, then: MapFn) -> MapFn {
    Arc::new(move |doc| then(first(doc)?))
}

// ---------------------------------------------------------------------------
// DocumentMapper
// ---------------------------------------------------------------------------

/// A transform plus what is needed to record it.
#[derive(Clone)]
pub struct DocumentMapper {
    name: Option<String>,
    args: Value,
    func: MapFn,
}

impl DocumentMapper {
    /// An anonymous mapper. It cannot be replayed in another context.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Value) -> ShellResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: None,
            args: Value::Null,
            func: Arc::new(func),
        }
    }

    /// A registered mapper built from `args`.
    pub fn named(name: &str, args: Value) -> ShellResult<Self> {
        let factory = MAPPERS.read().get(name).ok_or_else(|| {
            ShellError::invalid_input(format!("unknown document mapper: {name}"))
        })?;
        Ok(Self {
            name: Some(name.to_string()),
            func: factory(&args)?,
            args,
        })
    }

    /// Rebuild a mapper from its recorded form.
    pub fn from_record(record: &Value) -> ShellResult<Self> {
        match record.get("$mapper") {
            Some(Value::String(name)) => {
                let args = record.get("args").cloned().unwrap_or(Value::Null);
                Self::named(name, args).map_err(|e| ShellError::reconstruction(e.to_string()))
            }
            Some(Value::Null) => Err(ShellError::reconstruction(
                "an anonymous map function cannot be reconstructed",
            )),
            _ => Err(ShellError::reconstruction(format!(
                "malformed mapper record: {record}"
            ))),
        }
    }

    /// Recorded form: `{"$mapper": name-or-null, "args": ...}`.
    pub fn record(&self) -> Value {
        json!({"$mapper": self.name, "args": self.args})
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn apply(&self, doc: Value) -> ShellResult<Value> {
        (self.func)(doc)
    }

    pub fn func(&self) -> MapFn {
        self.func.clone()
    }
}

impl fmt::Debug for DocumentMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentMapper")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MapperRegistry
// ---------------------------------------------------------------------------

/// Named mapper factories.
#[derive(Default)]
pub struct MapperRegistry {
    factories: HashMap<String, MapperFactory>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `pick`, `field` and `set`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("pick", pick);
        reg.register("field", field);
        reg.register("set", set);
        reg
    }

    /// Register or replace a factory.
    pub fn register(&mut self, name: impl Into<String>, factory: MapperFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            log::debug!("replaced document mapper {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<MapperFactory> {
        self.factories.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("mappers", &self.names())
            .finish()
    }
}

static MAPPERS: Lazy<RwLock<MapperRegistry>> =
    Lazy::new(|| RwLock::new(MapperRegistry::with_builtins()));

/// Register a named mapper for every context in this process.
pub fn register_mapper(name: impl Into<String>, factory: MapperFactory) {
    MAPPERS.write().register(name, factory);
}

fn object(doc: Value) -> ShellResult<Map<String, Value>> {
    match doc {
        Value::Object(map) => Ok(map),
        other => Err(ShellError::invalid_input(format!(
            "mapper expects a document, got {other}"
        ))),
    }
}

/// `pick(["a", "b"])` keeps only the listed top-level fields.
fn pick(args: &Value) -> ShellResult<MapFn> {
    let fields: Vec<String> = match args {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ShellError::invalid_input("pick fields must be strings"))
            })
            .collect::<ShellResult<_>>()?,
        _ => return Err(ShellError::invalid_input("pick expects an array of field names")),
    };
    Ok(Arc::new(move |doc| {
        let mut map = object(doc)?;
        map.retain(|k, _| fields.iter().any(|f| f == k));
        Ok(Value::Object(map))
    }))
}

/// `field("a")` replaces the document by the value of one field.
fn field(args: &Value) -> ShellResult<MapFn> {
    let name = args
        .as_str()
        .ok_or_else(|| ShellError::invalid_input("field expects a field name"))?
        .to_string();
    Ok(Arc::new(move |doc| {
        Ok(doc.get(&name).cloned().unwrap_or(Value::Null))
    }))
}

/// `set({...})` merges fixed fields into the document.
fn set(args: &Value) -> ShellResult<MapFn> {
    let fields = args
        .as_object()
        .cloned()
        .ok_or_else(|| ShellError::invalid_input("set expects a document"))?;
    Ok(Arc::new(move |doc| {
        let mut map = object(doc)?;
        for (k, v) in &fields {
            map.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(map))
    }))
}
