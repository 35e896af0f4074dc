//! In-memory service provider.
//!
//! Stores documents per namespace and serves them through batched native
//! cursors with the same observable behaviour as a driver cursor: nothing is
//! fetched until the first iteration, documents arrive in server batches
//! (101 by default), and the resource reports `closed` as soon as the last
//! batch has been fetched even while buffered documents remain readable.
//! Writes publish change events to every open change stream.
//!
//! Latency and one-shot failures can be injected to exercise cancellation
//! and error translation. A round trip that is abandoned before its latency
//! elapses has no effect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use super::query::{apply_update, matches, project, run_pipeline, sort_documents, upsert_seed};
use super::{
    CursorFlag, ExplainVerbosity, FindOption, NativeChangeStream, NativeCursor, NativeFindCursor,
    NativeIteration, NativeQueryCursor, ReadPreferenceMode, ServiceProvider,
};
use crate::error::{ShellError, ShellResult};

/// Server batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 101;

const CHANGE_CAPACITY: usize = 1024;

fn namespace(database: &str, collection: &str) -> String {
    format!("{database}.{collection}")
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    latency: RwLock<Option<Duration>>,
    fail_next: Mutex<Option<ShellError>>,
    round_trips: AtomicUsize,
}

impl Faults {
    async fn round_trip(&self) -> ShellResult<()> {
        let latency = *self.latency.read();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UpdateOutcome {
    matched: u64,
    modified: u64,
    upserted_id: Option<Value>,
}

#[derive(Debug)]
struct Store {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    changes: broadcast::Sender<Value>,
    next_id: AtomicU64,
    change_seq: AtomicU64,
}

impl Store {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            changes,
            next_id: AtomicU64::new(1),
            change_seq: AtomicU64::new(1),
        }
    }

    fn docs(&self, ns: &str) -> Vec<Value> {
        self.collections.read().get(ns).cloned().unwrap_or_default()
    }

    fn with_id(&self, doc: Value) -> ShellResult<(Value, Value)> {
        let Value::Object(mut map) = doc else {
            return Err(ShellError::resource_with_code("2", "document must be an object"));
        };
        let id = match map.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
                // `_id` leads, as on the server.
                let mut with_id = Map::new();
                with_id.insert("_id".to_string(), id.clone());
                with_id.extend(map);
                map = with_id;
                id
            }
        };
        Ok((Value::Object(map), id))
    }

    fn publish(&self, database: &str, collection: &str, op: &str, id: &Value, full: Option<Value>) {
        let seq = self.change_seq.fetch_add(1, Ordering::SeqCst);
        let mut event = json!({
            "_id": {"_data": format!("{seq:016X}")},
            "operationType": op,
            "ns": {"db": database, "coll": collection},
            "documentKey": {"_id": id},
        });
        if let (Some(full), Some(map)) = (full, event.as_object_mut()) {
            map.insert("fullDocument".to_string(), full);
        }
        let _ = self.changes.send(event);
    }

    fn insert(&self, database: &str, collection: &str, doc: Value) -> ShellResult<Value> {
        let (doc, id) = self.with_id(doc)?;
        let ns = namespace(database, collection);
        {
            let mut collections = self.collections.write();
            let docs = collections.entry(ns).or_default();
            if docs.iter().any(|d| d.get("_id") == Some(&id)) {
                return Err(ShellError::resource_with_code(
                    "11000",
                    format!("E11000 duplicate key error collection: {database}.{collection} dup key: {{ _id: {id} }}"),
                ));
            }
            docs.push(doc.clone());
        }
        self.publish(database, collection, "insert", &id, Some(doc));
        Ok(id)
    }

    fn update(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
        multi: bool,
    ) -> ShellResult<UpdateOutcome> {
        let ns = namespace(database, collection);
        let replacement = update
            .as_object()
            .map_or(false, |m| !m.keys().any(|k| k.starts_with('$')));
        let mut outcome = UpdateOutcome::default();
        let mut changed = Vec::new();
        {
            let mut collections = self.collections.write();
            let docs = collections.entry(ns).or_default();
            for doc in docs.iter_mut() {
                if !matches(doc, filter)? {
                    continue;
                }
                outcome.matched += 1;
                let before = doc.clone();
                apply_update(doc, update)?;
                if *doc != before {
                    outcome.modified += 1;
                    changed.push(doc.clone());
                }
                if !multi {
                    break;
                }
            }
        }
        let op = if replacement { "replace" } else { "update" };
        for doc in changed {
            let id = doc.get("_id").cloned().unwrap_or(Value::Null);
            self.publish(database, collection, op, &id, Some(doc));
        }
        if outcome.matched == 0 && upsert {
            let mut seed = upsert_seed(filter);
            apply_update(&mut seed, update)?;
            outcome.upserted_id = Some(self.insert(database, collection, seed)?);
        }
        Ok(outcome)
    }

    fn delete(&self, database: &str, collection: &str, filter: &Value, multi: bool) -> ShellResult<u64> {
        let ns = namespace(database, collection);
        let mut removed = Vec::new();
        {
            let mut collections = self.collections.write();
            let Some(docs) = collections.get_mut(&ns) else {
                return Ok(0);
            };
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs.drain(..) {
                if (multi || removed.is_empty()) && matches(&doc, filter)? {
                    removed.push(doc);
                } else {
                    kept.push(doc);
                }
            }
            *docs = kept;
        }
        for doc in &removed {
            let id = doc.get("_id").cloned().unwrap_or(Value::Null);
            self.publish(database, collection, "delete", &id, None);
        }
        Ok(removed.len() as u64)
    }

    fn collection_names(&self, database: &str) -> Vec<String> {
        let prefix = format!("{database}.");
        let mut names: Vec<String> = self
            .collections
            .read()
            .keys()
            .filter_map(|ns| ns.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// MemoryProvider
// ---------------------------------------------------------------------------

/// A service provider backed by process memory. Clones share storage.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    store: Arc<Store>,
    faults: Arc<Faults>,
    batch_size: usize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::new()),
            faults: Arc::new(Faults::default()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Provider whose cursors fetch `batch_size` documents per round trip.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..Self::new()
        }
    }

    /// Store documents directly, without change events. Missing `_id`s are assigned.
    pub fn seed(
        &self,
        database: &str,
        collection: &str,
        docs: impl IntoIterator<Item = Value>,
    ) -> ShellResult<()> {
        let mut prepared = Vec::new();
        for doc in docs {
            prepared.push(self.store.with_id(doc)?.0);
        }
        self.store
            .collections
            .write()
            .entry(namespace(database, collection))
            .or_default()
            .extend(prepared);
        Ok(())
    }

    /// Snapshot of a collection's documents in storage order.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Value> {
        self.store.docs(&namespace(database, collection))
    }

    /// Delay every subsequent round trip by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.write() = latency;
    }

    /// Fail the next round trip with `err`.
    pub fn fail_next(&self, err: ShellError) {
        *self.faults.fail_next.lock() = Some(err);
    }

    /// Completed round trips so far.
    pub fn round_trips(&self) -> usize {
        self.faults.round_trips.load(Ordering::SeqCst)
    }

    fn cursor(&self, source: Source, options: &Value) -> MemoryCursor {
        let mut cursor = MemoryCursor {
            store: self.store.clone(),
            faults: self.faults.clone(),
            source,
            limit: None,
            skip: 0,
            sort: None,
            projection: None,
            batch_size: self.batch_size,
            max_time_ms: None,
            flags: Vec::new(),
            read_preference: None,
            options: Map::new(),
            pending: None,
            buffer: VecDeque::new(),
            killed: false,
        };
        cursor.apply_open_options(options);
        cursor
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn pipeline_from(value: Option<&Value>) -> ShellResult<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(stages)) => Ok(stages.clone()),
        Some(other) => Err(ShellError::resource_with_code(
            "14",
            format!("pipeline must be an array, got {other}"),
        )),
    }
}

#[async_trait]
impl ServiceProvider for MemoryProvider {
    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        options: Value,
    ) -> ShellResult<Box<dyn NativeFindCursor>> {
        let source = Source::Find {
            namespace: namespace(database, collection),
            filter,
        };
        Ok(Box::new(self.cursor(source, &options)))
    }

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Value>,
        options: Value,
    ) -> ShellResult<Box<dyn NativeQueryCursor>> {
        let source = Source::Pipeline {
            namespace: Some(namespace(database, collection)),
            pipeline,
        };
        Ok(Box::new(self.cursor(source, &options)))
    }

    fn aggregate_db(
        &self,
        _database: &str,
        pipeline: Vec<Value>,
        options: Value,
    ) -> ShellResult<Box<dyn NativeQueryCursor>> {
        let source = Source::Pipeline {
            namespace: None,
            pipeline,
        };
        Ok(Box::new(self.cursor(source, &options)))
    }

    fn run_cursor_command(
        &self,
        database: &str,
        command: Value,
        options: Value,
    ) -> ShellResult<Box<dyn NativeCursor>> {
        if !command.is_object() {
            return Err(ShellError::invalid_input("command must be a document"));
        }
        let source = Source::Command {
            database: database.to_string(),
            command,
        };
        Ok(Box::new(self.cursor(source, &options)))
    }

    fn watch(
        &self,
        database: &str,
        collection: Option<&str>,
        pipeline: Vec<Value>,
        _options: Value,
    ) -> ShellResult<Box<dyn NativeChangeStream>> {
        Ok(Box::new(MemoryChangeStream {
            rx: self.store.changes.subscribe(),
            faults: self.faults.clone(),
            database: database.to_string(),
            collection: collection.map(str::to_string),
            pipeline,
            peeked: None,
            resume_token: None,
            closed: false,
        }))
    }

    async fn insert_one(&self, database: &str, collection: &str, doc: Value) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let id = self.store.insert(database, collection, doc)?;
        Ok(json!({"acknowledged": true, "insertedId": id}))
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Value>,
    ) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let mut ids = Map::new();
        for (i, doc) in docs.into_iter().enumerate() {
            let id = self.store.insert(database, collection, doc)?;
            ids.insert(i.to_string(), id);
        }
        Ok(json!({"acknowledged": true, "insertedIds": ids}))
    }

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let upsert = options.get("upsert").and_then(Value::as_bool).unwrap_or(false);
        let out = self
            .store
            .update(database, collection, &filter, &update, upsert, false)?;
        Ok(update_reply(out))
    }

    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let upsert = options.get("upsert").and_then(Value::as_bool).unwrap_or(false);
        let out = self
            .store
            .update(database, collection, &filter, &update, upsert, true)?;
        Ok(update_reply(out))
    }

    async fn delete_one(&self, database: &str, collection: &str, filter: Value) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let n = self.store.delete(database, collection, &filter, false)?;
        Ok(json!({"acknowledged": true, "deletedCount": n}))
    }

    async fn delete_many(&self, database: &str, collection: &str, filter: Value) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let n = self.store.delete(database, collection, &filter, true)?;
        Ok(json!({"acknowledged": true, "deletedCount": n}))
    }

    async fn bulk_write(
        &self,
        database: &str,
        collection: &str,
        operations: Vec<Value>,
    ) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let mut inserted_ids = Map::new();
        let mut upserted_ids = Map::new();
        let (mut matched, mut modified, mut deleted) = (0u64, 0u64, 0u64);
        let null = Value::Null;
        for (i, op) in operations.iter().enumerate() {
            let Some((name, args)) = op
                .as_object()
                .filter(|m| m.len() == 1)
                .and_then(|m| m.iter().next())
            else {
                return Err(ShellError::invalid_input(format!(
                    "bulk operation {i} must have exactly one key"
                )));
            };
            let filter = args.get("filter").unwrap_or(&null);
            let upsert = args.get("upsert").and_then(Value::as_bool).unwrap_or(false);
            match name.as_str() {
                "insertOne" => {
                    let doc = args.get("document").cloned().unwrap_or(Value::Null);
                    let id = self.store.insert(database, collection, doc)?;
                    inserted_ids.insert(i.to_string(), id);
                }
                "updateOne" | "updateMany" | "replaceOne" => {
                    let update = args
                        .get("update")
                        .or_else(|| args.get("replacement"))
                        .unwrap_or(&null);
                    let out = self.store.update(
                        database,
                        collection,
                        filter,
                        update,
                        upsert,
                        name == "updateMany",
                    )?;
                    matched += out.matched;
                    modified += out.modified;
                    if let Some(id) = out.upserted_id {
                        upserted_ids.insert(i.to_string(), id);
                    }
                }
                "deleteOne" | "deleteMany" => {
                    deleted += self
                        .store
                        .delete(database, collection, filter, name == "deleteMany")?;
                }
                other => {
                    return Err(ShellError::invalid_input(format!(
                        "unknown bulk operation: {other}"
                    )))
                }
            }
        }
        Ok(json!({
            "acknowledged": true,
            "insertedCount": inserted_ids.len(),
            "insertedIds": inserted_ids,
            "matchedCount": matched,
            "modifiedCount": modified,
            "deletedCount": deleted,
            "upsertedCount": upserted_ids.len(),
            "upsertedIds": upserted_ids,
        }))
    }

    async fn run_command(&self, database: &str, command: Value) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let Some((name, arg)) = command.as_object().and_then(|m| m.iter().next()) else {
            return Err(ShellError::invalid_input("command must be a non-empty document"));
        };
        match name.as_str() {
            "ping" => Ok(json!({"ok": 1})),
            "buildInfo" | "buildinfo" => Ok(json!({"version": "7.0.0", "versionArray": [7, 0, 0, 0], "ok": 1})),
            "count" => {
                let coll = arg.as_str().unwrap_or_default();
                let query = command.get("query").cloned().unwrap_or(Value::Null);
                let mut n = 0u64;
                for doc in self.store.docs(&namespace(database, coll)) {
                    if matches(&doc, &query)? {
                        n += 1;
                    }
                }
                Ok(json!({"n": n, "ok": 1}))
            }
            "drop" => {
                let coll = arg.as_str().unwrap_or_default();
                let removed = self
                    .store
                    .collections
                    .write()
                    .remove(&namespace(database, coll));
                match removed {
                    Some(_) => Ok(json!({"ns": namespace(database, coll), "ok": 1})),
                    None => Err(ShellError::resource_with_code("26", "ns not found")),
                }
            }
            "listCollections" => {
                let batch: Vec<Value> = self
                    .store
                    .collection_names(database)
                    .into_iter()
                    .map(|name| json!({"name": name, "type": "collection"}))
                    .collect();
                Ok(json!({
                    "cursor": {"id": 0, "ns": format!("{database}.$cmd.listCollections"), "firstBatch": batch},
                    "ok": 1
                }))
            }
            other => Err(ShellError::resource_with_code(
                "59",
                format!("no such command: '{other}'"),
            )),
        }
    }
}

fn update_reply(out: UpdateOutcome) -> Value {
    json!({
        "acknowledged": true,
        "matchedCount": out.matched,
        "modifiedCount": out.modified,
        "upsertedCount": u64::from(out.upserted_id.is_some()),
        "upsertedId": out.upserted_id,
    })
}

// ---------------------------------------------------------------------------
// MemoryCursor
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Source {
    Find { namespace: String, filter: Value },
    Pipeline { namespace: Option<String>, pipeline: Vec<Value> },
    Command { database: String, command: Value },
}

/// Batched cursor over a find, an aggregation or a cursor command.
#[derive(Debug)]
pub struct MemoryCursor {
    store: Arc<Store>,
    faults: Arc<Faults>,
    source: Source,
    limit: Option<i64>,
    skip: u64,
    sort: Option<Value>,
    projection: Option<Value>,
    batch_size: usize,
    max_time_ms: Option<u64>,
    flags: Vec<CursorFlag>,
    read_preference: Option<ReadPreferenceMode>,
    options: Map<String, Value>,
    /// Server-side results not yet fetched. `None` until the first round trip.
    pending: Option<VecDeque<Value>>,
    buffer: VecDeque<Value>,
    killed: bool,
}

impl MemoryCursor {
    fn apply_open_options(&mut self, options: &Value) {
        let Some(map) = options.as_object() else {
            return;
        };
        for (key, value) in map {
            match key.as_str() {
                "limit" => self.limit = value.as_i64(),
                "skip" => self.skip = value.as_u64().unwrap_or(0),
                "sort" => self.sort = Some(value.clone()),
                "projection" => self.projection = Some(value.clone()),
                "batchSize" => {
                    if let Some(n) = value.as_u64().filter(|n| *n > 0) {
                        self.batch_size = n as usize;
                    }
                }
                "maxTimeMS" => self.max_time_ms = value.as_u64(),
                _ => {
                    self.options.insert(key.clone(), value.clone());
                }
            }
        }
    }

    fn ensure_unstarted(&self) -> ShellResult<()> {
        if self.pending.is_some() || self.killed {
            return Err(ShellError::resource("Cursor is already initialized"));
        }
        Ok(())
    }

    fn command_documents(&self, database: &str, command: &Value) -> ShellResult<Vec<Value>> {
        let Some((name, arg)) = command.as_object().and_then(|m| m.iter().next()) else {
            return Err(ShellError::invalid_input("command must be a non-empty document"));
        };
        match name.as_str() {
            "find" => {
                let ns = namespace(database, arg.as_str().unwrap_or_default());
                let filter = command.get("filter").cloned().unwrap_or(Value::Null);
                let mut docs = Vec::new();
                for doc in self.store.docs(&ns) {
                    if matches(&doc, &filter)? {
                        docs.push(doc);
                    }
                }
                if let Some(sort) = command.get("sort") {
                    sort_documents(&mut docs, sort)?;
                }
                if let Some(n) = command.get("limit").and_then(Value::as_u64).filter(|n| *n > 0) {
                    docs.truncate(n as usize);
                }
                Ok(docs)
            }
            "aggregate" => {
                let docs = match arg.as_str() {
                    Some(coll) => self.store.docs(&namespace(database, coll)),
                    None => Vec::new(),
                };
                run_pipeline(docs, &pipeline_from(command.get("pipeline"))?)
            }
            "listCollections" => Ok(self
                .store
                .collection_names(database)
                .into_iter()
                .map(|name| json!({"name": name, "type": "collection"}))
                .collect()),
            other => Err(ShellError::resource_with_code(
                "59",
                format!("no such command: '{other}'"),
            )),
        }
    }

    /// Every document this cursor would return, ignoring what was fetched.
    fn evaluate(&self) -> ShellResult<Vec<Value>> {
        let mut docs = match &self.source {
            Source::Find { namespace, filter } => {
                let mut docs = Vec::new();
                for doc in self.store.docs(namespace) {
                    if matches(&doc, filter)? {
                        docs.push(doc);
                    }
                }
                docs
            }
            Source::Pipeline {
                namespace,
                pipeline,
            } => {
                let docs = namespace
                    .as_deref()
                    .map(|ns| self.store.docs(ns))
                    .unwrap_or_default();
                return run_pipeline(docs, pipeline);
            }
            Source::Command { database, command } => self.command_documents(database, command)?,
        };
        if let Some(sort) = &self.sort {
            sort_documents(&mut docs, sort)?;
        }
        let skip = usize::try_from(self.skip).unwrap_or(usize::MAX);
        let mut docs: Vec<Value> = docs.into_iter().skip(skip).collect();
        if let Some(limit) = self.limit.filter(|n| *n != 0) {
            docs.truncate(limit.unsigned_abs() as usize);
        }
        match &self.projection {
            Some(spec) => docs.iter().map(|d| project(d, spec)).collect(),
            None => Ok(docs),
        }
    }

    async fn fetch_batch(&mut self) -> ShellResult<()> {
        self.faults.round_trip().await?;
        if self.pending.is_none() {
            self.pending = Some(self.evaluate()?.into());
        }
        if let Some(pending) = self.pending.as_mut() {
            for _ in 0..self.batch_size.max(1) {
                match pending.pop_front() {
                    Some(doc) => self.buffer.push_back(doc),
                    None => break,
                }
            }
        }
        Ok(())
    }

    async fn pull(&mut self) -> ShellResult<Option<Value>> {
        if let Some(doc) = self.buffer.pop_front() {
            return Ok(Some(doc));
        }
        if self.closed() {
            return Ok(None);
        }
        self.fetch_batch().await?;
        Ok(self.buffer.pop_front())
    }

    fn namespace_label(&self) -> String {
        match &self.source {
            Source::Find { namespace, .. } => namespace.clone(),
            Source::Pipeline { namespace, .. } => namespace.clone().unwrap_or_default(),
            Source::Command { database, .. } => format!("{database}.$cmd"),
        }
    }
}

#[async_trait]
impl NativeIteration for MemoryCursor {
    async fn has_next(&mut self) -> ShellResult<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        if self.closed() {
            return Ok(false);
        }
        self.fetch_batch().await?;
        Ok(!self.buffer.is_empty())
    }

    async fn next(&mut self) -> ShellResult<Option<Value>> {
        self.pull().await
    }

    async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        self.pull().await
    }

    async fn close(&mut self) -> ShellResult<()> {
        if !self.killed {
            self.killed = true;
            self.pending = Some(VecDeque::new());
        }
        Ok(())
    }

    fn closed(&self) -> bool {
        self.killed || self.pending.as_ref().map_or(false, VecDeque::is_empty)
    }
}

#[async_trait]
impl NativeCursor for MemoryCursor {
    async fn to_array(&mut self) -> ShellResult<Vec<Value>> {
        let mut out: Vec<Value> = self.buffer.drain(..).collect();
        while !self.closed() {
            self.fetch_batch().await?;
            out.extend(self.buffer.drain(..));
        }
        Ok(out)
    }

    fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    fn batch_size(&mut self, size: u32) -> ShellResult<()> {
        self.batch_size = if size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            size as usize
        };
        Ok(())
    }

    fn max_time_ms(&mut self, ms: u64) -> ShellResult<()> {
        self.ensure_unstarted()?;
        self.max_time_ms = Some(ms);
        Ok(())
    }
}

#[async_trait]
impl NativeQueryCursor for MemoryCursor {
    fn project(&mut self, projection: Value) -> ShellResult<()> {
        self.ensure_unstarted()?;
        match &mut self.source {
            Source::Pipeline { pipeline, .. } => pipeline.push(json!({"$project": projection})),
            _ => self.projection = Some(projection),
        }
        Ok(())
    }

    fn skip(&mut self, n: u64) -> ShellResult<()> {
        self.ensure_unstarted()?;
        match &mut self.source {
            Source::Pipeline { pipeline, .. } => pipeline.push(json!({"$skip": n})),
            _ => self.skip = n,
        }
        Ok(())
    }

    fn sort(&mut self, sort: Value) -> ShellResult<()> {
        self.ensure_unstarted()?;
        match &mut self.source {
            Source::Pipeline { pipeline, .. } => pipeline.push(json!({"$sort": sort})),
            _ => self.sort = Some(sort),
        }
        Ok(())
    }

    async fn explain(&mut self, verbosity: ExplainVerbosity) -> ShellResult<Value> {
        self.faults.round_trip().await?;
        let examined = match &self.source {
            Source::Find { namespace, .. } => self.store.docs(namespace).len(),
            Source::Pipeline {
                namespace: Some(ns),
                ..
            } => self.store.docs(ns).len(),
            _ => 0,
        };
        let returned = self.evaluate()?.len();
        let parsed_query = match &self.source {
            Source::Find { filter, .. } => filter.clone(),
            Source::Pipeline { pipeline, .. } => json!(pipeline),
            Source::Command { command, .. } => command.clone(),
        };
        let stage = if self.sort.is_some() { "SORT" } else { "COLLSCAN" };
        Ok(json!({
            "explainVersion": "1",
            "queryPlanner": {
                "namespace": self.namespace_label(),
                "parsedQuery": parsed_query,
                "winningPlan": {"stage": stage},
                "rejectedPlans": [],
            },
            "executionStats": {
                "executionSuccess": true,
                "nReturned": returned,
                "totalDocsExamined": examined,
            },
            "command": {"verbosity": verbosity.as_str(), "options": self.options.clone()},
            "ok": 1,
        }))
    }
}

#[async_trait]
impl NativeFindCursor for MemoryCursor {
    fn limit(&mut self, n: i64) -> ShellResult<()> {
        self.ensure_unstarted()?;
        self.limit = Some(n);
        Ok(())
    }

    fn set_option(&mut self, option: FindOption) -> ShellResult<()> {
        self.ensure_unstarted()?;
        self.options.insert(option.name().to_string(), option.value());
        Ok(())
    }

    fn add_cursor_flag(&mut self, flag: CursorFlag, on: bool) -> ShellResult<()> {
        self.ensure_unstarted()?;
        self.flags.retain(|f| *f != flag);
        if on {
            self.flags.push(flag);
        }
        Ok(())
    }

    fn with_read_preference(&mut self, mode: ReadPreferenceMode) -> ShellResult<()> {
        self.ensure_unstarted()?;
        self.read_preference = Some(mode);
        Ok(())
    }

    async fn count(&mut self, apply_skip_limit: bool) -> ShellResult<u64> {
        self.faults.round_trip().await?;
        if apply_skip_limit {
            return Ok(self.evaluate()?.len() as u64);
        }
        let total = match &self.source {
            Source::Find { namespace, filter } => {
                let mut n = 0u64;
                for doc in self.store.docs(namespace) {
                    if matches(&doc, filter)? {
                        n += 1;
                    }
                }
                n
            }
            _ => self.evaluate()?.len() as u64,
        };
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// MemoryChangeStream
// ---------------------------------------------------------------------------

/// Change stream fed by the provider's writes.
#[derive(Debug)]
pub struct MemoryChangeStream {
    rx: broadcast::Receiver<Value>,
    faults: Arc<Faults>,
    database: String,
    collection: Option<String>,
    pipeline: Vec<Value>,
    peeked: Option<Value>,
    resume_token: Option<Value>,
    closed: bool,
}

impl MemoryChangeStream {
    fn accepts(&self, event: &Value) -> ShellResult<bool> {
        let ns = &event["ns"];
        if ns["db"].as_str() != Some(self.database.as_str()) {
            return Ok(false);
        }
        if let Some(coll) = &self.collection {
            if ns["coll"].as_str() != Some(coll.as_str()) {
                return Ok(false);
            }
        }
        Ok(!run_pipeline(vec![event.clone()], &self.pipeline)?.is_empty())
    }

    fn deliver(&mut self, event: Value) -> Value {
        self.resume_token = event.get("_id").cloned();
        event
    }

    fn ensure_open(&self) -> ShellResult<()> {
        if self.closed {
            return Err(ShellError::resource("ChangeStream is closed"));
        }
        Ok(())
    }

    /// Wait for the next accepted event.
    async fn wait_event(&mut self) -> ShellResult<Option<Value>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.accepts(&event)? {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("change stream lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl NativeIteration for MemoryChangeStream {
    async fn has_next(&mut self) -> ShellResult<bool> {
        self.ensure_open()?;
        if self.peeked.is_none() {
            self.peeked = self.wait_event().await?;
        }
        Ok(self.peeked.is_some())
    }

    async fn next(&mut self) -> ShellResult<Option<Value>> {
        self.ensure_open()?;
        let event = match self.peeked.take() {
            Some(event) => Some(event),
            None => self.wait_event().await?,
        };
        Ok(event.map(|e| self.deliver(e)))
    }

    async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        self.ensure_open()?;
        if let Some(event) = self.peeked.take() {
            return Ok(Some(self.deliver(event)));
        }
        self.faults.round_trip().await?;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.accepts(&event)? {
                        return Ok(Some(self.deliver(event)));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("change stream lagged, {} events skipped", skipped);
                }
                Err(_) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> ShellResult<()> {
        self.closed = true;
        self.peeked = None;
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed
    }
}

impl NativeChangeStream for MemoryChangeStream {
    fn resume_token(&self) -> Option<Value> {
        self.resume_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(n: usize) -> MemoryProvider {
        let p = MemoryProvider::new();
        p.seed("test", "items", (0..n).map(|i| json!({"_id": i, "i": i})))
            .unwrap();
        p
    }

    #[tokio::test]
    async fn test_nothing_fetched_until_iteration() {
        let p = seeded(3);
        let cursor = p.find("test", "items", json!({}), json!({})).unwrap();
        assert!(!cursor.closed());
        assert_eq!(cursor.buffered_count(), 0);
        assert_eq!(p.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_closed_after_last_batch_while_buffered() {
        let p = seeded(25);
        let mut cursor = p.find("test", "items", json!({}), json!({})).unwrap();
        let first = cursor.try_next().await.unwrap().unwrap();
        assert_eq!(first["i"], 0);
        assert!(cursor.closed());
        assert_eq!(cursor.buffered_count(), 24);
        assert_eq!(cursor.to_array().await.unwrap().len(), 24);
        assert_eq!(cursor.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_small_batches() {
        let p = MemoryProvider::with_batch_size(2);
        p.seed("test", "items", (0..5).map(|i| json!({"i": i}))).unwrap();
        let mut cursor = p.find("test", "items", json!({}), json!({})).unwrap();
        cursor.try_next().await.unwrap();
        assert!(!cursor.closed());
        assert_eq!(cursor.buffered_count(), 1);
        let rest = cursor.to_array().await.unwrap();
        assert_eq!(rest.len(), 4);
        assert!(cursor.closed());
        assert_eq!(p.round_trips(), 3);
    }

    #[tokio::test]
    async fn test_find_options() {
        let p = seeded(10);
        let mut cursor = p.find("test", "items", json!({"i": {"$gte": 2}}), json!({})).unwrap();
        cursor.sort(json!({"i": -1})).unwrap();
        cursor.skip(1).unwrap();
        cursor.limit(3).unwrap();
        cursor.project(json!({"_id": 0})).unwrap();
        let docs = cursor.to_array().await.unwrap();
        assert_eq!(docs, vec![json!({"i": 8}), json!({"i": 7}), json!({"i": 6})]);
        assert!(cursor.limit(1).is_err());
    }

    #[tokio::test]
    async fn test_close_keeps_buffer() {
        let p = seeded(3);
        let mut cursor = p.find("test", "items", json!({}), json!({})).unwrap();
        assert!(cursor.has_next().await.unwrap());
        cursor.close().await.unwrap();
        cursor.close().await.unwrap();
        assert!(cursor.closed());
        assert_eq!(cursor.buffered_count(), 3);
        assert!(cursor.try_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_aggregate_stages_appended() {
        let p = seeded(5);
        let mut cursor = p
            .aggregate("test", "items", vec![json!({"$match": {"i": {"$lt": 4}}})], json!({}))
            .unwrap();
        cursor.sort(json!({"i": -1})).unwrap();
        cursor.skip(1).unwrap();
        let docs = cursor.to_array().await.unwrap();
        let is: Vec<_> = docs.iter().map(|d| d["i"].as_i64().unwrap()).collect();
        assert_eq!(is, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_aggregate_db_documents_stage() {
        let p = MemoryProvider::new();
        let mut cursor = p
            .aggregate_db("admin", vec![json!({"$documents": [{"x": 1}, {"x": 2}]})], json!({}))
            .unwrap();
        assert_eq!(cursor.to_array().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_command() {
        let p = seeded(4);
        let mut cursor = p
            .run_cursor_command("test", json!({"find": "items", "filter": {"i": 1}}), json!({}))
            .unwrap();
        assert_eq!(cursor.to_array().await.unwrap(), vec![json!({"_id": 1, "i": 1})]);

        let mut bad = p.run_cursor_command("test", json!({"fly": 1}), json!({})).unwrap();
        let err = bad.try_next().await.unwrap_err();
        assert_eq!(err.code(), Some("59"));
    }

    #[tokio::test]
    async fn test_writes_and_replies() {
        let p = MemoryProvider::new();
        let reply = p.insert_one("test", "c", json!({"a": 1})).await.unwrap();
        assert_eq!(reply["acknowledged"], true);
        let id = reply["insertedId"].clone();

        let dup = p.insert_one("test", "c", json!({"_id": id, "a": 2})).await.unwrap_err();
        assert_eq!(dup.code(), Some("11000"));

        let reply = p
            .update_many("test", "c", json!({}), json!({"$inc": {"a": 1}}), json!({}))
            .await
            .unwrap();
        assert_eq!(reply["matchedCount"], 1);
        assert_eq!(reply["modifiedCount"], 1);

        let reply = p
            .update_one("test", "c", json!({"k": "new"}), json!({"$set": {"a": 9}}), json!({"upsert": true}))
            .await
            .unwrap();
        assert_eq!(reply["upsertedCount"], 1);
        assert_eq!(p.documents("test", "c").len(), 2);

        let reply = p.delete_many("test", "c", json!({})).await.unwrap();
        assert_eq!(reply["deletedCount"], 2);
    }

    #[tokio::test]
    async fn test_bulk_write() {
        let p = MemoryProvider::new();
        let reply = p
            .bulk_write(
                "test",
                "c",
                vec![
                    json!({"insertOne": {"document": {"_id": 1, "a": 1}}}),
                    json!({"insertOne": {"document": {"_id": 2, "a": 2}}}),
                    json!({"updateOne": {"filter": {"_id": 1}, "update": {"$set": {"a": 5}}}}),
                    json!({"deleteOne": {"filter": {"_id": 2}}}),
                ],
            )
            .await
            .unwrap();
        assert_eq!(reply["insertedCount"], 2);
        assert_eq!(reply["modifiedCount"], 1);
        assert_eq!(reply["deletedCount"], 1);
        assert_eq!(reply["insertedIds"]["1"], 2);
    }

    #[tokio::test]
    async fn test_injected_failure_and_commands() {
        let p = MemoryProvider::new();
        p.fail_next(ShellError::resource("network down"));
        assert!(p.run_command("admin", json!({"ping": 1})).await.is_err());
        assert_eq!(p.run_command("admin", json!({"ping": 1})).await.unwrap()["ok"], 1);
        let err = p.run_command("admin", json!({"fly": 1})).await.unwrap_err();
        assert!(err.to_string().contains("no such command"));
    }

    #[tokio::test]
    async fn test_abandoned_round_trip_has_no_effect() {
        let p = seeded(2);
        p.set_latency(Some(Duration::from_millis(200)));
        let mut cursor = p.find("test", "items", json!({}), json!({})).unwrap();
        let res = tokio::time::timeout(Duration::from_millis(20), cursor.try_next()).await;
        assert!(res.is_err());
        assert_eq!(cursor.buffered_count(), 0);
        assert!(!cursor.closed());
        p.set_latency(None);
        assert_eq!(cursor.try_next().await.unwrap().unwrap()["i"], 0);
    }

    #[tokio::test]
    async fn test_change_stream_events() {
        let p = MemoryProvider::new();
        let mut stream = p
            .watch("test", Some("c"), vec![json!({"$match": {"operationType": "insert"}})], json!({}))
            .unwrap();
        assert!(stream.try_next().await.unwrap().is_none());
        assert!(stream.resume_token().is_none());

        p.insert_one("test", "other", json!({"a": 0})).await.unwrap();
        p.insert_one("test", "c", json!({"a": 1})).await.unwrap();
        p.delete_many("test", "c", json!({})).await.unwrap();

        let event = stream.try_next().await.unwrap().unwrap();
        assert_eq!(event["operationType"], "insert");
        assert_eq!(event["fullDocument"]["a"], 1);
        assert_eq!(stream.resume_token(), Some(event["_id"].clone()));
        assert!(stream.try_next().await.unwrap().is_none());

        stream.close().await.unwrap();
        assert!(stream.closed());
        assert!(stream.try_next().await.is_err());
    }

    #[tokio::test]
    async fn test_change_stream_blocking_next() {
        let p = MemoryProvider::new();
        let mut stream = p.watch("test", None, vec![], json!({})).unwrap();
        let writer = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert_one("test", "c", json!({"late": true})).await.unwrap();
        });
        assert!(stream.has_next().await.unwrap());
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event["fullDocument"]["late"], true);
    }
}
