//! Service boundary: the driver-side operations shell objects call into.
//!
//! Cursor-producing operations are synchronous and return an exclusively
//! owned native resource; the first round trip happens on first iteration.
//! Writes and commands are async request/response calls returning the raw
//! reply document.

pub mod memory;
pub mod query;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ShellError, ShellResult};

// ---------------------------------------------------------------------------
// Cursor options
// ---------------------------------------------------------------------------

/// Wire-level cursor flags, addressable by bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CursorFlag {
    Tailable,
    SlaveOk,
    OplogReplay,
    NoCursorTimeout,
    AwaitData,
    Exhaust,
    Partial,
}

impl CursorFlag {
    /// Look up a flag by its bit value.
    pub fn from_bit(bit: u32) -> Option<Self> {
        match bit {
            2 => Some(Self::Tailable),
            4 => Some(Self::SlaveOk),
            8 => Some(Self::OplogReplay),
            16 => Some(Self::NoCursorTimeout),
            32 => Some(Self::AwaitData),
            64 => Some(Self::Exhaust),
            128 => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn bit(self) -> u32 {
        match self {
            Self::Tailable => 2,
            Self::SlaveOk => 4,
            Self::OplogReplay => 8,
            Self::NoCursorTimeout => 16,
            Self::AwaitData => 32,
            Self::Exhaust => 64,
            Self::Partial => 128,
        }
    }
}

/// Find options without dedicated native setters.
#[derive(Debug, Clone, PartialEq)]
pub enum FindOption {
    Comment(Value),
    Collation(Value),
    Hint(Value),
    Min(Value),
    Max(Value),
    ReturnKey(bool),
    ShowRecordId(bool),
    AllowDiskUse(bool),
    MaxAwaitTimeMS(u64),
}

impl FindOption {
    /// Option name as sent to the server.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Comment(_) => "comment",
            Self::Collation(_) => "collation",
            Self::Hint(_) => "hint",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::ReturnKey(_) => "returnKey",
            Self::ShowRecordId(_) => "showRecordId",
            Self::AllowDiskUse(_) => "allowDiskUse",
            Self::MaxAwaitTimeMS(_) => "maxAwaitTimeMS",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Self::Comment(v) | Self::Collation(v) | Self::Hint(v) | Self::Min(v) | Self::Max(v) => {
                v.clone()
            }
            Self::ReturnKey(b) | Self::ShowRecordId(b) | Self::AllowDiskUse(b) => json!(b),
            Self::MaxAwaitTimeMS(ms) => json!(ms),
        }
    }
}

/// Read preference mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn parse(mode: &str) -> ShellResult<Self> {
        match mode {
            "primary" => Ok(Self::Primary),
            "primaryPreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondaryPreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(ShellError::invalid_input(format!(
                "Invalid read preference mode: {other}"
            ))),
        }
    }
}

/// Verbosity of an explain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExplainVerbosity {
    QueryPlanner,
    ExecutionStats,
    AllPlansExecution,
}

impl ExplainVerbosity {
    /// Accepts a verbosity name or a boolean (`true` means all plans).
    /// A missing value means `queryPlanner`.
    pub fn parse(value: Option<&Value>) -> ShellResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::QueryPlanner),
            Some(Value::Bool(true)) => Ok(Self::AllPlansExecution),
            Some(Value::Bool(false)) => Ok(Self::QueryPlanner),
            Some(Value::String(s)) => match s.as_str() {
                "queryPlanner" => Ok(Self::QueryPlanner),
                "executionStats" => Ok(Self::ExecutionStats),
                "allPlansExecution" => Ok(Self::AllPlansExecution),
                other => Err(ShellError::invalid_input(format!(
                    "verbosity must be one of queryPlanner, executionStats, allPlansExecution; got {other}"
                ))),
            },
            Some(other) => Err(ShellError::invalid_input(format!(
                "verbosity must be a string or boolean; got {other}"
            ))),
        }
    }

    pub fn includes_execution_stats(self) -> bool {
        matches!(self, Self::ExecutionStats | Self::AllPlansExecution)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryPlanner => "queryPlanner",
            Self::ExecutionStats => "executionStats",
            Self::AllPlansExecution => "allPlansExecution",
        }
    }
}

// ---------------------------------------------------------------------------
// Native resources
// ---------------------------------------------------------------------------

/// Iteration shared by every native resource.
#[async_trait]
pub trait NativeIteration: Send + Sync {
    /// Whether another item exists. May wait indefinitely on tailing resources.
    async fn has_next(&mut self) -> ShellResult<bool>;

    /// Next item. May wait indefinitely on tailing resources.
    async fn next(&mut self) -> ShellResult<Option<Value>>;

    /// Next item if one is available within one round trip.
    async fn try_next(&mut self) -> ShellResult<Option<Value>>;

    /// Release the resource. Repeated calls succeed.
    async fn close(&mut self) -> ShellResult<()>;

    /// True once the server side is released, either because every batch
    /// was fetched or because the resource was closed.
    fn closed(&self) -> bool;

    /// The resource's own async sequence, driven by `next`.
    fn stream(&mut self) -> BoxStream<'_, ShellResult<Value>> {
        Box::pin(futures::stream::unfold(Some(self), |state| async move {
            let cur = state?;
            match cur.next().await {
                Ok(Some(doc)) => Some((Ok(doc), Some(cur))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

/// Batched query cursor.
#[async_trait]
pub trait NativeCursor: NativeIteration {
    /// Every remaining item, buffered ones first.
    async fn to_array(&mut self) -> ShellResult<Vec<Value>>;

    /// Items fetched but not yet returned.
    fn buffered_count(&self) -> usize;

    fn batch_size(&mut self, size: u32) -> ShellResult<()>;

    fn max_time_ms(&mut self, ms: u64) -> ShellResult<()>;
}

/// Configuration shared by find and aggregation cursors.
#[async_trait]
pub trait NativeQueryCursor: NativeCursor {
    fn project(&mut self, projection: Value) -> ShellResult<()>;

    fn skip(&mut self, n: u64) -> ShellResult<()>;

    fn sort(&mut self, sort: Value) -> ShellResult<()>;

    async fn explain(&mut self, verbosity: ExplainVerbosity) -> ShellResult<Value>;
}

/// Find cursor.
#[async_trait]
pub trait NativeFindCursor: NativeQueryCursor {
    fn limit(&mut self, n: i64) -> ShellResult<()>;

    fn set_option(&mut self, option: FindOption) -> ShellResult<()>;

    fn add_cursor_flag(&mut self, flag: CursorFlag, on: bool) -> ShellResult<()>;

    fn with_read_preference(&mut self, mode: ReadPreferenceMode) -> ShellResult<()>;

    /// Number of matching documents, optionally honouring skip and limit.
    async fn count(&mut self, apply_skip_limit: bool) -> ShellResult<u64>;
}

/// Change stream: an endless sequence of change events.
pub trait NativeChangeStream: NativeIteration {
    /// Token of the last event returned.
    fn resume_token(&self) -> Option<Value>;
}

// ---------------------------------------------------------------------------
// ServiceProvider
// ---------------------------------------------------------------------------

/// Operations the service boundary exposes to shell objects.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        options: Value,
    ) -> ShellResult<Box<dyn NativeFindCursor>>;

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Value>,
        options: Value,
    ) -> ShellResult<Box<dyn NativeQueryCursor>>;

    /// Database-level aggregation (no collection).
    fn aggregate_db(
        &self,
        database: &str,
        pipeline: Vec<Value>,
        options: Value,
    ) -> ShellResult<Box<dyn NativeQueryCursor>>;

    /// A command whose reply is a cursor.
    fn run_cursor_command(
        &self,
        database: &str,
        command: Value,
        options: Value,
    ) -> ShellResult<Box<dyn NativeCursor>>;

    /// A cursor command that must be a document naming the command first.
    fn run_command_with_check(
        &self,
        database: &str,
        command: Value,
        options: Value,
    ) -> ShellResult<Box<dyn NativeCursor>> {
        match command.as_object() {
            Some(map) if !map.is_empty() => self.run_cursor_command(database, command, options),
            _ => Err(ShellError::invalid_input(
                "runCommand requires a non-empty command document",
            )),
        }
    }

    fn watch(
        &self,
        database: &str,
        collection: Option<&str>,
        pipeline: Vec<Value>,
        options: Value,
    ) -> ShellResult<Box<dyn NativeChangeStream>>;

    async fn insert_one(&self, database: &str, collection: &str, doc: Value) -> ShellResult<Value>;

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Value>,
    ) -> ShellResult<Value>;

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<Value>;

    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<Value>;

    async fn delete_one(&self, database: &str, collection: &str, filter: Value) -> ShellResult<Value>;

    async fn delete_many(&self, database: &str, collection: &str, filter: Value) -> ShellResult<Value>;

    async fn bulk_write(
        &self,
        database: &str,
        collection: &str,
        operations: Vec<Value>,
    ) -> ShellResult<Value>;

    async fn run_command(&self, database: &str, command: Value) -> ShellResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_flag_bits() {
        for bit in [2, 4, 8, 16, 32, 64, 128] {
            assert_eq!(CursorFlag::from_bit(bit).unwrap().bit(), bit);
        }
        assert!(CursorFlag::from_bit(1).is_none());
        assert!(CursorFlag::from_bit(256).is_none());
    }

    #[test]
    fn test_explain_verbosity() {
        assert_eq!(ExplainVerbosity::parse(None).unwrap(), ExplainVerbosity::QueryPlanner);
        assert_eq!(
            ExplainVerbosity::parse(Some(&json!(true))).unwrap(),
            ExplainVerbosity::AllPlansExecution
        );
        assert_eq!(
            ExplainVerbosity::parse(Some(&json!("executionStats"))).unwrap(),
            ExplainVerbosity::ExecutionStats
        );
        assert!(ExplainVerbosity::parse(Some(&json!("loud"))).is_err());
        assert!(ExplainVerbosity::parse(Some(&json!(3))).is_err());
    }

    #[test]
    fn test_read_preference_modes() {
        assert_eq!(
            ReadPreferenceMode::parse("secondaryPreferred").unwrap(),
            ReadPreferenceMode::SecondaryPreferred
        );
        assert!(ReadPreferenceMode::parse("anywhere").is_err());
    }
}
