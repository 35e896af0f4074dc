//! Replayable description of how a cursor was opened and configured.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ShellError, ShellResult};

/// Service-boundary operation that opened the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// `[database, collection, filter, options]`
    Find,
    /// `[database, collection, pipeline, options]`
    Aggregate,
    /// `[database, pipeline, options]`
    AggregateDb,
    /// `[database, command, options]`
    RunCursorCommand,
    /// `[database, command, options]`
    RunCommandWithCheck,
    /// `[database, collection or null, pipeline, options]`
    Watch,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Aggregate => "aggregate",
            Self::AggregateDb => "aggregateDb",
            Self::RunCursorCommand => "runCursorCommand",
            Self::RunCommandWithCheck => "runCommandWithCheck",
            Self::Watch => "watch",
        }
    }

    /// The cursor variant this origin produces.
    pub fn variant(self) -> CursorVariant {
        match self {
            Self::Find => CursorVariant::Cursor,
            Self::Aggregate | Self::AggregateDb => CursorVariant::AggregationCursor,
            Self::RunCursorCommand | Self::RunCommandWithCheck => CursorVariant::RunCommandCursor,
            Self::Watch => CursorVariant::ChangeStreamCursor,
        }
    }

    /// Positional argument count.
    pub fn arity(self) -> usize {
        match self {
            Self::Find | Self::Aggregate | Self::Watch => 4,
            Self::AggregateDb | Self::RunCursorCommand | Self::RunCommandWithCheck => 3,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cursor class tag, serialized as the class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursorVariant {
    Cursor,
    AggregationCursor,
    RunCommandCursor,
    ChangeStreamCursor,
}

impl CursorVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cursor => "Cursor",
            Self::AggregationCursor => "AggregationCursor",
            Self::RunCommandCursor => "RunCommandCursor",
            Self::ChangeStreamCursor => "ChangeStreamCursor",
        }
    }
}

impl fmt::Display for CursorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chained configuration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ChainStep {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Positional argument `index`, failing loudly when absent.
    pub fn arg(&self, index: usize) -> ShellResult<&Value> {
        self.args.get(index).ok_or_else(|| {
            ShellError::reconstruction(format!(
                "chain step {} is missing argument {}",
                self.method, index
            ))
        })
    }

    pub fn arg_i64(&self, index: usize) -> ShellResult<i64> {
        self.arg(index)?
            .as_i64()
            .ok_or_else(|| self.bad_arg(index, "an integer"))
    }

    pub fn arg_u64(&self, index: usize) -> ShellResult<u64> {
        self.arg(index)?
            .as_u64()
            .ok_or_else(|| self.bad_arg(index, "a non-negative integer"))
    }

    pub fn arg_bool(&self, index: usize) -> ShellResult<bool> {
        self.arg(index)?
            .as_bool()
            .ok_or_else(|| self.bad_arg(index, "a boolean"))
    }

    pub fn arg_str(&self, index: usize) -> ShellResult<&str> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| self.bad_arg(index, "a string"))
    }

    fn bad_arg(&self, index: usize, expected: &str) -> ShellError {
        ShellError::reconstruction(format!(
            "argument {} of chain step {} must be {}",
            index, self.method, expected
        ))
    }
}

/// Origin call plus chained configuration, free of resource handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructionRecord {
    pub origin: Origin,
    pub args: Vec<Value>,
    pub variant: CursorVariant,
    #[serde(default)]
    pub chain: Vec<ChainStep>,
}

impl ConstructionRecord {
    /// Record for a cursor opened by `origin`, tagged with the variant it produces.
    pub fn new(origin: Origin, args: Vec<Value>) -> Self {
        Self {
            origin,
            args,
            variant: origin.variant(),
            chain: Vec::new(),
        }
    }

    /// Append a chained call.
    pub fn push(&mut self, method: impl Into<String>, args: Vec<Value>) {
        self.chain.push(ChainStep::new(method, args));
    }

    /// Check the record is internally consistent before replaying it.
    pub fn validate(&self) -> ShellResult<()> {
        if self.origin.variant() != self.variant {
            return Err(ShellError::reconstruction(format!(
                "origin {} produces a {}, not a {}",
                self.origin,
                self.origin.variant(),
                self.variant
            )));
        }
        if self.args.len() != self.origin.arity() {
            return Err(ShellError::reconstruction(format!(
                "origin {} takes {} arguments, record has {}",
                self.origin,
                self.origin.arity(),
                self.args.len()
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> ShellResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ShellResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
