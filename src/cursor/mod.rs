//! Cursor Abstraction: shell cursors over native iteration resources.
//!
//! - [`FindCursor`] (`Cursor`), [`AggregationCursor`] and
//!   [`RunCommandCursor`] share [`ShellCursor`] for iteration, display and
//!   common configuration.
//! - [`ChangeStreamCursor`] has its own surface: it never ends on its own,
//!   so bulk and batch-level operations are unavailable and blocking calls
//!   warn once.
//!
//! Every chainable call is appended to the cursor's
//! [`ConstructionRecord`] so the cursor can be rebuilt elsewhere.

use std::ops::ControlFlow;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};

use crate::capabilities::CallSite;
use crate::error::{ShellError, ShellResult};
use crate::provider::{ExplainVerbosity, NativeCursor, NativeQueryCursor};
use crate::reconstruct::{ChainStep, ConstructionRecord, CursorVariant};
use crate::shell::{Printable, ShellObject};
use crate::session::SessionRef;
use crate::types::IterationSnapshot;

/// `ShellObject` and `Printable` for a [`ShellCursor`] with a `core` field.
macro_rules! impl_cursor_object {
    ($ty:ident, $class:expr) => {
        impl $crate::shell::ShellObject for $ty {
            fn shell_api_type(&self) -> &'static str {
                $class
            }

            fn session(&self) -> Option<&$crate::session::SessionRef> {
                self.core.session()
            }
        }

        #[async_trait::async_trait]
        impl $crate::shell::Printable for $ty {
            async fn as_printable(&mut self) -> $crate::error::ShellResult<serde_json::Value> {
                if let Some(snapshot) = self.core.snapshot() {
                    return Ok(serde_json::to_value(snapshot)?);
                }
                let snapshot = $crate::cursor::ShellCursor::it(self).await?;
                Ok(serde_json::to_value(snapshot)?)
            }
        }
    };
}

pub mod aggregation;
pub mod base;
pub mod change_stream;
pub mod find;
pub mod mapper;
pub mod run_command;

pub use aggregation::AggregationCursor;
pub use base::{CursorCore, CursorState};
pub use change_stream::ChangeStreamCursor;
pub use find::FindCursor;
pub use mapper::{register_mapper, DocumentMapper, MapFn, MapperRegistry};
pub use run_command::RunCommandCursor;

/// Replays one recorded chain step against a cursor.
pub trait Replay {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()>;
}

pub(crate) fn unknown_chain_method(class: &str, method: &str) -> ShellError {
    ShellError::reconstruction(format!("{class} has no chainable method {method}"))
}

fn batch_size_arg(step: &ChainStep) -> ShellResult<u32> {
    u32::try_from(step.arg_u64(0)?)
        .map_err(|_| ShellError::reconstruction("batchSize argument out of range"))
}

// ---------------------------------------------------------------------------
// ShellCursor
// ---------------------------------------------------------------------------

/// Wrapped surface shared by the batched cursor variants.
#[async_trait]
pub trait ShellCursor: ShellObject + Sized {
    type Native: NativeCursor + ?Sized;

    fn core(&self) -> &CursorCore<Self::Native>;

    fn core_mut(&mut self) -> &mut CursorCore<Self::Native>;

    fn record(&self) -> &ConstructionRecord {
        self.core().record()
    }

    fn state(&self) -> CursorState {
        self.core().state()
    }

    async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "tryNext")
            .run_async(self.core_mut().try_next())
            .await
    }

    async fn next(&mut self) -> ShellResult<Option<Value>> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "next")
            .run_async(self.core_mut().next())
            .await
    }

    async fn has_next(&mut self) -> ShellResult<bool> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "hasNext")
            .run_async(self.core_mut().has_next())
            .await
    }

    /// Release the resource. Repeated calls succeed.
    async fn close(&mut self) -> ShellResult<()> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "close")
            .run_async(self.core_mut().close())
            .await
    }

    async fn for_each<F>(&mut self, f: F) -> ShellResult<()>
    where
        F: FnMut(Value) -> ControlFlow<()> + Send,
    {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "forEach")
            .run_async(self.core_mut().for_each(f))
            .await
    }

    async fn to_array(&mut self) -> ShellResult<Vec<Value>> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "toArray")
            .run_async(self.core_mut().to_array())
            .await
    }

    async fn itcount(&mut self) -> ShellResult<u64> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "itcount")
            .run_async(self.core_mut().itcount())
            .await
    }

    /// Fresh top-level materialization, cached for display.
    async fn it(&mut self) -> ShellResult<IterationSnapshot> {
        let class = self.shell_api_type();
        let session = self.core().session().cloned();
        CallSite::new(session.as_ref(), class, "_it")
            .run_async(self.core_mut().iterate())
            .await
    }

    fn is_closed(&self) -> ShellResult<bool> {
        CallSite::new(self.core().session(), self.shell_api_type(), "isClosed")
            .run_sync(|| Ok(self.core().is_closed()))
    }

    fn is_exhausted(&self) -> ShellResult<bool> {
        CallSite::new(self.core().session(), self.shell_api_type(), "isExhausted")
            .run_sync(|| Ok(self.core().is_exhausted()))
    }

    fn objs_left_in_batch(&self) -> ShellResult<usize> {
        CallSite::new(self.core().session(), self.shell_api_type(), "objsLeftInBatch")
            .run_sync(|| Ok(self.core().buffered_count()))
    }

    fn map(&mut self, mapper: DocumentMapper) -> ShellResult<&mut Self> {
        let class = self.shell_api_type();
        self.core_mut().map(class, mapper)?;
        Ok(self)
    }

    /// Server batch size; also bounds each top-level materialization.
    fn batch_size(&mut self, size: u32) -> ShellResult<&mut Self> {
        let class = self.shell_api_type();
        let core = self.core_mut();
        core.configure(class, "batchSize", vec![json!(size)], |c| c.batch_size(size))?;
        if size > 0 {
            core.set_display_bound(size as usize);
        }
        Ok(self)
    }

    fn max_time_ms(&mut self, ms: u64) -> ShellResult<&mut Self> {
        let class = self.shell_api_type();
        self.core_mut()
            .configure(class, "maxTimeMS", vec![json!(ms)], |c| c.max_time_ms(ms))?;
        Ok(self)
    }

    fn pretty(&mut self) -> ShellResult<&mut Self> {
        let class = self.shell_api_type();
        self.core_mut().configure(class, "pretty", Vec::new(), |_| Ok(()))?;
        Ok(self)
    }

    /// Remaining documents as a stream. Not wrapped.
    fn stream(&mut self) -> BoxStream<'_, ShellResult<Value>> {
        self.core_mut().stream()
    }

    /// Replay a step every batched cursor understands.
    fn replay_common(&mut self, step: &ChainStep) -> ShellResult<()> {
        match step.method.as_str() {
            "map" => {
                self.map(DocumentMapper::from_record(step.arg(0)?)?)?;
            }
            "batchSize" => {
                self.batch_size(batch_size_arg(step)?)?;
            }
            "maxTimeMS" => {
                self.max_time_ms(step.arg_u64(0)?)?;
            }
            "pretty" => {
                self.pretty()?;
            }
            other => return Err(unknown_chain_method(self.shell_api_type(), other)),
        }
        Ok(())
    }
}

/// Wrapped explain shared by find and aggregation cursors. Execution
/// statistics are dropped unless the verbosity asks for them.
pub(crate) async fn explain_query<N>(
    core: &mut CursorCore<N>,
    class: &'static str,
    verbosity: Option<Value>,
) -> ShellResult<Value>
where
    N: NativeQueryCursor + ?Sized,
{
    let session = core.session().cloned();
    let native = core.native_mut();
    CallSite::new(session.as_ref(), class, "explain")
        .run_async(async move {
            let verbosity = ExplainVerbosity::parse(verbosity.as_ref())?;
            let mut out = native.explain(verbosity).await?;
            if !verbosity.includes_execution_stats() {
                if let Some(map) = out.as_object_mut() {
                    map.remove("executionStats");
                }
            }
            Ok(out)
        })
        .await
}

// ---------------------------------------------------------------------------
// AnyCursor
// ---------------------------------------------------------------------------

/// A cursor of any variant, as produced by reconstruction.
pub enum AnyCursor {
    Find(FindCursor),
    Aggregation(AggregationCursor),
    RunCommand(RunCommandCursor),
    ChangeStream(ChangeStreamCursor),
}

impl AnyCursor {
    pub fn variant(&self) -> CursorVariant {
        match self {
            Self::Find(_) => CursorVariant::Cursor,
            Self::Aggregation(_) => CursorVariant::AggregationCursor,
            Self::RunCommand(_) => CursorVariant::RunCommandCursor,
            Self::ChangeStream(_) => CursorVariant::ChangeStreamCursor,
        }
    }

    pub fn record(&self) -> &ConstructionRecord {
        match self {
            Self::Find(c) => c.record(),
            Self::Aggregation(c) => c.record(),
            Self::RunCommand(c) => c.record(),
            Self::ChangeStream(c) => c.record(),
        }
    }

    /// Fresh top-level materialization.
    pub async fn it(&mut self) -> ShellResult<IterationSnapshot> {
        match self {
            Self::Find(c) => c.it().await,
            Self::Aggregation(c) => c.it().await,
            Self::RunCommand(c) => c.it().await,
            Self::ChangeStream(c) => c.it().await,
        }
    }

    pub async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        match self {
            Self::Find(c) => c.try_next().await,
            Self::Aggregation(c) => c.try_next().await,
            Self::RunCommand(c) => c.try_next().await,
            Self::ChangeStream(c) => c.try_next().await,
        }
    }

    pub async fn close(&mut self) -> ShellResult<()> {
        match self {
            Self::Find(c) => c.close().await,
            Self::Aggregation(c) => c.close().await,
            Self::RunCommand(c) => c.close().await,
            Self::ChangeStream(c) => c.close().await,
        }
    }

    fn mismatch(&self, wanted: CursorVariant) -> ShellError {
        ShellError::Internal(format!("expected a {wanted}, found a {}", self.variant()))
    }

    pub fn into_find(self) -> ShellResult<FindCursor> {
        match self {
            Self::Find(c) => Ok(c),
            other => Err(other.mismatch(CursorVariant::Cursor)),
        }
    }

    pub fn into_aggregation(self) -> ShellResult<AggregationCursor> {
        match self {
            Self::Aggregation(c) => Ok(c),
            other => Err(other.mismatch(CursorVariant::AggregationCursor)),
        }
    }

    pub fn into_run_command(self) -> ShellResult<RunCommandCursor> {
        match self {
            Self::RunCommand(c) => Ok(c),
            other => Err(other.mismatch(CursorVariant::RunCommandCursor)),
        }
    }

    pub fn into_change_stream(self) -> ShellResult<ChangeStreamCursor> {
        match self {
            Self::ChangeStream(c) => Ok(c),
            other => Err(other.mismatch(CursorVariant::ChangeStreamCursor)),
        }
    }
}

impl Replay for AnyCursor {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()> {
        match self {
            Self::Find(c) => c.replay_step(step),
            Self::Aggregation(c) => c.replay_step(step),
            Self::RunCommand(c) => c.replay_step(step),
            Self::ChangeStream(c) => c.replay_step(step),
        }
    }
}

impl ShellObject for AnyCursor {
    fn shell_api_type(&self) -> &'static str {
        self.variant().as_str()
    }

    fn session(&self) -> Option<&SessionRef> {
        match self {
            Self::Find(c) => c.session(),
            Self::Aggregation(c) => c.session(),
            Self::RunCommand(c) => c.session(),
            Self::ChangeStream(c) => c.session(),
        }
    }
}

#[async_trait]
impl Printable for AnyCursor {
    async fn as_printable(&mut self) -> ShellResult<Value> {
        match self {
            Self::Find(c) => c.as_printable().await,
            Self::Aggregation(c) => c.as_printable().await,
            Self::RunCommand(c) => c.as_printable().await,
            Self::ChangeStream(c) => c.as_printable().await,
        }
    }
}
