//! Cursor over an aggregation pipeline.

use serde_json::{json, Value};

use super::base::CursorCore;
use super::{explain_query, Replay, ShellCursor};
use crate::error::ShellResult;
use crate::provider::NativeQueryCursor;
use crate::reconstruct::{ChainStep, ConstructionRecord};
use crate::session::SessionRef;

const CLASS: &str = "AggregationCursor";

pub struct AggregationCursor {
    core: CursorCore<dyn NativeQueryCursor>,
}

impl_cursor_object!(AggregationCursor, CLASS);

impl ShellCursor for AggregationCursor {
    type Native = dyn NativeQueryCursor;

    fn core(&self) -> &CursorCore<dyn NativeQueryCursor> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CursorCore<dyn NativeQueryCursor> {
        &mut self.core
    }
}

impl AggregationCursor {
    pub fn new(
        native: Box<dyn NativeQueryCursor>,
        record: ConstructionRecord,
        session: Option<SessionRef>,
    ) -> Self {
        Self {
            core: CursorCore::new(native, record, session),
        }
    }

    /// Appends a `$project` stage.
    pub fn projection(&mut self, spec: Value) -> ShellResult<&mut Self> {
        self.core
            .configure(CLASS, "projection", vec![spec.clone()], |c| c.project(spec))?;
        Ok(self)
    }

    /// Appends a `$skip` stage.
    pub fn skip(&mut self, n: u64) -> ShellResult<&mut Self> {
        self.core.configure(CLASS, "skip", vec![json!(n)], |c| c.skip(n))?;
        Ok(self)
    }

    /// Appends a `$sort` stage.
    pub fn sort(&mut self, spec: Value) -> ShellResult<&mut Self> {
        self.core
            .configure(CLASS, "sort", vec![spec.clone()], |c| c.sort(spec))?;
        Ok(self)
    }

    pub async fn explain(&mut self, verbosity: Option<Value>) -> ShellResult<Value> {
        explain_query(&mut self.core, CLASS, verbosity).await
    }
}

impl Replay for AggregationCursor {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()> {
        match step.method.as_str() {
            "projection" => self.projection(step.arg(0)?.clone())?,
            "skip" => self.skip(step.arg_u64(0)?)?,
            "sort" => self.sort(step.arg(0)?.clone())?,
            _ => return self.replay_common(step),
        };
        Ok(())
    }
}
