//! State shared by every cursor variant.
//!
//! [`CursorCore`] owns the native resource exclusively, together with the
//! composed transform, the cached display snapshot and the construction
//! record. Its methods are unwrapped; the variants put a
//! [`CallSite`](crate::capabilities::CallSite) around them.

use std::ops::ControlFlow;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::mapper::{compose, DocumentMapper, MapFn};
use crate::capabilities::CallSite;
use crate::error::ShellResult;
use crate::provider::{NativeCursor, NativeIteration};
use crate::reconstruct::ConstructionRecord;
use crate::session::config::DEFAULT_DISPLAY_BATCH_SIZE;
use crate::session::SessionRef;
use crate::types::IterationSnapshot;

/// Lifecycle state derived from the native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CursorState {
    OpenUnconsumed,
    OpenPartiallyConsumed,
    ClosedExhausted,
    ClosedNotExhausted,
}

pub struct CursorCore<N: NativeIteration + ?Sized> {
    session: Option<SessionRef>,
    record: ConstructionRecord,
    transform: Option<MapFn>,
    snapshot: Option<IterationSnapshot>,
    batch_size: Option<usize>,
    consumed: bool,
    native: Box<N>,
}

impl<N: NativeIteration + ?Sized> CursorCore<N> {
    pub fn new(native: Box<N>, record: ConstructionRecord, session: Option<SessionRef>) -> Self {
        Self {
            session,
            record,
            transform: None,
            snapshot: None,
            batch_size: None,
            consumed: false,
            native,
        }
    }

    pub fn session(&self) -> Option<&SessionRef> {
        self.session.as_ref()
    }

    pub fn record(&self) -> &ConstructionRecord {
        &self.record
    }

    pub fn native(&self) -> &N {
        &self.native
    }

    pub fn native_mut(&mut self) -> &mut N {
        &mut self.native
    }

    /// The cached display snapshot, if no iteration happened since it was taken.
    pub fn snapshot(&self) -> Option<&IterationSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn display_batch_size(&self) -> usize {
        self.session
            .as_ref()
            .map_or(DEFAULT_DISPLAY_BATCH_SIZE, |s| s.display_batch_size())
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    /// Run a chainable configuration call and record it on success.
    pub fn configure<F>(
        &mut self,
        class: &'static str,
        method: &'static str,
        args: Vec<Value>,
        f: F,
    ) -> ShellResult<()>
    where
        F: FnOnce(&mut N) -> ShellResult<()>,
    {
        let session = self.session.clone();
        let native = self.native.as_mut();
        CallSite::new(session.as_ref(), class, method).run_sync(|| f(native))?;
        self.record.push(method, args);
        Ok(())
    }

    /// Compose `mapper` after the installed transform.
    pub fn map(&mut self, class: &'static str, mapper: DocumentMapper) -> ShellResult<()> {
        self.configure(class, "map", vec![mapper.record()], |_| Ok(()))?;
        self.transform = Some(match self.transform.take() {
            Some(prev) => compose(prev, mapper.func()),
            None => mapper.func(),
        });
        Ok(())
    }

    pub fn set_display_bound(&mut self, size: usize) {
        self.batch_size = Some(size);
    }

    /// Mark the cursor consumed. Called only once the native call has
    /// returned, so an abandoned call leaves the state and snapshot alone.
    fn mark_consumed(&mut self) {
        self.snapshot = None;
        self.consumed = true;
    }

    fn apply(&self, doc: Value) -> ShellResult<Value> {
        match &self.transform {
            Some(f) => f(doc),
            None => Ok(doc),
        }
    }

    pub async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        let doc = self.native.try_next().await?;
        self.mark_consumed();
        match doc {
            Some(doc) => Ok(Some(self.apply(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn next(&mut self) -> ShellResult<Option<Value>> {
        let doc = self.native.next().await?;
        self.mark_consumed();
        match doc {
            Some(doc) => Ok(Some(self.apply(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn has_next(&mut self) -> ShellResult<bool> {
        let more = self.native.has_next().await?;
        self.mark_consumed();
        Ok(more)
    }

    pub async fn close(&mut self) -> ShellResult<()> {
        self.native.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.native.closed()
    }

    /// Feed documents to `f` through `try_next` until exhausted or `f` breaks.
    pub async fn for_each<F>(&mut self, mut f: F) -> ShellResult<()>
    where
        F: FnMut(Value) -> ControlFlow<()> + Send,
    {
        while let Some(doc) = self.try_next().await? {
            if f(doc).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Remaining documents as an async stream.
    pub fn stream(&mut self) -> BoxStream<'_, ShellResult<Value>> {
        self.mark_consumed();
        if self.transform.is_none() {
            return self.native.stream();
        }
        Box::pin(futures::stream::unfold(Some(self), |state| async move {
            let core = state?;
            match core.try_next().await {
                Ok(Some(doc)) => Some((Ok(doc), Some(core))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }

    /// Up to `bound` documents through `try_next`, stopping early on an empty answer.
    pub async fn collect_batch(&mut self, bound: usize) -> ShellResult<IterationSnapshot> {
        let mut snapshot = IterationSnapshot::new();
        while snapshot.len() < bound {
            match self.try_next().await? {
                Some(doc) => snapshot.push(doc),
                None => break,
            }
        }
        Ok(snapshot)
    }

    pub fn cache_snapshot(&mut self, snapshot: &IterationSnapshot) {
        self.snapshot = Some(snapshot.clone());
    }
}

impl<N: NativeCursor + ?Sized> CursorCore<N> {
    pub fn buffered_count(&self) -> usize {
        self.native.buffered_count()
    }

    /// Closed first, then the buffer, so an open cursor is never exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.native.closed() && self.native.buffered_count() == 0
    }

    pub fn state(&self) -> CursorState {
        match (self.native.closed(), self.consumed) {
            (true, _) if self.native.buffered_count() == 0 => CursorState::ClosedExhausted,
            (true, _) => CursorState::ClosedNotExhausted,
            (false, false) => CursorState::OpenUnconsumed,
            (false, true) => CursorState::OpenPartiallyConsumed,
        }
    }

    pub async fn to_array(&mut self) -> ShellResult<Vec<Value>> {
        if self.transform.is_none() {
            let docs = self.native.to_array().await?;
            self.mark_consumed();
            return Ok(docs);
        }
        let mut out = Vec::new();
        while let Some(doc) = self.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    pub async fn itcount(&mut self) -> ShellResult<u64> {
        let mut n = 0;
        while self.try_next().await?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    /// One top-level materialization, bounded by the explicit batch size
    /// or else the display batch size.
    pub async fn iterate(&mut self) -> ShellResult<IterationSnapshot> {
        let bound = self.batch_size.unwrap_or_else(|| self.display_batch_size());
        let mut snapshot = self.collect_batch(bound).await?;
        snapshot.cursor_has_more = !self.is_exhausted();
        self.cache_snapshot(&snapshot);
        Ok(snapshot)
    }
}
