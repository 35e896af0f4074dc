//! Cursor over a change stream.
//!
//! A change stream never runs dry on its own, so operations that assume a
//! finite result (`toArray`, batch inspection, exhaustion) are unavailable
//! and the blocking pair warns once per session.

use std::ops::ControlFlow;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::CursorCore;
use super::{unknown_chain_method, DocumentMapper, Replay};
use crate::capabilities::CallSite;
use crate::error::{ShellError, ShellResult};
use crate::provider::NativeChangeStream;
use crate::reconstruct::{ChainStep, ConstructionRecord};
use crate::session::SessionRef;
use crate::shell::{Printable, ShellObject};
use crate::types::IterationSnapshot;

const CLASS: &str = "ChangeStreamCursor";

const HAS_NEXT_BLOCKS: &str = "If there are no documents in the batch, hasNext will block. \
Use tryNext if you want to check if there are any documents without waiting.";

const NEXT_BLOCKS: &str = "If there are no documents in the batch, next will block. \
Use tryNext if you want to check if there are any documents without waiting.";

const NO_EXHAUSTION: &str = "isExhausted is not implemented for ChangeStreams because after \
closing a cursor, the remaining documents in the batch are still iterable. Use isClosed() instead.";

pub struct ChangeStreamCursor {
    core: CursorCore<dyn NativeChangeStream>,
    namespace: String,
}

impl ChangeStreamCursor {
    pub fn new(
        native: Box<dyn NativeChangeStream>,
        record: ConstructionRecord,
        session: Option<SessionRef>,
    ) -> Self {
        let database = record.args.first().and_then(Value::as_str).unwrap_or_default();
        let namespace = match record.args.get(1).and_then(Value::as_str) {
            Some(coll) => format!("{database}.{coll}"),
            None => database.to_string(),
        };
        Self {
            core: CursorCore::new(native, record, session),
            namespace,
        }
    }

    /// `db.collection`, or just `db` for a database-wide stream.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn record(&self) -> &ConstructionRecord {
        self.core.record()
    }

    fn warn(&self, message: &str) {
        if let Some(session) = self.core.session() {
            session.print_warning(message);
        }
    }

    fn unsupported<T>(&self, method: &'static str) -> ShellResult<T> {
        CallSite::new(self.core.session(), CLASS, method)
            .run_sync(|| Err(ShellError::unimplemented(CLASS, method)))
    }

    pub async fn close(&mut self) -> ShellResult<()> {
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "close")
            .run_async(self.core.close())
            .await
    }

    pub fn is_closed(&self) -> ShellResult<bool> {
        CallSite::new(self.core.session(), CLASS, "isClosed")
            .run_sync(|| Ok(self.core.is_closed()))
    }

    /// Next event if one is available within one round trip.
    pub async fn try_next(&mut self) -> ShellResult<Option<Value>> {
        let session = self.core.session().cloned();
        let core = &mut self.core;
        CallSite::new(session.as_ref(), CLASS, "tryNext")
            .run_async(async move {
                if core.is_closed() {
                    return Err(ShellError::runtime("Cannot call tryNext on closed cursor"));
                }
                core.try_next().await
            })
            .await
    }

    /// Waits for the next event.
    pub async fn has_next(&mut self) -> ShellResult<bool> {
        self.warn(HAS_NEXT_BLOCKS);
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "hasNext")
            .run_async(self.core.has_next())
            .await
    }

    /// Waits for the next event.
    pub async fn next(&mut self) -> ShellResult<Option<Value>> {
        self.warn(NEXT_BLOCKS);
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "next")
            .run_async(self.core.next())
            .await
    }

    /// Feeds the events available now to `f`.
    pub async fn for_each<F>(&mut self, f: F) -> ShellResult<()>
    where
        F: FnMut(Value) -> ControlFlow<()> + Send,
    {
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "forEach")
            .run_async(self.core.for_each(f))
            .await
    }

    /// Events available now.
    pub async fn itcount(&mut self) -> ShellResult<u64> {
        let session = self.core.session().cloned();
        let core = &mut self.core;
        CallSite::new(session.as_ref(), CLASS, "itcount")
            .run_async(async move {
                let mut n = 0;
                while core.try_next().await?.is_some() {
                    n += 1;
                }
                Ok(n)
            })
            .await
    }

    pub fn map(&mut self, mapper: DocumentMapper) -> ShellResult<&mut Self> {
        self.core.map(CLASS, mapper)?;
        Ok(self)
    }

    pub fn pretty(&mut self) -> ShellResult<&mut Self> {
        self.core.configure(CLASS, "pretty", Vec::new(), |_| Ok(()))?;
        Ok(self)
    }

    pub fn get_resume_token(&self) -> ShellResult<Option<Value>> {
        CallSite::new(self.core.session(), CLASS, "getResumeToken")
            .run_sync(|| Ok(self.core.native().resume_token()))
    }

    pub async fn to_array(&mut self) -> ShellResult<Vec<Value>> {
        self.unsupported("toArray")
    }

    pub fn batch_size(&mut self, _size: u32) -> ShellResult<&mut Self> {
        self.unsupported("batchSize")
    }

    pub fn max_time_ms(&mut self, _ms: u64) -> ShellResult<&mut Self> {
        self.unsupported("maxTimeMS")
    }

    pub fn objs_left_in_batch(&self) -> ShellResult<usize> {
        self.unsupported("objsLeftInBatch")
    }

    pub fn is_exhausted(&self) -> ShellResult<bool> {
        CallSite::new(self.core.session(), CLASS, "isExhausted")
            .run_sync(|| Err(ShellError::invalid_input(NO_EXHAUSTION)))
    }

    /// Events available now, up to the display batch size. More is
    /// reported for as long as the stream is open.
    pub async fn it(&mut self) -> ShellResult<IterationSnapshot> {
        let session = self.core.session().cloned();
        let core = &mut self.core;
        CallSite::new(session.as_ref(), CLASS, "_it")
            .run_async(async move {
                if core.is_closed() {
                    return Err(ShellError::runtime("ChangeStreamCursor is closed"));
                }
                let bound = core.display_batch_size();
                let mut snapshot = core.collect_batch(bound).await?;
                snapshot.cursor_has_more = !core.is_closed();
                core.cache_snapshot(&snapshot);
                Ok(snapshot)
            })
            .await
    }
}

impl Replay for ChangeStreamCursor {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()> {
        match step.method.as_str() {
            "map" => self.map(DocumentMapper::from_record(step.arg(0)?)?)?,
            "pretty" => self.pretty()?,
            "batchSize" => self.batch_size(0)?,
            "maxTimeMS" => self.max_time_ms(0)?,
            other => return Err(unknown_chain_method(CLASS, other)),
        };
        Ok(())
    }
}

impl ShellObject for ChangeStreamCursor {
    fn shell_api_type(&self) -> &'static str {
        CLASS
    }

    fn session(&self) -> Option<&SessionRef> {
        self.core.session()
    }
}

#[async_trait]
impl Printable for ChangeStreamCursor {
    async fn as_printable(&mut self) -> ShellResult<Value> {
        Ok(json!(format!("{CLASS} on {}", self.namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::event_bus::drain;
    use crate::events::ShellEvent;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::ServiceProvider;
    use crate::reconstruct::Origin;
    use crate::session::ShellSession;
    use std::sync::Arc;

    fn open(p: &MemoryProvider, session: Option<SessionRef>) -> ChangeStreamCursor {
        let native = p.watch("test", Some("orders"), vec![], json!({})).unwrap();
        let record = ConstructionRecord::new(
            Origin::Watch,
            vec![json!("test"), json!("orders"), json!([]), json!({})],
        );
        ChangeStreamCursor::new(native, record, session)
    }

    #[tokio::test]
    async fn test_to_array_unimplemented_without_round_trip() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        let err = c.to_array().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert_eq!(
            err.to_string(),
            "[COMMON-90002] Cannot call toArray on a ChangeStreamCursor"
        );
        assert_eq!(p.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_batch_operations_unimplemented() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        assert_eq!(c.batch_size(10).err().unwrap().kind(), ErrorKind::Unimplemented);
        assert_eq!(c.max_time_ms(10).err().unwrap().kind(), ErrorKind::Unimplemented);
        assert_eq!(c.objs_left_in_batch().unwrap_err().kind(), ErrorKind::Unimplemented);
        assert_eq!(c.is_exhausted().unwrap_err().kind(), ErrorKind::InvalidInput);
        assert!(c.record().chain.is_empty());
    }

    #[tokio::test]
    async fn test_events_and_resume_token() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        assert!(c.try_next().await.unwrap().is_none());
        p.insert_one("test", "orders", json!({"item": "pen"})).await.unwrap();
        let event = c.try_next().await.unwrap().unwrap();
        assert_eq!(event["fullDocument"]["item"], "pen");
        assert_eq!(c.get_resume_token().unwrap(), Some(event["_id"].clone()));
    }

    #[tokio::test]
    async fn test_blocking_calls_warn_once() {
        let p = MemoryProvider::new();
        let session = ShellSession::with_provider(Arc::new(p.clone()));
        let mut c = open(&p, Some(session.context()));
        let mut rx = session.events().subscribe();
        p.insert_one("test", "orders", json!({"n": 1})).await.unwrap();
        p.insert_one("test", "orders", json!({"n": 2})).await.unwrap();
        assert!(c.has_next().await.unwrap());
        assert!(c.has_next().await.unwrap());
        c.next().await.unwrap();
        let warnings: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ShellEvent::Warning { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec![HAS_NEXT_BLOCKS.to_string(), NEXT_BLOCKS.to_string()]);
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        c.close().await.unwrap();
        c.close().await.unwrap();
        assert!(c.is_closed().unwrap());
        let err = c.try_next().await.unwrap_err();
        assert_eq!(err.to_string(), "[SHAPI-10001] Cannot call tryNext on closed cursor");
        assert_eq!(c.it().await.unwrap_err().kind(), ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_it_and_printable() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        c.map(DocumentMapper::named("field", json!("operationType")).unwrap())
            .unwrap();
        p.insert_one("test", "orders", json!({"n": 1})).await.unwrap();
        p.delete_many("test", "orders", json!({})).await.unwrap();
        let snap = c.it().await.unwrap();
        assert_eq!(snap.documents, vec![json!("insert"), json!("delete")]);
        assert!(snap.cursor_has_more);
        assert_eq!(
            c.as_printable().await.unwrap(),
            json!("ChangeStreamCursor on test.orders")
        );
    }

    #[tokio::test]
    async fn test_replay_refuses_batch_size() {
        let p = MemoryProvider::new();
        let mut c = open(&p, None);
        assert!(c.replay_step(&ChainStep::new("pretty", vec![])).is_ok());
        assert_eq!(
            c.replay_step(&ChainStep::new("batchSize", vec![json!(5)]))
                .unwrap_err()
                .kind(),
            ErrorKind::Unimplemented
        );
        assert_eq!(
            c.replay_step(&ChainStep::new("limit", vec![json!(5)]))
                .unwrap_err()
                .kind(),
            ErrorKind::Reconstruction
        );
    }
}
