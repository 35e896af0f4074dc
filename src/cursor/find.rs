//! The find cursor, exposed as `Cursor`.

use serde_json::{json, Value};

use super::base::CursorCore;
use super::{explain_query, Replay, ShellCursor};
use crate::capabilities::CallSite;
use crate::error::{ShellError, ShellResult};
use crate::provider::{CursorFlag, FindOption, NativeFindCursor, ReadPreferenceMode};
use crate::reconstruct::{ChainStep, ConstructionRecord};
use crate::session::SessionRef;

const CLASS: &str = "Cursor";

pub struct FindCursor {
    core: CursorCore<dyn NativeFindCursor>,
}

impl_cursor_object!(FindCursor, CLASS);

impl ShellCursor for FindCursor {
    type Native = dyn NativeFindCursor;

    fn core(&self) -> &CursorCore<dyn NativeFindCursor> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CursorCore<dyn NativeFindCursor> {
        &mut self.core
    }
}

impl FindCursor {
    pub fn new(
        native: Box<dyn NativeFindCursor>,
        record: ConstructionRecord,
        session: Option<SessionRef>,
    ) -> Self {
        Self {
            core: CursorCore::new(native, record, session),
        }
    }

    fn set<F>(&mut self, method: &'static str, args: Vec<Value>, f: F) -> ShellResult<&mut Self>
    where
        F: FnOnce(&mut (dyn NativeFindCursor + 'static)) -> ShellResult<()>,
    {
        self.core.configure(CLASS, method, args, f)?;
        Ok(self)
    }

    fn option(&mut self, method: &'static str, option: FindOption) -> ShellResult<&mut Self> {
        let args = vec![option.value()];
        self.set(method, args, |c| c.set_option(option))
    }

    fn flag(&mut self, method: &'static str, flag: CursorFlag) -> ShellResult<&mut Self> {
        self.set(method, Vec::new(), |c| c.add_cursor_flag(flag, true))
    }

    /// A negative limit returns a single batch of at most `|n|` documents.
    pub fn limit(&mut self, n: i64) -> ShellResult<&mut Self> {
        self.set("limit", vec![json!(n)], |c| c.limit(n))
    }

    pub fn skip(&mut self, n: u64) -> ShellResult<&mut Self> {
        self.set("skip", vec![json!(n)], |c| c.skip(n))
    }

    pub fn sort(&mut self, spec: Value) -> ShellResult<&mut Self> {
        self.set("sort", vec![spec.clone()], |c| c.sort(spec))
    }

    pub fn projection(&mut self, spec: Value) -> ShellResult<&mut Self> {
        self.set("projection", vec![spec.clone()], |c| c.project(spec))
    }

    pub fn hint(&mut self, index: Value) -> ShellResult<&mut Self> {
        self.option("hint", FindOption::Hint(index))
    }

    pub fn comment(&mut self, comment: Value) -> ShellResult<&mut Self> {
        self.option("comment", FindOption::Comment(comment))
    }

    pub fn collation(&mut self, spec: Value) -> ShellResult<&mut Self> {
        self.option("collation", FindOption::Collation(spec))
    }

    pub fn min(&mut self, bound: Value) -> ShellResult<&mut Self> {
        self.option("min", FindOption::Min(bound))
    }

    pub fn max(&mut self, bound: Value) -> ShellResult<&mut Self> {
        self.option("max", FindOption::Max(bound))
    }

    pub fn return_key(&mut self, enabled: bool) -> ShellResult<&mut Self> {
        self.option("returnKey", FindOption::ReturnKey(enabled))
    }

    pub fn show_record_id(&mut self, enabled: bool) -> ShellResult<&mut Self> {
        self.option("showRecordId", FindOption::ShowRecordId(enabled))
    }

    pub fn allow_disk_use(&mut self, allow: bool) -> ShellResult<&mut Self> {
        self.option("allowDiskUse", FindOption::AllowDiskUse(allow))
    }

    pub fn max_await_time_ms(&mut self, ms: u64) -> ShellResult<&mut Self> {
        self.option("maxAwaitTimeMS", FindOption::MaxAwaitTimeMS(ms))
    }

    pub fn no_cursor_timeout(&mut self) -> ShellResult<&mut Self> {
        self.flag("noCursorTimeout", CursorFlag::NoCursorTimeout)
    }

    pub fn allow_partial_results(&mut self) -> ShellResult<&mut Self> {
        self.flag("allowPartialResults", CursorFlag::Partial)
    }

    pub fn oplog_replay(&mut self) -> ShellResult<&mut Self> {
        self.flag("oplogReplay", CursorFlag::OplogReplay)
    }

    pub fn tailable(&mut self, await_data: bool) -> ShellResult<&mut Self> {
        self.set("tailable", vec![json!(await_data)], |c| {
            c.add_cursor_flag(CursorFlag::Tailable, true)?;
            c.add_cursor_flag(CursorFlag::AwaitData, await_data)
        })
    }

    /// Set a wire flag by bit value.
    pub fn add_option(&mut self, bit: u32) -> ShellResult<&mut Self> {
        self.set("addOption", vec![json!(bit)], |c| {
            match CursorFlag::from_bit(bit) {
                None => Err(ShellError::invalid_input(format!(
                    "Unknown option flag number: {bit}."
                ))),
                Some(CursorFlag::SlaveOk) => Err(ShellError::unimplemented(
                    CLASS,
                    "addOption with the slaveOk flag (use readPref instead)",
                )),
                Some(flag) => c.add_cursor_flag(flag, true),
            }
        })
    }

    pub fn read_pref(&mut self, mode: &str, tag_set: Option<Value>) -> ShellResult<&mut Self> {
        let args = vec![json!(mode), tag_set.clone().unwrap_or(Value::Null)];
        self.set("readPref", args, |c| {
            if tag_set.is_some() {
                return Err(ShellError::unimplemented(CLASS, "readPref with tag sets"));
            }
            c.with_read_preference(ReadPreferenceMode::parse(mode)?)
        })
    }

    /// Matching documents, ignoring skip and limit.
    pub async fn count(&mut self) -> ShellResult<u64> {
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "count")
            .run_async(self.core.native_mut().count(false))
            .await
    }

    /// Matching documents, honouring skip and limit.
    pub async fn size(&mut self) -> ShellResult<u64> {
        let session = self.core.session().cloned();
        CallSite::new(session.as_ref(), CLASS, "size")
            .run_async(self.core.native_mut().count(true))
            .await
    }

    pub async fn explain(&mut self, verbosity: Option<Value>) -> ShellResult<Value> {
        explain_query(&mut self.core, CLASS, verbosity).await
    }
}

impl Replay for FindCursor {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()> {
        let arg = |i: usize| step.arg(i).cloned();
        match step.method.as_str() {
            "limit" => self.limit(step.arg_i64(0)?)?,
            "skip" => self.skip(step.arg_u64(0)?)?,
            "sort" => self.sort(arg(0)?)?,
            "projection" => self.projection(arg(0)?)?,
            "hint" => self.hint(arg(0)?)?,
            "comment" => self.comment(arg(0)?)?,
            "collation" => self.collation(arg(0)?)?,
            "min" => self.min(arg(0)?)?,
            "max" => self.max(arg(0)?)?,
            "returnKey" => self.return_key(step.arg_bool(0)?)?,
            "showRecordId" => self.show_record_id(step.arg_bool(0)?)?,
            "allowDiskUse" => self.allow_disk_use(step.arg_bool(0)?)?,
            "maxAwaitTimeMS" => self.max_await_time_ms(step.arg_u64(0)?)?,
            "noCursorTimeout" => self.no_cursor_timeout()?,
            "allowPartialResults" => self.allow_partial_results()?,
            "oplogReplay" => self.oplog_replay()?,
            "tailable" => self.tailable(step.arg_bool(0)?)?,
            "addOption" => {
                let bit = u32::try_from(step.arg_u64(0)?)
                    .map_err(|_| ShellError::reconstruction("addOption flag out of range"))?;
                self.add_option(bit)?
            }
            "readPref" => {
                let tag_set = step.args.get(1).filter(|v| !v.is_null()).cloned();
                self.read_pref(step.arg_str(0)?, tag_set)?
            }
            _ => return self.replay_common(step),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{CursorState, DocumentMapper};
    use crate::error::ErrorKind;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::ServiceProvider;
    use crate::reconstruct::Origin;
    use crate::session::ShellSession;
    use crate::shell::{to_shell_output, Printable};
    use std::ops::ControlFlow;
    use std::sync::Arc;

    fn provider(n: usize) -> MemoryProvider {
        let p = MemoryProvider::new();
        p.seed("test", "items", (0..n).map(|i| json!({"_id": i, "i": i})))
            .unwrap();
        p
    }

    fn open(p: &MemoryProvider, session: Option<SessionRef>) -> FindCursor {
        let native = p.find("test", "items", json!({}), json!({})).unwrap();
        let record = ConstructionRecord::new(
            Origin::Find,
            vec![json!("test"), json!("items"), json!({}), json!({})],
        );
        FindCursor::new(native, record, session)
    }

    fn with_session(p: &MemoryProvider) -> (Arc<ShellSession>, FindCursor) {
        let session = ShellSession::with_provider(Arc::new(p.clone()));
        let cursor = open(p, Some(session.context()));
        (session, cursor)
    }

    fn assert_exhaustion_invariant(c: &FindCursor) {
        let closed = c.is_closed().unwrap();
        let left = c.objs_left_in_batch().unwrap();
        assert_eq!(c.is_exhausted().unwrap(), closed && left == 0);
    }

    #[tokio::test]
    async fn test_exhaustion_invariant_in_every_state() {
        let p = provider(5);
        let mut c = open(&p, None);
        assert_exhaustion_invariant(&c);
        c.try_next().await.unwrap();
        assert_exhaustion_invariant(&c);
        c.close().await.unwrap();
        assert_exhaustion_invariant(&c);
        assert_eq!(c.state(), CursorState::ClosedNotExhausted);
        c.to_array().await.unwrap();
        assert_exhaustion_invariant(&c);
        assert_eq!(c.state(), CursorState::ClosedExhausted);
    }

    #[tokio::test]
    async fn test_map_composes_chronologically() {
        let p = provider(3);
        let mut c = open(&p, None);
        c.map(DocumentMapper::new(|mut d| {
            d["i"] = json!(d["i"].as_i64().unwrap_or(0) + 1);
            Ok(d)
        }))
        .unwrap()
        .map(DocumentMapper::new(|mut d| {
            d["i"] = json!(d["i"].as_i64().unwrap_or(0) * 10);
            Ok(d)
        }))
        .unwrap();
        let is: Vec<_> = c
            .to_array()
            .await
            .unwrap()
            .iter()
            .map(|d| d["i"].as_i64().unwrap())
            .collect();
        // g(f(x)) = (x + 1) * 10, never x * 10 + 1
        assert_eq!(is, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_display_batches() {
        let p = provider(25);
        let (_session, mut c) = with_session(&p);

        let first = to_shell_output(&mut c).await.unwrap();
        assert_eq!(first.kind, "Cursor");
        assert_eq!(first.printable["documents"].as_array().unwrap().len(), 20);
        assert_eq!(first.printable["cursorHasMore"], true);

        let again = c.as_printable().await.unwrap();
        assert_eq!(again, first.printable);

        let next = c.it().await.unwrap();
        assert_eq!(next.len(), 5);
        assert_eq!(next.documents[0]["i"], 20);
        assert!(!next.cursor_has_more);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_display() {
        let p = provider(10);
        let (_session, mut c) = with_session(&p);
        c.batch_size(4).unwrap();
        let snap = c.it().await.unwrap();
        assert_eq!(snap.len(), 4);
        assert!(snap.cursor_has_more);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let p = provider(3);
        let mut c = open(&p, None);
        c.close().await.unwrap();
        c.close().await.unwrap();
        assert!(c.is_closed().unwrap());
    }

    #[tokio::test]
    async fn test_chain_is_recorded() {
        let p = provider(10);
        let mut c = open(&p, None);
        c.sort(json!({"i": -1}))
            .unwrap()
            .skip(2)
            .unwrap()
            .limit(3)
            .unwrap()
            .pretty()
            .unwrap();
        let methods: Vec<_> = c.record().chain.iter().map(|s| s.method.as_str()).collect();
        assert_eq!(methods, vec!["sort", "skip", "limit", "pretty"]);
        let is: Vec<_> = c
            .to_array()
            .await
            .unwrap()
            .iter()
            .map(|d| d["i"].as_i64().unwrap())
            .collect();
        assert_eq!(is, vec![7, 6, 5]);
    }

    #[tokio::test]
    async fn test_failed_configuration_not_recorded() {
        let p = provider(3);
        let mut c = open(&p, None);
        c.try_next().await.unwrap();
        let err = c.limit(1).err().unwrap();
        assert!(err.to_string().contains("already initialized"));
        assert!(c.record().chain.is_empty());
        // batch size stays adjustable
        assert!(c.batch_size(2).is_ok());
    }

    #[tokio::test]
    async fn test_add_option() {
        let p = provider(1);
        let mut c = open(&p, None);
        assert_eq!(c.add_option(3).err().unwrap().kind(), ErrorKind::InvalidInput);
        assert_eq!(c.add_option(4).err().unwrap().kind(), ErrorKind::Unimplemented);
        assert!(c.add_option(2).is_ok());
        assert_eq!(c.record().chain.len(), 1);
    }

    #[tokio::test]
    async fn test_read_pref() {
        let p = provider(1);
        let mut c = open(&p, None);
        assert!(c.read_pref("secondary", None).is_ok());
        let err = c.read_pref("secondary", Some(json!([{"dc": "ny"}]))).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert!(c.read_pref("sideways", None).is_err());
    }

    #[tokio::test]
    async fn test_count_and_size() {
        let p = provider(10);
        let mut c = open(&p, None);
        c.skip(2).unwrap().limit(5).unwrap();
        assert_eq!(c.count().await.unwrap(), 10);
        assert_eq!(c.size().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_explain_strips_execution_stats() {
        let p = provider(4);
        let mut c = open(&p, None);
        let plan = c.explain(None).await.unwrap();
        assert!(plan.get("queryPlanner").is_some());
        assert!(plan.get("executionStats").is_none());

        let mut c = open(&p, None);
        let full = c.explain(Some(json!("executionStats"))).await.unwrap();
        assert_eq!(full["executionStats"]["nReturned"], 4);

        let mut c = open(&p, None);
        assert!(c.explain(Some(json!("verbose"))).await.is_err());
    }

    #[tokio::test]
    async fn test_for_each_and_itcount() {
        let p = provider(6);
        let mut c = open(&p, None);
        let mut seen = 0;
        c.for_each(|_| {
            seen += 1;
            if seen == 4 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, 4);
        assert_eq!(c.itcount().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_has_next_and_next() {
        let p = provider(1);
        let mut c = open(&p, None);
        assert!(c.has_next().await.unwrap());
        assert_eq!(c.next().await.unwrap().unwrap()["i"], 0);
        assert!(!c.has_next().await.unwrap());
        assert!(c.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_call_leaves_cursor_unconsumed() {
        let p = provider(3);
        let (session, mut c) = with_session(&p);
        p.set_latency(Some(std::time::Duration::from_millis(300)));
        let flag = session.interrupt().clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.set();
        });
        let err = c.to_array().await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(c.objs_left_in_batch().ok(), None);

        session.interrupt().reset();
        p.set_latency(None);
        assert_eq!(c.state(), CursorState::OpenUnconsumed);
        assert_eq!(c.objs_left_in_batch().unwrap(), 0);
        assert_eq!(c.to_array().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_call_keeps_display_snapshot() {
        let p = provider(25);
        let (session, mut c) = with_session(&p);
        c.batch_size(2).unwrap();
        let first = c.it().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(c.state(), CursorState::OpenPartiallyConsumed);

        p.set_latency(Some(std::time::Duration::from_millis(300)));
        let flag = session.interrupt().clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.set();
        });
        assert!(c.try_next().await.unwrap_err().is_interrupted());

        session.interrupt().reset();
        p.set_latency(None);
        assert_eq!(c.core().snapshot(), Some(&first));
        assert_eq!(c.as_printable().await.unwrap(), serde_json::to_value(&first).unwrap());
    }

    #[tokio::test]
    async fn test_replay_unknown_method() {
        let p = provider(1);
        let mut c = open(&p, None);
        let err = c
            .replay_step(&ChainStep::new("teleport", vec![]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reconstruction);
        assert!(err.to_string().contains("Cursor has no chainable method teleport"));
    }
}
