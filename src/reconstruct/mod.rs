//! Reconstruction Protocol: rebuild a cursor from its [`ConstructionRecord`].
//!
//! The origin call is re-issued against the session's service provider and
//! the recorded chain is replayed in order through the cursor's own
//! wrapped methods, so the rebuilt cursor records the same chain and can be
//! reconstructed again.

pub mod record;

use std::sync::Arc;

use serde_json::Value;

use crate::cursor::{
    AggregationCursor, AnyCursor, ChangeStreamCursor, FindCursor, Replay, RunCommandCursor,
};
use crate::error::{ShellError, ShellResult};
use crate::session::ShellSession;

pub use record::{ChainStep, ConstructionRecord, CursorVariant, Origin};

fn str_arg(args: &[Value], index: usize, name: &str) -> ShellResult<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ShellError::reconstruction(format!("origin argument {name} must be a string")))
}

fn pipeline_arg(args: &[Value], index: usize) -> ShellResult<Vec<Value>> {
    match args.get(index) {
        Some(Value::Array(stages)) => Ok(stages.clone()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(ShellError::reconstruction(format!(
            "origin argument pipeline must be an array, got {other}"
        ))),
    }
}

fn value_arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

/// Issue the origin call of `record` and wrap the native resource. The
/// chain is not replayed.
pub fn open_cursor(session: &Arc<ShellSession>, record: ConstructionRecord) -> ShellResult<AnyCursor> {
    record.validate()?;
    let provider = session.provider();
    let ctx = Some(session.context());
    let args = record.args.clone();
    let cursor = match record.origin {
        Origin::Find => {
            let native = provider.find(
                &str_arg(&args, 0, "database")?,
                &str_arg(&args, 1, "collection")?,
                value_arg(&args, 2),
                value_arg(&args, 3),
            )?;
            AnyCursor::Find(FindCursor::new(native, record, ctx))
        }
        Origin::Aggregate => {
            let native = provider.aggregate(
                &str_arg(&args, 0, "database")?,
                &str_arg(&args, 1, "collection")?,
                pipeline_arg(&args, 2)?,
                value_arg(&args, 3),
            )?;
            AnyCursor::Aggregation(AggregationCursor::new(native, record, ctx))
        }
        Origin::AggregateDb => {
            let native = provider.aggregate_db(
                &str_arg(&args, 0, "database")?,
                pipeline_arg(&args, 1)?,
                value_arg(&args, 2),
            )?;
            AnyCursor::Aggregation(AggregationCursor::new(native, record, ctx))
        }
        Origin::RunCursorCommand => {
            let native = provider.run_cursor_command(
                &str_arg(&args, 0, "database")?,
                value_arg(&args, 1),
                value_arg(&args, 2),
            )?;
            AnyCursor::RunCommand(RunCommandCursor::new(native, record, ctx))
        }
        Origin::RunCommandWithCheck => {
            let native = provider.run_command_with_check(
                &str_arg(&args, 0, "database")?,
                value_arg(&args, 1),
                value_arg(&args, 2),
            )?;
            AnyCursor::RunCommand(RunCommandCursor::new(native, record, ctx))
        }
        Origin::Watch => {
            let collection = args.get(1).and_then(Value::as_str);
            let native = provider.watch(
                &str_arg(&args, 0, "database")?,
                collection,
                pipeline_arg(&args, 2)?,
                value_arg(&args, 3),
            )?;
            AnyCursor::ChangeStream(ChangeStreamCursor::new(native, record, ctx))
        }
    };
    Ok(cursor)
}

/// Rebuild an equivalent cursor in `session`.
///
/// A chain step the target variant does not have, or whose arguments do
/// not fit, fails the whole reconstruction.
pub fn reconstruct_cursor(
    session: &Arc<ShellSession>,
    record: &ConstructionRecord,
) -> ShellResult<AnyCursor> {
    let mut origin = record.clone();
    let chain = std::mem::take(&mut origin.chain);
    log::debug!(
        "reconstructing {} from {} with {} chained calls",
        record.variant,
        record.origin,
        chain.len()
    );
    let mut cursor = open_cursor(session, origin)?;
    for (index, step) in chain.iter().enumerate() {
        cursor.replay_step(step).map_err(|err| match err {
            ShellError::Reconstruction(_) | ShellError::Interrupted => err,
            other => ShellError::reconstruction(format!(
                "chain step {index} ({}) failed: {other}",
                step.method
            )),
        })?;
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::DocumentMapper;
    use crate::cursor::ShellCursor;
    use crate::error::ErrorKind;
    use crate::provider::memory::MemoryProvider;
    use serde_json::json;

    fn session(n: usize) -> Arc<ShellSession> {
        let _ = env_logger::builder().is_test(true).try_init();
        let p = MemoryProvider::new();
        p.seed("test", "items", (0..n).map(|i| json!({"_id": i, "i": i})))
            .unwrap();
        ShellSession::with_provider(Arc::new(p))
    }

    fn find_record() -> ConstructionRecord {
        ConstructionRecord::new(
            Origin::Find,
            vec![json!("test"), json!("items"), json!({}), json!({})],
        )
    }

    #[tokio::test]
    async fn test_empty_chain_matches_direct_cursor() {
        let s = session(30);
        let native = s.provider().find("test", "items", json!({}), json!({})).unwrap();
        let mut direct = FindCursor::new(native, find_record(), None);
        let mut rebuilt = reconstruct_cursor(&s, &find_record())
            .unwrap()
            .into_find()
            .unwrap();
        for _ in 0..30 {
            assert_eq!(
                direct.try_next().await.unwrap(),
                rebuilt.try_next().await.unwrap()
            );
        }
        assert!(rebuilt.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_limit_chain_bounds_results() {
        let s = session(50);
        let mut record = find_record();
        record.push("limit", vec![json!(7)]);
        let mut cursor = reconstruct_cursor(&s, &record).unwrap().into_find().unwrap();
        assert_eq!(cursor.to_array().await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_reconstruction_composes() {
        let s = session(10);
        let mut original = reconstruct_cursor(&s, &find_record())
            .unwrap()
            .into_find()
            .unwrap();
        original
            .sort(json!({"i": -1}))
            .unwrap()
            .map(DocumentMapper::named("pick", json!(["i"])).unwrap())
            .unwrap()
            .limit(2)
            .unwrap();

        let json = original.record().to_json().unwrap();
        let record = ConstructionRecord::from_json(&json).unwrap();
        let first = reconstruct_cursor(&s, &record).unwrap();
        assert_eq!(first.record(), original.record());

        let mut second = reconstruct_cursor(&s, first.record())
            .unwrap()
            .into_find()
            .unwrap();
        assert_eq!(
            second.to_array().await.unwrap(),
            vec![json!({"i": 9}), json!({"i": 8})]
        );
    }

    #[tokio::test]
    async fn test_unknown_method_fails_loudly() {
        let s = session(1);
        let mut record = find_record();
        record.push("limit", vec![json!(1)]);
        record.push("teleport", vec![]);
        let err = reconstruct_cursor(&s, &record).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Reconstruction);
        assert!(err.to_string().contains("teleport"));
    }

    #[tokio::test]
    async fn test_variant_mismatch() {
        let s = session(1);
        let mut record = find_record();
        record.variant = CursorVariant::AggregationCursor;
        assert_eq!(
            reconstruct_cursor(&s, &record).err().unwrap().kind(),
            ErrorKind::Reconstruction
        );
    }

    #[tokio::test]
    async fn test_anonymous_map_cannot_be_replayed() {
        let s = session(1);
        let mut original = reconstruct_cursor(&s, &find_record())
            .unwrap()
            .into_find()
            .unwrap();
        original.map(DocumentMapper::new(Ok)).unwrap();
        let err = reconstruct_cursor(&s, original.record()).err().unwrap();
        assert!(err.to_string().contains("anonymous"));
    }

    #[tokio::test]
    async fn test_bad_step_arguments() {
        let s = session(1);
        let mut record = find_record();
        record.push("limit", vec![json!("many")]);
        assert_eq!(
            reconstruct_cursor(&s, &record).err().unwrap().kind(),
            ErrorKind::Reconstruction
        );
    }

    #[tokio::test]
    async fn test_every_origin_opens() {
        let s = session(3);
        let records = [
            ConstructionRecord::new(
                Origin::Aggregate,
                vec![json!("test"), json!("items"), json!([{"$match": {"i": 1}}]), json!({})],
            ),
            ConstructionRecord::new(
                Origin::AggregateDb,
                vec![json!("test"), json!([{"$documents": [{"x": 1}]}]), json!({})],
            ),
            ConstructionRecord::new(
                Origin::RunCursorCommand,
                vec![json!("test"), json!({"find": "items"}), json!({})],
            ),
            ConstructionRecord::new(
                Origin::RunCommandWithCheck,
                vec![json!("test"), json!({"listCollections": 1}), json!({})],
            ),
            ConstructionRecord::new(
                Origin::Watch,
                vec![json!("test"), Value::Null, json!([]), json!({})],
            ),
        ];
        let expected = [
            CursorVariant::AggregationCursor,
            CursorVariant::AggregationCursor,
            CursorVariant::RunCommandCursor,
            CursorVariant::RunCommandCursor,
            CursorVariant::ChangeStreamCursor,
        ];
        for (record, variant) in records.iter().zip(expected) {
            let cursor = reconstruct_cursor(&s, record).unwrap();
            assert_eq!(cursor.variant(), variant);
        }
    }

    #[tokio::test]
    async fn test_run_command_with_check_rejects_empty_command() {
        let s = session(0);
        let record = ConstructionRecord::new(
            Origin::RunCommandWithCheck,
            vec![json!("test"), json!({}), json!({})],
        );
        assert_eq!(
            reconstruct_cursor(&s, &record).err().unwrap().kind(),
            ErrorKind::InvalidInput
        );
    }
}
