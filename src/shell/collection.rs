//! Database and collection handles.
//!
//! Cursor-opening methods build the [`ConstructionRecord`] of their origin
//! call and open the cursor through it, so every cursor a handle returns
//! can be rebuilt elsewhere. Write methods convert the raw service reply
//! into the matching result type.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::capabilities::CallSite;
use crate::cursor::{AggregationCursor, AnyCursor, ChangeStreamCursor, FindCursor, RunCommandCursor};
use crate::error::ShellResult;
use crate::reconstruct::{open_cursor, ConstructionRecord, Origin};
use crate::session::{SessionRef, ShellSession};
use crate::shell::ShellObject;
use crate::types::{
    BulkWriteResult, CommandResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};

fn open(
    session: &Arc<ShellSession>,
    ctx: &SessionRef,
    class: &str,
    method: &str,
    record: ConstructionRecord,
) -> ShellResult<AnyCursor> {
    CallSite::new(Some(ctx), class, method).run_sync(|| open_cursor(session, record))
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Database {
    session: Arc<ShellSession>,
    ctx: SessionRef,
    name: String,
}

impl Database {
    pub fn new(session: &Arc<ShellSession>, name: impl Into<String>) -> Self {
        Self {
            session: session.clone(),
            ctx: session.context(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            database: self.clone(),
            name: name.into(),
        }
    }

    /// Database-level aggregation.
    pub fn aggregate(&self, pipeline: Vec<Value>, options: Value) -> ShellResult<AggregationCursor> {
        let record = ConstructionRecord::new(
            Origin::AggregateDb,
            vec![json!(self.name), Value::Array(pipeline), options],
        );
        open(&self.session, &self.ctx, "Database", "aggregate", record)?.into_aggregation()
    }

    pub fn run_cursor_command(&self, command: Value, options: Value) -> ShellResult<RunCommandCursor> {
        let record = ConstructionRecord::new(
            Origin::RunCommandWithCheck,
            vec![json!(self.name), command, options],
        );
        open(&self.session, &self.ctx, "Database", "runCursorCommand", record)?.into_run_command()
    }

    /// Run a plain command and wrap its reply.
    pub async fn run_command(&self, command: Value) -> ShellResult<CommandResult> {
        let provider = self.session.provider();
        CallSite::new(Some(&self.ctx), "Database", "runCommand")
            .run_async(async {
                let reply = provider.run_command(&self.name, command).await?;
                CommandResult::from_reply("RunCommandResult", &reply)
            })
            .await
    }

    /// Change stream over every collection of the database.
    pub fn watch(&self, pipeline: Vec<Value>, options: Value) -> ShellResult<ChangeStreamCursor> {
        let record = ConstructionRecord::new(
            Origin::Watch,
            vec![json!(self.name), Value::Null, Value::Array(pipeline), options],
        );
        open(&self.session, &self.ctx, "Database", "watch", record)?.into_change_stream()
    }
}

impl ShellObject for Database {
    fn shell_api_type(&self) -> &'static str {
        "Database"
    }

    fn session(&self) -> Option<&SessionRef> {
        Some(&self.ctx)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

const CLASS: &str = "Collection";

#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// `db.coll`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database.name, self.name)
    }

    fn site<'a>(&'a self, method: &'a str) -> CallSite<'a> {
        CallSite::new(Some(&self.database.ctx), CLASS, method)
    }

    fn open(&self, method: &str, record: ConstructionRecord) -> ShellResult<AnyCursor> {
        open(&self.database.session, &self.database.ctx, CLASS, method, record)
    }

    pub fn find(&self, filter: Value, options: Value) -> ShellResult<FindCursor> {
        let record = ConstructionRecord::new(
            Origin::Find,
            vec![json!(self.database.name), json!(self.name), filter, options],
        );
        self.open("find", record)?.into_find()
    }

    pub fn aggregate(&self, pipeline: Vec<Value>, options: Value) -> ShellResult<AggregationCursor> {
        let record = ConstructionRecord::new(
            Origin::Aggregate,
            vec![
                json!(self.database.name),
                json!(self.name),
                Value::Array(pipeline),
                options,
            ],
        );
        self.open("aggregate", record)?.into_aggregation()
    }

    pub fn watch(&self, pipeline: Vec<Value>, options: Value) -> ShellResult<ChangeStreamCursor> {
        let record = ConstructionRecord::new(
            Origin::Watch,
            vec![
                json!(self.database.name),
                json!(self.name),
                Value::Array(pipeline),
                options,
            ],
        );
        self.open("watch", record)?.into_change_stream()
    }

    pub async fn insert_one(&self, doc: Value) -> ShellResult<InsertOneResult> {
        let provider = self.database.session.provider();
        self.site("insertOne")
            .run_async(async {
                let reply = provider
                    .insert_one(&self.database.name, &self.name, doc)
                    .await?;
                InsertOneResult::from_reply(&reply)
            })
            .await
    }

    pub async fn insert_many(&self, docs: Vec<Value>) -> ShellResult<InsertManyResult> {
        let provider = self.database.session.provider();
        self.site("insertMany")
            .run_async(async {
                let reply = provider
                    .insert_many(&self.database.name, &self.name, docs)
                    .await?;
                InsertManyResult::from_reply(&reply)
            })
            .await
    }

    pub async fn update_one(
        &self,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<UpdateResult> {
        let provider = self.database.session.provider();
        self.site("updateOne")
            .run_async(async {
                let reply = provider
                    .update_one(&self.database.name, &self.name, filter, update, options)
                    .await?;
                UpdateResult::from_reply(&reply)
            })
            .await
    }

    pub async fn update_many(
        &self,
        filter: Value,
        update: Value,
        options: Value,
    ) -> ShellResult<UpdateResult> {
        let provider = self.database.session.provider();
        self.site("updateMany")
            .run_async(async {
                let reply = provider
                    .update_many(&self.database.name, &self.name, filter, update, options)
                    .await?;
                UpdateResult::from_reply(&reply)
            })
            .await
    }

    pub async fn delete_one(&self, filter: Value) -> ShellResult<DeleteResult> {
        let provider = self.database.session.provider();
        self.site("deleteOne")
            .run_async(async {
                let reply = provider
                    .delete_one(&self.database.name, &self.name, filter)
                    .await?;
                DeleteResult::from_reply(&reply)
            })
            .await
    }

    pub async fn delete_many(&self, filter: Value) -> ShellResult<DeleteResult> {
        let provider = self.database.session.provider();
        self.site("deleteMany")
            .run_async(async {
                let reply = provider
                    .delete_many(&self.database.name, &self.name, filter)
                    .await?;
                DeleteResult::from_reply(&reply)
            })
            .await
    }

    pub async fn bulk_write(&self, operations: Vec<Value>) -> ShellResult<BulkWriteResult> {
        let provider = self.database.session.provider();
        self.site("bulkWrite")
            .run_async(async {
                let reply = provider
                    .bulk_write(&self.database.name, &self.name, operations)
                    .await?;
                BulkWriteResult::from_reply(&reply)
            })
            .await
    }
}

impl ShellObject for Collection {
    fn shell_api_type(&self) -> &'static str {
        CLASS
    }

    fn session(&self) -> Option<&SessionRef> {
        Some(&self.database.ctx)
    }
}
