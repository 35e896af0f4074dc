//! Outcome records for write and command operations.
//!
//! Each kind exposes a fixed attribute shape no matter which call produced
//! it, so every deletion outcome, for example, reads as
//! `{acknowledged, deletedCount}`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ShellError, ShellResult};
use crate::shell::{Printable, ShellObject};

fn parse_reply<T: DeserializeOwned>(kind: &str, reply: &Value) -> ShellResult<T> {
    if !reply.is_object() {
        return Err(ShellError::invalid_input(format!(
            "malformed {kind} reply: expected a document"
        )));
    }
    serde_json::from_value(reply.clone())
        .map_err(|e| ShellError::invalid_input(format!("malformed {kind} reply: {e}")))
}

/// Outcome of a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    #[serde(default)]
    acknowledged: bool,
    deleted_count: u64,
}

impl DeleteResult {
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn new(acknowledged: bool, deleted_count: u64) -> Self {
        Self {
            acknowledged,
            deleted_count,
        }
    }

    /// Build from a raw service reply.
    pub fn from_reply(reply: &Value) -> ShellResult<Self> {
        parse_reply("delete", reply)
    }
}

/// Outcome of a single insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    #[serde(default)]
    acknowledged: bool,
    inserted_id: Value,
}

impl InsertOneResult {
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn inserted_id(&self) -> &Value {
        &self.inserted_id
    }

    pub fn new(acknowledged: bool, inserted_id: Value) -> Self {
        Self {
            acknowledged,
            inserted_id,
        }
    }

    /// Build from a raw service reply.
    pub fn from_reply(reply: &Value) -> ShellResult<Self> {
        parse_reply("insertOne", reply)
    }
}

/// Outcome of a multi-document insert. Ids are keyed by input position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    #[serde(default)]
    acknowledged: bool,
    inserted_ids: BTreeMap<u64, Value>,
}

impl InsertManyResult {
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn inserted_ids(&self) -> &BTreeMap<u64, Value> {
        &self.inserted_ids
    }

    pub fn new(acknowledged: bool, inserted_ids: BTreeMap<u64, Value>) -> Self {
        Self {
            acknowledged,
            inserted_ids,
        }
    }

    /// Build from a raw service reply.
    pub fn from_reply(reply: &Value) -> ShellResult<Self> {
        parse_reply("insertMany", reply)
    }
}

/// Outcome of an update or replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    #[serde(default)]
    acknowledged: bool,
    /// Id of the upserted document, when the update inserted one.
    #[serde(default)]
    inserted_id: Option<Value>,
    matched_count: u64,
    modified_count: u64,
    #[serde(default)]
    upserted_count: u64,
}

impl UpdateResult {
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Id of the upserted document, if the update inserted one.
    pub fn inserted_id(&self) -> Option<&Value> {
        self.inserted_id.as_ref()
    }

    pub fn matched_count(&self) -> u64 {
        self.matched_count
    }

    pub fn modified_count(&self) -> u64 {
        self.modified_count
    }

    pub fn upserted_count(&self) -> u64 {
        self.upserted_count
    }

    /// Build from a raw service reply.
    ///
    /// Drivers report the upserted id as `upsertedId`; it is exposed as
    /// `insertedId`.
    pub fn from_reply(reply: &Value) -> ShellResult<Self> {
        let mut result: UpdateResult = parse_reply("update", reply)?;
        if result.inserted_id.is_none() {
            result.inserted_id = reply
                .get("upsertedId")
                .filter(|id| !id.is_null())
                .cloned();
        }
        Ok(result)
    }
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    #[serde(default)]
    acknowledged: bool,
    #[serde(default)]
    inserted_count: u64,
    #[serde(default)]
    inserted_ids: BTreeMap<u64, Value>,
    #[serde(default)]
    matched_count: u64,
    #[serde(default)]
    modified_count: u64,
    #[serde(default)]
    deleted_count: u64,
    #[serde(default)]
    upserted_count: u64,
    #[serde(default)]
    upserted_ids: BTreeMap<u64, Value>,
}

impl BulkWriteResult {
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn inserted_count(&self) -> u64 {
        self.inserted_count
    }

    pub fn inserted_ids(&self) -> &BTreeMap<u64, Value> {
        &self.inserted_ids
    }

    pub fn matched_count(&self) -> u64 {
        self.matched_count
    }

    pub fn modified_count(&self) -> u64 {
        self.modified_count
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn upserted_count(&self) -> u64 {
        self.upserted_count
    }

    pub fn upserted_ids(&self) -> &BTreeMap<u64, Value> {
        &self.upserted_ids
    }

    /// Build from a raw service reply.
    pub fn from_reply(reply: &Value) -> ShellResult<Self> {
        parse_reply("bulkWrite", reply)
    }
}

/// Outcome of a generic database command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Display type of the command reply, e.g. `"ServerStatus"`.
    #[serde(rename = "type")]
    result_type: String,
    value: Value,
}

impl CommandResult {
    /// Display type of the reply, e.g. `"RunCommandResult"`.
    pub fn result_type(&self) -> &str {
        &self.result_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn new(result_type: impl Into<String>, value: Value) -> Self {
        Self {
            result_type: result_type.into(),
            value,
        }
    }

    /// Wrap a raw command reply. A reply with `ok: 0` is a resource failure.
    pub fn from_reply(result_type: impl Into<String>, reply: &Value) -> ShellResult<Self> {
        let Some(doc) = reply.as_object() else {
            return Err(ShellError::invalid_input(
                "malformed command reply: expected a document",
            ));
        };
        if doc.get("ok").and_then(Value::as_f64) == Some(0.0) {
            let message = doc
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("command failed");
            return Err(match doc.get("code") {
                Some(code) => ShellError::resource_with_code(code.to_string(), message),
                None => ShellError::resource(message),
            });
        }
        Ok(Self::new(result_type, reply.clone()))
    }
}

// ---------------------------------------------------------------------------
// ResultValue
// ---------------------------------------------------------------------------

/// Any operation outcome, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result")]
pub enum ResultValue {
    Delete(DeleteResult),
    InsertOne(InsertOneResult),
    InsertMany(InsertManyResult),
    Update(UpdateResult),
    BulkWrite(BulkWriteResult),
    Command(CommandResult),
}

impl ResultValue {
    /// Attribute view used for display.
    pub fn attributes(&self) -> ShellResult<Value> {
        let value = match self {
            Self::Delete(r) => serde_json::to_value(r)?,
            Self::InsertOne(r) => serde_json::to_value(r)?,
            Self::InsertMany(r) => serde_json::to_value(r)?,
            Self::Update(r) => serde_json::to_value(r)?,
            Self::BulkWrite(r) => serde_json::to_value(r)?,
            Self::Command(r) => r.value.clone(),
        };
        Ok(value)
    }
}

macro_rules! impl_result_object {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl ShellObject for $ty {
                fn shell_api_type(&self) -> &'static str {
                    stringify!($ty)
                }
            }

            #[async_trait]
            impl Printable for $ty {
                async fn as_printable(&mut self) -> ShellResult<Value> {
                    Ok(serde_json::to_value(&*self)?)
                }
            }

            impl From<$ty> for ResultValue {
                fn from(r: $ty) -> Self {
                    ResultValue::$variant(r)
                }
            }
        )*
    };
}

impl_result_object! {
    DeleteResult => Delete,
    InsertOneResult => InsertOne,
    InsertManyResult => InsertMany,
    UpdateResult => Update,
    BulkWriteResult => BulkWrite,
}

impl ShellObject for CommandResult {
    fn shell_api_type(&self) -> &'static str {
        "CommandResult"
    }
}

#[async_trait]
impl Printable for CommandResult {
    async fn as_printable(&mut self) -> ShellResult<Value> {
        Ok(self.value.clone())
    }
}

impl From<CommandResult> for ResultValue {
    fn from(r: CommandResult) -> Self {
        ResultValue::Command(r)
    }
}

impl ShellObject for ResultValue {
    fn shell_api_type(&self) -> &'static str {
        match self {
            Self::Delete(r) => r.shell_api_type(),
            Self::InsertOne(r) => r.shell_api_type(),
            Self::InsertMany(r) => r.shell_api_type(),
            Self::Update(r) => r.shell_api_type(),
            Self::BulkWrite(r) => r.shell_api_type(),
            Self::Command(r) => r.shell_api_type(),
        }
    }
}

#[async_trait]
impl Printable for ResultValue {
    async fn as_printable(&mut self) -> ShellResult<Value> {
        self.attributes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delete_result_shape() {
        let r = DeleteResult::from_reply(&json!({"acknowledged": true, "deletedCount": 3})).unwrap();
        assert_eq!(r, DeleteResult::new(true, 3));
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"acknowledged": true, "deletedCount": 3})
        );
    }

    #[test]
    fn test_missing_count_is_invalid_input() {
        let err = DeleteResult::from_reply(&json!({"acknowledged": true})).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        let err = InsertOneResult::from_reply(&json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("expected a document"));
    }

    #[test]
    fn test_update_result_maps_upserted_id() {
        let r = UpdateResult::from_reply(&json!({
            "acknowledged": true,
            "matchedCount": 0,
            "modifiedCount": 0,
            "upsertedCount": 1,
            "upsertedId": "abc"
        }))
        .unwrap();
        assert_eq!(r.inserted_id(), Some(&json!("abc")));
        assert_eq!(r.upserted_count(), 1);
    }

    #[test]
    fn test_insert_many_ids_by_position() {
        let r = InsertManyResult::from_reply(&json!({
            "acknowledged": true,
            "insertedIds": {"0": 10, "1": 11}
        }))
        .unwrap();
        assert_eq!(r.inserted_ids().get(&1), Some(&json!(11)));
    }

    #[test]
    fn test_bulk_write_accessors() {
        let r = BulkWriteResult::from_reply(&json!({
            "acknowledged": true,
            "insertedCount": 2,
            "insertedIds": {"0": "a", "2": "b"},
            "matchedCount": 1,
            "modifiedCount": 1,
            "deletedCount": 4,
            "upsertedIds": {"3": 7},
            "upsertedCount": 1
        }))
        .unwrap();
        assert!(r.acknowledged());
        assert_eq!(r.inserted_count(), 2);
        assert_eq!(r.inserted_ids().get(&2), Some(&json!("b")));
        assert_eq!((r.matched_count(), r.modified_count()), (1, 1));
        assert_eq!(r.deleted_count(), 4);
        assert_eq!(r.upserted_count(), 1);
        assert_eq!(r.upserted_ids().get(&3), Some(&json!(7)));
    }

    #[test]
    fn test_command_result_failure() {
        let err = CommandResult::from_reply(
            "Document",
            &json!({"ok": 0, "errmsg": "no such command", "code": 59}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
        assert_eq!(err.code(), Some("59"));
    }

    #[test]
    fn test_result_value_tagging() {
        let v: ResultValue = DeleteResult::new(true, 1).into();
        assert_eq!(v.shell_api_type(), "DeleteResult");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "Delete");
        let back: ResultValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
