//! The bounded batch produced by one top-level cursor materialization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShellResult;
use crate::shell::{Printable, ShellObject};

/// Ordered, bounded sequence of materialized documents plus a "more
/// available" flag. Displayed as `CursorIterationResult`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationSnapshot {
    pub documents: Vec<Value>,
    pub cursor_has_more: bool,
}

impl IterationSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc: Value) {
        self.documents.push(doc);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl ShellObject for IterationSnapshot {
    fn shell_api_type(&self) -> &'static str {
        "CursorIterationResult"
    }
}

#[async_trait]
impl Printable for IterationSnapshot {
    async fn as_printable(&mut self) -> ShellResult<Value> {
        Ok(serde_json::to_value(&*self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_wire_shape() {
        let mut snap = IterationSnapshot::new();
        snap.push(json!({"_id": 1}));
        snap.cursor_has_more = true;
        assert_eq!(
            serde_json::to_value(&snap).unwrap(),
            json!({"documents": [{"_id": 1}], "cursorHasMore": true})
        );
        assert_eq!(snap.len(), 1);
    }
}
