//! Base traits for every shell-exposed object.
//!
//! A [`ShellObject`] carries a kind tag used for signature lookup and
//! printing, plus an optional reference to its owning session. The REPL
//! surface turns any [`Printable`] object into a [`ShellOutput`].

pub mod collection;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShellResult;
use crate::session::SessionRef;

pub use collection::{Collection, Database};

/// Abstract base of every exposed class.
pub trait ShellObject: Send + Sync {
    /// Class name used to look up the signature and pick a printer.
    fn shell_api_type(&self) -> &'static str;

    /// The owning session, if any. Plain values have none.
    fn session(&self) -> Option<&SessionRef> {
        None
    }
}

/// Objects that can be materialized for display.
#[async_trait]
pub trait Printable: ShellObject {
    /// Display-ready structure. Cursors run their top-level materialization here.
    async fn as_printable(&mut self) -> ShellResult<Value>;
}

/// Structure handed to the pretty-printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOutput {
    #[serde(rename = "type")]
    pub kind: String,
    pub printable: Value,
}

/// Materialize `obj` for display.
pub async fn to_shell_output<T>(obj: &mut T) -> ShellResult<ShellOutput>
where
    T: Printable + ?Sized,
{
    let printable = obj.as_printable().await?;
    Ok(ShellOutput {
        kind: obj.shell_api_type().to_string(),
        printable,
    })
}
