//! # shellcore
//!
//! Runtime substrate for the objects an interactive database shell exposes.
//!
//! Three mechanisms carry most of the weight:
//!
//! - [`capabilities`]: per-class method signatures used for autocompletion
//!   and version or topology gating, plus the [`CallSite`] wrapper every
//!   exposed method runs inside (cancellation, telemetry, error transform).
//! - [`cursor`]: one cursor surface over the find, aggregation, run-command
//!   and change-stream resources of the service boundary.
//! - [`reconstruct`]: the replayable record of a cursor's origin call and
//!   configuration chain, used to rebuild an equivalent cursor in another
//!   execution context such as a [`runtime::EvaluationWorker`].

pub mod capabilities;
pub mod cursor;
pub mod error;
pub mod events;
pub mod provider;
pub mod reconstruct;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod telemetry;
pub mod types;

pub use capabilities::{signatures, CallSite, ConnectionInfo, SignatureRegistry};
pub use cursor::{
    AggregationCursor, AnyCursor, ChangeStreamCursor, CursorState, DocumentMapper, FindCursor,
    RunCommandCursor, ShellCursor,
};
pub use error::{ErrorInfo, ErrorKind, ShellError, ShellResult};
pub use provider::memory::MemoryProvider;
pub use provider::ServiceProvider;
pub use reconstruct::{reconstruct_cursor, ConstructionRecord, CursorVariant, Origin};
pub use runtime::EvaluationWorker;
pub use session::{SessionConfig, SessionContext, SessionRef, ShellSession};
pub use shell::{to_shell_output, Collection, Database, Printable, ShellObject, ShellOutput};
pub use types::{IterationSnapshot, ResultValue};
