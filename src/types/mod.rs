//! Result types and iteration snapshots.

pub mod results;
pub mod snapshot;

pub use results::{
    BulkWriteResult, CommandResult, DeleteResult, InsertManyResult, InsertOneResult,
    ResultValue, UpdateResult,
};
pub use snapshot::IterationSnapshot;
