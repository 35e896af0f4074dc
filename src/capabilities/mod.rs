//! Capability Registry: per-class signature metadata and call wrapping.
//!
//! - [`signature`]: declarations and fully populated signature nodes
//! - [`registry`]: the process-wide, append-only signature tree
//! - [`builtin`]: declarations of the built-in classes
//! - [`complete`]: version/topology filtering for completion
//! - [`wrap`]: the wrapper every exposed method body runs in

pub mod builtin;
pub mod complete;
pub mod registry;
pub mod signature;
pub mod wrap;

pub use complete::ConnectionInfo;
pub use registry::{register_class, signatures, ClassHelp, SignatureRegistry};
pub use signature::{
    ApiVersionRange, ClassSpec, MethodSpec, Platform, ReturnType, Topology, TypeSignature,
    VersionRange,
};
pub use wrap::CallSite;
