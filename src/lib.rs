//! # jpmml-bridge
//!
//! PMML evaluator bindings over a JVM: load a model through the JPMML
//! evaluator stack, then score single records or whole tables from Rust.
//!
//! ## Transports
//!
//! The scoring engine stays in Java; this crate is the marshaling and
//! lifecycle layer around it. Three interchangeable transports implement the
//! same four-call bridge contract:
//!
//! - `gateway` (default): a child `java` process behind a loopback socket,
//!   speaking length-prefixed pickled frames
//! - `embedded` (cargo feature `embedded`): in-process JVM, direct JNI
//!   dispatch through cached call signatures
//! - `nativebinding` (cargo feature `native`): in-process JVM, per-call
//!   `java.lang.reflect` dispatch
//!
//! ## Architecture
//!
//! ```text
//! Record | Table (host values)
//!        ↓
//! canonicalize (NaN → missing)
//!        ↓
//! pickle codec ({columns, data} column-major)
//!        ↓
//! Backend (gateway | embedded | nativebinding)
//!        ↓
//! PythonEvaluatorUtil.evaluate / evaluateAll (JVM)
//!        ↓
//! pickle codec ({columns, data, errors})
//!        ↓
//! Table + per-row errors (input index preserved)
//! ```
//!
//! Handles returned by a backend stay valid for the backend's lifetime.
//! Errors cross the boundary as [`BridgeError`], with JVM exceptions
//! translated into plain [`JavaError`] values at the transport edge.

pub mod backend;
pub mod builder;
pub mod classpath;
pub mod codec;
#[cfg(feature = "embedded")]
pub mod embedded;
pub mod error;
pub mod evaluator;
pub mod field;
pub mod gateway;
#[cfg(any(feature = "embedded", feature = "native"))]
mod jvm;
#[cfg(feature = "native")]
pub mod native;
pub mod protocol;
pub mod table;
pub mod value;

pub use backend::{
    create_backend, create_runtime, destroy_runtime, ensure_runtime, shared, Backend,
    BackendKind, JavaValue, ObjectHandle, SharedBackend,
};
pub use builder::{make_evaluator, EvaluatorBuilder, EvaluatorOptions, ModelSource};
pub use codec::{CodecError, Record, TablePayload};
#[cfg(feature = "embedded")]
pub use embedded::EmbeddedBackend;
pub use error::{BridgeError, JavaError};
pub use evaluator::{BulkResult, EvaluateAllOptions, Evaluator};
pub use field::ModelField;
pub use gateway::GatewayBackend;
#[cfg(feature = "native")]
pub use native::NativeBackend;
pub use table::{Table, TableError};
pub use value::Value;
