//! Bridge contract shared by the three transports.
//!
//! A backend owns exactly four primitives: construct an object, call a static
//! method, call an instance method, and build a typed array. Everything the
//! facade does — loading models, introspecting fields, shipping pickled
//! batches — composes out of those four calls, so a transport is swappable
//! without touching the evaluator layer.
//!
//! Backends hand out opaque [`ObjectHandle`]s instead of raw references and
//! keep the referent alive until the backend itself is dropped. Class lookups
//! are cached per backend instance and never evicted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::BridgeError;

/// Support class bundled with the evaluator jars; entry point for the pickled
/// byte-stream calls.
pub const SUPPORT_CLASS: &str = "org.jpmml.evaluator.python.PythonEvaluatorUtil";
/// Builder class behind [`crate::EvaluatorBuilder`].
pub const LOADING_BUILDER_CLASS: &str = "org.jpmml.evaluator.LoadingModelEvaluatorBuilder";
/// Visitor battery applied by `set_default_visitor_battery`.
pub const VISITOR_BATTERY_CLASS: &str = "org.jpmml.evaluator.DefaultVisitorBattery";
/// Value factory factory behind `set_reporting`.
pub const REPORTING_FACTORY_CLASS: &str =
    "org.jpmml.evaluator.reporting.ReportingValueFactoryFactory";
/// Transpiler pair behind the `transpile` option.
pub const IN_MEMORY_TRANSPILER_CLASS: &str = "org.jpmml.transpiler.InMemoryTranspiler";
pub const TRANSPILER_TRANSFORMER_CLASS: &str = "org.jpmml.transpiler.TranspilerTransformer";
/// Plain JDK classes the facade constructs.
pub const FILE_CLASS: &str = "java.io.File";
pub const BYTE_STREAM_CLASS: &str = "java.io.ByteArrayInputStream";
pub const CLASS_CLASS: &str = "java.lang.Class";
pub const STRING_CLASS: &str = "java.lang.String";

/// Opaque reference to a JVM object held alive by its backend.
///
/// The wrapped id is public so custom [`Backend`] implementations can mint
/// handles, but it carries no meaning outside the backend that produced it;
/// handles are never shared between backend instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value crossing the bridge in either direction.
///
/// Scalars travel inline; everything else stays in the JVM behind an
/// [`ObjectHandle`]. Byte arrays are the one structured exception, because
/// the pickled payloads ride on them.
#[derive(Debug, Clone, PartialEq)]
pub enum JavaValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Object(ObjectHandle),
}

impl JavaValue {
    /// Short type label used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "byte array",
            Self::Object(_) => "object",
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Require an object reference, as after a constructor call.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] for any non-object value.
    pub fn into_object(self, context: &str) -> Result<ObjectHandle, BridgeError> {
        match self {
            Self::Object(handle) => Ok(handle),
            other => Err(BridgeError::Transport(format!(
                "{context} returned {} instead of an object",
                other.kind()
            ))),
        }
    }

    /// Require a byte array, as after a pickled evaluation call.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] for any non-byte-array value.
    pub fn into_bytes(self, context: &str) -> Result<Vec<u8>, BridgeError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(BridgeError::Transport(format!(
                "{context} returned {} instead of a byte array",
                other.kind()
            ))),
        }
    }
}

/// Which transport a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process JVM, direct JNI dispatch.
    Embedded,
    /// Child JVM process behind a socket RPC connection. The default.
    Gateway,
    /// In-process JVM, reflection-style dispatch.
    Native,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Gateway => "gateway",
            Self::Native => "nativebinding",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "gateway" => Ok(Self::Gateway),
            "nativebinding" | "native" => Ok(Self::Native),
            other => Err(BridgeError::Unsupported(format!(
                "unknown backend \"{other}\"; expected embedded, gateway, or nativebinding"
            ))),
        }
    }
}

/// The four-call bridge contract.
///
/// All methods are synchronous and blocking. Implementations translate every
/// transport-native failure into [`BridgeError`] before returning; JVM
/// exceptions come back as [`BridgeError::Java`] carrying the translated
/// [`crate::JavaError`].
pub trait Backend: Send {
    /// Which transport this backend speaks.
    fn kind(&self) -> BackendKind;

    /// Construct `class_name` with the given constructor arguments.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Invocation`] when the class or a matching constructor
    /// cannot be resolved; [`BridgeError::Java`] when the constructor throws.
    fn new_object(
        &mut self,
        class_name: &str,
        args: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError>;

    /// Call a static method on `class_name`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Invocation`] on resolution failure,
    /// [`BridgeError::Java`] when the method throws.
    fn static_invoke(
        &mut self,
        class_name: &str,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError>;

    /// Call an instance method on a held object.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Invocation`] on resolution failure,
    /// [`BridgeError::Java`] when the method throws.
    fn invoke(
        &mut self,
        target: ObjectHandle,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError>;

    /// Build a `class_name[]` array from the given elements.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Invocation`] when the element class cannot be resolved.
    fn new_array(
        &mut self,
        class_name: &str,
        values: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError>;
}

/// A backend shared between the builder, the evaluator, and error hierarchy
/// checks. Calls serialize on the inner lock.
pub type SharedBackend = Arc<Mutex<dyn Backend>>;

/// Wrap a backend for shared use.
pub fn shared(backend: impl Backend + 'static) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

/// Lock a shared backend, translating poisoning into a transport error.
pub(crate) fn lock(
    backend: &SharedBackend,
) -> Result<MutexGuard<'_, dyn Backend + 'static>, BridgeError> {
    backend
        .lock()
        .map_err(|_| BridgeError::Transport("backend lock poisoned".to_string()))
}

/// Construct a backend of the given kind.
///
/// The JVM-embedding kinds exist only when the matching cargo feature was
/// compiled in; otherwise this returns [`BridgeError::Unsupported`].
///
/// # Errors
///
/// Returns an error when the kind was not compiled into this build.
pub fn create_backend(kind: BackendKind) -> Result<SharedBackend, BridgeError> {
    match kind {
        BackendKind::Gateway => Ok(shared(crate::gateway::GatewayBackend::new())),
        BackendKind::Embedded => create_embedded(),
        BackendKind::Native => create_native(),
    }
}

/// Start the runtime the given backend kind rides on.
///
/// # Errors
///
/// Returns an error when a runtime is already live or startup fails.
pub fn create_runtime(kind: BackendKind, user_classpath: &[impl AsRef<Path>]) -> Result<(), BridgeError> {
    let user_classpath = owned_paths(user_classpath);
    match kind {
        BackendKind::Gateway => crate::gateway::GatewayBackend::create_runtime(&user_classpath),
        BackendKind::Embedded => create_embedded_runtime(&user_classpath),
        BackendKind::Native => create_native_runtime(&user_classpath),
    }
}

/// Stop the runtime for the given backend kind. Idempotent.
///
/// # Errors
///
/// Returns an error when teardown itself fails; a missing runtime is not an
/// error.
pub fn destroy_runtime(kind: BackendKind) -> Result<(), BridgeError> {
    match kind {
        BackendKind::Gateway => crate::gateway::GatewayBackend::destroy_runtime(),
        BackendKind::Embedded => destroy_embedded_runtime(),
        BackendKind::Native => destroy_native_runtime(),
    }
}

/// Start the runtime if none is live, then probe that the evaluator support
/// class resolves. Called by [`crate::make_evaluator`] before any model work.
///
/// # Errors
///
/// Returns an error when startup fails or the support class is missing from
/// the classpath.
pub fn ensure_runtime(kind: BackendKind, user_classpath: &[impl AsRef<Path>]) -> Result<(), BridgeError> {
    let user_classpath = owned_paths(user_classpath);
    match kind {
        BackendKind::Gateway => crate::gateway::GatewayBackend::ensure_runtime(&user_classpath),
        BackendKind::Embedded => ensure_embedded_runtime(&user_classpath),
        BackendKind::Native => ensure_native_runtime(&user_classpath),
    }
}

fn owned_paths(paths: &[impl AsRef<Path>]) -> Vec<std::path::PathBuf> {
    paths.iter().map(|p| p.as_ref().to_path_buf()).collect()
}

fn feature_unsupported(kind: BackendKind, feature: &str) -> BridgeError {
    BridgeError::Unsupported(format!(
        "the {kind} backend requires building with the `{feature}` cargo feature"
    ))
}

#[cfg(feature = "embedded")]
fn create_embedded() -> Result<SharedBackend, BridgeError> {
    Ok(shared(crate::embedded::EmbeddedBackend::new()))
}

#[cfg(not(feature = "embedded"))]
fn create_embedded() -> Result<SharedBackend, BridgeError> {
    Err(feature_unsupported(BackendKind::Embedded, "embedded"))
}

#[cfg(feature = "embedded")]
fn create_embedded_runtime(user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    crate::embedded::EmbeddedBackend::create_runtime(user_classpath)
}

#[cfg(not(feature = "embedded"))]
fn create_embedded_runtime(_user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Embedded, "embedded"))
}

#[cfg(feature = "embedded")]
fn destroy_embedded_runtime() -> Result<(), BridgeError> {
    crate::embedded::EmbeddedBackend::destroy_runtime()
}

#[cfg(not(feature = "embedded"))]
fn destroy_embedded_runtime() -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Embedded, "embedded"))
}

#[cfg(feature = "embedded")]
fn ensure_embedded_runtime(user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    crate::embedded::EmbeddedBackend::ensure_runtime(user_classpath)
}

#[cfg(not(feature = "embedded"))]
fn ensure_embedded_runtime(_user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Embedded, "embedded"))
}

#[cfg(feature = "native")]
fn create_native() -> Result<SharedBackend, BridgeError> {
    Ok(shared(crate::native::NativeBackend::new()))
}

#[cfg(not(feature = "native"))]
fn create_native() -> Result<SharedBackend, BridgeError> {
    Err(feature_unsupported(BackendKind::Native, "native"))
}

#[cfg(feature = "native")]
fn create_native_runtime(user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    crate::native::NativeBackend::create_runtime(user_classpath)
}

#[cfg(not(feature = "native"))]
fn create_native_runtime(_user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Native, "native"))
}

#[cfg(feature = "native")]
fn destroy_native_runtime() -> Result<(), BridgeError> {
    crate::native::NativeBackend::destroy_runtime()
}

#[cfg(not(feature = "native"))]
fn destroy_native_runtime() -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Native, "native"))
}

#[cfg(feature = "native")]
fn ensure_native_runtime(user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    crate::native::NativeBackend::ensure_runtime(user_classpath)
}

#[cfg(not(feature = "native"))]
fn ensure_native_runtime(_user_classpath: &[std::path::PathBuf]) -> Result<(), BridgeError> {
    Err(feature_unsupported(BackendKind::Native, "native"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("gateway".parse::<BackendKind>().unwrap(), BackendKind::Gateway);
        assert_eq!(
            "embedded".parse::<BackendKind>().unwrap(),
            BackendKind::Embedded
        );
        assert_eq!(
            "nativebinding".parse::<BackendKind>().unwrap(),
            BackendKind::Native
        );
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert!("py4j".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_display_round_trip() {
        for kind in [BackendKind::Embedded, BackendKind::Gateway, BackendKind::Native] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_java_value_conversions() {
        let handle = ObjectHandle(3);
        assert_eq!(JavaValue::Object(handle).as_object(), Some(handle));
        assert_eq!(JavaValue::Null.as_object(), None);

        assert_eq!(
            JavaValue::Object(handle).into_object("ctor").unwrap(),
            handle
        );
        assert!(JavaValue::Int(1).into_object("ctor").is_err());

        assert_eq!(
            JavaValue::Bytes(vec![1, 2]).into_bytes("evaluate").unwrap(),
            vec![1, 2]
        );
        assert!(JavaValue::Null.into_bytes("evaluate").is_err());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ObjectHandle(12).to_string(), "#12");
    }
}
