//! Library-wide error taxonomy and the translated JVM exception value.
//!
//! Backends convert every transport-native failure into [`BridgeError`] at the
//! boundary. JVM exceptions are unwrapped into the plain-data [`JavaError`]
//! (class name, message, stack frames); host-side failures keep their own
//! variants. Nothing in this crate raises across the boundary untranslated.

use std::fmt;

use thiserror::Error;

use crate::backend::{JavaValue, SharedBackend};
use crate::codec::CodecError;
use crate::table::TableError;

/// A JVM exception translated into host-side data.
///
/// Carries only what crossed the boundary: the originating class name, the
/// message, and the rendered stack frames. Hierarchy questions are answered by
/// [`JavaError::is_instance`], which asks the runtime — the host has no local
/// copy of Java's class graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaError {
    /// Fully-qualified class name of the thrown exception.
    pub class_name: String,
    /// Exception message, empty when the JVM reported none.
    pub message: String,
    /// Rendered stack trace elements, outermost frame first.
    pub stack_trace: Vec<String>,
}

impl JavaError {
    /// Build a translated error from its unwrapped parts.
    #[must_use]
    pub fn new(
        class_name: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Vec<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            stack_trace,
        }
    }

    /// Check this error against the runtime's class hierarchy.
    ///
    /// Resolves both class names through `java.lang.Class.forName` and asks
    /// `isAssignableFrom`, so the answer reflects the live JVM rather than any
    /// host-side guess.
    ///
    /// # Errors
    ///
    /// Returns an error if either class cannot be resolved or the bridge call
    /// fails.
    pub fn is_instance(
        &self,
        backend: &SharedBackend,
        class_name: &str,
    ) -> Result<bool, BridgeError> {
        let mut bridge = crate::backend::lock(backend)?;
        let wanted = bridge.static_invoke(
            crate::backend::CLASS_CLASS,
            "forName",
            &[JavaValue::String(class_name.to_string())],
        )?;
        let own = bridge.static_invoke(
            crate::backend::CLASS_CLASS,
            "forName",
            &[JavaValue::String(self.class_name.clone())],
        )?;
        let (JavaValue::Object(wanted), JavaValue::Object(own)) = (wanted, own) else {
            return Err(BridgeError::Transport(
                "Class.forName returned a non-object value".to_string(),
            ));
        };
        match bridge.invoke(wanted, "isAssignableFrom", &[JavaValue::Object(own)])? {
            JavaValue::Bool(hit) => Ok(hit),
            other => Err(BridgeError::Transport(format!(
                "isAssignableFrom returned {} instead of a boolean",
                other.kind()
            ))),
        }
    }
}

impl fmt::Display for JavaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.class_name)
        } else {
            write!(f, "{}: {}", self.class_name, self.message)
        }
    }
}

/// Everything that can go wrong while talking to the evaluator runtime.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Class/method resolution or object construction failed. Usually a
    /// misconfigured classpath or a wrong class name; never retried.
    #[error("failed to resolve or construct {class_name}: {detail}")]
    Invocation {
        /// Class whose resolution or construction failed.
        class_name: String,
        /// Backend-specific failure detail.
        detail: String,
    },

    /// A JVM exception translated at the boundary.
    #[error("JVM exception: {0}")]
    Java(JavaError),

    /// Schema or structural checks failed during `verify()` or `build()`.
    #[error("model verification failed: {0}")]
    Verification(JavaError),

    /// A single record failed evaluation. Fatal only to that call; the
    /// evaluator stays usable.
    #[error("record evaluation failed: {0}")]
    Evaluation(JavaError),

    /// Host-side builder misuse (double load, build without a source).
    #[error("builder misuse: {0}")]
    Builder(String),

    /// Gateway or JVM transport breakage. Always fatal, never retried.
    #[error("bridge transport failure: {0}")]
    Transport(String),

    /// Byte-stream payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),

    /// The bundled jar directories could not be located or read.
    #[error("classpath assembly failed: {0}")]
    Classpath(String),

    /// Tabular container misuse while rebuilding bulk results.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Underlying I/O failure (gateway launch, model files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested backend was not compiled into this build.
    #[error("backend not available: {0}")]
    Unsupported(String),
}

impl BridgeError {
    /// The translated JVM exception inside this error, if any.
    #[must_use]
    pub fn java_error(&self) -> Option<&JavaError> {
        match self {
            Self::Java(err) | Self::Verification(err) | Self::Evaluation(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_java_error_display_with_message() {
        let err = JavaError::new(
            "org.jpmml.evaluator.ValueCheckException",
            "Field \"x\" cannot accept user input value \"abc\"",
            vec![],
        );
        let text = format!("{err}");
        assert!(text.starts_with("org.jpmml.evaluator.ValueCheckException: "));
        assert!(text.contains("abc"));
    }

    #[test]
    fn test_java_error_display_without_message() {
        let err = JavaError::new("java.lang.IllegalArgumentException", "", vec![]);
        assert_eq!(format!("{err}"), "java.lang.IllegalArgumentException");
    }

    #[test]
    fn test_java_error_accessor() {
        let inner = JavaError::new("java.lang.RuntimeException", "boom", vec![]);
        let err = BridgeError::Evaluation(inner.clone());
        assert_eq!(err.java_error(), Some(&inner));

        let err = BridgeError::Transport("connection reset".to_string());
        assert!(err.java_error().is_none());
    }

    #[test]
    fn test_invocation_display_names_the_class() {
        let err = BridgeError::Invocation {
            class_name: "org.example.Missing".to_string(),
            detail: "class not found".to_string(),
        };
        let text = format!("{err}");
        assert!(text.contains("org.example.Missing"));
        assert!(text.contains("class not found"));
    }
}
