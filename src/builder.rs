//! Builder for bridge-side model evaluators.
//!
//! Wraps `LoadingModelEvaluatorBuilder`: configuration calls chain by
//! consuming the builder, exactly one model source may be loaded, and
//! `build` consumes the whole thing, so the created-configured-built order
//! is enforced by ownership rather than run-time checks. Source and
//! double-load mistakes are host-side [`BridgeError::Builder`] errors and
//! never touch the bridge.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::backend::{
    self, BackendKind, JavaValue, SharedBackend, BYTE_STREAM_CLASS, FILE_CLASS,
    IN_MEMORY_TRANSPILER_CLASS, LOADING_BUILDER_CLASS, REPORTING_FACTORY_CLASS,
    TRANSPILER_TRANSFORMER_CLASS, VISITOR_BATTERY_CLASS,
};
use crate::error::BridgeError;
use crate::evaluator::Evaluator;

/// Strings at most this long are probed as file paths by the
/// [`ModelSource`] auto-detection.
const MAX_PATH_PROBE_LEN: usize = 1024;

/// Builder over a bridge-side `LoadingModelEvaluatorBuilder`.
pub struct EvaluatorBuilder {
    backend: SharedBackend,
    handle: crate::backend::ObjectHandle,
    loaded: bool,
    transpile: bool,
}

impl fmt::Debug for EvaluatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorBuilder")
            .field("handle", &self.handle)
            .field("loaded", &self.loaded)
            .field("transpile", &self.transpile)
            .finish_non_exhaustive()
    }
}

impl EvaluatorBuilder {
    /// Construct the bridge-side builder object.
    ///
    /// # Errors
    ///
    /// Returns an error when the builder class cannot be constructed.
    pub fn new(backend: SharedBackend) -> Result<Self, BridgeError> {
        let handle = {
            let mut bridge = backend::lock(&backend)?;
            bridge.new_object(LOADING_BUILDER_CLASS, &[])?
        };
        Ok(Self {
            backend,
            handle,
            loaded: false,
            transpile: false,
        })
    }

    /// Keep SAX locator information in the parsed model.
    ///
    /// # Errors
    ///
    /// Returns an error when the bridge call fails.
    pub fn set_locatable(self, locatable: bool) -> Result<Self, BridgeError> {
        self.configure("setLocatable", &[JavaValue::Bool(locatable)])
    }

    /// Toggle schema checking; lax mode is `set_check_schema(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error when the bridge call fails.
    pub fn set_check_schema(self, check: bool) -> Result<Self, BridgeError> {
        self.configure("setCheckSchema", &[JavaValue::Bool(check)])
    }

    /// Install the default visitor battery, which optimizes the model
    /// representation after load.
    ///
    /// # Errors
    ///
    /// Returns an error when the bridge call fails.
    pub fn set_default_visitor_battery(self) -> Result<Self, BridgeError> {
        let battery = {
            let mut bridge = backend::lock(&self.backend)?;
            bridge.new_object(VISITOR_BATTERY_CLASS, &[])?
        };
        self.configure("setVisitors", &[JavaValue::Object(battery)])
    }

    /// Use the reporting value factory, which annotates results with
    /// per-value audit trails.
    ///
    /// # Errors
    ///
    /// Returns an error when the bridge call fails.
    pub fn set_reporting_value_factory_factory(self) -> Result<Self, BridgeError> {
        let factory = {
            let mut bridge = backend::lock(&self.backend)?;
            bridge
                .static_invoke(REPORTING_FACTORY_CLASS, "newInstance", &[])?
                .into_object("newInstance")?
        };
        self.configure("setValueFactoryFactory", &[JavaValue::Object(factory)])
    }

    /// Transpile the loaded model to generated bytecode during [`Self::build`].
    #[must_use]
    pub fn transpile(mut self) -> Self {
        self.transpile = true;
        self
    }

    /// Load the model from a PMML file.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Builder`] when a source was already loaded; bridge
    /// errors otherwise.
    pub fn load_file(self, path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        self.check_not_loaded()?;
        let rendered = path.as_ref().to_string_lossy().into_owned();
        let file = {
            let mut bridge = backend::lock(&self.backend)?;
            bridge.new_object(FILE_CLASS, &[JavaValue::String(rendered)])?
        };
        self.load_source(JavaValue::Object(file))
    }

    /// Load the model from inline PMML markup.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Builder`] when a source was already loaded; bridge
    /// errors otherwise.
    pub fn load_string(self, markup: &str) -> Result<Self, BridgeError> {
        self.load_bytes(markup.as_bytes())
    }

    /// Load the model from raw PMML bytes.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Builder`] when a source was already loaded; bridge
    /// errors otherwise.
    pub fn load_bytes(self, bytes: &[u8]) -> Result<Self, BridgeError> {
        self.check_not_loaded()?;
        let stream = {
            let mut bridge = backend::lock(&self.backend)?;
            bridge.new_object(BYTE_STREAM_CLASS, &[JavaValue::Bytes(bytes.to_vec())])?
        };
        self.load_source(JavaValue::Object(stream))
    }

    /// Build the evaluator, applying the transpiler transform first when
    /// requested.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Builder`] when no source was loaded; a JVM-side build
    /// failure is reported as [`BridgeError::Verification`].
    pub fn build(self) -> Result<Evaluator, BridgeError> {
        if !self.loaded {
            return Err(BridgeError::Builder(
                "no model source was loaded".to_string(),
            ));
        }
        let mut bridge = backend::lock(&self.backend)?;
        if self.transpile {
            let transpiler = bridge.new_object(IN_MEMORY_TRANSPILER_CLASS, &[JavaValue::Null])?;
            let transformer = bridge.new_object(
                TRANSPILER_TRANSFORMER_CLASS,
                &[JavaValue::Object(transpiler)],
            )?;
            bridge.invoke(self.handle, "transform", &[JavaValue::Object(transformer)])?;
        }
        let evaluator = match bridge.invoke(self.handle, "build", &[]) {
            Ok(value) => value.into_object("build")?,
            Err(BridgeError::Java(java)) => return Err(BridgeError::Verification(java)),
            Err(other) => return Err(other),
        };
        drop(bridge);
        Ok(Evaluator::new(self.backend, evaluator))
    }

    fn configure(self, method: &str, args: &[JavaValue]) -> Result<Self, BridgeError> {
        {
            let mut bridge = backend::lock(&self.backend)?;
            bridge.invoke(self.handle, method, args)?;
        }
        Ok(self)
    }

    fn load_source(mut self, source: JavaValue) -> Result<Self, BridgeError> {
        {
            let mut bridge = backend::lock(&self.backend)?;
            bridge.invoke(self.handle, "load", &[source])?;
        }
        self.loaded = true;
        Ok(self)
    }

    fn check_not_loaded(&self) -> Result<(), BridgeError> {
        if self.loaded {
            return Err(BridgeError::Builder(
                "a model source was already loaded".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a model comes from; see [`make_evaluator`].
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    /// A PMML file on disk.
    File(&'a Path),
    /// Inline PMML markup.
    Markup(&'a str),
    /// Raw PMML bytes.
    Bytes(&'a [u8]),
}

impl<'a> From<&'a Path> for ModelSource<'a> {
    fn from(path: &'a Path) -> Self {
        Self::File(path)
    }
}

impl<'a> From<&'a PathBuf> for ModelSource<'a> {
    fn from(path: &'a PathBuf) -> Self {
        Self::File(path.as_path())
    }
}

impl<'a> From<&'a [u8]> for ModelSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for ModelSource<'a> {
    /// Short strings naming an existing file are paths; everything else is
    /// inline markup.
    fn from(text: &'a str) -> Self {
        if text.len() <= MAX_PATH_PROBE_LEN && Path::new(text).is_file() {
            Self::File(Path::new(text))
        } else {
            Self::Markup(text)
        }
    }
}

/// Options for [`make_evaluator`].
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    /// Transport to construct the evaluator on.
    pub backend: BackendKind,
    /// Skip schema checking while loading.
    pub lax: bool,
    /// Keep SAX locator information.
    pub locatable: bool,
    /// Annotate results with per-value audit trails.
    pub reporting: bool,
    /// Transpile the model to generated bytecode.
    pub transpile: bool,
    /// Extra classpath entries appended after the bundled jars.
    pub user_classpath: Vec<PathBuf>,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Gateway,
            lax: false,
            locatable: false,
            reporting: false,
            transpile: false,
            user_classpath: Vec::new(),
        }
    }
}

/// One-call construction: ensure the runtime, build, and verify.
///
/// # Errors
///
/// Surfaces runtime startup, classpath, build, and verification failures.
pub fn make_evaluator<'a>(
    source: impl Into<ModelSource<'a>>,
    options: &EvaluatorOptions,
) -> Result<Evaluator, BridgeError> {
    let source = source.into();
    backend::ensure_runtime(options.backend, &options.user_classpath)?;
    let bridge = backend::create_backend(options.backend)?;

    let mut builder = EvaluatorBuilder::new(bridge)?
        .set_locatable(options.locatable)?
        .set_check_schema(!options.lax)?;
    if options.reporting {
        builder = builder.set_reporting_value_factory_factory()?;
    }
    builder = match source {
        ModelSource::File(path) => builder.load_file(path)?,
        ModelSource::Markup(markup) => builder.load_string(markup)?,
        ModelSource::Bytes(bytes) => builder.load_bytes(bytes)?,
    };
    if options.transpile {
        builder = builder.transpile();
    }

    let evaluator = builder.build()?;
    evaluator.verify()?;
    Ok(evaluator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_detection_prefers_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pmml");
        std::fs::write(&path, "<PMML/>").unwrap();

        let rendered = path.to_string_lossy().into_owned();
        assert!(matches!(
            ModelSource::from(rendered.as_str()),
            ModelSource::File(_)
        ));
    }

    #[test]
    fn test_source_detection_markup_and_bytes() {
        assert!(matches!(
            ModelSource::from("<PMML xmlns=\"http://www.dmg.org/PMML-4_4\"/>"),
            ModelSource::Markup(_)
        ));
        assert!(matches!(
            ModelSource::from(&b"<PMML/>"[..]),
            ModelSource::Bytes(_)
        ));

        let long = "x".repeat(MAX_PATH_PROBE_LEN + 1);
        assert!(matches!(
            ModelSource::from(long.as_str()),
            ModelSource::Markup(_)
        ));
    }

    #[test]
    fn test_evaluator_options_defaults() {
        let options = EvaluatorOptions::default();
        assert_eq!(options.backend, BackendKind::Gateway);
        assert!(!options.lax);
        assert!(!options.locatable);
        assert!(!options.reporting);
        assert!(!options.transpile);
        assert!(options.user_classpath.is_empty());
    }
}
