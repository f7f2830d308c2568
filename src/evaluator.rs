//! Evaluator facade: the host-side handle to a built model.
//!
//! Single records travel as pickled dicts, batches as pickled column-major
//! tables; both paths hand the bytes to the bundled
//! `PythonEvaluatorUtil` entry points so row fan-out and result assembly
//! stay engine-side. The facade never names a concrete transport.

use std::fmt;

use crate::backend::{self, Backend, JavaValue, ObjectHandle, SharedBackend, STRING_CLASS,
    SUPPORT_CLASS};
use crate::codec::{self, Record};
use crate::error::BridgeError;
use crate::field::{self, ModelField};
use crate::table::Table;
use crate::value::Value;

/// Options for the bulk path.
#[derive(Debug, Clone)]
pub struct EvaluateAllOptions {
    /// Canonicalize NaN cells to missing before encoding.
    pub nan_as_missing: bool,
    /// Name of the appended per-row error column. `None` keeps the table
    /// clean and reports errors separately in [`BulkResult::errors`].
    pub error_column: Option<String>,
    /// Engine-side fan-out hint: `-1` all units, `1` sequential, `n` bounded.
    pub parallelism: i32,
}

impl Default for EvaluateAllOptions {
    fn default() -> Self {
        Self {
            nan_as_missing: true,
            error_column: Some("errors".to_string()),
            parallelism: -1,
        }
    }
}

/// Bulk evaluation outcome.
#[derive(Debug, Clone)]
pub struct BulkResult {
    /// Result table in model field order, error column included when
    /// requested and at least one row failed.
    pub table: Table,
    /// Per-row failure messages, populated only when no error column was
    /// requested.
    pub errors: Option<Vec<Option<String>>>,
}

/// A verified or verifiable model evaluator.
///
/// Constructed through [`crate::EvaluatorBuilder`] or
/// [`crate::make_evaluator`]; the handle stays valid for the lifetime of the
/// backend it came from.
pub struct Evaluator {
    backend: SharedBackend,
    handle: ObjectHandle,
    input_fields: Option<Vec<ModelField>>,
    target_fields: Option<Vec<ModelField>>,
    output_fields: Option<Vec<ModelField>>,
    drop_columns: Vec<String>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("handle", &self.handle)
            .field("input_fields", &self.input_fields)
            .field("target_fields", &self.target_fields)
            .field("output_fields", &self.output_fields)
            .field("drop_columns", &self.drop_columns)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    pub(crate) fn new(backend: SharedBackend, handle: ObjectHandle) -> Self {
        Self {
            backend,
            handle,
            input_fields: None,
            target_fields: None,
            output_fields: None,
            drop_columns: Vec::new(),
        }
    }

    /// The backend this evaluator rides on, for error hierarchy checks via
    /// [`crate::JavaError::is_instance`].
    #[must_use]
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Run the model's embedded verification data, if any.
    ///
    /// Fluent: returns `&self` so a fresh evaluator can be verified and used
    /// in one expression.
    ///
    /// # Errors
    ///
    /// A JVM-side verification failure is reported as
    /// [`BridgeError::Verification`].
    pub fn verify(&self) -> Result<&Self, BridgeError> {
        let mut bridge = backend::lock(&self.backend)?;
        match bridge.invoke(self.handle, "verify", &[]) {
            Ok(_) => Ok(self),
            Err(BridgeError::Java(java)) => Err(BridgeError::Verification(java)),
            Err(other) => Err(other),
        }
    }

    /// Active input fields, materialized from the model once and memoized.
    ///
    /// # Errors
    ///
    /// Returns an error when the first materialization fails; later calls
    /// are local.
    pub fn input_fields(&mut self) -> Result<&[ModelField], BridgeError> {
        if self.input_fields.is_none() {
            self.input_fields =
                Some(field::materialize(&self.backend, self.handle, "getInputFields")?);
        }
        Ok(self.input_fields.as_deref().unwrap_or_default())
    }

    /// Target fields, memoized like [`Self::input_fields`].
    ///
    /// # Errors
    ///
    /// Returns an error when the first materialization fails.
    pub fn target_fields(&mut self) -> Result<&[ModelField], BridgeError> {
        if self.target_fields.is_none() {
            self.target_fields =
                Some(field::materialize(&self.backend, self.handle, "getTargetFields")?);
        }
        Ok(self.target_fields.as_deref().unwrap_or_default())
    }

    /// Output fields, memoized like [`Self::input_fields`].
    ///
    /// # Errors
    ///
    /// Returns an error when the first materialization fails.
    pub fn output_fields(&mut self) -> Result<&[ModelField], BridgeError> {
        if self.output_fields.is_none() {
            self.output_fields =
                Some(field::materialize(&self.backend, self.handle, "getOutputFields")?);
        }
        Ok(self.output_fields.as_deref().unwrap_or_default())
    }

    /// Set or clear the result fields to drop engine-side. `None` or an
    /// empty slice clears. Affects both the single-record and bulk paths.
    pub fn suppress_result_fields(&mut self, fields: Option<&[ModelField]>) {
        self.drop_columns = fields
            .map(|fields| fields.iter().map(|f| f.name().to_string()).collect())
            .unwrap_or_default();
    }

    /// Evaluate one record with the default NaN-as-missing rule.
    ///
    /// # Errors
    ///
    /// A per-record engine failure surfaces as [`BridgeError::Evaluation`];
    /// the evaluator stays usable.
    pub fn evaluate(&self, record: &Record) -> Result<Record, BridgeError> {
        self.evaluate_with(record, true)
    }

    /// Evaluate one record, canonicalizing NaN cells to missing when
    /// `nan_as_missing` is set.
    ///
    /// # Errors
    ///
    /// A per-record engine failure surfaces as [`BridgeError::Evaluation`].
    pub fn evaluate_with(
        &self,
        record: &Record,
        nan_as_missing: bool,
    ) -> Result<Record, BridgeError> {
        let canonical: Record = record
            .iter()
            .map(|(name, value)| (name.clone(), value.clone().canonicalize(nan_as_missing)))
            .collect();
        let request = codec::encode_record(&canonical)?;

        let mut bridge = backend::lock(&self.backend)?;
        let drops = self.drop_argument(&mut *bridge)?;
        let result = bridge.static_invoke(
            SUPPORT_CLASS,
            "evaluate",
            &[
                JavaValue::Object(self.handle),
                JavaValue::Bytes(request),
                drops,
            ],
        );
        drop(bridge);

        let response = match result {
            Ok(value) => value.into_bytes("evaluate")?,
            Err(BridgeError::Java(java)) => return Err(BridgeError::Evaluation(java)),
            Err(other) => return Err(other),
        };
        Ok(codec::decode_record(&response)?)
    }

    /// Evaluate a whole table with default options; failed rows report in
    /// the `errors` column.
    ///
    /// # Errors
    ///
    /// A whole-batch engine failure surfaces as [`BridgeError::Evaluation`];
    /// single-row failures land in the error column instead.
    pub fn evaluate_all(&self, table: &Table) -> Result<Table, BridgeError> {
        Ok(self
            .evaluate_all_with(table, &EvaluateAllOptions::default())?
            .table)
    }

    /// Evaluate a whole table in one bridge call.
    ///
    /// Row fan-out happens inside the JVM per `options.parallelism`. The
    /// input's row index is copied onto the result when the row counts
    /// match; otherwise the result keeps its default index and a warning
    /// names both counts.
    ///
    /// # Errors
    ///
    /// A whole-batch engine failure surfaces as [`BridgeError::Evaluation`].
    pub fn evaluate_all_with(
        &self,
        table: &Table,
        options: &EvaluateAllOptions,
    ) -> Result<BulkResult, BridgeError> {
        let canonical = table.canonicalized(options.nan_as_missing);
        let request = codec::encode_table(canonical.columns(), canonical.data())?;

        let mut bridge = backend::lock(&self.backend)?;
        let drops = self.drop_argument(&mut *bridge)?;
        let result = bridge.static_invoke(
            SUPPORT_CLASS,
            "evaluateAll",
            &[
                JavaValue::Object(self.handle),
                JavaValue::Bytes(request),
                drops,
                JavaValue::Int(options.parallelism),
            ],
        );
        drop(bridge);

        let response = match result {
            Ok(value) => value.into_bytes("evaluateAll")?,
            Err(BridgeError::Java(java)) => return Err(BridgeError::Evaluation(java)),
            Err(other) => return Err(other),
        };
        let payload = codec::decode_table(&response)?;

        let failed = payload
            .errors
            .as_ref()
            .map_or(0, |errors| errors.iter().filter(|e| e.is_some()).count());
        tracing::debug!(
            rows = table.n_rows(),
            columns = payload.columns.len(),
            failed,
            "bulk evaluation returned"
        );

        let mut out = Table::from_columns(payload.columns, payload.data)?;
        if out.n_rows() == table.n_rows() {
            out.set_index(table.index().to_vec())?;
        } else {
            tracing::warn!(
                input_rows = table.n_rows(),
                output_rows = out.n_rows(),
                "row count changed during evaluation; keeping the default index"
            );
        }

        match options.error_column.as_deref() {
            Some(column) => {
                if let Some(errors) = payload.errors {
                    if errors.iter().any(Option::is_some) {
                        let cells: Vec<Value> = errors
                            .into_iter()
                            .map(|e| e.map_or(Value::Null, Value::String))
                            .collect();
                        out.push_column(column, cells)?;
                    }
                }
                Ok(BulkResult {
                    table: out,
                    errors: None,
                })
            }
            None => Ok(BulkResult {
                table: out,
                errors: payload.errors,
            }),
        }
    }

    /// Alias for [`Self::evaluate_all`] with default options.
    ///
    /// # Errors
    ///
    /// Same as [`Self::evaluate_all`].
    pub fn predict(&self, table: &Table) -> Result<Table, BridgeError> {
        self.evaluate_all(table)
    }

    /// The `dropColumns` argument: null when nothing is suppressed, a
    /// `String[]` otherwise.
    fn drop_argument(&self, bridge: &mut dyn Backend) -> Result<JavaValue, BridgeError> {
        if self.drop_columns.is_empty() {
            return Ok(JavaValue::Null);
        }
        let values: Vec<JavaValue> = self
            .drop_columns
            .iter()
            .map(|name| JavaValue::String(name.clone()))
            .collect();
        Ok(JavaValue::Object(bridge.new_array(STRING_CLASS, &values)?))
    }
}
