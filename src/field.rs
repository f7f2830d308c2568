//! Model schema descriptors surfaced by the evaluator facade.

use std::fmt;

use crate::backend::{Backend, JavaValue, ObjectHandle, SharedBackend};
use crate::error::BridgeError;

/// One field of a model's input, target, or output schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelField {
    name: String,
    data_type: String,
    op_type: String,
}

impl ModelField {
    pub(crate) fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        op_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            op_type: op_type.into(),
        }
    }

    /// Field name as the model declares it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PMML data type, `double`, `string`, and friends. Empty when the model
    /// leaves it undeclared, as some output fields do.
    #[must_use]
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// PMML operational type: `categorical`, `ordinal`, or `continuous`.
    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }
}

impl fmt::Display for ModelField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Materialize the field list behind an evaluator getter such as
/// `getInputFields`.
pub(crate) fn materialize(
    backend: &SharedBackend,
    evaluator: ObjectHandle,
    getter: &str,
) -> Result<Vec<ModelField>, BridgeError> {
    let mut bridge = crate::backend::lock(backend)?;
    let list = bridge.invoke(evaluator, getter, &[])?.into_object(getter)?;
    let len = int_of(bridge.invoke(list, "size", &[])?, "size")?;

    let mut fields = Vec::with_capacity(len.unsigned_abs() as usize);
    for i in 0..len {
        let item = bridge
            .invoke(list, "get", &[JavaValue::Int(i)])?
            .into_object("list element")?;
        let name = string_of(&mut *bridge, item, "getName")?;
        let data_type = enum_of(&mut *bridge, item, "getDataType")?;
        let op_type = enum_of(&mut *bridge, item, "getOpType")?;
        fields.push(ModelField::new(name, data_type, op_type));
    }
    Ok(fields)
}

fn int_of(value: JavaValue, context: &str) -> Result<i32, BridgeError> {
    match value {
        JavaValue::Int(i) => Ok(i),
        JavaValue::Long(l) => i32::try_from(l).map_err(|_| {
            BridgeError::Transport(format!("{context} returned an out-of-range count"))
        }),
        other => Err(BridgeError::Transport(format!(
            "{context} returned {} instead of an integer",
            other.kind()
        ))),
    }
}

/// Read a string-valued getter. A `FieldName`-style wrapper object is
/// unwrapped through its `getValue`.
fn string_of(
    bridge: &mut dyn Backend,
    target: ObjectHandle,
    getter: &str,
) -> Result<String, BridgeError> {
    match bridge.invoke(target, getter, &[])? {
        JavaValue::String(s) => Ok(s),
        JavaValue::Object(wrapper) => match bridge.invoke(wrapper, "getValue", &[])? {
            JavaValue::String(s) => Ok(s),
            other => Err(BridgeError::Transport(format!(
                "{getter} wrapper returned {} instead of a string",
                other.kind()
            ))),
        },
        other => Err(BridgeError::Transport(format!(
            "{getter} returned {} instead of a string",
            other.kind()
        ))),
    }
}

/// Read an enum-valued getter as its PMML value string. A missing value maps
/// to the empty string.
fn enum_of(
    bridge: &mut dyn Backend,
    target: ObjectHandle,
    getter: &str,
) -> Result<String, BridgeError> {
    match bridge.invoke(target, getter, &[])? {
        JavaValue::Null => Ok(String::new()),
        JavaValue::String(s) => Ok(s),
        JavaValue::Object(variant) => match bridge.invoke(variant, "value", &[])? {
            JavaValue::String(s) => Ok(s),
            other => Err(BridgeError::Transport(format!(
                "{getter} variant returned {} instead of a string",
                other.kind()
            ))),
        },
        other => Err(BridgeError::Transport(format!(
            "{getter} returned {} instead of an enum value",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_accessors() {
        let field = ModelField::new("Species", "string", "categorical");
        assert_eq!(field.name(), "Species");
        assert_eq!(field.data_type(), "string");
        assert_eq!(field.op_type(), "categorical");
        assert_eq!(field.to_string(), "Species");
    }

    #[test]
    fn test_int_of_accepts_both_widths() {
        assert_eq!(int_of(JavaValue::Int(4), "size").unwrap(), 4);
        assert_eq!(int_of(JavaValue::Long(4), "size").unwrap(), 4);
        assert!(int_of(JavaValue::Long(i64::MAX), "size").is_err());
        assert!(int_of(JavaValue::String("4".to_string()), "size").is_err());
    }
}
