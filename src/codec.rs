//! Pickle payload codec for the bulk byte-stream path.
//!
//! Records and tables cross the bridge as single pickled byte arrays instead
//! of per-cell calls, which keeps the expensive boundary crossing O(1) per
//! batch. The layout matches what the evaluator support classes read and
//! write:
//!
//! - a record is a dict of field name to scalar;
//! - a table is a dict `{"columns": [names], "data": [[column values]]}`,
//!   column-major, with every column the same length;
//! - a bulk result adds `"errors"`, either `None` or a list with one entry
//!   per input row (`None` for rows that evaluated cleanly).

use std::collections::BTreeMap;

use serde_pickle::{DeOptions, HashableValue, SerOptions, Value as Pickle};
use thiserror::Error;

use crate::value::Value;

/// A single evaluation record: field name to scalar cell.
///
/// Ordered by field name. Column order for bulk payloads is carried by the
/// explicit `columns` list, never by dict iteration order.
pub type Record = BTreeMap<String, Value>;

/// Decoded form of a bulk payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePayload {
    /// Column names, in evaluator output order.
    pub columns: Vec<String>,
    /// Column-major cell data, one inner vector per column.
    pub data: Vec<Vec<Value>>,
    /// Per-row failure messages, present only on bulk results that carried an
    /// errors slot. `None` entries mark rows that evaluated cleanly.
    pub errors: Option<Vec<Option<String>>>,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("pickle error: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("unsupported value in {context}: {detail}")]
    Unsupported { context: String, detail: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Encode one record as a pickled dict.
///
/// # Errors
///
/// Returns an error if pickle serialization fails.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut dict = BTreeMap::new();
    for (name, value) in record {
        dict.insert(HashableValue::String(name.clone()), to_pickle(value));
    }
    Ok(serde_pickle::value_to_vec(
        &Pickle::Dict(dict),
        SerOptions::new(),
    )?)
}

/// Decode one record from a pickled dict.
///
/// # Errors
///
/// Returns an error if the bytes do not unpickle to a dict of string keys and
/// scalar values.
pub fn decode_record(bytes: &[u8]) -> Result<Record, CodecError> {
    let value = serde_pickle::value_from_slice(bytes, DeOptions::new())?;
    let Pickle::Dict(dict) = value else {
        return Err(CodecError::Malformed(format!(
            "expected a record dict, got {}",
            pickle_kind(&value)
        )));
    };
    let mut record = Record::new();
    for (key, cell) in dict {
        let name = dict_key(key)?;
        let cell = from_pickle(cell, &name)?;
        record.insert(name, cell);
    }
    Ok(record)
}

/// Encode a column-major table as a pickled `{"columns", "data"}` dict.
///
/// # Errors
///
/// Returns an error if the column and data lengths disagree or serialization
/// fails.
pub fn encode_table(columns: &[String], data: &[Vec<Value>]) -> Result<Vec<u8>, CodecError> {
    if columns.len() != data.len() {
        return Err(CodecError::Malformed(format!(
            "{} column names for {} data columns",
            columns.len(),
            data.len()
        )));
    }
    let names = columns
        .iter()
        .map(|name| Pickle::String(name.clone()))
        .collect();
    let cells = data
        .iter()
        .map(|column| Pickle::List(column.iter().map(to_pickle).collect()))
        .collect();
    let mut dict = BTreeMap::new();
    dict.insert(
        HashableValue::String("columns".to_string()),
        Pickle::List(names),
    );
    dict.insert(
        HashableValue::String("data".to_string()),
        Pickle::List(cells),
    );
    Ok(serde_pickle::value_to_vec(
        &Pickle::Dict(dict),
        SerOptions::new(),
    )?)
}

/// Decode a bulk payload, including the optional `errors` slot.
///
/// # Errors
///
/// Returns an error on ragged data, wrong shapes, or non-scalar cells.
pub fn decode_table(bytes: &[u8]) -> Result<TablePayload, CodecError> {
    let value = serde_pickle::value_from_slice(bytes, DeOptions::new())?;
    let Pickle::Dict(mut dict) = value else {
        return Err(CodecError::Malformed(format!(
            "expected a table dict, got {}",
            pickle_kind(&value)
        )));
    };

    let columns = match dict.remove(&HashableValue::String("columns".to_string())) {
        Some(Pickle::List(items)) => items
            .into_iter()
            .map(|item| match item {
                Pickle::String(name) => Ok(name),
                other => Err(CodecError::Malformed(format!(
                    "column name is {}",
                    pickle_kind(&other)
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "\"columns\" is {}",
                pickle_kind(&other)
            )))
        }
        None => return Err(CodecError::Malformed("missing \"columns\"".to_string())),
    };

    let data = match dict.remove(&HashableValue::String("data".to_string())) {
        Some(Pickle::List(items)) => {
            let mut data = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let Pickle::List(cells) = item else {
                    return Err(CodecError::Malformed(format!(
                        "data column {i} is {}",
                        pickle_kind(&item)
                    )));
                };
                let context = columns
                    .get(i)
                    .map_or_else(|| format!("column {i}"), Clone::clone);
                let column = cells
                    .into_iter()
                    .map(|cell| from_pickle(cell, &context))
                    .collect::<Result<Vec<_>, _>>()?;
                data.push(column);
            }
            data
        }
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "\"data\" is {}",
                pickle_kind(&other)
            )))
        }
        None => return Err(CodecError::Malformed("missing \"data\"".to_string())),
    };

    if columns.len() != data.len() {
        return Err(CodecError::Malformed(format!(
            "{} column names for {} data columns",
            columns.len(),
            data.len()
        )));
    }
    if let Some(first) = data.first() {
        for (i, column) in data.iter().enumerate() {
            if column.len() != first.len() {
                return Err(CodecError::Malformed(format!(
                    "column \"{}\" has {} rows, expected {}",
                    columns[i],
                    column.len(),
                    first.len()
                )));
            }
        }
    }

    let errors = match dict.remove(&HashableValue::String("errors".to_string())) {
        None | Some(Pickle::None) => None,
        Some(Pickle::List(items)) => {
            let entries = items
                .into_iter()
                .map(|item| match item {
                    Pickle::None => Ok(None),
                    Pickle::String(message) => Ok(Some(message)),
                    other => Err(CodecError::Malformed(format!(
                        "error entry is {}",
                        pickle_kind(&other)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(entries)
        }
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "\"errors\" is {}",
                pickle_kind(&other)
            )))
        }
    };

    Ok(TablePayload {
        columns,
        data,
        errors,
    })
}

fn to_pickle(value: &Value) -> Pickle {
    match value {
        Value::Null => Pickle::None,
        Value::Bool(b) => Pickle::Bool(*b),
        Value::Int(i) => Pickle::I64(*i),
        Value::Float(f) => Pickle::F64(*f),
        Value::String(s) => Pickle::String(s.clone()),
    }
}

fn from_pickle(value: Pickle, context: &str) -> Result<Value, CodecError> {
    match value {
        Pickle::None => Ok(Value::Null),
        Pickle::Bool(b) => Ok(Value::Bool(b)),
        Pickle::I64(i) => Ok(Value::Int(i)),
        Pickle::Int(big) => i64::try_from(big).map(Value::Int).map_err(|_| {
            CodecError::Unsupported {
                context: context.to_string(),
                detail: "integer exceeds 64 bits".to_string(),
            }
        }),
        Pickle::F64(f) => Ok(Value::Float(f)),
        Pickle::String(s) => Ok(Value::String(s)),
        other => Err(CodecError::Unsupported {
            context: context.to_string(),
            detail: pickle_kind(&other).to_string(),
        }),
    }
}

fn dict_key(key: HashableValue) -> Result<String, CodecError> {
    match key {
        HashableValue::String(name) => Ok(name),
        other => Err(CodecError::Malformed(format!(
            "dict key is {other:?}, expected a string"
        ))),
    }
}

fn pickle_kind(value: &Pickle) -> &'static str {
    match value {
        Pickle::None => "none",
        Pickle::Bool(_) => "a boolean",
        Pickle::I64(_) | Pickle::Int(_) => "an integer",
        Pickle::F64(_) => "a float",
        Pickle::Bytes(_) => "bytes",
        Pickle::String(_) => "a string",
        Pickle::List(_) => "a list",
        Pickle::Tuple(_) => "a tuple",
        Pickle::Set(_) | Pickle::FrozenSet(_) => "a set",
        Pickle::Dict(_) => "a dict",
    }
}
