//! Wire protocol spoken between [`crate::gateway::GatewayBackend`] and the
//! gateway JVM.
//!
//! Version 1. Every frame is a `u32` big-endian payload length followed by a
//! pickle-protocol payload. Requests are dicts with an `"op"` key:
//!
//! - `{"op": "class", "name": str}` resolves and pins a class
//! - `{"op": "new", "class": ref, "args": [wire...]}`
//! - `{"op": "static", "class": ref, "method": str, "args": [wire...]}`
//! - `{"op": "invoke", "target": ref, "method": str, "args": [wire...]}`
//! - `{"op": "array", "class": ref, "values": [wire...]}`
//! - `{"op": "shutdown"}`
//!
//! Scalars travel inline as pickle values; objects stay in the JVM and cross
//! as `{"$ref": id}` dicts. Responses are `{"status": "ok", "value": wire}` or
//! `{"status": "error", "kind": "java" | "protocol", "class": str,
//! "message": str, "stacktrace": [str...]}`.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde_pickle::{DeOptions, HashableValue, SerOptions, Value as Pickle};

use crate::backend::{JavaValue, ObjectHandle};
use crate::error::{BridgeError, JavaError};

/// Protocol version shipped in no frame, bumped only on layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

const REF_KEY: &str = "$ref";

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns an error when the underlying writer fails.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds 4 GiB")
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one length-prefixed frame.
///
/// # Errors
///
/// Returns an error on a short read or when the underlying reader fails.
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Encode a request dict as a pickled frame payload.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] when pickling fails.
pub fn encode_request(request: &Pickle) -> Result<Vec<u8>, BridgeError> {
    serde_pickle::value_to_vec(request, SerOptions::new())
        .map_err(|e| BridgeError::Transport(format!("cannot encode request frame: {e}")))
}

/// A host value in its wire form.
#[must_use]
pub fn to_wire(value: &JavaValue) -> Pickle {
    match value {
        JavaValue::Null => Pickle::None,
        JavaValue::Bool(b) => Pickle::Bool(*b),
        JavaValue::Int(i) => Pickle::I64(i64::from(*i)),
        JavaValue::Long(l) => Pickle::I64(*l),
        JavaValue::Float(f) => Pickle::F64(f64::from(*f)),
        JavaValue::Double(d) => Pickle::F64(*d),
        JavaValue::String(s) => Pickle::String(s.clone()),
        JavaValue::Bytes(b) => Pickle::Bytes(b.clone()),
        JavaValue::Object(handle) => {
            let mut dict = BTreeMap::new();
            dict.insert(
                HashableValue::String(REF_KEY.to_string()),
                Pickle::I64(handle.0 as i64),
            );
            Pickle::Dict(dict)
        }
    }
}

/// Decode one wire value.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] for shapes the protocol does not carry.
pub fn from_wire(value: Pickle) -> Result<JavaValue, BridgeError> {
    match value {
        Pickle::None => Ok(JavaValue::Null),
        Pickle::Bool(b) => Ok(JavaValue::Bool(b)),
        Pickle::I64(i) => Ok(JavaValue::Long(i)),
        Pickle::Int(big) => i64::try_from(big).map(JavaValue::Long).map_err(|_| {
            BridgeError::Transport("wire integer exceeds 64 bits".to_string())
        }),
        Pickle::F64(f) => Ok(JavaValue::Double(f)),
        Pickle::String(s) => Ok(JavaValue::String(s)),
        Pickle::Bytes(b) => Ok(JavaValue::Bytes(b)),
        Pickle::Dict(mut dict) => {
            match dict.remove(&HashableValue::String(REF_KEY.to_string())) {
                Some(Pickle::I64(id)) if id >= 0 => {
                    Ok(JavaValue::Object(ObjectHandle(id as u64)))
                }
                _ => Err(BridgeError::Transport(
                    "wire dict is not an object reference".to_string(),
                )),
            }
        }
        other => Err(BridgeError::Transport(format!(
            "unsupported wire value: {other:?}"
        ))),
    }
}

fn request(op: &str, fields: Vec<(&str, Pickle)>) -> Pickle {
    let mut dict = BTreeMap::new();
    dict.insert(
        HashableValue::String("op".to_string()),
        Pickle::String(op.to_string()),
    );
    for (key, value) in fields {
        dict.insert(HashableValue::String(key.to_string()), value);
    }
    Pickle::Dict(dict)
}

fn wire_args(args: &[JavaValue]) -> Pickle {
    Pickle::List(args.iter().map(to_wire).collect())
}

/// `{"op": "class"}` — resolve and pin a class by dotted name.
#[must_use]
pub fn class_request(class_name: &str) -> Pickle {
    request(
        "class",
        vec![("name", Pickle::String(class_name.to_string()))],
    )
}

/// `{"op": "new"}` — construct an instance of a pinned class.
#[must_use]
pub fn new_request(class: ObjectHandle, args: &[JavaValue]) -> Pickle {
    request(
        "new",
        vec![
            ("class", to_wire(&JavaValue::Object(class))),
            ("args", wire_args(args)),
        ],
    )
}

/// `{"op": "static"}` — invoke a static method on a pinned class.
#[must_use]
pub fn static_request(class: ObjectHandle, method: &str, args: &[JavaValue]) -> Pickle {
    request(
        "static",
        vec![
            ("class", to_wire(&JavaValue::Object(class))),
            ("method", Pickle::String(method.to_string())),
            ("args", wire_args(args)),
        ],
    )
}

/// `{"op": "invoke"}` — invoke an instance method on a held object.
#[must_use]
pub fn invoke_request(target: ObjectHandle, method: &str, args: &[JavaValue]) -> Pickle {
    request(
        "invoke",
        vec![
            ("target", to_wire(&JavaValue::Object(target))),
            ("method", Pickle::String(method.to_string())),
            ("args", wire_args(args)),
        ],
    )
}

/// `{"op": "array"}` — build a typed array from the given elements.
#[must_use]
pub fn array_request(class: ObjectHandle, values: &[JavaValue]) -> Pickle {
    request(
        "array",
        vec![
            ("class", to_wire(&JavaValue::Object(class))),
            ("values", wire_args(values)),
        ],
    )
}

/// `{"op": "shutdown"}` — ask the server to acknowledge and exit.
#[must_use]
pub fn shutdown_request() -> Pickle {
    request("shutdown", Vec::new())
}

/// Decode a response frame into a value or a translated failure.
///
/// `"java"`-kind errors become [`BridgeError::Java`]; everything else the
/// server reports is a protocol breach and surfaces as
/// [`BridgeError::Transport`].
///
/// # Errors
///
/// Returns an error for failure responses and for malformed frames.
pub fn parse_response(payload: &[u8]) -> Result<JavaValue, BridgeError> {
    let value = serde_pickle::value_from_slice(payload, DeOptions::new())
        .map_err(|e| BridgeError::Transport(format!("cannot decode response frame: {e}")))?;
    let Pickle::Dict(mut dict) = value else {
        return Err(BridgeError::Transport(
            "response frame is not a dict".to_string(),
        ));
    };

    let status = match dict.remove(&HashableValue::String("status".to_string())) {
        Some(Pickle::String(s)) => s,
        _ => {
            return Err(BridgeError::Transport(
                "response frame has no status".to_string(),
            ))
        }
    };

    match status.as_str() {
        "ok" => {
            let value = dict
                .remove(&HashableValue::String("value".to_string()))
                .unwrap_or(Pickle::None);
            from_wire(value)
        }
        "error" => Err(parse_error(&mut dict)),
        other => Err(BridgeError::Transport(format!(
            "unknown response status \"{other}\""
        ))),
    }
}

fn parse_error(dict: &mut BTreeMap<HashableValue, Pickle>) -> BridgeError {
    let field = |dict: &mut BTreeMap<HashableValue, Pickle>, key: &str| -> String {
        match dict.remove(&HashableValue::String(key.to_string())) {
            Some(Pickle::String(s)) => s,
            _ => String::new(),
        }
    };

    let kind = field(dict, "kind");
    let class = field(dict, "class");
    let message = field(dict, "message");
    let stack_trace = match dict.remove(&HashableValue::String("stacktrace".to_string())) {
        Some(Pickle::List(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Pickle::String(frame) => Some(frame),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if kind == "java" {
        BridgeError::Java(JavaError::new(class, message, stack_trace))
    } else {
        BridgeError::Transport(format!("gateway reported {kind} error: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello").unwrap();
        assert_eq!(&buffer[..4], &5u32.to_be_bytes());

        let mut cursor = buffer.as_slice();
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn test_read_frame_short_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(b"abc");
        let mut cursor = buffer.as_slice();
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_wire_scalars_round_trip() {
        for value in [
            JavaValue::Null,
            JavaValue::Bool(true),
            JavaValue::Long(42),
            JavaValue::Double(5.1),
            JavaValue::String("setosa".to_string()),
            JavaValue::Bytes(vec![1, 2, 3]),
            JavaValue::Object(ObjectHandle(7)),
        ] {
            assert_eq!(from_wire(to_wire(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_wire_narrow_numbers_widen() {
        assert_eq!(
            from_wire(to_wire(&JavaValue::Int(3))).unwrap(),
            JavaValue::Long(3)
        );
        assert_eq!(
            from_wire(to_wire(&JavaValue::Float(1.5))).unwrap(),
            JavaValue::Double(1.5)
        );
    }

    #[test]
    fn test_parse_ok_response() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String("status".to_string()),
            Pickle::String("ok".to_string()),
        );
        dict.insert(
            HashableValue::String("value".to_string()),
            Pickle::String("2".to_string()),
        );
        let payload =
            serde_pickle::value_to_vec(&Pickle::Dict(dict), SerOptions::new()).unwrap();
        assert_eq!(
            parse_response(&payload).unwrap(),
            JavaValue::String("2".to_string())
        );
    }

    #[test]
    fn test_parse_java_error_response() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String("status".to_string()),
            Pickle::String("error".to_string()),
        );
        dict.insert(
            HashableValue::String("kind".to_string()),
            Pickle::String("java".to_string()),
        );
        dict.insert(
            HashableValue::String("class".to_string()),
            Pickle::String("org.jpmml.evaluator.ValueCheckException".to_string()),
        );
        dict.insert(
            HashableValue::String("message".to_string()),
            Pickle::String("bad value".to_string()),
        );
        dict.insert(
            HashableValue::String("stacktrace".to_string()),
            Pickle::List(vec![Pickle::String("at Frame.one".to_string())]),
        );
        let payload =
            serde_pickle::value_to_vec(&Pickle::Dict(dict), SerOptions::new()).unwrap();

        let err = parse_response(&payload).unwrap_err();
        let BridgeError::Java(java) = err else {
            panic!("expected a translated Java error, got {err}");
        };
        assert_eq!(java.class_name, "org.jpmml.evaluator.ValueCheckException");
        assert_eq!(java.message, "bad value");
        assert_eq!(java.stack_trace, vec!["at Frame.one".to_string()]);
    }

    #[test]
    fn test_parse_protocol_error_response() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String("status".to_string()),
            Pickle::String("error".to_string()),
        );
        dict.insert(
            HashableValue::String("kind".to_string()),
            Pickle::String("protocol".to_string()),
        );
        dict.insert(
            HashableValue::String("message".to_string()),
            Pickle::String("unknown op".to_string()),
        );
        let payload =
            serde_pickle::value_to_vec(&Pickle::Dict(dict), SerOptions::new()).unwrap();

        let err = parse_response(&payload).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(err.to_string().contains("unknown op"));
    }

    #[test]
    fn test_request_shapes() {
        let Pickle::Dict(dict) = class_request("java.lang.String") else {
            panic!("class request is not a dict");
        };
        assert_eq!(
            dict.get(&HashableValue::String("op".to_string())),
            Some(&Pickle::String("class".to_string()))
        );
        assert_eq!(
            dict.get(&HashableValue::String("name".to_string())),
            Some(&Pickle::String("java.lang.String".to_string()))
        );

        let Pickle::Dict(dict) =
            invoke_request(ObjectHandle(4), "verify", &[JavaValue::Bool(false)])
        else {
            panic!("invoke request is not a dict");
        };
        assert_eq!(
            dict.get(&HashableValue::String("method".to_string())),
            Some(&Pickle::String("verify".to_string()))
        );
        assert_eq!(
            dict.get(&HashableValue::String("args".to_string())),
            Some(&Pickle::List(vec![Pickle::Bool(false)]))
        );
    }

    #[test]
    fn test_rejects_non_ref_dict() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String("other".to_string()),
            Pickle::I64(1),
        );
        assert!(from_wire(Pickle::Dict(dict)).is_err());
    }
}
