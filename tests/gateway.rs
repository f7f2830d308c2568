//! End-to-end flows over the real socket transport against a scripted
//! server.
//!
//! The server thread answers each frame with the next canned response and
//! hands back the requests it saw, so these tests pin the exact wire
//! conversation the facade produces, from builder construction through bulk
//! scoring. The one test that needs a live JVM is ignored by default.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::thread;

use serde_pickle::{DeOptions, HashableValue, SerOptions, Value as Pickle};

use jpmml_bridge::backend::{LOADING_BUILDER_CLASS, SUPPORT_CLASS};
use jpmml_bridge::codec;
use jpmml_bridge::protocol;
use jpmml_bridge::{
    destroy_runtime, make_evaluator, shared, BackendKind, BridgeError, Evaluator,
    EvaluatorBuilder, EvaluatorOptions, GatewayBackend, Record, Table, Value,
};

/// The classic iris decision tree, splitting on petal measurements.
const IRIS_TREE_PMML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PMML xmlns="http://www.dmg.org/PMML-4_4" version="4.4">
  <Header description="iris decision tree"/>
  <DataDictionary numberOfFields="5">
    <DataField name="Sepal.Length" optype="continuous" dataType="double"/>
    <DataField name="Sepal.Width" optype="continuous" dataType="double"/>
    <DataField name="Petal.Length" optype="continuous" dataType="double"/>
    <DataField name="Petal.Width" optype="continuous" dataType="double"/>
    <DataField name="Species" optype="categorical" dataType="string">
      <Value value="setosa"/>
      <Value value="versicolor"/>
      <Value value="virginica"/>
    </DataField>
  </DataDictionary>
  <TreeModel modelName="DecisionTree" functionName="classification" splitCharacteristic="binarySplit">
    <MiningSchema>
      <MiningField name="Species" usageType="target"/>
      <MiningField name="Sepal.Length"/>
      <MiningField name="Sepal.Width"/>
      <MiningField name="Petal.Length"/>
      <MiningField name="Petal.Width"/>
    </MiningSchema>
    <Output>
      <OutputField name="probability(setosa)" optype="continuous" dataType="double" feature="probability" value="setosa"/>
      <OutputField name="probability(versicolor)" optype="continuous" dataType="double" feature="probability" value="versicolor"/>
      <OutputField name="probability(virginica)" optype="continuous" dataType="double" feature="probability" value="virginica"/>
      <OutputField name="Node_Id" optype="categorical" dataType="string" feature="entityId"/>
    </Output>
    <Node id="1" score="setosa" recordCount="150">
      <True/>
      <ScoreDistribution value="setosa" recordCount="50"/>
      <ScoreDistribution value="versicolor" recordCount="50"/>
      <ScoreDistribution value="virginica" recordCount="50"/>
      <Node id="2" score="setosa" recordCount="50">
        <SimplePredicate field="Petal.Length" operator="lessThan" value="2.45"/>
        <ScoreDistribution value="setosa" recordCount="50"/>
        <ScoreDistribution value="versicolor" recordCount="0"/>
        <ScoreDistribution value="virginica" recordCount="0"/>
      </Node>
      <Node id="3" score="versicolor" recordCount="100">
        <SimplePredicate field="Petal.Length" operator="greaterOrEqual" value="2.45"/>
        <ScoreDistribution value="setosa" recordCount="0"/>
        <ScoreDistribution value="versicolor" recordCount="50"/>
        <ScoreDistribution value="virginica" recordCount="50"/>
        <Node id="6" score="versicolor" recordCount="54">
          <SimplePredicate field="Petal.Width" operator="lessThan" value="1.75"/>
          <ScoreDistribution value="setosa" recordCount="0"/>
          <ScoreDistribution value="versicolor" recordCount="49"/>
          <ScoreDistribution value="virginica" recordCount="5"/>
        </Node>
        <Node id="7" score="virginica" recordCount="46">
          <SimplePredicate field="Petal.Width" operator="greaterOrEqual" value="1.75"/>
          <ScoreDistribution value="setosa" recordCount="0"/>
          <ScoreDistribution value="versicolor" recordCount="1"/>
          <ScoreDistribution value="virginica" recordCount="45"/>
        </Node>
      </Node>
    </Node>
  </TreeModel>
</PMML>
"#;

fn dict(entries: Vec<(&str, Pickle)>) -> Pickle {
    let mut map = BTreeMap::new();
    for (key, value) in entries {
        map.insert(HashableValue::String(key.to_string()), value);
    }
    Pickle::Dict(map)
}

fn ok_response(value: Pickle) -> Pickle {
    dict(vec![
        ("status", Pickle::String("ok".to_string())),
        ("value", value),
    ])
}

fn ref_value(id: i64) -> Pickle {
    dict(vec![("$ref", Pickle::I64(id))])
}

fn java_error_response(class: &str, message: &str) -> Pickle {
    dict(vec![
        ("status", Pickle::String("error".to_string())),
        ("kind", Pickle::String("java".to_string())),
        ("class", Pickle::String(class.to_string())),
        ("message", Pickle::String(message.to_string())),
        ("stacktrace", Pickle::List(vec![])),
    ])
}

fn protocol_error_response(message: &str) -> Pickle {
    dict(vec![
        ("status", Pickle::String("error".to_string())),
        ("kind", Pickle::String("protocol".to_string())),
        ("message", Pickle::String(message.to_string())),
    ])
}

fn pickle_cell(value: &Value) -> Pickle {
    match value {
        Value::Null => Pickle::None,
        Value::Bool(b) => Pickle::Bool(*b),
        Value::Int(i) => Pickle::I64(*i),
        Value::Float(f) => Pickle::F64(*f),
        Value::String(s) => Pickle::String(s.clone()),
    }
}

/// An ok response whose value is a pickled bulk result payload.
fn bulk_ok(columns: &[&str], data: &[Vec<Value>], errors: &[Option<&str>]) -> Pickle {
    let mut payload = BTreeMap::new();
    payload.insert(
        HashableValue::String("columns".to_string()),
        Pickle::List(
            columns
                .iter()
                .map(|c| Pickle::String((*c).to_string()))
                .collect(),
        ),
    );
    payload.insert(
        HashableValue::String("data".to_string()),
        Pickle::List(
            data.iter()
                .map(|column| Pickle::List(column.iter().map(pickle_cell).collect()))
                .collect(),
        ),
    );
    payload.insert(
        HashableValue::String("errors".to_string()),
        Pickle::List(
            errors
                .iter()
                .map(|e| e.map_or(Pickle::None, |m| Pickle::String(m.to_string())))
                .collect(),
        ),
    );
    let bytes = serde_pickle::value_to_vec(&Pickle::Dict(payload), SerOptions::new()).unwrap();
    ok_response(Pickle::Bytes(bytes))
}

/// One-connection server answering each frame with the next canned response,
/// returning the decoded requests it saw.
fn serve_script(responses: Vec<Pickle>) -> (u16, thread::JoinHandle<Vec<Pickle>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut seen = Vec::new();
        for response in responses {
            let payload = protocol::read_frame(&mut stream).unwrap();
            seen.push(serde_pickle::value_from_slice(&payload, DeOptions::new()).unwrap());
            let out = serde_pickle::value_to_vec(&response, SerOptions::new()).unwrap();
            protocol::write_frame(&mut stream, &out).unwrap();
        }
        seen
    });
    (port, handle)
}

/// Responses covering builder construction, a byte-stream load, and build.
fn builder_preamble() -> Vec<Pickle> {
    vec![
        ok_response(ref_value(1)),
        ok_response(ref_value(2)),
        ok_response(ref_value(3)),
        ok_response(ref_value(4)),
        ok_response(Pickle::None),
        ok_response(ref_value(5)),
    ]
}

fn scripted_evaluator(port: u16) -> Evaluator {
    EvaluatorBuilder::new(shared(GatewayBackend::connect(port)))
        .unwrap()
        .load_bytes(b"<PMML/>")
        .unwrap()
        .build()
        .unwrap()
}

fn op_of(request: &Pickle) -> &str {
    let Pickle::Dict(fields) = request else {
        panic!("request is not a dict: {request:?}");
    };
    match fields.get(&HashableValue::String("op".to_string())) {
        Some(Pickle::String(op)) => op,
        other => panic!("request has no op: {other:?}"),
    }
}

fn field_of<'a>(request: &'a Pickle, key: &str) -> &'a Pickle {
    let Pickle::Dict(fields) = request else {
        panic!("request is not a dict: {request:?}");
    };
    fields
        .get(&HashableValue::String(key.to_string()))
        .unwrap_or_else(|| panic!("request has no {key}"))
}

fn iris_rows() -> Table {
    Table::from_rows(
        vec![
            "Sepal.Length".to_string(),
            "Sepal.Width".to_string(),
            "Petal.Length".to_string(),
            "Petal.Width".to_string(),
        ],
        vec![
            vec![
                Value::Float(5.1),
                Value::Float(3.5),
                Value::Float(1.4),
                Value::Float(0.2),
            ],
            vec![
                Value::Float(6.1),
                Value::Float(2.9),
                Value::Float(4.7),
                Value::Float(1.4),
            ],
            vec![
                Value::Float(6.3),
                Value::Float(3.3),
                Value::Float(6.0),
                Value::Float(2.5),
            ],
        ],
    )
    .unwrap()
}

#[test]
fn test_single_record_flow_over_the_wire() {
    let scored = Record::from([
        ("Species".to_string(), Value::String("setosa".to_string())),
        ("probability(setosa)".to_string(), Value::Float(1.0)),
        ("probability(versicolor)".to_string(), Value::Float(0.0)),
        ("probability(virginica)".to_string(), Value::Float(0.0)),
        ("Node_Id".to_string(), Value::String("2".to_string())),
    ]);
    let mut responses = builder_preamble();
    responses.push(ok_response(ref_value(6)));
    responses.push(ok_response(Pickle::Bytes(
        codec::encode_record(&scored).unwrap(),
    )));
    let (port, server) = serve_script(responses);

    let evaluator = scripted_evaluator(port);
    let request = Record::from([
        ("Sepal.Length".to_string(), Value::Float(5.1)),
        ("Sepal.Width".to_string(), Value::Float(3.5)),
        ("Petal.Length".to_string(), Value::Float(1.4)),
        ("Petal.Width".to_string(), Value::Float(0.2)),
    ]);
    let result = evaluator.evaluate(&request).unwrap();
    assert_eq!(result, scored);

    let seen = server.join().unwrap();
    let ops: Vec<&str> = seen.iter().map(op_of).collect();
    assert_eq!(
        ops,
        ["class", "new", "class", "new", "invoke", "invoke", "class", "static"]
    );
    assert_eq!(
        field_of(&seen[0], "name"),
        &Pickle::String(LOADING_BUILDER_CLASS.to_string())
    );
    assert_eq!(
        field_of(&seen[6], "name"),
        &Pickle::String(SUPPORT_CLASS.to_string())
    );

    // The evaluate frame carried the pickled record and a null drop list.
    let Pickle::List(args) = field_of(&seen[7], "args") else {
        panic!("static args is not a list");
    };
    let Pickle::Bytes(payload) = &args[1] else {
        panic!("request payload is not bytes");
    };
    assert_eq!(codec::decode_record(payload).unwrap(), request);
    assert_eq!(args[2], Pickle::None);
}

#[test]
fn test_iris_batch_flow_over_the_wire() {
    let columns = [
        "Species",
        "probability(setosa)",
        "probability(versicolor)",
        "probability(virginica)",
        "Node_Id",
    ];
    let data = vec![
        vec![
            Value::String("setosa".to_string()),
            Value::String("versicolor".to_string()),
            Value::String("virginica".to_string()),
        ],
        vec![Value::Float(1.0), Value::Float(0.0), Value::Float(0.0)],
        vec![
            Value::Float(0.0),
            Value::Float(49.0 / 54.0),
            Value::Float(1.0 / 46.0),
        ],
        vec![
            Value::Float(0.0),
            Value::Float(5.0 / 54.0),
            Value::Float(45.0 / 46.0),
        ],
        vec![
            Value::String("2".to_string()),
            Value::String("6".to_string()),
            Value::String("7".to_string()),
        ],
    ];
    let mut responses = builder_preamble();
    responses.push(ok_response(ref_value(6)));
    responses.push(bulk_ok(&columns, &data, &[None, None, None]));
    let (port, server) = serve_script(responses);

    let evaluator = scripted_evaluator(port);
    let table = iris_rows();
    let result = evaluator.evaluate_all(&table).unwrap();

    // Model field order carries through; no error column on a clean batch.
    let names: Vec<&str> = result.columns().iter().map(String::as_str).collect();
    assert_eq!(names, columns);
    assert_eq!(result.n_rows(), 3);
    assert_eq!(result.index(), [Value::Int(0), Value::Int(1), Value::Int(2)]);

    assert_eq!(result.column("Species").unwrap()[0], Value::String("setosa".to_string()));
    assert_eq!(
        result.column("probability(versicolor)").unwrap()[1],
        Value::Float(49.0 / 54.0)
    );
    assert_eq!(
        result.column("probability(virginica)").unwrap()[2],
        Value::Float(45.0 / 46.0)
    );
    assert_eq!(result.column("Node_Id").unwrap()[1], Value::String("6".to_string()));

    // The request carried the whole input table in one frame.
    let seen = server.join().unwrap();
    let Pickle::List(args) = field_of(&seen[7], "args") else {
        panic!("static args is not a list");
    };
    let Pickle::Bytes(payload) = &args[1] else {
        panic!("request payload is not bytes");
    };
    let sent = codec::decode_table(payload).unwrap();
    assert_eq!(sent.columns, table.columns());
    assert_eq!(sent.data, table.data());
    assert_eq!(args[3], Pickle::I64(-1));
}

#[test]
fn test_one_bad_row_does_not_poison_the_batch() {
    let columns = ["Species", "probability(setosa)"];
    let data = vec![
        vec![
            Value::String("setosa".to_string()),
            Value::Null,
            Value::String("virginica".to_string()),
        ],
        vec![Value::Float(1.0), Value::Null, Value::Float(0.0)],
    ];
    let errors = [
        None,
        Some("Field \"Petal.Width\" cannot accept user input value \"oops\""),
        None,
    ];
    let mut responses = builder_preamble();
    responses.push(ok_response(ref_value(6)));
    responses.push(bulk_ok(&columns, &data, &errors));
    let (port, server) = serve_script(responses);

    let evaluator = scripted_evaluator(port);
    let result = evaluator.evaluate_all(&iris_rows()).unwrap();

    assert_eq!(result.n_rows(), 3);
    let cells = result.column("errors").unwrap();
    assert_eq!(cells[0], Value::Null);
    assert!(matches!(&cells[1], Value::String(m) if m.contains("Petal.Width")));
    assert_eq!(cells[2], Value::Null);

    // Clean rows kept their results; the failed row nulled out.
    let species = result.column("Species").unwrap();
    assert_eq!(species[0], Value::String("setosa".to_string()));
    assert_eq!(species[1], Value::Null);
    assert_eq!(species[2], Value::String("virginica".to_string()));
    server.join().unwrap();
}

#[test]
fn test_verification_failure_over_the_wire() {
    let mut responses = builder_preamble();
    responses.push(java_error_response(
        "org.jpmml.evaluator.ValueCheckException",
        "verification record 3 mismatched",
    ));
    let (port, server) = serve_script(responses);

    let evaluator = scripted_evaluator(port);
    let err = evaluator.verify().unwrap_err();
    assert!(matches!(err, BridgeError::Verification(_)));
    assert_eq!(
        err.java_error().unwrap().class_name,
        "org.jpmml.evaluator.ValueCheckException"
    );
    server.join().unwrap();
}

#[test]
fn test_protocol_error_surfaces_as_transport() {
    let mut responses = builder_preamble();
    responses.push(ok_response(ref_value(6)));
    responses.push(protocol_error_response("unknown op \"evaluate\""));
    let (port, server) = serve_script(responses);

    let evaluator = scripted_evaluator(port);
    let record = Record::from([("Petal.Length".to_string(), Value::Float(1.4))]);
    let err = evaluator.evaluate(&record).unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
    assert!(err.to_string().contains("unknown op"));
    server.join().unwrap();
}

#[test]
fn test_server_hangup_is_a_transport_error() {
    let (port, server) = serve_script(builder_preamble());

    let evaluator = scripted_evaluator(port);
    server.join().unwrap();

    let record = Record::from([("Petal.Length".to_string(), Value::Float(1.4))]);
    let err = evaluator.evaluate(&record).unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
}

#[test]
fn test_destroying_a_missing_runtime_is_fine() {
    destroy_runtime(BackendKind::Gateway).unwrap();
}

#[test]
#[ignore = "requires a JVM and the bundled evaluator jars"]
fn test_live_gateway_scores_the_iris_tree() {
    let evaluator = make_evaluator(IRIS_TREE_PMML, &EvaluatorOptions::default()).unwrap();

    let record = Record::from([
        ("Sepal.Length".to_string(), Value::Float(5.1)),
        ("Sepal.Width".to_string(), Value::Float(3.5)),
        ("Petal.Length".to_string(), Value::Float(1.4)),
        ("Petal.Width".to_string(), Value::Float(0.2)),
    ]);
    let scored = evaluator.evaluate(&record).unwrap();
    assert_eq!(
        scored.get("Species"),
        Some(&Value::String("setosa".to_string()))
    );
    assert_eq!(scored.get("probability(setosa)"), Some(&Value::Float(1.0)));

    let result = evaluator.evaluate_all(&iris_rows()).unwrap();
    assert_eq!(result.n_rows(), 3);
    assert!(result.column("errors").is_none());

    let p = match result.column("probability(versicolor)").unwrap()[1] {
        Value::Float(p) => p,
        ref other => panic!("probability is not a float: {other:?}"),
    };
    assert!((p - 49.0 / 54.0).abs() < 1e-13);

    let node_ids = result.column("Node_Id").unwrap();
    assert_eq!(node_ids[0], Value::String("2".to_string()));
    assert_eq!(node_ids[1], Value::String("6".to_string()));
    assert_eq!(node_ids[2], Value::String("7".to_string()));

    destroy_runtime(BackendKind::Gateway).unwrap();
}
