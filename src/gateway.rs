//! Default transport: a child `java` process serving the pickled-frame RPC
//! protocol over a loopback TCP socket.
//!
//! The runtime is process-global: one child JVM per host process, launched
//! with the assembled classpath and torn down explicitly. Each
//! [`GatewayBackend`] instance holds its own connection, opened lazily on the
//! first call, and its own class-resolution cache. No call timeouts; a hung
//! evaluation blocks its caller.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Lines};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard};

use serde_pickle::Value as Pickle;

use crate::backend::{Backend, BackendKind, JavaValue, ObjectHandle, SUPPORT_CLASS};
use crate::classpath;
use crate::error::BridgeError;
use crate::protocol;

/// Entry point of the bundled gateway server jar.
const GATEWAY_MAIN_CLASS: &str = "org.jpmml.evaluator.python.GatewayServer";
/// Stdout line the freshly-launched server prints before serving.
const PORT_LINE_PREFIX: &str = "JPMML_BRIDGE_GATEWAY_PORT=";

/// Reflective failures the server reports as thrown exceptions but which are
/// really resolution misses on our side of the call.
const RESOLUTION_FAILURES: &[&str] = &[
    "java.lang.ClassNotFoundException",
    "java.lang.NoSuchMethodException",
    "java.lang.InstantiationException",
];

struct GatewayRuntime {
    child: Child,
    port: u16,
}

static RUNTIME: Mutex<Option<GatewayRuntime>> = Mutex::new(None);

fn runtime_lock() -> Result<MutexGuard<'static, Option<GatewayRuntime>>, BridgeError> {
    RUNTIME
        .lock()
        .map_err(|_| BridgeError::Transport("gateway runtime lock poisoned".to_string()))
}

fn runtime_port() -> Result<u16, BridgeError> {
    match runtime_lock()?.as_ref() {
        Some(runtime) => Ok(runtime.port),
        None => Err(BridgeError::Transport(
            "no gateway runtime is running; start one with ensure_runtime".to_string(),
        )),
    }
}

/// Socket RPC backend speaking the version-1 frame protocol.
pub struct GatewayBackend {
    connection: Option<TcpStream>,
    class_refs: HashMap<String, ObjectHandle>,
    port_override: Option<u16>,
}

impl GatewayBackend {
    /// Backend bound to the process-global runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: None,
            class_refs: HashMap::new(),
            port_override: None,
        }
    }

    /// Backend bound to an already-listening server on `127.0.0.1:<port>`,
    /// bypassing the process-global runtime. The connection still opens
    /// lazily on the first call.
    #[must_use]
    pub fn connect(port: u16) -> Self {
        Self {
            connection: None,
            class_refs: HashMap::new(),
            port_override: Some(port),
        }
    }

    /// Launch the gateway JVM. Fails when one is already running.
    ///
    /// # Errors
    ///
    /// Returns an error when a runtime is live, the classpath cannot be
    /// assembled, or the child fails to start and announce its port.
    pub fn create_runtime(user_classpath: &[PathBuf]) -> Result<(), BridgeError> {
        let mut slot = runtime_lock()?;
        if slot.is_some() {
            return Err(BridgeError::Transport(
                "a gateway runtime is already running".to_string(),
            ));
        }
        *slot = Some(launch(user_classpath)?);
        Ok(())
    }

    /// Stop the gateway JVM. A missing runtime is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the runtime lock is poisoned.
    pub fn destroy_runtime() -> Result<(), BridgeError> {
        let mut slot = runtime_lock()?;
        let Some(mut runtime) = slot.take() else {
            return Ok(());
        };
        // Orderly shutdown first; the kill below covers a deaf server.
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", runtime.port)) {
            if let Ok(payload) = protocol::encode_request(&protocol::shutdown_request()) {
                let _ = protocol::write_frame(&mut stream, &payload);
                let _ = protocol::read_frame(&mut stream);
            }
        }
        let _ = runtime.child.kill();
        let _ = runtime.child.wait();
        tracing::info!(port = runtime.port, "gateway runtime stopped");
        Ok(())
    }

    /// Launch the gateway JVM unless one is already running, then probe that
    /// the evaluator support class resolves.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Classpath`] when the probe fails after a cold
    /// start, or the launch error itself.
    pub fn ensure_runtime(user_classpath: &[PathBuf]) -> Result<(), BridgeError> {
        let started = {
            let mut slot = runtime_lock()?;
            if slot.is_some() {
                false
            } else {
                *slot = Some(launch(user_classpath)?);
                true
            }
        };
        if started {
            let mut probe = Self::new();
            probe.class_ref(SUPPORT_CLASS).map_err(|e| {
                BridgeError::Classpath(format!(
                    "gateway is up but {SUPPORT_CLASS} did not resolve; \
                     check the bundled jars: {e}"
                ))
            })?;
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, BridgeError> {
        if self.connection.is_none() {
            let port = match self.port_override {
                Some(port) => port,
                None => runtime_port()?,
            };
            let stream = TcpStream::connect(("127.0.0.1", port)).map_err(|e| {
                BridgeError::Transport(format!("cannot reach gateway on port {port}: {e}"))
            })?;
            let _ = stream.set_nodelay(true);
            tracing::debug!(port, "gateway connection opened");
            self.connection = Some(stream);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("gateway connection unavailable".to_string()))
    }

    fn call(&mut self, request: &Pickle) -> Result<JavaValue, BridgeError> {
        let payload = protocol::encode_request(request)?;
        let stream = self.stream()?;
        protocol::write_frame(stream, &payload)
            .map_err(|e| BridgeError::Transport(format!("gateway write failed: {e}")))?;
        let response = protocol::read_frame(stream)
            .map_err(|e| BridgeError::Transport(format!("gateway read failed: {e}")))?;
        protocol::parse_response(&response)
    }

    fn class_ref(&mut self, class_name: &str) -> Result<ObjectHandle, BridgeError> {
        if let Some(handle) = self.class_refs.get(class_name) {
            return Ok(*handle);
        }
        let handle = self
            .call(&protocol::class_request(class_name))
            .map_err(|e| into_resolution(class_name, e))?
            .into_object("class resolution")?;
        self.class_refs.insert(class_name.to_string(), handle);
        Ok(handle)
    }
}

impl Default for GatewayBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for GatewayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gateway
    }

    fn new_object(
        &mut self,
        class_name: &str,
        args: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        let class = self.class_ref(class_name)?;
        self.call(&protocol::new_request(class, args))
            .map_err(|e| into_resolution(class_name, e))?
            .into_object("constructor call")
    }

    fn static_invoke(
        &mut self,
        class_name: &str,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError> {
        let class = self.class_ref(class_name)?;
        self.call(&protocol::static_request(class, method, args))
            .map_err(|e| into_resolution(class_name, e))
    }

    fn invoke(
        &mut self,
        target: ObjectHandle,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError> {
        self.call(&protocol::invoke_request(target, method, args))
            .map_err(|e| into_resolution(&format!("{method} on {target}"), e))
    }

    fn new_array(
        &mut self,
        class_name: &str,
        values: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        let class = self.class_ref(class_name)?;
        self.call(&protocol::array_request(class, values))
            .map_err(|e| into_resolution(class_name, e))?
            .into_object("array construction")
    }
}

/// Reclassify reflective misses as [`BridgeError::Invocation`]; genuine
/// throws from inside the called code pass through untouched.
fn into_resolution(subject: &str, err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Java(java) if RESOLUTION_FAILURES.contains(&java.class_name.as_str()) => {
            BridgeError::Invocation {
                class_name: subject.to_string(),
                detail: java.to_string(),
            }
        }
        other => other,
    }
}

fn launch(user_classpath: &[PathBuf]) -> Result<GatewayRuntime, BridgeError> {
    let entries = classpath::assemble(user_classpath)?;
    let classpath = classpath::join(&entries);
    tracing::info!(
        entries = entries.len(),
        main = GATEWAY_MAIN_CLASS,
        "launching gateway JVM"
    );

    let mut child = Command::new("java")
        .arg("-cp")
        .arg(&classpath)
        .arg(GATEWAY_MAIN_CLASS)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| BridgeError::Transport(format!("cannot launch java: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Transport("gateway child has no stdout".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let port = match read_port(&mut lines) {
        Ok(port) => port,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };

    // Keep draining stdout so the child never blocks on a full pipe.
    std::thread::spawn(move || {
        for line in lines.map_while(Result::ok) {
            tracing::debug!(target: "jpmml_bridge::gateway::jvm", "{line}");
        }
    });

    tracing::info!(port, "gateway runtime ready");
    Ok(GatewayRuntime { child, port })
}

fn read_port(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<u16, BridgeError> {
    for line in lines {
        let line = line
            .map_err(|e| BridgeError::Transport(format!("gateway stdout read failed: {e}")))?;
        if let Some(rest) = line.strip_prefix(PORT_LINE_PREFIX) {
            return rest.trim().parse().map_err(|_| {
                BridgeError::Transport(format!("gateway announced a malformed port: {line:?}"))
            });
        }
        tracing::debug!(target: "jpmml_bridge::gateway::jvm", "{line}");
    }
    Err(BridgeError::Transport(
        "gateway exited before announcing its port".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::net::TcpListener;
    use std::thread;

    use serde_pickle::{DeOptions, HashableValue, SerOptions};

    fn dict(entries: Vec<(&str, Pickle)>) -> Pickle {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            map.insert(HashableValue::String(key.to_string()), value);
        }
        Pickle::Dict(map)
    }

    fn ok_response(value: Pickle) -> Pickle {
        dict(vec![("status", Pickle::String("ok".to_string())), ("value", value)])
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

    /// One-connection server answering each frame with the next canned
    /// response, returning the decoded requests it saw.
    fn serve_script(responses: Vec<Pickle>) -> (u16, thread::JoinHandle<Vec<Pickle>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for response in responses {
                let payload = protocol::read_frame(&mut stream).unwrap();
                seen.push(
                    serde_pickle::value_from_slice(&payload, DeOptions::new()).unwrap(),
                );
                let out = serde_pickle::value_to_vec(&response, SerOptions::new()).unwrap();
                protocol::write_frame(&mut stream, &out).unwrap();
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn test_class_resolution_is_cached() {
        let (port, server) = serve_script(vec![ok_response(ref_value(11))]);
        let mut backend = GatewayBackend::connect(port);

        assert_eq!(
            backend.class_ref("java.lang.String").unwrap(),
            ObjectHandle(11)
        );
        assert_eq!(
            backend.class_ref("java.lang.String").unwrap(),
            ObjectHandle(11)
        );

        // Only one frame crossed the wire for the two lookups.
        assert_eq!(server.join().unwrap().len(), 1);
    }

    #[test]
    fn test_invoke_round_trip() {
        let (port, server) = serve_script(vec![ok_response(Pickle::String(
            "classification".to_string(),
        ))]);
        let mut backend = GatewayBackend::connect(port);

        let result = backend
            .invoke(ObjectHandle(4), "getMiningFunction", &[])
            .unwrap();
        assert_eq!(result, JavaValue::String("classification".to_string()));

        let seen = server.join().unwrap();
        let Pickle::Dict(request) = &seen[0] else {
            panic!("request is not a dict");
        };
        assert_eq!(
            request.get(&HashableValue::String("op".to_string())),
            Some(&Pickle::String("invoke".to_string()))
        );
    }

    #[test]
    fn test_missing_constructor_maps_to_invocation() {
        let (port, server) = serve_script(vec![
            ok_response(ref_value(1)),
            java_error_response("java.lang.NoSuchMethodException", "no such constructor"),
        ]);
        let mut backend = GatewayBackend::connect(port);

        let err = backend
            .new_object("java.io.File", &[JavaValue::Int(1)])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invocation { .. }));
        assert!(err.to_string().contains("java.io.File"));
        server.join().unwrap();
    }

    #[test]
    fn test_thrown_exception_passes_through() {
        let (port, server) = serve_script(vec![java_error_response(
            "org.jpmml.evaluator.EvaluationException",
            "field check failed",
        )]);
        let mut backend = GatewayBackend::connect(port);

        let err = backend
            .invoke(ObjectHandle(9), "verify", &[])
            .unwrap_err();
        let BridgeError::Java(java) = err else {
            panic!("expected a translated Java error");
        };
        assert_eq!(java.class_name, "org.jpmml.evaluator.EvaluationException");
        server.join().unwrap();
    }

    #[test]
    fn test_unreachable_port_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut backend = GatewayBackend::connect(port);
        let err = backend.invoke(ObjectHandle(1), "anything", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
    }
}
