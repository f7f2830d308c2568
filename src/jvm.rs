//! In-process JVM plumbing shared by the `embedded` and `native` backends.
//!
//! The invocation API allows exactly one JVM per process and cannot restart
//! one after teardown, so the VM lives in a process-global slot with three
//! states: never started, live, destroyed. Destroying marks the slot
//! unusable; the VM itself stays resident until process exit because JNI has
//! no way to unload it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use jni::objects::{
    GlobalRef, JByteArray, JObject, JObjectArray, JString, JThrowable, JValue, JValueOwned,
};
use jni::sys::jsize;
use jni::{InitArgsBuilder, JNIEnv, JNIVersion, JavaVM};

use crate::backend::{JavaValue, ObjectHandle};
use crate::classpath;
use crate::error::{BridgeError, JavaError};

/// `java.lang.reflect.Modifier.STATIC`.
const MODIFIER_STATIC: i32 = 0x0008;

enum JvmSlot {
    Empty,
    Live(Arc<JavaVM>),
    Destroyed,
}

static JVM: Mutex<JvmSlot> = Mutex::new(JvmSlot::Empty);

fn jvm_lock() -> Result<MutexGuard<'static, JvmSlot>, BridgeError> {
    JVM.lock()
        .map_err(|_| BridgeError::Transport("JVM slot lock poisoned".to_string()))
}

fn destroyed_error() -> BridgeError {
    BridgeError::Transport(
        "the in-process JVM was destroyed and cannot be restarted in this process".to_string(),
    )
}

/// Start the process-global JVM. Fails when one is live or was destroyed.
pub(crate) fn create_jvm(user_classpath: &[PathBuf]) -> Result<(), BridgeError> {
    let mut slot = jvm_lock()?;
    match &*slot {
        JvmSlot::Live(_) => Err(BridgeError::Transport(
            "a JVM is already running in this process".to_string(),
        )),
        JvmSlot::Destroyed => Err(destroyed_error()),
        JvmSlot::Empty => {
            *slot = JvmSlot::Live(Arc::new(launch_jvm(user_classpath)?));
            Ok(())
        }
    }
}

/// Start the JVM unless one is live. Returns whether this call did the cold
/// start, so the caller knows to run its classpath probe.
pub(crate) fn ensure_jvm(user_classpath: &[PathBuf]) -> Result<bool, BridgeError> {
    let mut slot = jvm_lock()?;
    match &*slot {
        JvmSlot::Live(_) => Ok(false),
        JvmSlot::Destroyed => Err(destroyed_error()),
        JvmSlot::Empty => {
            *slot = JvmSlot::Live(Arc::new(launch_jvm(user_classpath)?));
            Ok(true)
        }
    }
}

/// Mark the JVM slot destroyed. Idempotent; a never-started slot stays
/// startable.
pub(crate) fn destroy_jvm() -> Result<(), BridgeError> {
    let mut slot = jvm_lock()?;
    match &*slot {
        JvmSlot::Live(_) => {
            *slot = JvmSlot::Destroyed;
            tracing::info!("in-process JVM retired; it cannot be restarted in this process");
            Ok(())
        }
        JvmSlot::Empty | JvmSlot::Destroyed => Ok(()),
    }
}

fn launch_jvm(user_classpath: &[PathBuf]) -> Result<JavaVM, BridgeError> {
    let entries = classpath::assemble(user_classpath)?;
    let classpath = classpath::join(&entries);
    tracing::info!(entries = entries.len(), "starting in-process JVM");

    let args = InitArgsBuilder::new()
        .version(JNIVersion::V8)
        .option(format!("-Djava.class.path={classpath}"))
        .build()
        .map_err(|e| BridgeError::Transport(format!("bad JVM init arguments: {e}")))?;
    JavaVM::new(args)
        .map_err(|e| BridgeError::Transport(format!("cannot start the in-process JVM: {e}")))
}

/// Run `f` against the live JVM on the current thread.
///
/// The thread stays attached afterwards; backend calls are frequent enough
/// that detaching between them would only churn.
pub(crate) fn with_env<T>(
    f: impl FnOnce(&mut JNIEnv) -> Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    let vm = {
        let slot = jvm_lock()?;
        match &*slot {
            JvmSlot::Live(vm) => Arc::clone(vm),
            JvmSlot::Empty => {
                return Err(BridgeError::Transport(
                    "no in-process JVM is running; start one with ensure_runtime".to_string(),
                ))
            }
            JvmSlot::Destroyed => return Err(destroyed_error()),
        }
    };
    let mut env = vm
        .attach_current_thread_permanently()
        .map_err(|e| BridgeError::Transport(format!("cannot attach to the JVM: {e}")))?;
    f(&mut env)
}

/// Keeps handed-out objects alive via global references.
///
/// Handles are minted monotonically and never reclaimed; the object universe
/// of a model session is static.
pub(crate) struct HandleRegistry {
    objects: HashMap<u64, GlobalRef>,
    next: u64,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next: 1,
        }
    }

    pub(crate) fn insert(&mut self, reference: GlobalRef) -> ObjectHandle {
        let id = self.next;
        self.next += 1;
        self.objects.insert(id, reference);
        ObjectHandle(id)
    }

    pub(crate) fn get(&self, handle: ObjectHandle) -> Result<&GlobalRef, BridgeError> {
        self.objects
            .get(&handle.0)
            .ok_or_else(|| BridgeError::Transport(format!("stale object handle {handle}")))
    }
}

pub(crate) fn jni_failure(err: jni::errors::Error) -> BridgeError {
    BridgeError::Transport(format!("JNI failure: {err}"))
}

/// Lift a raw JNI result, translating a thrown exception into
/// [`BridgeError::Java`] with the throwable unwrapped and cleared.
pub(crate) fn unwrap_thrown<T>(
    env: &mut JNIEnv,
    result: jni::errors::Result<T>,
) -> Result<T, BridgeError> {
    match result {
        Ok(value) => Ok(value),
        Err(jni::errors::Error::JavaException) => match take_pending(env) {
            Some(java) => Err(BridgeError::Java(java)),
            None => Err(BridgeError::Transport(
                "JVM signaled an exception but none was pending".to_string(),
            )),
        },
        Err(other) => Err(jni_failure(other)),
    }
}

/// Pop the pending exception, if any, and translate it.
pub(crate) fn take_pending(env: &mut JNIEnv) -> Option<JavaError> {
    if !env.exception_check().unwrap_or(false) {
        return None;
    }
    let throwable = env.exception_occurred().ok();
    let _ = env.exception_clear();
    let throwable = throwable?;
    Some(describe_throwable(env, &throwable))
}

/// Translate a throwable into its class name, message, and rendered frames.
///
/// Runs with no exception pending; every lookup here is best-effort because
/// this is already the failure path.
pub(crate) fn describe_throwable(env: &mut JNIEnv, throwable: &JThrowable) -> JavaError {
    let class_name = object_class_name(env, throwable)
        .unwrap_or_else(|| "java.lang.Throwable".to_string());

    let message = env
        .call_method(throwable, "getMessage", "()Ljava/lang/String;", &[])
        .ok()
        .and_then(|value| into_string(env, value).ok().flatten())
        .unwrap_or_default();

    let mut stack_trace = Vec::new();
    if let Ok(frames) = env.call_method(
        throwable,
        "getStackTrace",
        "()[Ljava/lang/StackTraceElement;",
        &[],
    ) {
        if let Ok(frames) = frames.l() {
            let frames = JObjectArray::from(frames);
            let count = env.get_array_length(&frames).unwrap_or(0);
            for i in 0..count {
                let Ok(frame) = env.get_object_array_element(&frames, i) else {
                    break;
                };
                let rendered = env
                    .call_method(&frame, "toString", "()Ljava/lang/String;", &[])
                    .ok()
                    .and_then(|value| into_string(env, value).ok().flatten());
                match rendered {
                    Some(line) => stack_trace.push(line),
                    None => break,
                }
            }
        }
    }
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_clear();
    }

    JavaError::new(class_name, message, stack_trace)
}

/// Dotted runtime class name of an object.
pub(crate) fn object_class_name(env: &mut JNIEnv, obj: &JObject) -> Option<String> {
    let class = env.get_object_class(obj).ok()?;
    let name = env
        .call_method(&class, "getName", "()Ljava/lang/String;", &[])
        .ok()?;
    into_string(env, name).ok().flatten()
}

/// Pull a `String` out of a call result; `None` for Java `null`.
pub(crate) fn into_string(
    env: &mut JNIEnv,
    value: JValueOwned,
) -> Result<Option<String>, BridgeError> {
    let obj = value.l().map_err(jni_failure)?;
    if obj.is_null() {
        return Ok(None);
    }
    let string = JString::from(obj);
    let s = env.get_string(&string).map_err(jni_failure)?;
    Ok(Some(s.into()))
}

/// Convert a returned object into a [`JavaValue`], unboxing the wrapper
/// types and registering everything else as a handle.
pub(crate) fn realize_object<'local>(
    env: &mut JNIEnv<'local>,
    registry: &mut HandleRegistry,
    obj: JObject<'local>,
) -> Result<JavaValue, BridgeError> {
    if obj.is_null() {
        return Ok(JavaValue::Null);
    }
    if env.is_instance_of(&obj, "java/lang/String").map_err(jni_failure)? {
        let s = env
            .get_string(&JString::from(obj))
            .map_err(jni_failure)?
            .into();
        return Ok(JavaValue::String(s));
    }
    if env.is_instance_of(&obj, "java/lang/Boolean").map_err(jni_failure)? {
        let result = env.call_method(&obj, "booleanValue", "()Z", &[]);
        return Ok(JavaValue::Bool(
            unwrap_thrown(env, result)?.z().map_err(jni_failure)?,
        ));
    }
    if env.is_instance_of(&obj, "java/lang/Integer").map_err(jni_failure)?
        || env.is_instance_of(&obj, "java/lang/Short").map_err(jni_failure)?
        || env.is_instance_of(&obj, "java/lang/Byte").map_err(jni_failure)?
    {
        let result = env.call_method(&obj, "intValue", "()I", &[]);
        return Ok(JavaValue::Int(
            unwrap_thrown(env, result)?.i().map_err(jni_failure)?,
        ));
    }
    if env.is_instance_of(&obj, "java/lang/Long").map_err(jni_failure)? {
        let result = env.call_method(&obj, "longValue", "()J", &[]);
        return Ok(JavaValue::Long(
            unwrap_thrown(env, result)?.j().map_err(jni_failure)?,
        ));
    }
    if env.is_instance_of(&obj, "java/lang/Float").map_err(jni_failure)? {
        let result = env.call_method(&obj, "floatValue", "()F", &[]);
        return Ok(JavaValue::Float(
            unwrap_thrown(env, result)?.f().map_err(jni_failure)?,
        ));
    }
    if env.is_instance_of(&obj, "java/lang/Double").map_err(jni_failure)? {
        let result = env.call_method(&obj, "doubleValue", "()D", &[]);
        return Ok(JavaValue::Double(
            unwrap_thrown(env, result)?.d().map_err(jni_failure)?,
        ));
    }
    if env.is_instance_of(&obj, "[B").map_err(jni_failure)? {
        let bytes = env
            .convert_byte_array(&JByteArray::from(obj))
            .map_err(jni_failure)?;
        return Ok(JavaValue::Bytes(bytes));
    }
    let global = env.new_global_ref(&obj).map_err(jni_failure)?;
    Ok(JavaValue::Object(registry.insert(global)))
}

/// Box a bridge value into an `Object` local reference, for reflective calls
/// and `Object[]` argument arrays.
pub(crate) fn box_value<'local>(
    env: &mut JNIEnv<'local>,
    registry: &HandleRegistry,
    value: &JavaValue,
) -> Result<JObject<'local>, BridgeError> {
    match value {
        JavaValue::Null => Ok(JObject::null()),
        JavaValue::Bool(b) => static_box(
            env,
            "java/lang/Boolean",
            "(Z)Ljava/lang/Boolean;",
            JValue::Bool(u8::from(*b)),
        ),
        JavaValue::Int(i) => static_box(
            env,
            "java/lang/Integer",
            "(I)Ljava/lang/Integer;",
            JValue::Int(*i),
        ),
        JavaValue::Long(l) => static_box(
            env,
            "java/lang/Long",
            "(J)Ljava/lang/Long;",
            JValue::Long(*l),
        ),
        JavaValue::Float(f) => static_box(
            env,
            "java/lang/Float",
            "(F)Ljava/lang/Float;",
            JValue::Float(*f),
        ),
        JavaValue::Double(d) => static_box(
            env,
            "java/lang/Double",
            "(D)Ljava/lang/Double;",
            JValue::Double(*d),
        ),
        JavaValue::String(s) => Ok(env.new_string(s).map_err(jni_failure)?.into()),
        JavaValue::Bytes(b) => Ok(env.byte_array_from_slice(b).map_err(jni_failure)?.into()),
        JavaValue::Object(handle) => {
            let global = registry.get(*handle)?;
            env.new_local_ref(global.as_obj()).map_err(jni_failure)
        }
    }
}

fn static_box<'local>(
    env: &mut JNIEnv<'local>,
    class: &str,
    sig: &str,
    arg: JValue,
) -> Result<JObject<'local>, BridgeError> {
    let result = env.call_static_method(class, "valueOf", sig, &[arg]);
    unwrap_thrown(env, result)?.l().map_err(jni_failure)
}

/// Whether a method is dispatched on a class or an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Static,
    Instance,
}

/// A reflectively selected method: the `java.lang.reflect.Method` object plus
/// the dotted type names needed to build a call signature.
pub(crate) struct SelectedMethod<'local> {
    pub(crate) method: JObject<'local>,
    pub(crate) param_types: Vec<String>,
    pub(crate) return_type: String,
}

/// A reflectively selected constructor.
pub(crate) struct SelectedConstructor<'local> {
    pub(crate) constructor: JObject<'local>,
    pub(crate) param_types: Vec<String>,
}

/// Scan `getMethods` of a class object for an applicable overload: same name,
/// same arity, every argument acceptable to the declared parameter type.
pub(crate) fn select_method<'local>(
    env: &mut JNIEnv<'local>,
    registry: &HandleRegistry,
    class: &JObject<'_>,
    name: &str,
    args: &[JavaValue],
    dispatch: Dispatch,
) -> Result<Option<SelectedMethod<'local>>, BridgeError> {
    let result = env.call_method(class, "getMethods", "()[Ljava/lang/reflect/Method;", &[]);
    let methods = unwrap_thrown(env, result)?.l().map_err(jni_failure)?;
    let methods = JObjectArray::from(methods);
    let count = env.get_array_length(&methods).map_err(jni_failure)?;

    for i in 0..count {
        let method = env
            .get_object_array_element(&methods, i)
            .map_err(jni_failure)?;

        let name_value = env.call_method(&method, "getName", "()Ljava/lang/String;", &[]);
        let name_value = unwrap_thrown(env, name_value)?;
        let method_name = into_string(env, name_value)?.unwrap_or_default();
        if method_name != name {
            continue;
        }

        let mods = env.call_method(&method, "getModifiers", "()I", &[]);
        let mods = unwrap_thrown(env, mods)?.i().map_err(jni_failure)?;
        let is_static = mods & MODIFIER_STATIC != 0;
        if is_static != (dispatch == Dispatch::Static) {
            continue;
        }

        let params = env.call_method(
            &method,
            "getParameterTypes",
            "()[Ljava/lang/Class;",
            &[],
        );
        let params = unwrap_thrown(env, params)?.l().map_err(jni_failure)?;
        let params = JObjectArray::from(params);
        if let Some(param_types) = match_params(env, registry, &params, args)? {
            let ret = env.call_method(&method, "getReturnType", "()Ljava/lang/Class;", &[]);
            let ret = unwrap_thrown(env, ret)?.l().map_err(jni_failure)?;
            let ret_name = env.call_method(&ret, "getName", "()Ljava/lang/String;", &[]);
            let ret_name = unwrap_thrown(env, ret_name)?;
            let return_type = into_string(env, ret_name)?.unwrap_or_default();
            return Ok(Some(SelectedMethod {
                method,
                param_types,
                return_type,
            }));
        }
    }
    Ok(None)
}

/// Scan `getConstructors` of a class object for an applicable overload.
pub(crate) fn select_constructor<'local>(
    env: &mut JNIEnv<'local>,
    registry: &HandleRegistry,
    class: &JObject<'_>,
    args: &[JavaValue],
) -> Result<Option<SelectedConstructor<'local>>, BridgeError> {
    let result = env.call_method(
        class,
        "getConstructors",
        "()[Ljava/lang/reflect/Constructor;",
        &[],
    );
    let ctors = unwrap_thrown(env, result)?.l().map_err(jni_failure)?;
    let ctors = JObjectArray::from(ctors);
    let count = env.get_array_length(&ctors).map_err(jni_failure)?;

    for i in 0..count {
        let constructor = env
            .get_object_array_element(&ctors, i)
            .map_err(jni_failure)?;
        let params = env.call_method(
            &constructor,
            "getParameterTypes",
            "()[Ljava/lang/Class;",
            &[],
        );
        let params = unwrap_thrown(env, params)?.l().map_err(jni_failure)?;
        let params = JObjectArray::from(params);
        if let Some(param_types) = match_params(env, registry, &params, args)? {
            return Ok(Some(SelectedConstructor {
                constructor,
                param_types,
            }));
        }
    }
    Ok(None)
}

/// Check every argument against the declared parameter types; `Some` carries
/// the dotted parameter type names on a full match.
fn match_params(
    env: &mut JNIEnv,
    registry: &HandleRegistry,
    params: &JObjectArray,
    args: &[JavaValue],
) -> Result<Option<Vec<String>>, BridgeError> {
    let count = env.get_array_length(params).map_err(jni_failure)?;
    if count as usize != args.len() {
        return Ok(None);
    }

    let mut param_types = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let param_class = env
            .get_object_array_element(params, i as jsize)
            .map_err(jni_failure)?;
        let pname = env.call_method(&param_class, "getName", "()Ljava/lang/String;", &[]);
        let pname = unwrap_thrown(env, pname)?;
        let pname = into_string(env, pname)?.unwrap_or_default();

        let accepted = match arg {
            JavaValue::Object(handle) => {
                if is_primitive(&pname) {
                    false
                } else {
                    let global = registry.get(*handle)?;
                    let hit = env.call_method(
                        &param_class,
                        "isInstance",
                        "(Ljava/lang/Object;)Z",
                        &[JValue::Object(global.as_obj())],
                    );
                    unwrap_thrown(env, hit)?.z().map_err(jni_failure)?
                }
            }
            other => scalar_accepts(&pname, other),
        };
        if !accepted {
            return Ok(None);
        }
        param_types.push(pname);
    }
    Ok(Some(param_types))
}

pub(crate) fn is_primitive(type_name: &str) -> bool {
    matches!(
        type_name,
        "boolean" | "byte" | "char" | "short" | "int" | "long" | "float" | "double" | "void"
    )
}

/// Which declared parameter types accept a scalar bridge value. Mirrors
/// Java's applicability rules for the widenings the bridge can produce.
pub(crate) fn scalar_accepts(param: &str, arg: &JavaValue) -> bool {
    match arg {
        JavaValue::Null => !is_primitive(param),
        JavaValue::Bool(_) => {
            matches!(param, "boolean" | "java.lang.Boolean" | "java.lang.Object")
        }
        JavaValue::Int(_) => matches!(
            param,
            "int"
                | "long"
                | "double"
                | "java.lang.Integer"
                | "java.lang.Number"
                | "java.lang.Object"
        ),
        JavaValue::Long(_) => matches!(
            param,
            "long" | "java.lang.Long" | "java.lang.Number" | "java.lang.Object"
        ),
        JavaValue::Float(_) => matches!(
            param,
            "float" | "double" | "java.lang.Float" | "java.lang.Number" | "java.lang.Object"
        ),
        JavaValue::Double(_) => matches!(
            param,
            "double" | "java.lang.Double" | "java.lang.Number" | "java.lang.Object"
        ),
        JavaValue::String(_) => matches!(
            param,
            "java.lang.String" | "java.lang.CharSequence" | "java.lang.Object"
        ),
        JavaValue::Bytes(_) => matches!(param, "[B" | "java.lang.Object"),
        JavaValue::Object(_) => !is_primitive(param),
    }
}

/// JNI type descriptor for a dotted class name as `Class.getName` renders it.
pub(crate) fn descriptor_of(type_name: &str) -> String {
    match type_name {
        "void" => "V".to_string(),
        "boolean" => "Z".to_string(),
        "byte" => "B".to_string(),
        "char" => "C".to_string(),
        "short" => "S".to_string(),
        "int" => "I".to_string(),
        "long" => "J".to_string(),
        "float" => "F".to_string(),
        "double" => "D".to_string(),
        // Array binary names are already descriptor-shaped, dots aside.
        array if array.starts_with('[') => array.replace('.', "/"),
        object => format!("L{};", object.replace('.', "/")),
    }
}

/// Dotted name to the slashed form `FindClass` wants.
pub(crate) fn slashed(class_name: &str) -> String {
    class_name.replace('.', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_of_primitives() {
        assert_eq!(descriptor_of("int"), "I");
        assert_eq!(descriptor_of("boolean"), "Z");
        assert_eq!(descriptor_of("double"), "D");
        assert_eq!(descriptor_of("void"), "V");
    }

    #[test]
    fn test_descriptor_of_objects_and_arrays() {
        assert_eq!(descriptor_of("java.lang.String"), "Ljava/lang/String;");
        assert_eq!(descriptor_of("[B"), "[B");
        assert_eq!(descriptor_of("[Ljava.lang.String;"), "[Ljava/lang/String;");
        assert_eq!(
            descriptor_of("org.jpmml.evaluator.Evaluator"),
            "Lorg/jpmml/evaluator/Evaluator;"
        );
    }

    #[test]
    fn test_scalar_acceptance_widening() {
        assert!(scalar_accepts("int", &JavaValue::Int(1)));
        assert!(scalar_accepts("long", &JavaValue::Int(1)));
        assert!(scalar_accepts("double", &JavaValue::Float(1.0)));
        assert!(!scalar_accepts("int", &JavaValue::Long(1)));
        assert!(!scalar_accepts("int", &JavaValue::Null));
        assert!(scalar_accepts("java.lang.String", &JavaValue::Null));
        assert!(scalar_accepts("[B", &JavaValue::Bytes(vec![1])));
        assert!(!scalar_accepts("[B", &JavaValue::String("x".to_string())));
    }

    #[test]
    fn test_registry_rejects_unknown_handle() {
        let registry = HandleRegistry::new();
        assert!(registry.get(ObjectHandle(7)).is_err());
    }

    #[test]
    fn test_slashed() {
        assert_eq!(slashed("java.io.File"), "java/io/File");
    }
}
