//! In-process backend with reflective dispatch.
//!
//! Every call resolves its target at call time: `Class.forName`, a
//! `getMethods` scan, `Method.invoke` with boxed arguments. Arrays go
//! through `java.lang.reflect.Array`. Slower than the direct path, but the
//! overload semantics are exactly the reflection API's own. Exceptions
//! thrown by the called code arrive wrapped in
//! `InvocationTargetException`; the cause is unwrapped before translation.

use std::collections::HashMap;
use std::path::PathBuf;

use jni::objects::{GlobalRef, JObject, JObjectArray, JThrowable, JValue};
use jni::sys::jsize;
use jni::JNIEnv;

use crate::backend::{Backend, BackendKind, JavaValue, ObjectHandle, SUPPORT_CLASS};
use crate::error::{BridgeError, JavaError};
use crate::jvm::{
    self, box_value, jni_failure, realize_object, select_constructor, select_method,
    unwrap_thrown, Dispatch, HandleRegistry,
};

/// Reflective backend over the process-global JVM.
pub struct NativeBackend {
    registry: HandleRegistry,
    classes: HashMap<String, GlobalRef>,
}

impl NativeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: HandleRegistry::new(),
            classes: HashMap::new(),
        }
    }

    /// Start the process-global JVM with the assembled classpath.
    ///
    /// # Errors
    ///
    /// Returns an error when a JVM is live, was already destroyed, or fails
    /// to start.
    pub fn create_runtime(user_classpath: &[PathBuf]) -> Result<(), BridgeError> {
        jvm::create_jvm(user_classpath)
    }

    /// Retire the process-global JVM. It cannot be restarted afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the JVM slot lock is poisoned.
    pub fn destroy_runtime() -> Result<(), BridgeError> {
        jvm::destroy_jvm()
    }

    /// Start the JVM unless one is live; after a cold start, probe that the
    /// evaluator support class resolves.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Classpath`] when the probe fails.
    pub fn ensure_runtime(user_classpath: &[PathBuf]) -> Result<(), BridgeError> {
        let cold = jvm::ensure_jvm(user_classpath)?;
        if cold {
            let mut probe = Self::new();
            jvm::with_env(|env| probe.class_ref(env, SUPPORT_CLASS).map(|_| ())).map_err(
                |e| {
                    BridgeError::Classpath(format!(
                        "JVM is up but {SUPPORT_CLASS} did not resolve; \
                         check the bundled jars: {e}"
                    ))
                },
            )?;
        }
        Ok(())
    }

    fn class_ref(&mut self, env: &mut JNIEnv, class_name: &str) -> Result<GlobalRef, BridgeError> {
        if let Some(global) = self.classes.get(class_name) {
            return Ok(global.clone());
        }
        let name = JObject::from(env.new_string(class_name).map_err(jni_failure)?);
        let result = env.call_static_method(
            "java/lang/Class",
            "forName",
            "(Ljava/lang/String;)Ljava/lang/Class;",
            &[JValue::Object(&name)],
        );
        let class = match unwrap_thrown(env, result) {
            Ok(value) => value.l().map_err(jni_failure)?,
            Err(BridgeError::Java(java)) => {
                return Err(BridgeError::Invocation {
                    class_name: class_name.to_string(),
                    detail: java.to_string(),
                })
            }
            Err(other) => return Err(other),
        };
        let global = env.new_global_ref(&class).map_err(jni_failure)?;
        self.classes.insert(class_name.to_string(), global.clone());
        Ok(global)
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn new_object(
        &mut self,
        class_name: &str,
        args: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        jvm::with_env(|env| {
            let class = self.class_ref(env, class_name)?;
            let selected = select_constructor(env, &self.registry, class.as_obj(), args)?
                .ok_or_else(|| no_applicable(class_name, "constructor", args.len()))?;

            let arg_array = JObject::from(boxed_array(env, &self.registry, args)?);
            let result = env.call_method(
                &selected.constructor,
                "newInstance",
                "([Ljava/lang/Object;)Ljava/lang/Object;",
                &[JValue::Object(&arg_array)],
            );
            let obj = lift_reflective(env, result)?.l().map_err(jni_failure)?;
            let global = env.new_global_ref(&obj).map_err(jni_failure)?;
            Ok(self.registry.insert(global))
        })
    }

    fn static_invoke(
        &mut self,
        class_name: &str,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError> {
        jvm::with_env(|env| {
            let class = self.class_ref(env, class_name)?;
            let selected =
                select_method(env, &self.registry, class.as_obj(), method, args, Dispatch::Static)?
                    .ok_or_else(|| no_applicable(class_name, method, args.len()))?;

            let null = JObject::null();
            reflective_invoke(env, &mut self.registry, &selected.method, &null, args)
        })
    }

    fn invoke(
        &mut self,
        target: ObjectHandle,
        method: &str,
        args: &[JavaValue],
    ) -> Result<JavaValue, BridgeError> {
        jvm::with_env(|env| {
            let target_obj = env
                .new_local_ref(self.registry.get(target)?.as_obj())
                .map_err(jni_failure)?;
            let class = env.get_object_class(&target_obj).map_err(jni_failure)?;
            let selected =
                select_method(env, &self.registry, &class, method, args, Dispatch::Instance)?
                    .ok_or_else(|| {
                        let class_name = jvm::object_class_name(env, &target_obj)
                            .unwrap_or_else(|| "java.lang.Object".to_string());
                        no_applicable(&class_name, method, args.len())
                    })?;

            reflective_invoke(env, &mut self.registry, &selected.method, &target_obj, args)
        })
    }

    fn new_array(
        &mut self,
        class_name: &str,
        values: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        jvm::with_env(|env| {
            let class = self.class_ref(env, class_name)?;
            let class_local = env
                .new_local_ref(class.as_obj())
                .map_err(jni_failure)?;
            let length = i32::try_from(values.len()).map_err(|_| {
                BridgeError::Transport("array length exceeds the JVM limit".to_string())
            })?;

            let result = env.call_static_method(
                "java/lang/reflect/Array",
                "newInstance",
                "(Ljava/lang/Class;I)Ljava/lang/Object;",
                &[JValue::Object(&class_local), JValue::Int(length)],
            );
            let array = unwrap_thrown(env, result)?.l().map_err(jni_failure)?;

            for (i, value) in values.iter().enumerate() {
                let element = box_value(env, &self.registry, value)?;
                let result = env.call_static_method(
                    "java/lang/reflect/Array",
                    "set",
                    "(Ljava/lang/Object;ILjava/lang/Object;)V",
                    &[
                        JValue::Object(&array),
                        JValue::Int(i as i32),
                        JValue::Object(&element),
                    ],
                );
                unwrap_thrown(env, result)?;
            }

            let global = env.new_global_ref(&array).map_err(jni_failure)?;
            Ok(self.registry.insert(global))
        })
    }
}

fn no_applicable(class_name: &str, member: &str, argc: usize) -> BridgeError {
    BridgeError::Invocation {
        class_name: class_name.to_string(),
        detail: format!("no applicable {member} taking {argc} arguments"),
    }
}

/// `Method.invoke` on a selected method, realizing the boxed result.
fn reflective_invoke(
    env: &mut JNIEnv,
    registry: &mut HandleRegistry,
    method: &JObject<'_>,
    target: &JObject<'_>,
    args: &[JavaValue],
) -> Result<JavaValue, BridgeError> {
    let arg_array = JObject::from(boxed_array(env, registry, args)?);
    let result = env.call_method(
        method,
        "invoke",
        "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;",
        &[JValue::Object(target), JValue::Object(&arg_array)],
    );
    let obj = lift_reflective(env, result)?.l().map_err(jni_failure)?;
    realize_object(env, registry, obj)
}

/// `Object[]` of boxed arguments for `invoke`/`newInstance`.
fn boxed_array<'local>(
    env: &mut JNIEnv<'local>,
    registry: &HandleRegistry,
    args: &[JavaValue],
) -> Result<JObjectArray<'local>, BridgeError> {
    let length = jsize::try_from(args.len()).map_err(|_| {
        BridgeError::Transport("argument list exceeds the JVM array limit".to_string())
    })?;
    let array = env
        .new_object_array(length, "java/lang/Object", &JObject::null())
        .map_err(jni_failure)?;
    for (i, arg) in args.iter().enumerate() {
        let boxed = box_value(env, registry, arg)?;
        let result = env.set_object_array_element(&array, i as jsize, &boxed);
        unwrap_thrown(env, result)?;
    }
    Ok(array)
}

/// Lift a reflective-call result, unwrapping the real cause out of
/// `InvocationTargetException` before translating.
fn lift_reflective<T>(
    env: &mut JNIEnv,
    result: jni::errors::Result<T>,
) -> Result<T, BridgeError> {
    match result {
        Ok(value) => Ok(value),
        Err(jni::errors::Error::JavaException) => {
            let throwable = env.exception_occurred().ok();
            let _ = env.exception_clear();
            let Some(throwable) = throwable else {
                return Err(BridgeError::Transport(
                    "JVM signaled an exception but none was pending".to_string(),
                ));
            };
            Err(BridgeError::Java(describe_cause_first(env, &throwable)))
        }
        Err(other) => Err(jni_failure(other)),
    }
}

fn describe_cause_first(env: &mut JNIEnv, throwable: &JThrowable) -> JavaError {
    let wrapped = env
        .is_instance_of(throwable, "java/lang/reflect/InvocationTargetException")
        .unwrap_or(false);
    if wrapped {
        if let Ok(cause) = env.call_method(throwable, "getCause", "()Ljava/lang/Throwable;", &[])
        {
            if let Ok(cause) = cause.l() {
                if !cause.is_null() {
                    return jvm::describe_throwable(env, &JThrowable::from(cause));
                }
            }
        }
        if env.exception_check().unwrap_or(false) {
            let _ = env.exception_clear();
        }
    }
    jvm::describe_throwable(env, throwable)
}
