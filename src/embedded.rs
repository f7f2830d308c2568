//! In-process backend with direct JNI dispatch.
//!
//! The first call to any (class, member, argument shape) triple resolves the
//! overload reflectively and records a call plan: the declared parameter
//! types plus the JNI signature built from them. Every later call with the
//! same shape skips the scan and goes straight through the checked JNI entry
//! points. Thrown exceptions are popped off the env and translated before
//! returning.

use std::collections::HashMap;
use std::path::PathBuf;

use jni::objects::{GlobalRef, JObject, JValue, JValueOwned};
use jni::sys::jsize;
use jni::JNIEnv;

use crate::backend::{Backend, BackendKind, JavaValue, ObjectHandle, SUPPORT_CLASS};
use crate::error::BridgeError;
use crate::jvm::{
    self, box_value, descriptor_of, jni_failure, realize_object, select_constructor,
    select_method, unwrap_thrown, Dispatch, HandleRegistry,
};

/// Call-plan cache key: the argument fingerprint distinguishes overloads by
/// the runtime classes of object arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey {
    class: String,
    member: String,
    fingerprint: String,
}

#[derive(Debug, Clone)]
struct CallPlan {
    param_types: Vec<String>,
    signature: String,
    return_type: String,
}

/// Direct-dispatch backend over the process-global JVM.
pub struct EmbeddedBackend {
    registry: HandleRegistry,
    classes: HashMap<String, GlobalRef>,
    plans: HashMap<CallKey, CallPlan>,
}

impl EmbeddedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: HandleRegistry::new(),
            classes: HashMap::new(),
            plans: HashMap::new(),
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
            jvm::with_env(|env| {
                if env.find_class(jvm::slashed(SUPPORT_CLASS)).is_err() {
                    let detail = jvm::take_pending(env)
                        .map(|java| java.to_string())
                        .unwrap_or_else(|| "class not found".to_string());
                    return Err(BridgeError::Classpath(format!(
                        "JVM is up but {SUPPORT_CLASS} did not resolve; \
                         check the bundled jars: {detail}"
                    )));
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn class_ref(&mut self, env: &mut JNIEnv, class_name: &str) -> Result<GlobalRef, BridgeError> {
        if let Some(global) = self.classes.get(class_name) {
            return Ok(global.clone());
        }
        let class = match env.find_class(jvm::slashed(class_name)) {
            Ok(class) => class,
            Err(e) => {
                let detail = jvm::take_pending(env)
                    .map(|java| java.to_string())
                    .unwrap_or_else(|| e.to_string());
                return Err(BridgeError::Invocation {
                    class_name: class_name.to_string(),
                    detail,
                });
            }
        };
        let global = env.new_global_ref(&class).map_err(jni_failure)?;
        self.classes.insert(class_name.to_string(), global.clone());
        Ok(global)
    }

    fn method_plan(
        &mut self,
        env: &mut JNIEnv,
        class_name: &str,
        class: &JObject<'_>,
        method: &str,
        args: &[JavaValue],
        dispatch: Dispatch,
    ) -> Result<CallPlan, BridgeError> {
        let key = CallKey {
            class: class_name.to_string(),
            member: method.to_string(),
            fingerprint: self.fingerprint(env, args)?,
        };
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan.clone());
        }

        let selected = select_method(env, &self.registry, class, method, args, dispatch)?
            .ok_or_else(|| BridgeError::Invocation {
                class_name: class_name.to_string(),
                detail: format!("no applicable method {method} taking {} arguments", args.len()),
            })?;
        let plan = CallPlan {
            signature: build_signature(&selected.param_types, &selected.return_type),
            param_types: selected.param_types,
            return_type: selected.return_type,
        };
        self.plans.insert(key, plan.clone());
        Ok(plan)
    }

    fn constructor_plan(
        &mut self,
        env: &mut JNIEnv,
        class_name: &str,
        class: &JObject<'_>,
        args: &[JavaValue],
    ) -> Result<CallPlan, BridgeError> {
        let key = CallKey {
            class: class_name.to_string(),
            member: "<init>".to_string(),
            fingerprint: self.fingerprint(env, args)?,
        };
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan.clone());
        }

        let selected = select_constructor(env, &self.registry, class, args)?.ok_or_else(|| {
            BridgeError::Invocation {
                class_name: class_name.to_string(),
                detail: format!("no applicable constructor taking {} arguments", args.len()),
            }
        })?;
        let plan = CallPlan {
            signature: build_signature(&selected.param_types, "void"),
            param_types: selected.param_types,
            return_type: "void".to_string(),
        };
        self.plans.insert(key, plan.clone());
        Ok(plan)
    }

    /// Overload fingerprint of an argument list: scalar kinds plus the
    /// runtime class names of object arguments.
    fn fingerprint(&self, env: &mut JNIEnv, args: &[JavaValue]) -> Result<String, BridgeError> {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            let part = match arg {
                JavaValue::Object(handle) => {
                    let global = self.registry.get(*handle)?;
                    jvm::object_class_name(env, global.as_obj())
                        .unwrap_or_else(|| "java.lang.Object".to_string())
                }
                other => other.kind().to_string(),
            };
            parts.push(part);
        }
        Ok(parts.join(","))
    }
}

impl Default for EmbeddedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn new_object(
        &mut self,
        class_name: &str,
        args: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        jvm::with_env(|env| {
            let class = self.class_ref(env, class_name)?;
            let plan = self.constructor_plan(env, class_name, class.as_obj(), args)?;
            let locals = build_locals(env, &self.registry, &plan.param_types, args)?;
            let jargs = assemble_args(&plan.param_types, args, &locals)?;

            let result = env.new_object(jvm::slashed(class_name), &plan.signature, &jargs);
            let obj = unwrap_thrown(env, result)?;
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
            let plan =
                self.method_plan(env, class_name, class.as_obj(), method, args, Dispatch::Static)?;
            let locals = build_locals(env, &self.registry, &plan.param_types, args)?;
            let jargs = assemble_args(&plan.param_types, args, &locals)?;

            let result =
                env.call_static_method(jvm::slashed(class_name), method, &plan.signature, &jargs);
            let value = unwrap_thrown(env, result)?;
            realize_result(env, &mut self.registry, value, &plan.return_type)
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
            let class_name = jvm::object_class_name(env, &target_obj)
                .unwrap_or_else(|| "java.lang.Object".to_string());

            let plan =
                self.method_plan(env, &class_name, &class, method, args, Dispatch::Instance)?;
            let locals = build_locals(env, &self.registry, &plan.param_types, args)?;
            let jargs = assemble_args(&plan.param_types, args, &locals)?;

            let result = env.call_method(&target_obj, method, &plan.signature, &jargs);
            let value = unwrap_thrown(env, result)?;
            realize_result(env, &mut self.registry, value, &plan.return_type)
        })
    }

    fn new_array(
        &mut self,
        class_name: &str,
        values: &[JavaValue],
    ) -> Result<ObjectHandle, BridgeError> {
        jvm::with_env(|env| {
            // Resolve through the cache first so a bad class name reports as
            // a resolution failure rather than a JNI error.
            let _ = self.class_ref(env, class_name)?;

            let length = jsize::try_from(values.len()).map_err(|_| {
                BridgeError::Transport("array length exceeds the JVM limit".to_string())
            })?;
            let array = env
                .new_object_array(length, jvm::slashed(class_name), &JObject::null())
                .map_err(jni_failure)?;
            for (i, value) in values.iter().enumerate() {
                let element = box_value(env, &self.registry, value)?;
                let result = env.set_object_array_element(&array, i as jsize, &element);
                unwrap_thrown(env, result)?;
            }
            let global = env.new_global_ref(&array).map_err(jni_failure)?;
            Ok(self.registry.insert(global))
        })
    }
}

/// Materialize local references for the reference-typed argument slots;
/// primitive slots stay `None` and travel as raw scalars.
fn build_locals<'local>(
    env: &mut JNIEnv<'local>,
    registry: &HandleRegistry,
    param_types: &[String],
    args: &[JavaValue],
) -> Result<Vec<Option<JObject<'local>>>, BridgeError> {
    param_types
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            if jvm::is_primitive(param) {
                Ok(None)
            } else {
                box_value(env, registry, arg).map(Some)
            }
        })
        .collect()
}

fn assemble_args<'local, 'a>(
    param_types: &[String],
    args: &[JavaValue],
    locals: &'a [Option<JObject<'local>>],
) -> Result<Vec<JValue<'local, 'a>>, BridgeError> {
    let mut out = Vec::with_capacity(args.len());
    for ((param, arg), local) in param_types.iter().zip(args).zip(locals) {
        match local {
            Some(obj) => out.push(JValue::Object(obj)),
            None => out.push(primitive_arg(param, arg)?),
        }
    }
    Ok(out)
}

/// Scalar argument for a primitive parameter slot, widening where Java
/// would.
fn primitive_arg<'local, 'a>(
    param: &str,
    arg: &JavaValue,
) -> Result<JValue<'local, 'a>, BridgeError> {
    let value = match (param, arg) {
        ("boolean", JavaValue::Bool(b)) => JValue::Bool(u8::from(*b)),
        ("int", JavaValue::Int(i)) => JValue::Int(*i),
        ("long", JavaValue::Int(i)) => JValue::Long(i64::from(*i)),
        ("long", JavaValue::Long(l)) => JValue::Long(*l),
        ("float", JavaValue::Float(f)) => JValue::Float(*f),
        ("double", JavaValue::Float(f)) => JValue::Double(f64::from(*f)),
        ("double", JavaValue::Double(d)) => JValue::Double(*d),
        ("double", JavaValue::Int(i)) => JValue::Double(f64::from(*i)),
        _ => {
            return Err(BridgeError::Transport(format!(
                "cannot pass a {} argument as {param}",
                arg.kind()
            )))
        }
    };
    Ok(value)
}

/// Convert a checked-call result according to the declared return type.
fn realize_result<'local>(
    env: &mut JNIEnv<'local>,
    registry: &mut HandleRegistry,
    value: JValueOwned<'local>,
    return_type: &str,
) -> Result<JavaValue, BridgeError> {
    match return_type {
        "void" => {
            value.v().map_err(jni_failure)?;
            Ok(JavaValue::Null)
        }
        "boolean" => Ok(JavaValue::Bool(value.z().map_err(jni_failure)?)),
        "byte" => Ok(JavaValue::Int(i32::from(value.b().map_err(jni_failure)?))),
        "short" => Ok(JavaValue::Int(i32::from(value.s().map_err(jni_failure)?))),
        "int" => Ok(JavaValue::Int(value.i().map_err(jni_failure)?)),
        "long" => Ok(JavaValue::Long(value.j().map_err(jni_failure)?)),
        "float" => Ok(JavaValue::Float(value.f().map_err(jni_failure)?)),
        "double" => Ok(JavaValue::Double(value.d().map_err(jni_failure)?)),
        "char" => {
            let c = value.c().map_err(jni_failure)?;
            let c = char::from_u32(u32::from(c)).unwrap_or(char::REPLACEMENT_CHARACTER);
            Ok(JavaValue::String(c.to_string()))
        }
        _ => {
            let obj = value.l().map_err(jni_failure)?;
            realize_object(env, registry, obj)
        }
    }
}

fn build_signature(param_types: &[String], return_type: &str) -> String {
    let mut sig = String::from("(");
    for param in param_types {
        sig.push_str(&descriptor_of(param));
    }
    sig.push(')');
    sig.push_str(&descriptor_of(return_type));
    sig
}
