//! The global native-function table `NativeFunc` values index into, plus
//! the core natives the runtime semantics depend on (`errors.*`,
//! `runtime.*`). Hosts register their own libraries before compiling or
//! loading programs so the indices baked into bytecode stay stable.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{ErrorObject, RuntimeError};
use crate::permissions::TRUSTED;
use crate::value::Value;
use crate::vm::VM;

pub type NativeFn = fn(Value, &[Value], &mut VM) -> Result<Value, RuntimeError>;

/// A host function callable from bytecode.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    /// Fixed argument count, or -1 for variadic.
    pub arguments: i32,
    pub function: NativeFn,
}

static REGISTRY: OnceLock<RwLock<Vec<NativeFunction>>> = OnceLock::new();

fn registry() -> &'static RwLock<Vec<NativeFunction>> {
    REGISTRY.get_or_init(|| RwLock::new(core_natives()))
}

/// Register a native function and return its table index. Registering a
/// name twice returns the existing index unchanged.
pub fn register_native(f: NativeFunction) -> usize {
    let mut table = registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(index) = table.iter().position(|n| n.name == f.name) {
        return index;
    }
    table.push(f);
    table.len() - 1
}

pub fn native(index: usize) -> Option<NativeFunction> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(index)
        .cloned()
}

pub fn native_index(name: &str) -> Option<usize> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .position(|n| n.name == name)
}

fn core_natives() -> Vec<NativeFunction> {
    vec![
        NativeFunction {
            name: "errors.newError",
            arguments: 1,
            function: errors_new_error,
        },
        NativeFunction {
            name: "errors.rethrow",
            arguments: 1,
            function: errors_rethrow,
        },
        NativeFunction {
            name: "errors.is",
            arguments: 2,
            function: errors_is,
        },
        NativeFunction {
            name: "errors.wrap",
            arguments: -1,
            function: errors_wrap,
        },
        NativeFunction {
            name: "errors.public",
            arguments: -1,
            function: errors_public,
        },
        NativeFunction {
            name: "runtime.defer",
            arguments: 1,
            function: runtime_defer,
        },
        NativeFunction {
            name: "runtime.steps",
            arguments: 0,
            function: runtime_steps,
        },
        NativeFunction {
            name: "runtime.resetSteps",
            arguments: 0,
            function: runtime_reset_steps,
        },
        NativeFunction {
            name: "runtime.panic",
            arguments: 1,
            function: runtime_panic,
        },
    ]
}

fn errors_new_error(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    let err = vm.new_error(args[0].to_string());
    Ok(Value::Object(Arc::new(ErrorObject::new(err))))
}

/// Raise the given error again without touching its stored stack trace.
fn errors_rethrow(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Object(obj) => match obj.as_any().downcast_ref::<ErrorObject>() {
            Some(e) => {
                e.set_rethrow();
                Err(e.error())
            }
            None => Err(vm.new_error(format!("Expected error, got {}", args[0]))),
        },
        other => Err(vm.new_error(format!("Expected error, got {other}"))),
    }
}

fn errors_is(_this: Value, args: &[Value], _vm: &mut VM) -> Result<Value, RuntimeError> {
    let matched = match (&args[0], &args[1]) {
        (Value::Object(obj), Value::String(message)) => obj
            .as_any()
            .downcast_ref::<ErrorObject>()
            .map(|e| e.error().is(message))
            .unwrap_or(false),
        _ => false,
    };
    Ok(Value::Bool(matched))
}

fn wrap_with_inner(
    public: bool,
    args: &[Value],
    vm: &mut VM,
) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(vm.new_error(format!("expected 1 or 2 parameters, got {}", args.len())));
    }
    let message = match &args[0] {
        Value::String(s) => s.to_string(),
        other => {
            return Err(vm.new_error(format!(
                "expected parameter 1 to be a string, got {}",
                other.type_of()
            )))
        }
    };
    let mut err = if public {
        vm.new_public_error(message)
    } else {
        vm.new_error(message)
    };
    if let Some(inner) = args.get(1) {
        match inner {
            Value::Null | Value::Undefined => {}
            Value::String(s) => err.wrap(vm.new_error(s.to_string())),
            Value::Object(obj) => match obj.as_any().downcast_ref::<ErrorObject>() {
                Some(e) => err.wrap(e.error()),
                None => {
                    return Err(vm.new_error(format!(
                        "expected parameter 2 to be an error, got {}",
                        inner.type_of()
                    )))
                }
            },
            other => {
                return Err(vm.new_error(format!(
                    "expected parameter 2 to be an error, got {}",
                    other.type_of()
                )))
            }
        }
    }
    Ok(Value::Object(Arc::new(ErrorObject::new(err))))
}

fn errors_wrap(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    wrap_with_inner(false, args, vm)
}

fn errors_public(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    wrap_with_inner(true, args, vm)
}

fn runtime_defer(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    vm.defer(args[0].clone())?;
    Ok(Value::Null)
}

fn runtime_steps(_this: Value, _args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    Ok(Value::Int(vm.steps() as i64))
}

fn runtime_reset_steps(_this: Value, _args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    vm.require_permission(TRUSTED)?;
    vm.reset_steps();
    Ok(Value::Null)
}

fn runtime_panic(_this: Value, args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    vm.require_permission(TRUSTED)?;
    panic!("{}", args[0]);
}
