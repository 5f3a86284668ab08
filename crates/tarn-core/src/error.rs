use std::any::Any;
use std::fmt;
use std::sync::RwLock;

use crate::value::{read_lock, write_lock, NativeMethod, NativeObject, Value};
use crate::vm::VM;

/// A script-visible error: what `throw` raises, what a catch register
/// receives (wrapped in an [`ErrorObject`]), and what the VM's entry points
/// return on failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    /// Safe to show to an end user (set by `errors.public`).
    pub public: bool,
    /// Program counter at the point the error was raised.
    pub pc: usize,
    /// One line per live frame, `<funcName>:<sourceLine>`.
    pub stack_trace: String,
    /// A rethrown error keeps its original stack trace.
    pub is_rethrow: bool,
    pub wrapped: Option<Box<RuntimeError>>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Message match against this error or any error it wraps.
    pub fn is(&self, message: &str) -> bool {
        if self.message == message {
            return true;
        }
        match &self.wrapped {
            Some(inner) => inner.is(message),
            None => false,
        }
    }

    pub fn wrap(&mut self, inner: RuntimeError) {
        self.wrapped = Some(Box::new(inner));
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// The host-object form of a [`RuntimeError`], stored into the catch
/// register on a handled throw. `errors.rethrow` flips the rethrow flag on
/// the shared object, so the inner state is lock-guarded.
pub struct ErrorObject {
    inner: RwLock<RuntimeError>,
}

impl ErrorObject {
    pub fn new(err: RuntimeError) -> Self {
        ErrorObject {
            inner: RwLock::new(err),
        }
    }

    pub fn error(&self) -> RuntimeError {
        read_lock(&self.inner).clone()
    }

    pub fn set_rethrow(&self) {
        write_lock(&self.inner).is_rethrow = true;
    }
}

fn error_is(this: Value, args: &[Value], _vm: &mut VM) -> Result<Value, RuntimeError> {
    let matched = match (&this, args.first()) {
        (Value::Object(obj), Some(Value::String(msg))) => obj
            .as_any()
            .downcast_ref::<ErrorObject>()
            .map(|e| e.error().is(msg))
            .unwrap_or(false),
        _ => false,
    };
    Ok(Value::Bool(matched))
}

fn error_to_string(this: Value, _args: &[Value], _vm: &mut VM) -> Result<Value, RuntimeError> {
    Ok(Value::string(this.to_string()))
}

impl NativeObject for ErrorObject {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &str {
        "error"
    }

    fn get_property(&self, name: &str, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
        let err = read_lock(&self.inner);
        let value = match name {
            "message" => Value::string(err.message.clone()),
            "public" => Value::Bool(err.public),
            "pc" => Value::Int(err.pc as i64),
            "stackTrace" => Value::string(err.stack_trace.clone()),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn get_method(&self, name: &str) -> Option<NativeMethod> {
        match name {
            "is" => Some(error_is),
            "toString" => Some(error_to_string),
            _ => None,
        }
    }

    fn display(&self) -> String {
        read_lock(&self.inner).message.clone()
    }
}

/// Failures of the binary program codec. `InvalidHeader` is the signal
/// callers use to fall back to source compilation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinaryError {
    #[error("invalid binary header")]
    InvalidHeader,
    #[error("unsupported binary format version {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of program data")]
    UnexpectedEof,
    #[error("unknown value tag 0x{0:02x} in program data")]
    UnknownValueTag(u8),
    #[error("unknown opcode 0x{0:02x} in program data")]
    UnknownOpcode(u8),
    #[error("unknown address kind 0x{0:02x} in program data")]
    UnknownAddressKind(u8),
    #[error("string table index {0} out of range")]
    BadStringIndex(u32),
    #[error("invalid unicode code point {0}")]
    InvalidRune(u32),
    #[error("cannot serialize a {0} constant")]
    UnsupportedConstant(&'static str),
}
