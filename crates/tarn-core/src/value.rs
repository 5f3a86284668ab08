use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::RuntimeError;
use crate::vm::VM;

/// Recover the guard from a poisoned lock. A container is poisoned when a
/// panic unwound while it was held; the data itself is still structurally
/// sound, so readers and writers keep going.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The discriminator of a runtime value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Null,
    Undefined,
    Bool,
    Int,
    Float,
    Rune,
    String,
    Bytes,
    Array,
    Map,
    Object,
    Func,
    NativeFunc,
    Enum,
    Class,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Null => "null",
            Type::Undefined => "undefined",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::Rune => "rune",
            Type::String => "string",
            Type::Bytes => "bytes",
            Type::Array => "array",
            Type::Map => "map",
            Type::Object => "object",
            Type::Func => "function",
            Type::NativeFunc => "native function",
            Type::Enum => "enum",
            Type::Class => "class",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared mutable array storage. Iteration snapshots the slice under the
/// read lock so in-loop mutation of the source is observed only through
/// index reads, never through the iteration sequence.
#[derive(Debug, Default)]
pub struct ArrayObject {
    values: RwLock<Vec<Value>>,
}

impl ArrayObject {
    pub fn new(values: Vec<Value>) -> Self {
        ArrayObject {
            values: RwLock::new(values),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Value>> {
        read_lock(&self.values)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<Value>> {
        write_lock(&self.values)
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Shared mutable map storage. Keys use identity equality (see `Value`'s
/// `PartialEq`): `Int(1)` and `Float(1.0)` are distinct keys.
#[derive(Debug, Default)]
pub struct MapObject {
    entries: RwLock<hashbrown::HashMap<Value, Value>>,
}

impl MapObject {
    pub fn new() -> Self {
        MapObject::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, hashbrown::HashMap<Value, Value>> {
        read_lock(&self.entries)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, hashbrown::HashMap<Value, Value>> {
        write_lock(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// A method exposed by a host object, dispatched by the call opcodes with
/// the receiver bound as `this`.
pub type NativeMethod = fn(Value, &[Value], &mut VM) -> Result<Value, RuntimeError>;

/// A host-provided object. Every capability is optional: the default
/// implementations expose nothing, and the VM falls back to laxer behavior
/// (missing properties read as `undefined`, writes fail as readonly).
pub trait NativeObject: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// The type name visible to scripts.
    fn type_name(&self) -> &str {
        "object"
    }

    fn get_property(&self, _name: &str, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
        Ok(None)
    }

    /// Returns false when the property is not writable.
    fn set_property(&self, _name: &str, _value: Value, _vm: &mut VM) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    fn get_index(&self, _index: i64, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
        Ok(None)
    }

    fn set_index(&self, _index: i64, _value: Value, _vm: &mut VM) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    fn get_method(&self, _name: &str) -> Option<NativeMethod> {
        None
    }

    /// Iteration values, when the object is enumerable.
    fn values(&self, _vm: &mut VM) -> Option<Result<Vec<Value>, RuntimeError>> {
        None
    }

    /// Index-iterable length, when the object supports it.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Deferred-cleanup hook, run when a frame holding this object as a
    /// finalizable exits.
    fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Custom equality against another value, when the object defines one.
    fn equals(&self, _other: &Value) -> Option<bool> {
        None
    }

    fn display(&self) -> String {
        format!("[{}]", self.type_name())
    }
}

/// A runtime value. Values are passed by copy; `Array`, `Map` and `Object`
/// copies share the underlying storage.
#[derive(Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Rune(char),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Array(Arc<ArrayObject>),
    Map(Arc<MapObject>),
    Object(Arc<dyn NativeObject>),
    /// Index into `Program.functions`.
    Func(usize),
    /// Index into the global native registry.
    NativeFunc(usize),
    /// Index into `Program.enums`.
    Enum(usize),
    /// Index into `Program.classes`.
    Class(usize),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Arc::new(ArrayObject::new(values)))
    }

    /// A new array of `size` slots, each initialized to `Null`. The code
    /// generator allocates literals this way and fills the slots with `set`.
    pub fn array_sized(size: usize) -> Value {
        Value::array(vec![Value::Null; size])
    }

    pub fn map() -> Value {
        Value::Map(Arc::new(MapObject::new()))
    }

    pub fn object(obj: Arc<dyn NativeObject>) -> Value {
        Value::Object(obj)
    }

    /// Rune arithmetic runs over the code point as `i64`; results outside
    /// the scalar range collapse to U+FFFD.
    pub fn rune_from_i64(n: i64) -> Value {
        Value::Rune(char::from_u32(n as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    pub fn type_of(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Undefined => Type::Undefined,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Rune(_) => Type::Rune,
            Value::String(_) => Type::String,
            Value::Bytes(_) => Type::Bytes,
            Value::Array(_) => Type::Array,
            Value::Map(_) => Type::Map,
            Value::Object(_) => Type::Object,
            Value::Func(_) => Type::Func,
            Value::NativeFunc(_) => Type::NativeFunc,
            Value::Enum(_) => Type::Enum,
            Value::Class(_) => Type::Class,
        }
    }

    pub fn to_int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Float(f) => *f as i64,
            Value::Rune(c) => *c as i64,
            Value::Bool(b) => *b as i64,
            _ => 0,
        }
    }

    pub fn to_float(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            Value::Rune(c) => *c as u32 as f64,
            _ => 0.0,
        }
    }

    /// The code point for rune arithmetic. Floats truncate.
    pub fn to_rune(&self) -> i64 {
        match self {
            Value::Rune(c) => *c as i64,
            Value::Int(n) => *n,
            Value::Float(f) => *f as i64,
            _ => 0,
        }
    }

    pub fn to_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Size charged against the allocation quota.
    pub fn size(&self) -> u64 {
        match self {
            Value::String(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
            Value::Null | Value::Undefined => 0,
            _ => 8,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_nil_or_empty(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Truthiness for `tjp`, `not` and `mob`: booleans are themselves,
    /// numbers are nonzero, everything else is "has a value".
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            _ => !self.is_nil_or_empty(),
        }
    }

    /// Script equality (`==`): value-based with numeric cross-comparison.
    /// `null == undefined` holds; aggregates compare by reference.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::Rune(a), Value::Int(b)) | (Value::Int(b), Value::Rune(a)) => {
                *a as i64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), other) => match a.equals(other) {
                Some(eq) => eq,
                None => match other {
                    Value::Object(b) => object_ptr(a) == object_ptr(b),
                    _ => false,
                },
            },
            (lhs, Value::Object(b)) => b.equals(lhs).unwrap_or(false),
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::NativeFunc(a), Value::NativeFunc(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => false,
        }
    }

    /// Script strict equality (`===`): `equals` plus an identical type tag.
    pub fn strict_equals(&self, other: &Value) -> bool {
        self.type_of() == other.type_of() && self.equals(other)
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, seen: &mut Vec<usize>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Undefined => f.write_str("undefined"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Rune(c) => write!(f, "{c}"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            Value::Array(a) => {
                let ptr = Arc::as_ptr(a) as usize;
                if seen.contains(&ptr) {
                    return f.write_str("[...]");
                }
                seen.push(ptr);
                let items = a.snapshot();
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt_nested(f, seen)?;
                }
                f.write_str("]")?;
                seen.pop();
                Ok(())
            }
            Value::Map(m) => {
                let ptr = Arc::as_ptr(m) as usize;
                if seen.contains(&ptr) {
                    return f.write_str("{...}");
                }
                seen.push(ptr);
                let entries: Vec<(Value, Value)> = m
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    k.fmt_nested(f, seen)?;
                    f.write_str(": ")?;
                    v.fmt_nested(f, seen)?;
                }
                f.write_str("}")?;
                seen.pop();
                Ok(())
            }
            Value::Object(o) => f.write_str(&o.display()),
            Value::Func(i) => write!(f, "[function {i}]"),
            Value::NativeFunc(i) => write!(f, "[native function {i}]"),
            Value::Enum(i) => write!(f, "[enum {i}]"),
            Value::Class(i) => write!(f, "[class {i}]"),
        }
    }
}

fn object_ptr(obj: &Arc<dyn NativeObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_of(), self)
    }
}

/// Identity equality: same type tag and same value, floats by bit pattern,
/// aggregates and objects by pointer. This is the map-key discipline, and
/// what the constant-pool deduplication uses. Script `==`/`===` live in
/// `equals` and `strict_equals`.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => object_ptr(a) == object_ptr(b),
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::NativeFunc(a), Value::NativeFunc(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.type_of() as u8).hash(state);
        match self {
            Value::Null | Value::Undefined => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Rune(c) => c.hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Array(a) => (Arc::as_ptr(a) as usize).hash(state),
            Value::Map(m) => (Arc::as_ptr(m) as usize).hash(state),
            Value::Object(o) => object_ptr(o).hash(state),
            Value::Func(i)
            | Value::NativeFunc(i)
            | Value::Enum(i)
            | Value::Class(i) => i.hash(state),
        }
    }
}
