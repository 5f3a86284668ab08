//! The Tarn runtime: a register-based bytecode virtual machine with
//! closures, structured exception handling, host-object dispatch, a
//! binary program format and quota-enforced resource limits. The surface
//! language compiler is an external collaborator; it produces a
//! [`Program`] (usually through [`ProgramBuilder`]) and the VM executes
//! it.

pub mod binary;
pub mod disasm;
pub mod emit;
pub mod error;
pub mod instruction;
pub mod native;
mod ops;
pub mod permissions;
pub mod program;
pub mod value;
pub mod vm;

pub use disasm::disassemble;
pub use emit::{FunctionBuilder, ProgramBuilder};
pub use error::{BinaryError, ErrorObject, RuntimeError};
pub use instruction::{Address, AddressKind, Instruction, Op};
pub use native::{native_index, register_native, NativeFn, NativeFunction};
pub use permissions::{Permissions, TRUSTED};
pub use program::{Class, EnumType, EnumValue, Field, Function, Method, Program};
pub use value::{ArrayObject, MapObject, NativeMethod, NativeObject, Type, Value};
pub use vm::{BoundMethod, BoundNativeMethod, Closure, ClosureRegister, Instance, VM};
