use hashbrown::HashMap;

use crate::instruction::Instruction;
use crate::permissions::Permissions;
use crate::value::Value;

/// The immutable compiled artifact a VM executes. Function 0 is the global
/// initializer: it runs over the global register file before any other
/// entry point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub constants: Vec<Value>,
    pub functions: Vec<Function>,
    pub enums: Vec<EnumType>,
    pub classes: Vec<Class>,
    pub resources: HashMap<String, Vec<u8>>,
    /// Free-form compiler annotations.
    pub directives: Vec<String>,
    pub permissions: Permissions,
}

impl Program {
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.has(name)
    }

    pub fn resource(&self, name: &str) -> Option<&[u8]> {
        self.resources.get(name).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub name: String,
    pub index: usize,
    /// Mandatory parameter count.
    pub arguments: usize,
    pub optional_arguments: usize,
    pub exported: bool,
    pub directives: Vec<String>,
    /// Registers of the declaring frame that nested closures capture.
    pub closures: Vec<usize>,
    pub instructions: Vec<Instruction>,
    /// Register window size of a frame running this function.
    pub max_registers: usize,
    /// Source line per instruction, for stack traces. May be empty.
    pub positions: Vec<u32>,
}

impl Function {
    /// Source line for the instruction at `pc`, 0 when unmapped.
    pub fn line(&self, pc: usize) -> u32 {
        self.positions.get(pc).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumType {
    pub name: String,
    pub values: Vec<EnumValue>,
}

impl EnumType {
    pub fn value_by_name(&self, name: &str) -> Option<&EnumValue> {
        self.values.iter().find(|v| v.name == name)
    }
}

/// A named enum member pointing into the constant pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumValue {
    pub name: String,
    pub k_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Class {
    pub name: String,
    pub exported: bool,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

impl Class {
    /// Function index of a method, `constructor` included.
    pub fn method(&self, name: &str) -> Option<usize> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.func_index)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Field {
    pub name: String,
    pub exported: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Method {
    pub name: String,
    pub func_index: usize,
}
