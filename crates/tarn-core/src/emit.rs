use crate::instruction::{Address, Instruction, Op};
use crate::program::{Class, EnumType, EnumValue, Function, Program};
use crate::value::Value;

/// Builder for assembling a [`Program`] in memory. The code generator (and
/// the test suite) targets this instead of constructing the structs by
/// hand; the constant pool deduplicates by identity equality, so `1` and
/// `1.0` stay distinct entries.
#[derive(Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    /// Add a constant, deduplicating. Returns the pool index.
    pub fn constant(&mut self, value: Value) -> i32 {
        for (i, existing) in self.program.constants.iter().enumerate() {
            if *existing == value {
                return i as i32;
            }
        }
        let idx = self.program.constants.len();
        self.program.constants.push(value);
        idx as i32
    }

    /// Install a finished function and return its index. Function 0 is the
    /// global initializer.
    pub fn add_function(&mut self, builder: FunctionBuilder) -> usize {
        let index = self.program.functions.len();
        self.program.functions.push(builder.build(index));
        index
    }

    pub fn add_enum(&mut self, name: impl Into<String>, values: Vec<(String, i32)>) -> usize {
        let index = self.program.enums.len();
        self.program.enums.push(EnumType {
            name: name.into(),
            values: values
                .into_iter()
                .map(|(name, k_index)| EnumValue {
                    name,
                    k_index: k_index as usize,
                })
                .collect(),
        });
        index
    }

    pub fn add_class(&mut self, class: Class) -> usize {
        let index = self.program.classes.len();
        self.program.classes.push(class);
        index
    }

    pub fn add_resource(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.program.resources.insert(name.into(), data);
    }

    pub fn add_directive(&mut self, directive: impl Into<String>) {
        self.program.directives.push(directive.into());
    }

    pub fn add_permission(&mut self, name: impl Into<String>) {
        self.program.permissions.grant(name);
    }

    pub fn build(self) -> Program {
        self.program
    }
}

/// Builder for one function body. Jump targets are patched after the fact
/// with `patch_a`/`patch_b`/`patch_c`.
pub struct FunctionBuilder {
    name: String,
    arguments: usize,
    optional_arguments: usize,
    exported: bool,
    directives: Vec<String>,
    closures: Vec<usize>,
    max_registers: usize,
    instructions: Vec<Instruction>,
    positions: Vec<u32>,
    current_line: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, arguments: usize) -> Self {
        FunctionBuilder {
            name: name.into(),
            arguments,
            optional_arguments: 0,
            exported: false,
            directives: Vec::new(),
            closures: Vec::new(),
            max_registers: 0,
            instructions: Vec::new(),
            positions: Vec::new(),
            current_line: 0,
        }
    }

    pub fn optional(mut self, n: usize) -> Self {
        self.optional_arguments = n;
        self
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn registers(mut self, n: usize) -> Self {
        self.max_registers = n;
        self
    }

    /// Registers of this function's frames that nested closures capture.
    pub fn captures(mut self, registers: Vec<usize>) -> Self {
        self.closures = registers;
        self
    }

    pub fn directive(mut self, d: impl Into<String>) -> Self {
        self.directives.push(d.into());
        self
    }

    /// Source line recorded for subsequently emitted instructions.
    pub fn line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Append an instruction, returning its pc.
    pub fn emit(&mut self, op: Op, a: Address, b: Address, c: Address) -> usize {
        let pc = self.instructions.len();
        self.instructions.push(Instruction::new(op, a, b, c));
        self.positions.push(self.current_line);
        pc
    }

    pub fn current_pc(&self) -> usize {
        self.instructions.len()
    }

    pub fn patch_a(&mut self, pc: usize, value: i32) {
        self.instructions[pc].a.value = value;
    }

    pub fn patch_b(&mut self, pc: usize, value: i32) {
        self.instructions[pc].b.value = value;
    }

    pub fn patch_c(&mut self, pc: usize, value: i32) {
        self.instructions[pc].c.value = value;
    }

    fn build(self, index: usize) -> Function {
        Function {
            name: self.name,
            index,
            arguments: self.arguments,
            optional_arguments: self.optional_arguments,
            exported: self.exported,
            directives: self.directives,
            closures: self.closures,
            instructions: self.instructions,
            max_registers: self.max_registers,
            positions: self.positions,
        }
    }
}
