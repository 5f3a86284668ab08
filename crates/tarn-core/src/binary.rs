//! Binary program codec: a 4-byte magic and format version, a
//! deduplicated string table, then the program sections in fixed order
//! (constants, functions, enums, classes, resources, directives,
//! permissions). All integers are little-endian. New optional sections
//! are appended, never inserted, so old readers keep working.

use hashbrown::HashMap;

use crate::error::BinaryError;
use crate::instruction::{Address, AddressKind, Instruction, Op};
use crate::program::{Class, EnumType, EnumValue, Field, Function, Method, Program};
use crate::value::Value;

pub const MAGIC: &[u8; 4] = b"TARN";
pub const VERSION: u32 = 1;

const VAL_NULL: u8 = 0x00;
const VAL_UNDEFINED: u8 = 0x01;
const VAL_BOOL: u8 = 0x02;
const VAL_INT: u8 = 0x03;
const VAL_FLOAT: u8 = 0x04;
const VAL_RUNE: u8 = 0x05;
const VAL_STRING: u8 = 0x06;
const VAL_BYTES: u8 = 0x07;

/// Builds a deduplicated string table for serialization.
struct StringTableBuilder {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringTableBuilder {
    fn new() -> Self {
        let mut b = StringTableBuilder {
            strings: Vec::new(),
            index: HashMap::new(),
        };
        b.intern(""); // index 0 = empty string
        b
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

// ── Writer ────────────────────────────────────────────────────────────

pub fn write(program: &Program) -> Result<Vec<u8>, BinaryError> {
    let mut stb = StringTableBuilder::new();
    let mut body = Vec::new();

    // constants
    body.extend_from_slice(&(program.constants.len() as u32).to_le_bytes());
    for value in &program.constants {
        write_value(value, &mut body, &mut stb)?;
    }

    // functions
    body.extend_from_slice(&(program.functions.len() as u32).to_le_bytes());
    for f in &program.functions {
        write_function(f, &mut body, &mut stb);
    }

    // enums
    body.extend_from_slice(&(program.enums.len() as u16).to_le_bytes());
    for e in &program.enums {
        body.extend_from_slice(&stb.intern(&e.name).to_le_bytes());
        body.extend_from_slice(&(e.values.len() as u16).to_le_bytes());
        for v in &e.values {
            body.extend_from_slice(&stb.intern(&v.name).to_le_bytes());
            body.extend_from_slice(&(v.k_index as u32).to_le_bytes());
        }
    }

    // classes
    body.extend_from_slice(&(program.classes.len() as u16).to_le_bytes());
    for c in &program.classes {
        body.extend_from_slice(&stb.intern(&c.name).to_le_bytes());
        body.push(c.exported as u8);
        body.extend_from_slice(&(c.fields.len() as u16).to_le_bytes());
        for field in &c.fields {
            body.extend_from_slice(&stb.intern(&field.name).to_le_bytes());
            body.push(field.exported as u8);
        }
        body.extend_from_slice(&(c.methods.len() as u16).to_le_bytes());
        for m in &c.methods {
            body.extend_from_slice(&stb.intern(&m.name).to_le_bytes());
            body.extend_from_slice(&(m.func_index as u32).to_le_bytes());
        }
    }

    // resources, sorted for deterministic output
    let mut resources: Vec<(&String, &Vec<u8>)> = program.resources.iter().collect();
    resources.sort_by_key(|(name, _)| name.as_str());
    body.extend_from_slice(&(resources.len() as u16).to_le_bytes());
    for (name, data) in resources {
        body.extend_from_slice(&stb.intern(name).to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
    }

    // directives
    body.extend_from_slice(&(program.directives.len() as u16).to_le_bytes());
    for d in &program.directives {
        body.extend_from_slice(&stb.intern(d).to_le_bytes());
    }

    // permissions, sorted
    let permissions = program.permissions.sorted();
    body.extend_from_slice(&(permissions.len() as u16).to_le_bytes());
    for p in permissions {
        body.extend_from_slice(&stb.intern(p).to_le_bytes());
    }

    // assemble: header, string table, body
    let mut out = Vec::with_capacity(body.len() + 64);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(stb.strings.len() as u32).to_le_bytes());
    for s in &stb.strings {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }
    out.extend_from_slice(&body);
    Ok(out)
}

fn write_function(f: &Function, buf: &mut Vec<u8>, stb: &mut StringTableBuilder) {
    buf.extend_from_slice(&stb.intern(&f.name).to_le_bytes());
    buf.extend_from_slice(&(f.arguments as u16).to_le_bytes());
    buf.extend_from_slice(&(f.optional_arguments as u16).to_le_bytes());
    buf.push(f.exported as u8);
    buf.extend_from_slice(&(f.directives.len() as u16).to_le_bytes());
    for d in &f.directives {
        buf.extend_from_slice(&stb.intern(d).to_le_bytes());
    }
    buf.extend_from_slice(&(f.closures.len() as u16).to_le_bytes());
    for c in &f.closures {
        buf.extend_from_slice(&(*c as u16).to_le_bytes());
    }
    buf.extend_from_slice(&(f.max_registers as u16).to_le_bytes());
    buf.extend_from_slice(&(f.instructions.len() as u32).to_le_bytes());
    for i in &f.instructions {
        buf.push(i.op as u8);
        for addr in [i.a, i.b, i.c] {
            buf.push(addr.kind as u8);
            buf.extend_from_slice(&addr.value.to_le_bytes());
        }
    }
    buf.extend_from_slice(&(f.positions.len() as u32).to_le_bytes());
    for p in &f.positions {
        buf.extend_from_slice(&p.to_le_bytes());
    }
}

fn write_value(
    value: &Value,
    buf: &mut Vec<u8>,
    stb: &mut StringTableBuilder,
) -> Result<(), BinaryError> {
    match value {
        Value::Null => buf.push(VAL_NULL),
        Value::Undefined => buf.push(VAL_UNDEFINED),
        Value::Bool(b) => {
            buf.push(VAL_BOOL);
            buf.push(*b as u8);
        }
        Value::Int(n) => {
            buf.push(VAL_INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(f) => {
            buf.push(VAL_FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Rune(c) => {
            buf.push(VAL_RUNE);
            buf.extend_from_slice(&(*c as u32).to_le_bytes());
        }
        Value::String(s) => {
            buf.push(VAL_STRING);
            buf.extend_from_slice(&stb.intern(s).to_le_bytes());
        }
        Value::Bytes(b) => {
            buf.push(VAL_BYTES);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        // runtime-only types cannot appear in a constant pool
        other => return Err(BinaryError::UnsupportedConstant(other.type_of().name())),
    }
    Ok(())
}

// ── Reader ────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, BinaryError> {
        if self.cursor >= self.data.len() {
            return Err(BinaryError::UnexpectedEof);
        }
        let v = self.data[self.cursor];
        self.cursor += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, BinaryError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BinaryError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, BinaryError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, BinaryError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, BinaryError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BinaryError> {
        if self.cursor + len > self.data.len() {
            return Err(BinaryError::UnexpectedEof);
        }
        let b = &self.data[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(b)
    }
}

pub fn read(data: &[u8]) -> Result<Program, BinaryError> {
    let mut r = Reader { data, cursor: 0 };
    if r.take(4)? != MAGIC {
        return Err(BinaryError::InvalidHeader);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(BinaryError::UnsupportedVersion(version));
    }

    // string table
    let count = r.u32()? as usize;
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r.u32()? as usize;
        let bytes = r.take(len)?;
        table.push(String::from_utf8_lossy(bytes).into_owned());
    }
    let string_at = |idx: u32| -> Result<String, BinaryError> {
        table
            .get(idx as usize)
            .cloned()
            .ok_or(BinaryError::BadStringIndex(idx))
    };

    let mut program = Program::default();

    // constants
    let count = r.u32()? as usize;
    for _ in 0..count {
        program.constants.push(read_value(&mut r, &string_at)?);
    }

    // functions
    let count = r.u32()? as usize;
    for index in 0..count {
        program.functions.push(read_function(&mut r, index, &string_at)?);
    }

    // enums
    let count = r.u16()? as usize;
    for _ in 0..count {
        let name = string_at(r.u32()?)?;
        let n_values = r.u16()? as usize;
        let mut values = Vec::with_capacity(n_values);
        for _ in 0..n_values {
            let name = string_at(r.u32()?)?;
            let k_index = r.u32()? as usize;
            values.push(EnumValue { name, k_index });
        }
        program.enums.push(EnumType { name, values });
    }

    // classes
    let count = r.u16()? as usize;
    for _ in 0..count {
        let name = string_at(r.u32()?)?;
        let exported = r.u8()? != 0;
        let n_fields = r.u16()? as usize;
        let mut fields = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let name = string_at(r.u32()?)?;
            let exported = r.u8()? != 0;
            fields.push(Field { name, exported });
        }
        let n_methods = r.u16()? as usize;
        let mut methods = Vec::with_capacity(n_methods);
        for _ in 0..n_methods {
            let name = string_at(r.u32()?)?;
            let func_index = r.u32()? as usize;
            methods.push(Method { name, func_index });
        }
        program.classes.push(Class {
            name,
            exported,
            fields,
            methods,
        });
    }

    // resources
    let count = r.u16()? as usize;
    for _ in 0..count {
        let name = string_at(r.u32()?)?;
        let len = r.u32()? as usize;
        let data = r.take(len)?.to_vec();
        program.resources.insert(name, data);
    }

    // directives
    let count = r.u16()? as usize;
    for _ in 0..count {
        program.directives.push(string_at(r.u32()?)?);
    }

    // permissions
    let count = r.u16()? as usize;
    for _ in 0..count {
        program.permissions.grant(string_at(r.u32()?)?);
    }

    Ok(program)
}

fn read_function(
    r: &mut Reader<'_>,
    index: usize,
    string_at: &impl Fn(u32) -> Result<String, BinaryError>,
) -> Result<Function, BinaryError> {
    let name = string_at(r.u32()?)?;
    let arguments = r.u16()? as usize;
    let optional_arguments = r.u16()? as usize;
    let exported = r.u8()? != 0;
    let n_directives = r.u16()? as usize;
    let mut directives = Vec::with_capacity(n_directives);
    for _ in 0..n_directives {
        directives.push(string_at(r.u32()?)?);
    }
    let n_closures = r.u16()? as usize;
    let mut closures = Vec::with_capacity(n_closures);
    for _ in 0..n_closures {
        closures.push(r.u16()? as usize);
    }
    let max_registers = r.u16()? as usize;
    let n_instructions = r.u32()? as usize;
    let mut instructions = Vec::with_capacity(n_instructions);
    for _ in 0..n_instructions {
        let raw = r.u8()?;
        let op = Op::from_u8(raw).ok_or(BinaryError::UnknownOpcode(raw))?;
        let mut operands = [Address::VOID; 3];
        for addr in operands.iter_mut() {
            let raw = r.u8()?;
            let kind = AddressKind::from_u8(raw).ok_or(BinaryError::UnknownAddressKind(raw))?;
            let value = r.i32()?;
            *addr = Address { kind, value };
        }
        instructions.push(Instruction::new(op, operands[0], operands[1], operands[2]));
    }
    let n_positions = r.u32()? as usize;
    let mut positions = Vec::with_capacity(n_positions);
    for _ in 0..n_positions {
        positions.push(r.u32()?);
    }
    Ok(Function {
        name,
        index,
        arguments,
        optional_arguments,
        exported,
        directives,
        closures,
        instructions,
        max_registers,
        positions,
    })
}

fn read_value(
    r: &mut Reader<'_>,
    string_at: &impl Fn(u32) -> Result<String, BinaryError>,
) -> Result<Value, BinaryError> {
    let tag = r.u8()?;
    match tag {
        VAL_NULL => Ok(Value::Null),
        VAL_UNDEFINED => Ok(Value::Undefined),
        VAL_BOOL => Ok(Value::Bool(r.u8()? != 0)),
        VAL_INT => Ok(Value::Int(r.i64()?)),
        VAL_FLOAT => Ok(Value::Float(r.f64()?)),
        VAL_RUNE => {
            let cp = r.u32()?;
            char::from_u32(cp)
                .map(Value::Rune)
                .ok_or(BinaryError::InvalidRune(cp))
        }
        VAL_STRING => Ok(Value::string(string_at(r.u32()?)?)),
        VAL_BYTES => {
            let len = r.u32()? as usize;
            Ok(Value::bytes(r.take(len)?.to_vec()))
        }
        other => Err(BinaryError::UnknownValueTag(other)),
    }
}
