use std::fmt;

/// Opcodes of the register machine. Each instruction carries three
/// addressed operands A, B, C; unused operands are `Void`.
///
/// Jump conventions: `jmp`, `ejp`, `djp` and `tjp` advance the pc by their
/// offset *in addition to* the implicit advance past the instruction;
/// `jpb` and the optional-chaining jumps (`gto`, `cco`, `cso` via reg0)
/// adjust the pc exactly; `try` operands and the pcs stored on a guard are
/// absolute.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// A := constants[B]
    Ldk = 0,
    /// A := B
    Mov,
    /// A := B, C := truthiness of B
    Mob,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Bor,
    Band,
    Bxor,
    Lsh,
    Rsh,
    /// A := A + 1, in place
    Inc,
    /// A := A - 1, in place
    Dec,
    /// A := -B
    Unm,
    /// A := !B
    Not,
    /// A := ~B, int only
    Bnt,
    /// scratch register A (only reg0) := immediate B
    Str,
    /// new instance: A class, B dest, C argument array
    New,
    /// new instance with a single argument in C
    Nes,
    /// A := new array of B slots
    Arr,
    /// A := new map (B is a size hint)
    Map,
    /// A := iteration keys/indices of B
    Key,
    /// A := iteration values of B (snapshot)
    Val,
    /// A := length of B
    Len,
    /// A := enums[B].values[C]
    Enu,
    /// A := B[C]
    Get,
    /// optional-chaining get: jumps by reg0 when B is nullish
    Gto,
    /// A[B] := C
    Set,
    /// spread the last element of array A
    Spa,
    /// pc += A
    Jmp,
    /// pc -= A
    Jpb,
    /// pc += C when A == B
    Ejp,
    /// pc += C when A != B
    Djp,
    /// truthiness test on A, jump B; C selects the mode
    Tjp,
    Eql,
    Neq,
    Seq,
    Sne,
    Lst,
    Lse,
    /// call: A callee, B dest, C argument array
    Cal,
    /// optional-chaining call
    Cco,
    /// call with the single argument in C
    Cas,
    /// optional-chaining call with a single argument
    Cso,
    /// read native property: A := B()
    Rnp,
    /// return A
    Ret,
    /// A := closure over function B
    Clo,
    /// throw A
    Trw,
    /// push guard: A catch pc, B error register, C finally pc
    Try,
    /// try-body end
    Tre,
    /// catch-body end (emitted only without a finally)
    Cen,
    /// finally end
    Fen,
    /// abrupt exit from a guarded region (return/break/continue)
    Trx,
    /// delete key B from map A
    Del,
}

impl Op {
    /// Convert a raw byte to an Op. Valid because the enum is `#[repr(u8)]`
    /// with dense variants from 0 through `Del`.
    pub fn from_u8(byte: u8) -> Option<Op> {
        if byte <= Op::Del as u8 {
            // SAFETY: Op is #[repr(u8)] with dense, contiguous variants 0..=Del.
            Some(unsafe { std::mem::transmute::<u8, Op>(byte) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Ldk => "ldk",
            Op::Mov => "mov",
            Op::Mob => "mob",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Bor => "bor",
            Op::Band => "band",
            Op::Bxor => "bxor",
            Op::Lsh => "lsh",
            Op::Rsh => "rsh",
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Unm => "unm",
            Op::Not => "not",
            Op::Bnt => "bnt",
            Op::Str => "str",
            Op::New => "new",
            Op::Nes => "nes",
            Op::Arr => "arr",
            Op::Map => "map",
            Op::Key => "key",
            Op::Val => "val",
            Op::Len => "len",
            Op::Enu => "enu",
            Op::Get => "get",
            Op::Gto => "gto",
            Op::Set => "set",
            Op::Spa => "spa",
            Op::Jmp => "jmp",
            Op::Jpb => "jpb",
            Op::Ejp => "ejp",
            Op::Djp => "djp",
            Op::Tjp => "tjp",
            Op::Eql => "eql",
            Op::Neq => "neq",
            Op::Seq => "seq",
            Op::Sne => "sne",
            Op::Lst => "lst",
            Op::Lse => "lse",
            Op::Cal => "cal",
            Op::Cco => "cco",
            Op::Cas => "cas",
            Op::Cso => "cso",
            Op::Rnp => "rnp",
            Op::Ret => "ret",
            Op::Clo => "clo",
            Op::Trw => "trw",
            Op::Try => "try",
            Op::Tre => "tre",
            Op::Cen => "cen",
            Op::Fen => "fen",
            Op::Trx => "trx",
            Op::Del => "del",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The address space an operand indexes into.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Unused operand.
    Void = 0,
    /// Register of the current frame.
    Local,
    /// Register of the global file.
    Global,
    /// Program constant pool.
    Constant,
    /// Captured register, by index into the frame's closure list.
    Closure,
    Enum,
    Func,
    NativeFunc,
    Class,
    /// Literal immediate integer.
    Data,
    /// Compiler-internal; must never reach the VM.
    Unresolved,
}

impl AddressKind {
    pub fn from_u8(byte: u8) -> Option<AddressKind> {
        if byte <= AddressKind::Unresolved as u8 {
            // SAFETY: dense, contiguous #[repr(u8)] variants 0..=Unresolved.
            Some(unsafe { std::mem::transmute::<u8, AddressKind>(byte) })
        } else {
            None
        }
    }
}

/// One typed operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub kind: AddressKind,
    pub value: i32,
}

impl Address {
    pub const VOID: Address = Address {
        kind: AddressKind::Void,
        value: 0,
    };

    pub const fn local(value: i32) -> Address {
        Address {
            kind: AddressKind::Local,
            value,
        }
    }

    pub const fn global(value: i32) -> Address {
        Address {
            kind: AddressKind::Global,
            value,
        }
    }

    pub const fn constant(value: i32) -> Address {
        Address {
            kind: AddressKind::Constant,
            value,
        }
    }

    pub const fn closure(value: i32) -> Address {
        Address {
            kind: AddressKind::Closure,
            value,
        }
    }

    pub const fn data(value: i32) -> Address {
        Address {
            kind: AddressKind::Data,
            value,
        }
    }

    pub const fn func(value: i32) -> Address {
        Address {
            kind: AddressKind::Func,
            value,
        }
    }

    pub const fn native_func(value: i32) -> Address {
        Address {
            kind: AddressKind::NativeFunc,
            value,
        }
    }

    pub const fn class(value: i32) -> Address {
        Address {
            kind: AddressKind::Class,
            value,
        }
    }

    pub const fn enumeration(value: i32) -> Address {
        Address {
            kind: AddressKind::Enum,
            value,
        }
    }

    pub fn is_void(&self) -> bool {
        self.kind == AddressKind::Void
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressKind::Void => f.write_str("-"),
            AddressKind::Local => write!(f, "r{}", self.value),
            AddressKind::Global => write!(f, "g{}", self.value),
            AddressKind::Constant => write!(f, "k{}", self.value),
            AddressKind::Closure => write!(f, "u{}", self.value),
            AddressKind::Enum => write!(f, "e{}", self.value),
            AddressKind::Func => write!(f, "f{}", self.value),
            AddressKind::NativeFunc => write!(f, "n{}", self.value),
            AddressKind::Class => write!(f, "c{}", self.value),
            AddressKind::Data => write!(f, "{}", self.value),
            AddressKind::Unresolved => write!(f, "?{}", self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub a: Address,
    pub b: Address,
    pub c: Address,
}

impl Instruction {
    pub const fn new(op: Op, a: Address, b: Address, c: Address) -> Instruction {
        Instruction { op, a, b, c }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.op, self.a, self.b, self.c)
    }
}
