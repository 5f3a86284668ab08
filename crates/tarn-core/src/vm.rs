use std::any::Any;
use std::sync::{Arc, RwLock};

use crate::error::{ErrorObject, RuntimeError};
use crate::instruction::{Address, AddressKind, Instruction, Op};
use crate::native;
use crate::program::Program;
use crate::value::{read_lock, write_lock, NativeMethod, NativeObject, Value};

/// A register window, shared between a frame and any closures that
/// captured it.
pub type FrameValues = Arc<RwLock<Vec<Value>>>;

/// Back reference from a closure to one register of the frame that
/// created it.
pub struct ClosureRegister {
    pub register: usize,
    pub values: FrameValues,
}

/// A first-class closure: function index plus the chain of captured
/// registers. Stored in registers as an `Object`.
pub struct Closure {
    pub func_index: usize,
    pub closures: Vec<Arc<ClosureRegister>>,
}

impl NativeObject for Closure {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &str {
        "function"
    }

    fn display(&self) -> String {
        "[function]".to_string()
    }
}

/// A program-function method bound to its receiver, produced by property
/// access on a class instance.
pub struct BoundMethod {
    pub this: Value,
    pub func_index: usize,
}

impl NativeObject for BoundMethod {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &str {
        "function"
    }

    fn display(&self) -> String {
        "[function]".to_string()
    }
}

/// A host-object method bound to its receiver.
pub struct BoundNativeMethod {
    pub this: Value,
    pub method: NativeMethod,
}

impl NativeObject for BoundNativeMethod {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &str {
        "function"
    }

    fn display(&self) -> String {
        "[function]".to_string()
    }
}

/// A class instance: declared fields plus whatever the program assigns.
pub struct Instance {
    class: usize,
    type_name: String,
    fields: RwLock<hashbrown::HashMap<String, Value>>,
}

impl Instance {
    pub fn new(class: usize, type_name: String, fields: hashbrown::HashMap<String, Value>) -> Self {
        Instance {
            class,
            type_name,
            fields: RwLock::new(fields),
        }
    }

    pub fn class_index(&self) -> usize {
        self.class
    }
}

impl NativeObject for Instance {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get_property(&self, name: &str, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
        Ok(read_lock(&self.fields).get(name).cloned())
    }

    fn set_property(&self, name: &str, value: Value, _vm: &mut VM) -> Result<bool, RuntimeError> {
        write_lock(&self.fields).insert(name.to_string(), value);
        Ok(true)
    }

    fn display(&self) -> String {
        format!("[{}]", self.type_name)
    }
}

fn is_callable_object(obj: &Arc<dyn NativeObject>) -> bool {
    let any = obj.as_any();
    any.is::<Closure>() || any.is::<BoundMethod>() || any.is::<BoundNativeMethod>()
}

/// One activation record.
struct Frame {
    func_index: usize,
    pc: usize,
    values: FrameValues,
    /// Where in the caller the return value lands, or `Void`.
    ret_address: Address,
    closures: Vec<Arc<ClosureRegister>>,
    finalizables: Vec<Value>,
    /// Entered from a native caller awaiting a result; returning from this
    /// frame stops the dispatcher.
    exit: bool,
    /// Captured by a closure: the register window must outlive the frame,
    /// so it is never recycled.
    in_closure: bool,
    max_registers: usize,
}

impl Frame {
    fn with_registers(n: usize) -> Frame {
        Frame {
            func_index: 0,
            pc: 0,
            values: Arc::new(RwLock::new(vec![Value::Undefined; n])),
            ret_address: Address::VOID,
            closures: Vec::new(),
            finalizables: Vec::new(),
            exit: false,
            in_closure: false,
            max_registers: n,
        }
    }
}

/// An active exception guard.
struct TryFrame {
    /// Absolute pc of the catch block, -1 when there is none. Consumed on
    /// entry so a throw inside the catch reaches the finally instead.
    catch_pc: i32,
    /// Absolute pc of the finally block, -1 when there is none.
    finally_pc: i32,
    /// Where to resume after the finally completes, -1 when falling
    /// through.
    ret_pc: i32,
    error_reg: Address,
    /// Frame pointer at push time; a cross-frame throw unwinds to here.
    fp: usize,
    finally_executed: bool,
    /// A throw with no catch parks here until the finally has run.
    err: Option<RuntimeError>,
}

/// What an opcode handler tells the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Advance past the instruction.
    Next,
    /// The handler already adjusted the pc.
    Continue,
    /// Stop the dispatcher; the return value is set.
    Exit,
}

/// The virtual machine. Single-threaded, run-to-completion; one `VM` owns
/// its call stack and register files exclusively. `Array` and `Map`
/// contents may be shared across VMs and carry their own locks.
pub struct VM {
    program: Arc<Program>,
    globals: FrameValues,
    call_stack: Vec<Frame>,
    frame_cache: Vec<Frame>,
    try_stack: Vec<TryFrame>,
    fp: usize,
    /// Scratch register written by `str`; optional-chaining opcodes read
    /// the jump offset from it.
    reg0: i32,
    steps: u64,
    allocations: u64,
    pub max_steps: u64,
    pub max_allocations: u64,
    pub max_frames: usize,
    initialized: bool,
    ret_value: Value,
    global_finalizables: Vec<Value>,
    finalizer_errors: Vec<RuntimeError>,
}

impl VM {
    /// Build a VM over a program, with an optional pre-seeded global
    /// register file. The file is grown to the initializer's register
    /// budget.
    pub fn new(program: Arc<Program>, globals: Option<Vec<Value>>) -> VM {
        let size = program.functions.first().map(|f| f.max_registers).unwrap_or(0);
        let mut file = globals.unwrap_or_default();
        if file.len() < size {
            file.resize(size, Value::Undefined);
        }
        VM {
            program,
            globals: Arc::new(RwLock::new(file)),
            call_stack: Vec::new(),
            frame_cache: Vec::new(),
            try_stack: Vec::new(),
            fp: 0,
            reg0: 0,
            steps: 0,
            allocations: 0,
            max_steps: 0,
            max_allocations: 0,
            max_frames: 0,
            initialized: false,
            ret_value: Value::Null,
            global_finalizables: Vec::new(),
            finalizer_errors: Vec::new(),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Snapshot of the global register file.
    pub fn globals(&self) -> Vec<Value> {
        read_lock(&self.globals).clone()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn reset_steps(&mut self) {
        self.steps = 0;
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Errors raised by finalizables; they never replace the primary error.
    pub fn finalizer_errors(&self) -> &[RuntimeError] {
        &self.finalizer_errors
    }

    /// Accrue steps, e.g. from a child VM, against this VM's quota.
    /// Exceeding the limit resets the counter so handling runs under a
    /// fresh budget.
    pub fn add_steps(&mut self, n: u64) -> Result<(), RuntimeError> {
        self.steps = self.steps.saturating_add(n);
        if self.max_steps > 0 && self.steps > self.max_steps {
            self.steps = 0;
            return Err(self.new_error("step limit exceeded"));
        }
        Ok(())
    }

    /// Charge bytes against the allocation quota.
    pub fn add_allocations(&mut self, n: u64) -> Result<(), RuntimeError> {
        self.allocations = self.allocations.saturating_add(n);
        if self.max_allocations > 0 && self.allocations > self.max_allocations {
            self.allocations = 0;
            return Err(self.new_error("allocation limit exceeded"));
        }
        Ok(())
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.program.has_permission(name)
    }

    pub fn require_permission(&self, name: &str) -> Result<(), RuntimeError> {
        if self.has_permission(name) {
            Ok(())
        } else {
            Err(self.new_error("unauthorized"))
        }
    }

    /// One line per live frame, innermost first.
    pub fn stack_trace(&self) -> String {
        let mut lines = Vec::with_capacity(self.call_stack.len());
        for frame in self.call_stack.iter().rev() {
            let f = &self.program.functions[frame.func_index];
            lines.push(format!("{}:{}", f.name, f.line(frame.pc)));
        }
        lines.join("\n")
    }

    /// A new script error stamped with the current pc and stack trace.
    pub fn new_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            pc: self.current_pc(),
            stack_trace: self.stack_trace(),
            ..Default::default()
        }
    }

    /// Same, flagged safe to show to end users.
    pub fn new_public_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = self.new_error(message);
        err.public = true;
        err
    }

    /// Attach the current trace to a host-raised error. Rethrows and
    /// errors that already carry a trace pass through untouched.
    pub(crate) fn wrap_error(&self, err: RuntimeError) -> RuntimeError {
        if err.is_rethrow || !err.stack_trace.is_empty() {
            return err;
        }
        RuntimeError {
            pc: self.current_pc(),
            stack_trace: self.stack_trace(),
            ..err
        }
    }

    /// Register a deferred callable (or closeable host object) on the
    /// current frame. Runs on every exit path, in reverse order.
    pub fn defer(&mut self, callable: Value) -> Result<(), RuntimeError> {
        match &callable {
            Value::Func(_) | Value::NativeFunc(_) | Value::Object(_) => {}
            other => {
                return Err(self.new_error(format!("{} is not a function", other.type_of())))
            }
        }
        match self.call_stack.last_mut() {
            Some(frame) => frame.finalizables.push(callable),
            None => self.global_finalizables.push(callable),
        }
        Ok(())
    }

    /// Execute the program: run the global initializer, then `main` with
    /// `args` if the program exports one. Top-level finalizables run when
    /// this returns.
    pub fn run(&mut self, args: &[Value]) -> Result<Value, RuntimeError> {
        self.initialize()?;
        let result = match self.program.function_index("main") {
            Some(index) if index != 0 => self.run_frame(index, args.to_vec(), None, None),
            _ => Ok(self.ret_value.clone()),
        };
        self.run_global_finalizables();
        result
    }

    /// Execute a single named function, initializing globals first if
    /// needed.
    pub fn run_func(&mut self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        self.initialize()?;
        let index = match self.program.function_index(name) {
            Some(index) => index,
            None => return Err(self.new_error(format!("function not found: {name}"))),
        };
        self.run_frame(index, args.to_vec(), None, None)
    }

    /// Call a first-class callable (function, closure, bound method,
    /// native) from host code, driving the dispatcher to completion.
    pub fn run_value(
        &mut self,
        callee: &Value,
        this: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        match callee {
            Value::Func(index) => self.run_frame(*index, args, this, None),
            Value::NativeFunc(index) => {
                let this = this.unwrap_or(Value::Null);
                self.invoke_native(*index, args, this)
            }
            Value::Object(obj) => {
                if let Some(c) = obj.as_any().downcast_ref::<Closure>() {
                    let closures = c.closures.clone();
                    self.run_frame(c.func_index, args, this, Some(closures))
                } else if let Some(b) = obj.as_any().downcast_ref::<BoundMethod>() {
                    let this = b.this.clone();
                    self.run_frame(b.func_index, args, Some(this), None)
                } else if let Some(m) = obj.as_any().downcast_ref::<BoundNativeMethod>() {
                    let this = m.this.clone();
                    (m.method)(this, &args, self).map_err(|e| self.wrap_error(e))
                } else {
                    Err(self.new_error(format!("{} is not a function", callee.type_of())))
                }
            }
            other => Err(self.new_error(format!("{} is not a function", other.type_of()))),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    fn initialize(&mut self) -> Result<(), RuntimeError> {
        if self.initialized {
            return Ok(());
        }
        if self.program.functions.is_empty() {
            return Err(RuntimeError::new("program has no functions"));
        }
        self.initialized = true;

        // The initializer executes directly over the global register file;
        // its frame is flagged captured so it is never recycled.
        let need = self.program.functions[0].max_registers;
        {
            let mut globals = write_lock(&self.globals);
            if globals.len() < need {
                globals.resize(need, Value::Undefined);
            }
        }
        let frame = Frame {
            func_index: 0,
            pc: 0,
            values: self.globals.clone(),
            ret_address: Address::VOID,
            closures: Vec::new(),
            finalizables: Vec::new(),
            exit: true,
            in_closure: true,
            max_registers: need,
        };
        let base = self.call_stack.len();
        let floor = self.try_stack.len();
        self.call_stack.push(frame);
        self.fp = base;
        let value = self.dispatch(base, floor)?;
        self.ret_value = value;
        Ok(())
    }

    fn run_frame(
        &mut self,
        index: usize,
        args: Vec<Value>,
        this: Option<Value>,
        closures: Option<Vec<Arc<ClosureRegister>>>,
    ) -> Result<Value, RuntimeError> {
        let base = self.call_stack.len();
        let floor = self.try_stack.len();
        self.push_program_frame(index, Address::VOID, args, this, closures, true)?;
        self.dispatch(base, floor)
    }

    // ── Dispatcher ────────────────────────────────────────────────────

    fn dispatch(&mut self, frame_base: usize, try_floor: usize) -> Result<Value, RuntimeError> {
        loop {
            if let Err(err) = self.add_steps(1) {
                match self.handle_error(err, try_floor) {
                    None => continue,
                    Some(fatal) => return Err(self.bail(fatal, frame_base, try_floor)),
                }
            }
            let instr = {
                let frame = &self.call_stack[self.fp];
                let f = &self.program.functions[frame.func_index];
                match f.instructions.get(frame.pc) {
                    Some(instr) => *instr,
                    None => panic!(
                        "compiler error: pc {} out of range in function {}",
                        frame.pc, f.name
                    ),
                }
            };
            match self.exec(&instr) {
                Ok(Flow::Next) => self.call_stack[self.fp].pc += 1,
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => {
                    return Ok(std::mem::replace(&mut self.ret_value, Value::Null))
                }
                Err(err) => {
                    if let Some(fatal) = self.handle_error(err, try_floor) {
                        return Err(self.bail(fatal, frame_base, try_floor));
                    }
                }
            }
        }
    }

    fn exec(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        match i.op {
            Op::Ldk => {
                let k = self.program.constants[i.b.value as usize].clone();
                self.set(i.a, k);
                Ok(Flow::Next)
            }
            Op::Mov => {
                let v = self.get(i.b);
                self.set(i.a, v);
                Ok(Flow::Next)
            }
            Op::Mob => self.exec_mob(i),
            Op::Add => self.exec_add(i),
            Op::Sub => self.exec_sub(i),
            Op::Mul => self.exec_mul(i),
            Op::Div => self.exec_div(i),
            Op::Mod => self.exec_mod(i),
            Op::Bor => self.exec_int_op(i, |a, b| a | b),
            Op::Band => self.exec_int_op(i, |a, b| a & b),
            Op::Bxor => self.exec_int_op(i, |a, b| a ^ b),
            Op::Lsh => self.exec_int_op(i, |a, b| {
                if (0..64).contains(&b) {
                    ((a as u64) << b) as i64
                } else {
                    0
                }
            }),
            Op::Rsh => self.exec_int_op(i, |a, b| {
                if (0..64).contains(&b) {
                    a >> b
                } else if b >= 64 && a < 0 {
                    -1
                } else {
                    0
                }
            }),
            Op::Inc => self.exec_step(i, 1),
            Op::Dec => self.exec_step(i, -1),
            Op::Unm => self.exec_unm(i),
            Op::Not => self.exec_not(i),
            Op::Bnt => self.exec_bnt(i),
            Op::Str => {
                if i.a.kind != AddressKind::Data || i.b.kind != AddressKind::Data {
                    panic!("compiler error: invalid str operands: {i}");
                }
                if i.a.value != 0 {
                    panic!("compiler error: invalid scratch register: {}", i.a.value);
                }
                self.reg0 = i.b.value;
                Ok(Flow::Next)
            }
            Op::New => self.exec_new(i, false),
            Op::Nes => self.exec_new(i, true),
            Op::Arr => {
                self.set(i.a, Value::array_sized(i.b.value as usize));
                Ok(Flow::Next)
            }
            Op::Map => {
                self.set(i.a, Value::map());
                Ok(Flow::Next)
            }
            Op::Key => self.exec_key(i),
            Op::Val => self.exec_val(i),
            Op::Len => self.exec_len(i),
            Op::Enu => {
                let enu = &self.program.enums[i.b.value as usize];
                let value = &enu.values[i.c.value as usize];
                let k = self.program.constants[value.k_index].clone();
                self.set(i.a, k);
                Ok(Flow::Next)
            }
            Op::Get => self.exec_get(i, true),
            Op::Gto => self.exec_get(i, false),
            Op::Set => self.exec_set_op(i),
            Op::Spa => self.exec_spa(i),
            Op::Jmp => {
                self.inc_pc(i.a.value);
                Ok(Flow::Next)
            }
            Op::Jpb => {
                self.inc_pc(-i.a.value);
                Ok(Flow::Continue)
            }
            Op::Ejp => {
                if self.get(i.a).equals(&self.get(i.b)) {
                    self.inc_pc(i.c.value);
                }
                Ok(Flow::Next)
            }
            Op::Djp => {
                if !self.get(i.a).equals(&self.get(i.b)) {
                    self.inc_pc(i.c.value);
                }
                Ok(Flow::Next)
            }
            Op::Tjp => self.exec_tjp(i),
            Op::Eql => {
                let eq = self.get(i.b).equals(&self.get(i.c));
                self.set(i.a, Value::Bool(eq));
                Ok(Flow::Next)
            }
            Op::Neq => {
                let eq = self.get(i.b).equals(&self.get(i.c));
                self.set(i.a, Value::Bool(!eq));
                Ok(Flow::Next)
            }
            Op::Seq => {
                let eq = self.get(i.b).strict_equals(&self.get(i.c));
                self.set(i.a, Value::Bool(eq));
                Ok(Flow::Next)
            }
            Op::Sne => {
                let eq = self.get(i.b).strict_equals(&self.get(i.c));
                self.set(i.a, Value::Bool(!eq));
                Ok(Flow::Next)
            }
            Op::Lst => self.exec_lst(i),
            Op::Lse => self.exec_lse(i),
            Op::Cal => self.exec_call(i, false, false),
            Op::Cco => self.exec_call(i, false, true),
            Op::Cas => self.exec_call(i, true, false),
            Op::Cso => self.exec_call(i, true, true),
            Op::Rnp => self.exec_rnp(i),
            Op::Ret => self.exec_ret(i),
            Op::Clo => self.exec_clo(i),
            Op::Trw => self.exec_trw(i),
            Op::Try => {
                let catch_pc = if i.a.is_void() { -1 } else { i.a.value };
                let finally_pc = if i.c.kind == AddressKind::Data {
                    i.c.value
                } else {
                    -1
                };
                self.try_stack.push(TryFrame {
                    catch_pc,
                    finally_pc,
                    ret_pc: -1,
                    error_reg: i.b,
                    fp: self.fp,
                    finally_executed: false,
                    err: None,
                });
                Ok(Flow::Next)
            }
            Op::Tre => self.exec_tre(),
            Op::Cen => {
                self.try_stack.pop();
                Ok(Flow::Next)
            }
            Op::Fen => self.exec_fen(),
            Op::Trx => self.exec_trx(),
            Op::Del => self.exec_del(i),
        }
    }

    // ── Addressing ────────────────────────────────────────────────────

    pub fn get(&self, addr: Address) -> Value {
        match addr.kind {
            AddressKind::Void => Value::Null,
            AddressKind::Local => {
                let frame = &self.call_stack[self.fp];
                read_lock(&frame.values)[addr.value as usize].clone()
            }
            AddressKind::Global => read_lock(&self.globals)[addr.value as usize].clone(),
            AddressKind::Constant => self.program.constants[addr.value as usize].clone(),
            AddressKind::Closure => {
                let reg = &self.call_stack[self.fp].closures[addr.value as usize];
                read_lock(&reg.values)[reg.register].clone()
            }
            AddressKind::Data => Value::Int(addr.value as i64),
            AddressKind::Func => Value::Func(addr.value as usize),
            AddressKind::NativeFunc => Value::NativeFunc(addr.value as usize),
            AddressKind::Enum => Value::Enum(addr.value as usize),
            AddressKind::Class => Value::Class(addr.value as usize),
            AddressKind::Unresolved => {
                panic!("compiler error: unresolved address reached the vm: {addr}")
            }
        }
    }

    pub fn set(&mut self, addr: Address, value: Value) {
        match addr.kind {
            AddressKind::Local => {
                let frame = &self.call_stack[self.fp];
                write_lock(&frame.values)[addr.value as usize] = value;
            }
            AddressKind::Global => {
                write_lock(&self.globals)[addr.value as usize] = value;
            }
            AddressKind::Closure => {
                let reg = &self.call_stack[self.fp].closures[addr.value as usize];
                write_lock(&reg.values)[reg.register] = value;
            }
            AddressKind::Void => {}
            _ => panic!("compiler error: write to non-writable address {addr}"),
        }
    }

    fn current_pc(&self) -> usize {
        self.call_stack.get(self.fp).map(|f| f.pc).unwrap_or(0)
    }

    fn set_pc(&mut self, pc: usize) {
        self.call_stack[self.fp].pc = pc;
    }

    fn inc_pc(&mut self, delta: i32) {
        let frame = &mut self.call_stack[self.fp];
        frame.pc = (frame.pc as i64 + delta as i64) as usize;
    }

    // ── Calls ─────────────────────────────────────────────────────────

    fn exec_call(&mut self, i: &Instruction, single: bool, optional: bool) -> Result<Flow, RuntimeError> {
        let args = if single {
            vec![self.get(i.c)]
        } else if i.c.is_void() {
            Vec::new()
        } else {
            self.argument_array(i.c)
        };
        match i.a.kind {
            AddressKind::Func => {
                self.push_program_frame(i.a.value as usize, i.b, args, None, None, false)?;
                Ok(Flow::Continue)
            }
            AddressKind::NativeFunc => {
                let out = self.invoke_native(i.a.value as usize, args, Value::Null)?;
                if !i.b.is_void() {
                    self.set(i.b, out);
                }
                Ok(Flow::Next)
            }
            _ => {
                let callee = self.get(i.a);
                self.call_value(callee, i.b, args, optional)
            }
        }
    }

    fn argument_array(&mut self, addr: Address) -> Vec<Value> {
        match self.get(addr) {
            Value::Array(a) => a.snapshot(),
            Value::Null | Value::Undefined => Vec::new(),
            other => panic!(
                "compiler error: argument address holds {}, expected array",
                other.type_of()
            ),
        }
    }

    fn call_value(
        &mut self,
        callee: Value,
        ret: Address,
        args: Vec<Value>,
        optional: bool,
    ) -> Result<Flow, RuntimeError> {
        match &callee {
            Value::Func(index) => {
                self.push_program_frame(*index, ret, args, None, None, false)?;
                Ok(Flow::Continue)
            }
            Value::NativeFunc(index) => {
                let out = self.invoke_native(*index, args, Value::Null)?;
                if !ret.is_void() {
                    self.set(ret, out);
                }
                Ok(Flow::Next)
            }
            Value::Object(obj) => {
                if let Some(c) = obj.as_any().downcast_ref::<Closure>() {
                    let closures = c.closures.clone();
                    let index = c.func_index;
                    self.push_program_frame(index, ret, args, None, Some(closures), false)?;
                    Ok(Flow::Continue)
                } else if let Some(b) = obj.as_any().downcast_ref::<BoundMethod>() {
                    let this = b.this.clone();
                    let index = b.func_index;
                    self.push_program_frame(index, ret, args, Some(this), None, false)?;
                    Ok(Flow::Continue)
                } else if let Some(m) = obj.as_any().downcast_ref::<BoundNativeMethod>() {
                    let method = m.method;
                    let this = m.this.clone();
                    let out = method(this, &args, self).map_err(|e| self.wrap_error(e))?;
                    if !ret.is_void() {
                        self.set(ret, out);
                    }
                    Ok(Flow::Next)
                } else {
                    Err(self.new_error(format!("{} is not a function", callee.type_of())))
                }
            }
            Value::Null | Value::Undefined if optional => {
                let offset = self.reg0;
                self.inc_pc(offset);
                Ok(Flow::Continue)
            }
            other => Err(self.new_error(format!("{} is not a function", other.type_of()))),
        }
    }

    fn push_program_frame(
        &mut self,
        index: usize,
        ret: Address,
        mut args: Vec<Value>,
        this: Option<Value>,
        closures: Option<Vec<Arc<ClosureRegister>>>,
        exit: bool,
    ) -> Result<(), RuntimeError> {
        if self.max_frames > 0 && self.call_stack.len() >= self.max_frames {
            return Err(self.new_error("stack overflow"));
        }
        let (required, declared, max_registers) = {
            let f = &self.program.functions[index];
            (
                f.arguments,
                f.arguments + f.optional_arguments,
                f.max_registers,
            )
        };
        if args.len() < required {
            let name = self.program.functions[index].name.clone();
            return Err(self.new_error(format!(
                "{name} expects {required} arguments, got {}",
                args.len()
            )));
        }
        // pad missing optionals; surplus arguments are dropped
        if args.len() > declared {
            args.truncate(declared);
        }
        while args.len() < declared {
            args.push(Value::Undefined);
        }

        let mut frame = self
            .take_cached_frame(max_registers)
            .unwrap_or_else(|| Frame::with_registers(max_registers));
        frame.func_index = index;
        frame.pc = 0;
        frame.ret_address = ret;
        frame.exit = exit;
        frame.in_closure = false;
        frame.closures = closures.unwrap_or_default();
        {
            let mut values = write_lock(&frame.values);
            let mut base = 0;
            if let Some(this) = this {
                values[0] = this;
                base = 1;
            }
            for (n, arg) in args.into_iter().enumerate() {
                values[base + n] = arg;
            }
        }
        // step the caller past the call before entering the callee; frames
        // entered from native code hand control back to their caller instead
        if !exit && !self.call_stack.is_empty() {
            self.call_stack[self.fp].pc += 1;
        }
        self.call_stack.push(frame);
        self.fp = self.call_stack.len() - 1;
        Ok(())
    }

    fn take_cached_frame(&mut self, max_registers: usize) -> Option<Frame> {
        let pos = self
            .frame_cache
            .iter()
            .rposition(|f| f.max_registers == max_registers)?;
        Some(self.frame_cache.swap_remove(pos))
    }

    fn recycle(&mut self, mut frame: Frame) {
        if frame.in_closure {
            return;
        }
        frame.finalizables.clear();
        frame.closures.clear();
        frame.ret_address = Address::VOID;
        frame.exit = false;
        frame.pc = 0;
        {
            let mut values = write_lock(&frame.values);
            for v in values.iter_mut() {
                *v = Value::Undefined;
            }
        }
        self.frame_cache.push(frame);
    }

    pub(crate) fn invoke_native(
        &mut self,
        index: usize,
        args: Vec<Value>,
        this: Value,
    ) -> Result<Value, RuntimeError> {
        let nf = match native::native(index) {
            Some(nf) => nf,
            None => panic!("compiler error: unknown native function index {index}"),
        };
        if nf.arguments >= 0 && args.len() != nf.arguments as usize {
            return Err(self.new_error(format!(
                "{} expects {} arguments, got {}",
                nf.name,
                nf.arguments,
                args.len()
            )));
        }
        (nf.function)(this, &args, self).map_err(|e| self.wrap_error(e))
    }

    fn exec_rnp(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        match self.get(i.b) {
            Value::NativeFunc(index) => {
                let out = self.invoke_native(index, Vec::new(), Value::Null)?;
                self.set(i.a, out);
                Ok(Flow::Next)
            }
            other => panic!("compiler error: rnp on {}", other.type_of()),
        }
    }

    fn exec_new(&mut self, i: &Instruction, single: bool) -> Result<Flow, RuntimeError> {
        let args = if single {
            vec![self.get(i.c)]
        } else if i.c.is_void() {
            Vec::new()
        } else {
            self.argument_array(i.c)
        };
        let class_index = match i.a.kind {
            AddressKind::Class => i.a.value as usize,
            _ => match self.get(i.a) {
                Value::Class(c) => c,
                other => {
                    return Err(self.new_error(format!("{} is not a class", other.type_of())))
                }
            },
        };
        let program = self.program.clone();
        let class = &program.classes[class_index];
        let mut fields = hashbrown::HashMap::new();
        for field in &class.fields {
            fields.insert(field.name.clone(), Value::Undefined);
        }
        let instance = Value::Object(Arc::new(Instance::new(
            class_index,
            class.name.clone(),
            fields,
        )));
        self.set(i.b, instance.clone());
        if let Some(ctor) = class.method("constructor") {
            self.push_program_frame(ctor, Address::VOID, args, Some(instance), None, false)?;
            return Ok(Flow::Continue);
        }
        Ok(Flow::Next)
    }

    fn exec_clo(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let func_index = i.b.value as usize;
        let declared = self.program.functions[self.call_stack[self.fp].func_index]
            .closures
            .clone();
        let frame = &mut self.call_stack[self.fp];
        // the register window now outlives the frame
        frame.in_closure = true;
        let mut closures = frame.closures.clone();
        let values = frame.values.clone();
        for register in declared {
            closures.push(Arc::new(ClosureRegister {
                register,
                values: values.clone(),
            }));
        }
        self.set(i.a, Value::Object(Arc::new(Closure {
            func_index,
            closures,
        })));
        Ok(Flow::Next)
    }

    fn exec_ret(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        if self.return_from_finally() {
            return Ok(Flow::Continue);
        }
        let ret_value = if i.a.is_void() {
            Value::Null
        } else {
            self.get(i.a)
        };
        if self.fp == 0 && self.call_stack[0].func_index == 0 {
            // initializer finalizables run at shutdown, after main
            let fins = std::mem::take(&mut self.call_stack[0].finalizables);
            self.global_finalizables.extend(fins);
        } else {
            self.run_finalizables_current();
        }
        let frame = match self.call_stack.pop() {
            Some(frame) => frame,
            None => unreachable!("ret with empty call stack"),
        };
        let ret_address = frame.ret_address;
        let exit = frame.exit;
        self.recycle(frame);
        if self.call_stack.is_empty() {
            self.fp = 0;
            self.ret_value = ret_value;
            return Ok(Flow::Exit);
        }
        self.fp = self.call_stack.len() - 1;
        if !ret_address.is_void() {
            self.set(ret_address, ret_value.clone());
        }
        if exit {
            self.ret_value = ret_value;
            return Ok(Flow::Exit);
        }
        Ok(Flow::Continue)
    }

    // ── Aggregates ────────────────────────────────────────────────────

    fn exec_get(&mut self, i: &Instruction, required: bool) -> Result<Flow, RuntimeError> {
        if self.get_from_object(i, required)? {
            Ok(Flow::Next)
        } else {
            // nullish receiver under optional chaining
            let offset = self.reg0;
            self.inc_pc(offset);
            Ok(Flow::Continue)
        }
    }

    fn get_from_object(&mut self, i: &Instruction, required: bool) -> Result<bool, RuntimeError> {
        let source = self.get(i.b);
        let key = self.get(i.c);
        match &source {
            Value::Null | Value::Undefined => {
                if required {
                    Err(self.new_error(format!(
                        "Cannot read property '{key}' of {}",
                        source.type_of()
                    )))
                } else {
                    Ok(false)
                }
            }
            Value::Array(arr) => {
                let index = match key {
                    Value::Int(n) => n,
                    other => {
                        return Err(
                            self.new_error(format!("Invalid index type: {}", other.type_of()))
                        )
                    }
                };
                let value = {
                    let values = arr.read();
                    if index < 0 || index as usize >= values.len() {
                        Value::Null
                    } else {
                        values[index as usize].clone()
                    }
                };
                self.set(i.a, value);
                Ok(true)
            }
            Value::Map(map) => {
                let value = map.read().get(&key).cloned().unwrap_or(Value::Undefined);
                self.set(i.a, value);
                Ok(true)
            }
            Value::String(s) => {
                let index = match key {
                    Value::Int(n) => n,
                    other => {
                        return Err(
                            self.new_error(format!("Invalid index type: {}", other.type_of()))
                        )
                    }
                };
                let bytes = s.as_bytes();
                let value = if index < 0 || index as usize >= bytes.len() {
                    Value::Null
                } else {
                    Value::Rune(bytes[index as usize] as char)
                };
                self.set(i.a, value);
                Ok(true)
            }
            Value::Bytes(bytes) => {
                let index = match key {
                    Value::Int(n) => n,
                    other => {
                        return Err(
                            self.new_error(format!("Invalid index type: {}", other.type_of()))
                        )
                    }
                };
                let value = if index < 0 || index as usize >= bytes.len() {
                    Value::Null
                } else {
                    Value::Int(bytes[index as usize] as i64)
                };
                self.set(i.a, value);
                Ok(true)
            }
            Value::Enum(e) => {
                let value = match &key {
                    Value::String(name) => {
                        let program = self.program.clone();
                        program.enums[*e]
                            .value_by_name(name)
                            .map(|v| program.constants[v.k_index].clone())
                            .unwrap_or(Value::Undefined)
                    }
                    _ => Value::Undefined,
                };
                self.set(i.a, value);
                Ok(true)
            }
            Value::Object(obj) => {
                let obj = obj.clone();
                match &key {
                    Value::Int(n) => {
                        let value = obj.get_index(*n, self)?.unwrap_or(Value::Undefined);
                        self.set(i.a, value);
                        Ok(true)
                    }
                    Value::String(name) => {
                        if let Some(value) = obj.get_property(name, self)? {
                            self.set(i.a, value);
                        } else if let Some(method) = obj.get_method(name) {
                            self.set(
                                i.a,
                                Value::Object(Arc::new(BoundNativeMethod {
                                    this: source.clone(),
                                    method,
                                })),
                            );
                        } else if let Some(bound) = self.class_method(&obj, name, &source) {
                            self.set(i.a, bound);
                        } else {
                            self.set(i.a, Value::Undefined);
                        }
                        Ok(true)
                    }
                    other => {
                        Err(self.new_error(format!("Invalid index type: {}", other.type_of())))
                    }
                }
            }
            other => Err(self.new_error(format!(
                "Cannot read property '{key}' of {}",
                other.type_of()
            ))),
        }
    }

    fn class_method(
        &self,
        obj: &Arc<dyn NativeObject>,
        name: &str,
        this: &Value,
    ) -> Option<Value> {
        let instance = obj.as_any().downcast_ref::<Instance>()?;
        let func_index = self.program.classes[instance.class_index()].method(name)?;
        Some(Value::Object(Arc::new(BoundMethod {
            this: this.clone(),
            func_index,
        })))
    }

    fn exec_set_op(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let target = self.get(i.a);
        let key = self.get(i.b);
        let value = self.get(i.c);
        match &target {
            Value::Array(arr) => {
                let index = match key {
                    Value::Int(n) => n,
                    other => {
                        return Err(
                            self.new_error(format!("Invalid index type: {}", other.type_of()))
                        )
                    }
                };
                let mut values = arr.write();
                if index < 0 || index as usize >= values.len() {
                    drop(values);
                    return Err(self.new_error(format!("Index out of range: {index}")));
                }
                values[index as usize] = value;
                Ok(Flow::Next)
            }
            Value::Map(map) => {
                map.write().insert(key, value);
                Ok(Flow::Next)
            }
            Value::Object(obj) => {
                let obj = obj.clone();
                match &key {
                    Value::String(name) => {
                        if obj.set_property(name, value, self)? {
                            Ok(Flow::Next)
                        } else {
                            Err(self
                                .new_error(format!("readonly or undefined property: {name}")))
                        }
                    }
                    Value::Int(n) => {
                        if obj.set_index(*n, value, self)? {
                            Ok(Flow::Next)
                        } else {
                            Err(self.new_error("readonly property"))
                        }
                    }
                    other => {
                        Err(self.new_error(format!("Invalid index type: {}", other.type_of())))
                    }
                }
            }
            other => Err(self.new_error(format!(
                "Cannot set property of {}",
                other.type_of()
            ))),
        }
    }

    fn exec_spa(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let value = self.get(i.a);
        let arr = match &value {
            Value::Array(arr) => arr,
            other => {
                return Err(self.new_error(format!("Expected array, got {}", other.type_of())))
            }
        };
        let values = arr.snapshot();
        let Some(last) = values.last() else {
            return Ok(Flow::Next);
        };
        match last {
            Value::Null | Value::Undefined => {
                let head = values[..values.len() - 1].to_vec();
                self.set(i.a, Value::array(head));
            }
            Value::Array(tail) => {
                let mut head = values[..values.len() - 1].to_vec();
                head.extend(tail.snapshot());
                self.set(i.a, Value::array(head));
            }
            other => {
                return Err(self.new_error(format!("Expected array, got {}", other.type_of())))
            }
        }
        Ok(Flow::Next)
    }

    fn exec_key(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let source = self.get(i.b);
        let keys = match &source {
            // iterating an uninitialized value is allowed
            Value::Null => Vec::new(),
            Value::Array(arr) => (0..arr.len() as i64).map(Value::Int).collect(),
            Value::Map(map) => map.read().keys().cloned().collect(),
            Value::Enum(e) => {
                let count = self.program.enums[*e].values.len() as i64;
                (0..count).map(Value::Int).collect()
            }
            Value::Object(obj) => match obj.len() {
                Some(len) => (0..len as i64).map(Value::Int).collect(),
                None => {
                    return Err(self.new_error(format!(
                        "Expected a key or index enumerable, got {}",
                        source.type_of()
                    )))
                }
            },
            other => {
                return Err(self.new_error(format!(
                    "Expected an enumerable, got {}",
                    other.type_of()
                )))
            }
        };
        self.set(i.a, Value::array(keys));
        Ok(Flow::Next)
    }

    fn exec_val(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let source = self.get(i.b);
        let values = match &source {
            Value::Null | Value::Undefined => Vec::new(),
            // snapshot, so in-loop mutation does not affect the iteration
            Value::Array(arr) => arr.snapshot(),
            Value::Bytes(bytes) => bytes.iter().map(|b| Value::Int(*b as i64)).collect(),
            Value::Map(map) => map.read().values().cloned().collect(),
            Value::Object(obj) => {
                let obj = obj.clone();
                match obj.values(self) {
                    Some(result) => result?,
                    None => {
                        return Err(
                            self.new_error(format!("Expected an enumerable, got {source}"))
                        )
                    }
                }
            }
            other => {
                return Err(self.new_error(format!("Expected an enumerable, got {other}")))
            }
        };
        self.set(i.a, Value::array(values));
        Ok(Flow::Next)
    }

    fn exec_len(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let source = self.get(i.b);
        let len = match &source {
            Value::Array(arr) => arr.len(),
            Value::Map(map) => map.len(),
            Value::Object(obj) => match obj.len() {
                Some(len) => len,
                None => {
                    return Err(self.new_error(format!(
                        "The value is not a collection: {}",
                        source.type_of()
                    )))
                }
            },
            other => {
                return Err(self.new_error(format!(
                    "The value is not a collection: {}",
                    other.type_of()
                )))
            }
        };
        self.set(i.a, Value::Int(len as i64));
        Ok(Flow::Next)
    }

    fn exec_del(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let target = self.get(i.a);
        if let Value::Map(map) = &target {
            let key = self.get(i.b);
            map.write().remove(&key);
        }
        Ok(Flow::Next)
    }

    fn exec_tjp(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let value = self.get(i.a);
        let jump = match i.c.value {
            0 => value.is_truthy(),
            1 => !value.is_truthy(),
            2 => !value.is_nil(),
            mode => panic!("compiler error: invalid tjp mode {mode}"),
        };
        if jump {
            self.inc_pc(i.b.value);
        }
        Ok(Flow::Next)
    }

    // ── Exceptions ────────────────────────────────────────────────────

    fn exec_trw(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let value = self.get(i.a);
        let err = match &value {
            Value::Object(obj) => match obj.as_any().downcast_ref::<ErrorObject>() {
                Some(e) => {
                    let inner = e.error();
                    if inner.is_rethrow {
                        // a rethrow keeps its original trace
                        inner
                    } else {
                        RuntimeError {
                            pc: self.current_pc(),
                            stack_trace: self.stack_trace(),
                            ..inner
                        }
                    }
                }
                None => self.new_error(value.to_string()),
            },
            _ => self.new_error(value.to_string()),
        };
        Err(err)
    }

    fn exec_tre(&mut self) -> Result<Flow, RuntimeError> {
        let Some(guard) = self.try_stack.last_mut() else {
            panic!("compiler error: tre without an active guard");
        };
        if guard.finally_pc < 0 {
            self.try_stack.pop();
        } else {
            // falling through into the finally
            guard.finally_executed = true;
        }
        Ok(Flow::Next)
    }

    fn exec_fen(&mut self) -> Result<Flow, RuntimeError> {
        let Some(guard) = self.try_stack.pop() else {
            panic!("compiler error: fen without an active guard");
        };
        if let Some(err) = guard.err {
            // no catch took it; rethrow now that the finally has run
            self.inc_pc(1);
            return Err(err);
        }
        if guard.ret_pc >= 0 {
            self.set_pc(guard.ret_pc as usize);
            return Ok(Flow::Continue);
        }
        Ok(Flow::Next)
    }

    fn exec_trx(&mut self) -> Result<Flow, RuntimeError> {
        let fp = self.fp;
        let pc = self.call_stack[fp].pc;
        let Some(guard) = self.try_stack.last_mut() else {
            return Ok(Flow::Next);
        };
        if guard.finally_pc < 0 {
            self.try_stack.pop();
            return Ok(Flow::Next);
        }
        guard.ret_pc = pc as i32 + 1;
        guard.finally_executed = true;
        let target = guard.finally_pc as usize;
        self.set_pc(target);
        Ok(Flow::Continue)
    }

    /// A `ret` inside an unfinished try-finally diverts to the finally
    /// first; the guard remembers this pc and `fen` jumps back so the
    /// `ret` re-executes with the guard gone.
    fn return_from_finally(&mut self) -> bool {
        let fp = self.fp;
        let pc = self.call_stack[fp].pc as i32;
        let Some(guard) = self.try_stack.last_mut() else {
            return false;
        };
        if guard.fp != fp || guard.finally_pc < 0 || guard.finally_executed {
            return false;
        }
        guard.finally_executed = true;
        guard.ret_pc = pc;
        let target = guard.finally_pc as usize;
        self.call_stack[fp].pc = target;
        true
    }

    /// The throw state machine. Returns the error back when no guard above
    /// `try_floor` can take it.
    fn handle_error(&mut self, err: RuntimeError, try_floor: usize) -> Option<RuntimeError> {
        let mut err = err;
        loop {
            if self.try_stack.len() <= try_floor {
                return Some(err);
            }
            let top = self.try_stack.len() - 1;
            if self.try_stack[top].finally_executed {
                // the error comes from inside this guard's finally; an
                // error raised there replaces anything it had stashed
                self.try_stack.pop();
                continue;
            }
            let guard_fp = self.try_stack[top].fp;
            while self.fp > guard_fp {
                self.run_finalizables_current();
                if let Some(frame) = self.call_stack.pop() {
                    self.recycle(frame);
                }
                self.fp = self.call_stack.len() - 1;
            }
            let guard = &mut self.try_stack[top];
            if guard.catch_pc >= 0 {
                let catch_pc = guard.catch_pc as usize;
                guard.catch_pc = -1;
                let error_reg = guard.error_reg;
                self.set(error_reg, Value::Object(Arc::new(ErrorObject::new(err))));
                self.set_pc(catch_pc);
                return None;
            }
            if guard.finally_pc >= 0 {
                guard.err = Some(err);
                guard.finally_executed = true;
                let target = guard.finally_pc as usize;
                self.set_pc(target);
                return None;
            }
            self.try_stack.pop();
        }
    }

    /// Unwind everything this dispatch owns after an unhandled error,
    /// running finalizables on the way down.
    fn bail(&mut self, err: RuntimeError, frame_base: usize, try_floor: usize) -> RuntimeError {
        self.try_stack.truncate(try_floor);
        while self.call_stack.len() > frame_base {
            self.fp = self.call_stack.len() - 1;
            if self.fp == 0 && self.call_stack[0].func_index == 0 {
                let fins = std::mem::take(&mut self.call_stack[0].finalizables);
                self.global_finalizables.extend(fins);
            } else {
                self.run_finalizables_current();
            }
            if let Some(frame) = self.call_stack.pop() {
                self.recycle(frame);
            }
        }
        self.fp = self.call_stack.len().saturating_sub(1);
        if frame_base == 0 {
            self.run_global_finalizables();
        }
        err
    }

    // ── Finalizables ──────────────────────────────────────────────────

    fn run_finalizables_current(&mut self) {
        let fins = std::mem::take(&mut self.call_stack[self.fp].finalizables);
        for f in fins.into_iter().rev() {
            if let Err(e) = self.run_finalizable(f) {
                self.finalizer_errors.push(e);
            }
        }
    }

    fn run_global_finalizables(&mut self) {
        let fins = std::mem::take(&mut self.global_finalizables);
        for f in fins.into_iter().rev() {
            if let Err(e) = self.run_finalizable(f) {
                self.finalizer_errors.push(e);
            }
        }
    }

    fn run_finalizable(&mut self, f: Value) -> Result<(), RuntimeError> {
        match &f {
            Value::Object(obj) if !is_callable_object(obj) => obj.close(),
            Value::Func(_) | Value::NativeFunc(_) | Value::Object(_) => {
                self.run_value(&f, None, Vec::new()).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    // ── Test hooks ────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn frame_cache_register_sizes(&self) -> Vec<usize> {
        self.frame_cache.iter().map(|f| f.max_registers).collect()
    }

    #[cfg(test)]
    pub(crate) fn frame_cache_is_clean(&self) -> bool {
        self.frame_cache.iter().all(|f| {
            read_lock(&f.values)
                .iter()
                .all(|v| matches!(v, Value::Undefined))
        })
    }

    #[cfg(test)]
    pub(crate) fn try_depth(&self) -> usize {
        self.try_stack.len()
    }
}
