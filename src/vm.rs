// The interpreter.
//
// One loop reads 16-bit opcodes and mutates the value stack, frame stack,
// call stack, scope stack, loop stack and this stack. Constructor and
// destructor recursion run as nested interpreter loops that stop when the
// pc returns to the call site.

use crate::bytecode::Op;
use crate::class::type_size;
use crate::memory::{Addr, MemoryError, Region};
use crate::modules::{self, fs::FsState, ModuleCtx};
use crate::program::Program;
use crate::types::*;
use crate::value::{elem_stride, ArrayHeader, Value, ARRAY_HEADER_SIZE, VTABLE_SLOT_SIZE};
use std::convert::TryFrom;
use std::fmt;
use std::time::Instant;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Memory(MemoryError),
    DivideByZero,
    StackUnderflow,
    IndexOutOfBounds { index: u64, len: u64 },
    BadOpcode(u16),
    BadVirtualSlot(u16),
    MissingLoop,
    NullPointer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Memory(MemoryError::Null) => write!(f, "null pointer dereference"),
            Error::Memory(e) => write!(f, "{}", e),
            Error::DivideByZero => write!(f, "division by zero"),
            Error::StackUnderflow => write!(f, "value stack underflow"),
            Error::IndexOutOfBounds { index, len } => {
                write!(f, "array index {} out of bounds (length {})", index, len)
            }
            Error::BadOpcode(op) => write!(f, "bad opcode {:#06x}", op),
            Error::BadVirtualSlot(slot) => write!(f, "bad virtual slot {}", slot),
            Error::MissingLoop => write!(f, "break/continue outside a loop"),
            Error::NullPointer => write!(f, "null pointer dereference"),
        }
    }
}

impl From<MemoryError> for Error {
    fn from(e: MemoryError) -> Error {
        Error::Memory(e)
    }
}

/// Sink for everything the program prints.
pub trait Output {
    fn emit(&mut self, text: &str);
}

impl Output for std::io::Stdout {
    fn emit(&mut self, text: &str) {
        print!("{}", text);
    }
}

impl Output for Vec<String> {
    fn emit(&mut self, text: &str) {
        self.push(text.to_string());
    }
}

pub struct Frame {
    locals: Vec<Value>,
}

impl Frame {
    fn new(num_locals: u16) -> Frame {
        Frame { locals: vec![Value::null(); num_locals as usize] }
    }

    fn reset(&mut self, num_locals: u16) {
        if self.locals.len() < num_locals as usize {
            self.locals.resize(num_locals as usize, Value::null());
        }
    }

    pub fn local(&self, slot: u16) -> Value {
        self.locals[slot as usize]
    }

    pub fn set_local(&mut self, slot: u16, value: Value) {
        self.locals[slot as usize] = value;
    }
}

/// Recycles frames so call-heavy programs do not churn the allocator.
#[derive(Default)]
struct FramePool {
    free: Vec<Frame>,
}

impl FramePool {
    fn acquire(&mut self, num_locals: u16) -> Frame {
        match self.free.pop() {
            Some(mut frame) => {
                frame.reset(num_locals);
                frame
            }
            None => Frame::new(num_locals),
        }
    }

    fn release(&mut self, frame: Frame) {
        self.free.push(frame);
    }
}

#[derive(Copy, Clone, Debug)]
struct CallFrame {
    return_pc: u32,
    base_pointer: u32,
    use_ret: bool,
    pop_this: bool,
    loop_count: u32,
    scope_count: u32,
}

#[derive(Clone, Default)]
struct ScopeInfo {
    marker: u64,
    objects: Vec<Value>,
}

#[derive(Copy, Clone, Debug)]
struct LoopFrame {
    start_pc: u32,
    end_pc: u32,
    scope_count: i32,
}

pub struct Vm {
    pub program: Program,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    frame_pool: FramePool,
    calls: Vec<CallFrame>,
    scopes: Vec<ScopeInfo>,
    current_scope: i32,
    loops: Vec<LoopFrame>,
    this_stack: Vec<Value>,
    arg_storage: Vec<Value>,
    pending_ctors: Vec<(Value, u16)>,
    pending_dtors: Vec<Value>,
    pc: u32,
    fs: FsState,
    started: Instant,
}

impl Vm {
    pub fn new(program: Program) -> Vm {
        Vm {
            program,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            frame_pool: FramePool::default(),
            calls: Vec::new(),
            scopes: vec![ScopeInfo::default(); 64],
            current_scope: -1,
            loops: Vec::new(),
            this_stack: Vec::new(),
            arg_storage: Vec::new(),
            pending_ctors: Vec::new(),
            pending_dtors: Vec::new(),
            pc: 0,
            fs: FsState::new(),
            started: Instant::now(),
        }
    }

    /// Run from `start_pc` until the END opcode.
    pub fn run(&mut self, start_pc: u32, out: &mut dyn Output) -> Result<()> {
        trace!("executing from pc {} of {}", start_pc, self.program.code.len());
        self.pc = start_pc;
        self.push_scope();
        loop {
            let op = self.read_op()?;
            if op == Op::End {
                break;
            }
            self.execute(op, out)?;
        }
        self.program.release_string_pool();
        Ok(())
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn scope_depth(&self) -> i32 {
        self.current_scope + 1
    }

    pub fn loop_depth(&self) -> usize {
        self.loops.len()
    }

    pub fn this_depth(&self) -> usize {
        self.this_stack.len()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn print_stats(&self, out: &mut dyn Output) {
        let mem = &self.program.memory;
        out.emit(&format!(
            "Max initialization usage: {:.2}KB\n",
            mem.max_usage(Region::Init) as f64 / 1024.0
        ));
        out.emit(&format!(
            "Max stack usage: {:.2}KB\n",
            mem.max_usage(Region::Stack) as f64 / 1024.0
        ));
        out.emit(&format!("Num heap allocations: {}\n", mem.heap_allocs()));
        out.emit(&format!("Num heap frees: {}\n", mem.heap_frees()));
        out.emit(&format!("Stack size: {}\n", self.stack.len()));
        out.emit(&format!("Scope stack size: {}\n", self.scope_depth()));
        out.emit(&format!("Loop stack size: {}\n", self.loops.len()));
        out.emit(&format!("Code size: {}\n", self.program.code.len()));
    }

    // ---- decoding --------------------------------------------------------

    fn read_op(&mut self) -> Result<Op> {
        let raw = self.program.code.read_u16(&mut self.pc);
        Op::try_from(raw).map_err(|_| Error::BadOpcode(raw))
    }

    fn read_u8(&mut self) -> u8 {
        self.program.code.read_u8(&mut self.pc)
    }

    fn read_u16(&mut self) -> u16 {
        self.program.code.read_u16(&mut self.pc)
    }

    fn read_u32(&mut self) -> u32 {
        self.program.code.read_u32(&mut self.pc)
    }

    fn read_u64(&mut self) -> u64 {
        self.program.code.read_u64(&mut self.pc)
    }

    // ---- stack helpers ---------------------------------------------------

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(Error::StackUnderflow)
    }

    fn push_scope(&mut self) {
        self.current_scope += 1;
        if self.current_scope as usize >= self.scopes.len() {
            self.scopes.resize(self.current_scope as usize + 1, ScopeInfo::default());
        }
        let marker = self.program.memory.marker(Region::Stack);
        let scope = &mut self.scopes[self.current_scope as usize];
        scope.marker = marker;
        scope.objects.clear();
    }

    fn register_scope_object(&mut self, value: Value) {
        self.scopes[self.current_scope as usize].objects.push(value);
    }

    fn pop_scope(&mut self, out: &mut dyn Output) -> Result<()> {
        let index = self.current_scope as usize;
        let objects = std::mem::take(&mut self.scopes[index].objects);
        let mark = self.pending_dtors.len();
        // reverse declaration order
        for object in objects.into_iter().rev() {
            self.add_dtor_recursive(object)?;
        }
        self.execute_pending_dtors(mark, out)?;
        let marker = self.scopes[index].marker;
        self.program.memory.free_to(Region::Stack, marker);
        self.current_scope -= 1;
        Ok(())
    }

    // ---- construction / destruction recursion ----------------------------

    /// Queue default constructors for every interior object, members first,
    /// then (optionally) the value itself.
    fn add_ctor_recursive(&mut self, value: Value, include_self: bool) -> Result<()> {
        if value.is_array {
            let header = ArrayHeader::read(&self.program.memory, value.data)?;
            if header.elem_pointer_level == 0 && is_class_type(value.type_id) {
                let stride = elem_stride(&self.program.classes, value.type_id, 0);
                for i in 0..header.element_count() {
                    let element = Value {
                        type_id: value.type_id,
                        pointer_level: 0,
                        is_array: false,
                        is_reference: false,
                        data: value
                            .data
                            .offset((i * stride) as i64 + VTABLE_SLOT_SIZE as i64),
                    };
                    self.add_ctor_recursive(element, true)?;
                }
            }
            return Ok(());
        }
        if value.is_primitive() || value.is_pointer() || !is_class_type(value.type_id) {
            return Ok(());
        }

        let mut chain = Some(value.type_id);
        while let Some(class_id) = chain {
            for index in 0..self.program.class(class_id).member_fields.len() {
                let field = self.program.class(class_id).member_fields[index].clone();
                let ftype = field.type_info.type_id;
                if is_primitive_type(ftype) {
                    continue;
                }
                if !field.dims.is_empty() {
                    if field.type_info.pointer_level != 1 {
                        continue;
                    }
                    let stride = elem_stride(&self.program.classes, ftype, 0);
                    let count: u64 = field.dims.iter().map(|d| d.0 as u64).product();
                    for i in 0..count {
                        let element = Value {
                            type_id: ftype,
                            pointer_level: 0,
                            is_array: false,
                            is_reference: false,
                            data: value
                                .data
                                .offset(field.offset as i64 + (i * stride) as i64 + VTABLE_SLOT_SIZE as i64),
                        };
                        self.add_ctor_recursive(element, true)?;
                    }
                } else if field.type_info.pointer_level == 0 {
                    let member = Value {
                        type_id: ftype,
                        pointer_level: 0,
                        is_array: false,
                        is_reference: false,
                        data: value.data.offset(field.offset as i64),
                    };
                    self.add_ctor_recursive(member, true)?;
                }
            }
            chain = self.program.class(class_id).base;
        }

        if include_self {
            if let Some(ctor) = self.program.class(value.type_id).default_ctor {
                self.pending_ctors.push((value, ctor));
            }
        }
        Ok(())
    }

    fn execute_pending_ctors(&mut self, from: usize, out: &mut dyn Output) -> Result<()> {
        while self.pending_ctors.len() > from {
            let (value, ctor) = self.pending_ctors.remove(from);
            let this = Value::make_pointer(
                value.type_id,
                1,
                value.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.run_inline_fn(value.type_id, ctor, this, None, false, out)?;
        }
        Ok(())
    }

    /// Queue destructors child-first (reverse declaration order), then the
    /// value itself. Pointer members are never followed.
    fn add_dtor_recursive(&mut self, value: Value) -> Result<()> {
        if value.is_array {
            let header = ArrayHeader::read(&self.program.memory, value.data)?;
            if header.elem_pointer_level == 0 && is_class_type(value.type_id) {
                let stride = elem_stride(&self.program.classes, value.type_id, 0);
                for i in 0..header.element_count() {
                    let element = Value {
                        type_id: value.type_id,
                        pointer_level: 0,
                        is_array: false,
                        is_reference: false,
                        data: value
                            .data
                            .offset((i * stride) as i64 + VTABLE_SLOT_SIZE as i64),
                    };
                    self.add_dtor_recursive(element)?;
                }
            }
            return Ok(());
        }
        if value.is_primitive() || value.is_pointer() || !is_class_type(value.type_id) {
            return Ok(());
        }

        let mut chain = Some(value.type_id);
        while let Some(class_id) = chain {
            for index in (0..self.program.class(class_id).member_fields.len()).rev() {
                let field = self.program.class(class_id).member_fields[index].clone();
                let ftype = field.type_info.type_id;
                if is_primitive_type(ftype) {
                    continue;
                }
                if !field.dims.is_empty() {
                    if field.type_info.pointer_level != 1 {
                        continue;
                    }
                    let stride = elem_stride(&self.program.classes, ftype, 0);
                    let count: u64 = field.dims.iter().map(|d| d.0 as u64).product();
                    for i in (0..count).rev() {
                        let element = Value {
                            type_id: ftype,
                            pointer_level: 0,
                            is_array: false,
                            is_reference: false,
                            data: value
                                .data
                                .offset(field.offset as i64 + (i * stride) as i64 + VTABLE_SLOT_SIZE as i64),
                        };
                        self.add_dtor_recursive(element)?;
                    }
                } else if field.type_info.pointer_level == 0 {
                    let member = Value {
                        type_id: ftype,
                        pointer_level: 0,
                        is_array: false,
                        is_reference: false,
                        data: value.data.offset(field.offset as i64),
                    };
                    self.add_dtor_recursive(member)?;
                }
            }
            chain = self.program.class(class_id).base;
        }

        self.pending_dtors.push(value);
        Ok(())
    }

    fn execute_pending_dtors(&mut self, from: usize, out: &mut dyn Output) -> Result<()> {
        while self.pending_dtors.len() > from {
            let value = self.pending_dtors.remove(from);
            let dtor = match self.program.class(value.type_id).destructor {
                Some(d) => d,
                None => continue,
            };
            let this = Value::make_pointer(
                value.type_id,
                1,
                value.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.run_inline_fn(value.type_id, dtor, this, None, false, out)?;
        }
        Ok(())
    }

    // ---- calls -----------------------------------------------------------

    /// Pop arguments right-to-left into frame slots, applying implicit-cast
    /// constructors (ids read from the instruction stream when
    /// `read_casts`), copy construction for by-value object parameters and
    /// a final primitive conversion.
    fn bind_args(
        &mut self,
        frame: &mut Frame,
        class_id: TypeId,
        fn_id: u16,
        read_casts: bool,
        out: &mut dyn Output,
    ) -> Result<()> {
        let n_params = self.program.class(class_id).function(fn_id).params.len();
        for i in (0..n_params).rev() {
            let cast_fn = if read_casts { self.read_u16() } else { INVALID_ID };
            let param = self.program.class(class_id).function(fn_id).params[i].clone();
            let mut arg = self.pop()?;

            if cast_fn != INVALID_ID {
                let original = arg;
                arg = Value::make_object(
                    &self.program.classes,
                    param.type_info.type_id,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.register_scope_object(arg);
                let this = Value::make_pointer(
                    param.type_info.type_id,
                    1,
                    arg.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.run_inline_fn(param.type_info.type_id, cast_fn, this, Some(original), false, out)?;
            }

            if !param.is_reference {
                if is_class_type(param.type_info.type_id) && param.type_info.pointer_level == 0 {
                    let original = arg;
                    arg = Value::make_object(
                        &self.program.classes,
                        param.type_info.type_id,
                        &mut self.program.memory,
                        Region::Stack,
                    )?;
                    match self.program.class(param.type_info.type_id).copy_ctor {
                        Some(copy) => {
                            let this = Value::make_pointer(
                                param.type_info.type_id,
                                1,
                                arg.data,
                                &mut self.program.memory,
                                Region::Stack,
                            )?;
                            self.run_inline_fn(
                                param.type_info.type_id,
                                copy,
                                this,
                                Some(original),
                                false,
                                out,
                            )?;
                        }
                        None => {
                            let size = self.program.type_size(param.type_info.type_id);
                            arg.assign(&original, size, &mut self.program.memory)?;
                        }
                    }
                } else {
                    arg = arg.clone_into(&self.program.classes, &mut self.program.memory, Region::Stack)?;
                }
            }

            if arg.type_id != param.type_info.type_id && !arg.is_reference && arg.is_primitive() {
                arg = arg.cast_to(
                    &self.program.classes,
                    param.type_info.type_id,
                    param.type_info.pointer_level,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
            }

            frame.set_local(param.slot, arg);
        }
        Ok(())
    }

    /// Begin a function call in the main loop: push bookkeeping and jump.
    fn begin_call(
        &mut self,
        class_id: TypeId,
        fn_id: u16,
        use_ret: bool,
        this: Option<Value>,
        out: &mut dyn Output,
    ) -> Result<()> {
        let num_locals = self.program.class(class_id).function(fn_id).num_locals;
        let target_pc = self.program.class(class_id).function(fn_id).pc;
        let mut call = CallFrame {
            return_pc: 0,
            base_pointer: self.stack.len() as u32,
            use_ret,
            pop_this: this.is_some(),
            loop_count: self.loops.len() as u32,
            scope_count: 0,
        };
        self.push_scope();
        call.scope_count = self.current_scope as u32;

        let mut frame = self.frame_pool.acquire(num_locals);
        self.bind_args(&mut frame, class_id, fn_id, true, out)?;
        call.return_pc = self.pc;

        if let Some(this) = this {
            self.this_stack.push(this);
        }
        self.calls.push(call);
        self.frames.push(frame);
        self.pc = target_pc;
        Ok(())
    }

    /// Run a parameterless-or-one-argument function to completion inside
    /// the current opcode (constructors, destructors, copy/assign/cast
    /// helpers). No cast ids are read from the stream.
    fn run_inline_fn(
        &mut self,
        class_id: TypeId,
        fn_id: u16,
        this: Value,
        pushed_arg: Option<Value>,
        use_ret: bool,
        out: &mut dyn Output,
    ) -> Result<()> {
        let stop_pc = self.pc;
        let num_locals = self.program.class(class_id).function(fn_id).num_locals;
        let target_pc = self.program.class(class_id).function(fn_id).pc;

        let mut call = CallFrame {
            return_pc: stop_pc,
            base_pointer: self.stack.len() as u32,
            use_ret,
            pop_this: true,
            loop_count: self.loops.len() as u32,
            scope_count: 0,
        };
        self.push_scope();
        call.scope_count = self.current_scope as u32;

        if let Some(arg) = pushed_arg {
            self.stack.push(arg);
        }
        let mut frame = self.frame_pool.acquire(num_locals);
        self.bind_args(&mut frame, class_id, fn_id, false, out)?;

        self.this_stack.push(this);
        self.calls.push(call);
        self.frames.push(frame);
        self.pc = target_pc;

        while self.pc != stop_pc {
            let op = self.read_op()?;
            if op == Op::End {
                break;
            }
            self.execute(op, out)?;
        }
        Ok(())
    }

    fn do_return(&mut self, out: &mut dyn Output) -> Result<()> {
        let tag = self.read_u8();
        let frame = self.frames.pop().ok_or(Error::StackUnderflow)?;
        let call = self.calls.pop().ok_or(Error::StackUnderflow)?;

        if call.pop_this {
            self.this_stack.pop();
        }

        let mark = self.pending_dtors.len();
        let free_marker = self.scopes[call.scope_count as usize].marker;
        for index in (call.scope_count as i32..=self.current_scope).rev() {
            let objects = std::mem::take(&mut self.scopes[index as usize].objects);
            for object in objects.into_iter().rev() {
                self.add_dtor_recursive(object)?;
            }
        }
        self.current_scope = call.scope_count as i32 - 1;
        self.execute_pending_dtors(mark, out)?;

        self.loops.truncate(call.loop_count as usize);

        let return_marker = self.program.memory.marker(Region::Return);
        let mut result = None;
        if tag == 1 {
            let value = self.pop()?;
            if call.use_ret {
                let actual = value.actual(&self.program.memory)?;
                result = Some(actual.clone_into(
                    &self.program.classes,
                    &mut self.program.memory,
                    Region::Return,
                )?);
            }
        } else if tag == 2 {
            result = Some(self.pop()?);
        }

        self.program.memory.free_to(Region::Stack, free_marker);

        if let Some(value) = result {
            if tag == 2 {
                self.stack.push(value);
            } else {
                let back = value.clone_into(
                    &self.program.classes,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.program.memory.free_to(Region::Return, return_marker);
                self.stack.push(back);
            }
        }

        self.pc = call.return_pc;
        self.frame_pool.release(frame);
        Ok(())
    }

    // ---- the dispatch loop ----------------------------------------------

    fn execute(&mut self, op: Op, out: &mut dyn Output) -> Result<()> {
        if self.program.settings.trace {
            println!("{:>6} {:?} stack={}", self.pc, op, self.stack.len());
        }
        match op {
            Op::Jump => {
                self.pc = self.read_u32();
            }
            Op::JumpIfFalse => {
                let target = self.read_u32();
                let cond = self.pop()?;
                if !cond.get_bool(&self.program.memory)? {
                    self.pc = target;
                }
            }

            Op::PushPrim => {
                let prim = self.read_u8() as u16;
                let mem = &mut self.program.memory;
                let value = match Primitive::from_type(prim) {
                    Some(Primitive::UInt8) => {
                        let v = self.program.code.read_u8(&mut self.pc);
                        Value::make_u8(v, mem, Region::Stack)?
                    }
                    Some(Primitive::UInt16) => {
                        let v = self.program.code.read_u16(&mut self.pc);
                        Value::make_u16(v, mem, Region::Stack)?
                    }
                    Some(Primitive::UInt32) => {
                        let v = self.program.code.read_u32(&mut self.pc);
                        Value::make_u32(v, mem, Region::Stack)?
                    }
                    Some(Primitive::UInt64) => {
                        let v = self.program.code.read_u64(&mut self.pc);
                        Value::make_u64(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Int8) => {
                        let v = self.program.code.read_u8(&mut self.pc) as i8;
                        Value::make_i8(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Int16) => {
                        let v = self.program.code.read_u16(&mut self.pc) as i16;
                        Value::make_i16(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Int32) => {
                        let v = self.program.code.read_u32(&mut self.pc) as i32;
                        Value::make_i32(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Int64) => {
                        let v = self.program.code.read_i64(&mut self.pc);
                        Value::make_i64(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Real32) => {
                        let v = self.program.code.read_f32(&mut self.pc);
                        Value::make_f32(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Real64) => {
                        let v = self.program.code.read_f64(&mut self.pc);
                        Value::make_f64(v, mem, Region::Stack)?
                    }
                    Some(Primitive::Bool) => {
                        let v = self.program.code.read_u8(&mut self.pc);
                        Value::make_bool(v != 0, mem, Region::Stack)?
                    }
                    Some(Primitive::Char) => {
                        let v = self.program.code.read_u8(&mut self.pc);
                        Value::make_char(v, mem, Region::Stack)?
                    }
                    _ => return Err(Error::BadOpcode(prim)),
                };
                self.stack.push(value);
            }

            Op::PushStr => {
                let text = Addr(self.read_u64());
                let value = Value::make_cstr(text, &mut self.program.memory, Region::Stack)?;
                self.stack.push(value);
            }

            Op::PushLocal => {
                let slot = self.read_u16();
                let frame = self.frames.last().ok_or(Error::StackUnderflow)?;
                let value = frame.local(slot).actual(&self.program.memory)?;
                self.stack.push(value);
            }

            Op::PushNull => {
                let type_id = self.read_u16();
                let plevel = self.read_u8();
                self.stack.push(Value::make_null(type_id, plevel));
            }

            Op::PushIndexed => self.push_indexed(out)?,

            Op::PushStatic => {
                let class_id = self.read_u16();
                let offset = self.read_u64();
                let type_id = self.read_u16();
                let plevel = self.read_u8();
                let is_reference = self.read_u8() != 0;
                let is_array = self.read_u8() != 0;
                let base = self.program.class(class_id).static_base;
                self.stack.push(Value {
                    type_id,
                    pointer_level: plevel,
                    is_array,
                    is_reference,
                    data: base.offset(offset as i64),
                });
            }

            Op::PushMember => {
                let type_id = self.read_u16();
                let plevel = self.read_u8();
                let offset = self.read_u64();
                let is_reference = self.read_u8() != 0;
                let is_array = self.read_u8() != 0;
                let base = self.pop()?;
                if base.data.is_null() {
                    return Err(Error::NullPointer);
                }
                self.stack.push(Value {
                    type_id,
                    pointer_level: plevel,
                    is_array,
                    is_reference,
                    data: base.data.offset(offset as i64),
                });
            }

            Op::PushThis => {
                let this = *self.this_stack.last().ok_or(Error::StackUnderflow)?;
                self.stack.push(this);
            }

            Op::PushScope => self.push_scope(),
            Op::PopScope => self.pop_scope(out)?,

            Op::PushLoop => {
                let start_pc = self.read_u32();
                let end_pc = self.read_u32();
                self.loops.push(LoopFrame {
                    start_pc,
                    end_pc,
                    scope_count: self.current_scope,
                });
            }
            Op::PopLoop => {
                self.loops.pop();
            }

            Op::DeclarePrim => {
                let prim = self.read_u8() as u16;
                let slot = self.read_u16();
                let value = self.pop()?;
                let stored = value.cast_to(
                    &self.program.classes,
                    prim,
                    0,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.frames
                    .last_mut()
                    .ok_or(Error::StackUnderflow)?
                    .set_local(slot, stored);
            }

            Op::DeclarePointer => {
                let type_id = self.read_u16();
                let plevel = self.read_u8();
                let slot = self.read_u16();
                let value = self.pop()?;
                let stored = if value.data.is_null() {
                    // a null initializer still gets a pointer cell
                    Value::make_pointer(type_id, plevel, Addr::NULL, &mut self.program.memory, Region::Stack)?
                } else {
                    value.clone_into(&self.program.classes, &mut self.program.memory, Region::Stack)?
                };
                self.frames
                    .last_mut()
                    .ok_or(Error::StackUnderflow)?
                    .set_local(slot, stored);
            }

            Op::DeclareArray => self.declare_array(out)?,
            Op::DeclareObject => self.declare_object(out)?,
            Op::DeclareObjectAssign => self.declare_object_assign(out)?,

            Op::DeclareRef => {
                let slot = self.read_u16();
                let value = self.pop()?;
                let reference =
                    Value::make_reference(&value, &mut self.program.memory, Region::Stack)?;
                self.frames
                    .last_mut()
                    .ok_or(Error::StackUnderflow)?
                    .set_local(slot, reference);
            }

            Op::Set => {
                let assign_fn = self.read_u16();
                let target = self.pop()?;
                let value = self.pop()?;
                if assign_fn == INVALID_ID {
                    let size = self.program.type_size(target.type_id);
                    target.assign(&value, size, &mut self.program.memory)?;
                } else {
                    let this = Value::make_pointer(
                        target.type_id,
                        1,
                        target.actual(&self.program.memory)?.data,
                        &mut self.program.memory,
                        Region::Stack,
                    )?;
                    self.run_inline_fn(target.type_id, assign_fn, this, Some(value), false, out)?;
                }
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Less | Op::Greater
            | Op::LessEq | Op::GreaterEq | Op::Eq | Op::NotEq | Op::BitAnd | Op::BitOr
            | Op::Shl | Op::Shr | Op::LogicalAnd | Op::LogicalOr => self.binary_op(op, out)?,

            Op::AddAssign | Op::SubAssign | Op::MulAssign | Op::DivAssign | Op::ModAssign => {
                let amount = self.pop()?;
                let target = self.pop()?;
                let mem = &mut self.program.memory;
                match op {
                    Op::AddAssign => target.plus_equals(&amount, mem)?,
                    Op::SubAssign => target.minus_equals(&amount, mem)?,
                    Op::MulAssign => target.times_equals(&amount, mem)?,
                    Op::DivAssign => target.divide_equals(&amount, mem)?,
                    _ => target.mod_equals(&amount, mem)?,
                }
            }

            Op::UnaryUpdate => {
                let kind = self.read_u8();
                let push = self.read_u8() != 0;
                match kind {
                    0 | 1 => {
                        let value = *self.stack.last().ok_or(Error::StackUnderflow)?;
                        if kind == 0 {
                            value.increment(&mut self.program.memory)?;
                        } else {
                            value.decrement(&mut self.program.memory)?;
                        }
                        if !push {
                            self.stack.pop();
                        }
                    }
                    _ => {
                        let value = self.pop()?;
                        let before = if push {
                            Some(value.clone_into(
                                &self.program.classes,
                                &mut self.program.memory,
                                Region::Stack,
                            )?)
                        } else {
                            None
                        };
                        if kind == 2 {
                            value.increment(&mut self.program.memory)?;
                        } else {
                            value.decrement(&mut self.program.memory)?;
                        }
                        if let Some(before) = before {
                            self.stack.push(before);
                        }
                    }
                }
            }

            Op::Negate => {
                let value = self.pop()?;
                let result = value.negate(&mut self.program.memory, Region::Stack)?;
                self.stack.push(result);
            }

            Op::Invert => {
                let value = self.pop()?;
                let result = value.invert(&mut self.program.memory, Region::Stack)?;
                self.stack.push(result);
            }

            Op::AddressOf => {
                let value = self.pop()?;
                let pointer = Value::make_pointer(
                    value.type_id,
                    value.pointer_level + 1,
                    value.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.stack.push(pointer);
            }

            Op::Deref => {
                let pointer = self.pop()?;
                let value = pointer.actual(&self.program.memory)?.dereference(&self.program.memory)?;
                self.stack.push(value);
            }

            Op::Cast => {
                let type_id = self.read_u16();
                let plevel = self.read_u8();
                let value = self.pop()?;
                let program = &mut self.program;
                let result = value.cast_to(
                    &program.classes,
                    type_id,
                    plevel,
                    &mut program.memory,
                    Region::Stack,
                )?;
                self.stack.push(result);
            }

            Op::Break => {
                let frame = *self.loops.last().ok_or(Error::MissingLoop)?;
                while self.current_scope > frame.scope_count + 1 {
                    self.pop_scope(out)?;
                }
                self.pc = frame.end_pc;
            }

            Op::Continue => {
                let frame = *self.loops.last().ok_or(Error::MissingLoop)?;
                while self.current_scope > frame.scope_count + 1 {
                    self.pop_scope(out)?;
                }
                self.pc = frame.start_pc;
            }

            Op::Breakpoint => {
                if self.program.settings.trace {
                    println!("breakpoint: pc={} {}", self.pc, self.trace_state());
                }
            }

            Op::ModuleConstant => {
                let module = self.read_u16();
                let constant = self.read_u16();
                let mut ctx = ModuleCtx {
                    memory: &mut self.program.memory,
                    fs: &mut self.fs,
                    out,
                    started: self.started,
                };
                let value = modules::constant(&mut ctx, module, constant)?;
                self.stack.push(value);
            }

            Op::ModuleCall => {
                let module = self.read_u16();
                let function = self.read_u16();
                let argc = self.read_u8();
                let use_ret = self.read_u8() != 0;
                self.arg_storage.clear();
                for _ in 0..argc {
                    let arg = self.pop()?;
                    self.arg_storage.push(arg);
                }
                let args = std::mem::take(&mut self.arg_storage);
                let value = {
                    let mut ctx = ModuleCtx {
                        memory: &mut self.program.memory,
                        fs: &mut self.fs,
                        out,
                        started: self.started,
                    };
                    modules::call(&mut ctx, module, function, &args)?
                };
                self.arg_storage = args;
                if use_ret && value.type_info().is_valid() {
                    self.stack.push(value);
                }
            }

            Op::StaticCall => {
                let class_id = self.read_u16();
                let fn_id = self.read_u16();
                let use_ret = self.read_u8() != 0;
                self.begin_call(class_id, fn_id, use_ret, None, out)?;
            }

            Op::MemberCall => {
                let class_id = self.read_u16();
                let fn_id = self.read_u16();
                let use_ret = self.read_u8() != 0;
                let receiver = self.pop()?.actual(&self.program.memory)?;
                let this = Value::make_pointer(
                    receiver.type_id,
                    1,
                    receiver.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.begin_call(class_id, fn_id, use_ret, Some(this), out)?;
            }

            Op::VirtualCall => {
                let slot = self.read_u16();
                let use_ret = self.read_u8() != 0;
                let receiver = self.pop()?.actual(&self.program.memory)?;
                if receiver.data.is_null() {
                    return Err(Error::NullPointer);
                }
                let dynamic_type = self
                    .program
                    .memory
                    .read_u64(receiver.data.offset(-(VTABLE_SLOT_SIZE as i64)))?
                    as u16;
                if !is_class_type(dynamic_type) {
                    return Err(Error::BadVirtualSlot(slot));
                }
                let vslot = self
                    .program
                    .class(dynamic_type)
                    .vtable
                    .slots
                    .get(slot as usize)
                    .copied()
                    .ok_or(Error::BadVirtualSlot(slot))?;
                let this = Value::make_pointer(
                    dynamic_type,
                    1,
                    receiver.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.begin_call(vslot.class_id, vslot.fn_id, use_ret, Some(this), out)?;
            }

            Op::ConstructorCall => {
                let type_id = self.read_u16();
                let fn_id = self.read_u16();
                let object = Value::make_object(
                    &self.program.classes,
                    type_id,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.register_scope_object(object);
                let mark = self.pending_ctors.len();
                self.add_ctor_recursive(object, false)?;
                self.execute_pending_ctors(mark, out)?;
                if fn_id != INVALID_ID {
                    let this = Value::make_pointer(
                        type_id,
                        1,
                        object.data,
                        &mut self.program.memory,
                        Region::Stack,
                    )?;
                    self.begin_call(type_id, fn_id, false, Some(this), out)?;
                }
                self.stack.push(object);
            }

            Op::New => {
                let type_id = self.read_u16();
                let fn_id = self.read_u16();
                let object = Value::make_object(
                    &self.program.classes,
                    type_id,
                    &mut self.program.memory,
                    Region::Heap,
                )?;
                let pointer = Value::make_pointer(
                    type_id,
                    1,
                    object.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                let mark = self.pending_ctors.len();
                self.add_ctor_recursive(object, false)?;
                self.execute_pending_ctors(mark, out)?;
                if fn_id != INVALID_ID {
                    let this = Value::make_pointer(
                        type_id,
                        1,
                        object.data,
                        &mut self.program.memory,
                        Region::Stack,
                    )?;
                    self.begin_call(type_id, fn_id, false, Some(this), out)?;
                }
                self.stack.push(pointer);
            }

            Op::NewArray => {
                let type_id = self.read_u16();
                let elem_plevel = self.read_u8();
                let count = self.pop()?.actual(&self.program.memory)?.get_u64(&self.program.memory)? as u32;
                let array = Value::make_array(
                    &self.program.classes,
                    type_id,
                    elem_plevel,
                    &[count],
                    &mut self.program.memory,
                    Region::Heap,
                )?;
                if elem_plevel == 0 && is_class_type(type_id) {
                    let mark = self.pending_ctors.len();
                    self.add_ctor_recursive(array, false)?;
                    self.execute_pending_ctors(mark, out)?;
                }
                let pointer = Value::make_pointer(
                    type_id,
                    1 + elem_plevel,
                    array.data,
                    &mut self.program.memory,
                    Region::Stack,
                )?;
                self.stack.push(pointer);
            }

            Op::Delete => {
                let pointer = self.pop()?.actual(&self.program.memory)?;
                let object = pointer.dereference(&self.program.memory)?;
                if object.data.is_null() {
                    return Err(Error::NullPointer);
                }
                if is_class_type(object.type_id) && object.pointer_level == 0 {
                    let mark = self.pending_dtors.len();
                    self.add_dtor_recursive(object)?;
                    self.execute_pending_dtors(mark, out)?;
                    self.program
                        .memory
                        .free(object.data.offset(-(VTABLE_SLOT_SIZE as i64)))?;
                } else {
                    self.program.memory.free(object.data)?;
                }
            }

            Op::DeleteArray => {
                let pointer = self.pop()?.actual(&self.program.memory)?;
                let mut array = pointer.dereference(&self.program.memory)?;
                if array.data.is_null() {
                    return Err(Error::NullPointer);
                }
                array.is_array = true;
                let header = ArrayHeader::read(&self.program.memory, array.data)?;
                if header.elem_pointer_level == 0 && is_class_type(array.type_id) {
                    let mark = self.pending_dtors.len();
                    self.add_dtor_recursive(array)?;
                    self.execute_pending_dtors(mark, out)?;
                }
                self.program
                    .memory
                    .free(array.data.offset(-(ARRAY_HEADER_SIZE as i64)))?;
            }

            Op::Strlen => {
                let value = self.pop()?.actual(&self.program.memory)?;
                let text = Addr(value.pointer_word(&self.program.memory)?);
                let length = self.program.memory.read_cstr(text)?.len() as u32;
                let result = Value::make_u32(length, &mut self.program.memory, Region::Stack)?;
                self.stack.push(result);
            }

            Op::Return => self.do_return(out)?,

            Op::End => {}
        }
        Ok(())
    }

    fn binary_op(&mut self, op: Op, out: &mut dyn Output) -> Result<()> {
        let op_fn = self.read_u16();
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        // pointer arithmetic moves in units of the pointee size
        if (op == Op::Add || op == Op::Sub) && lhs.is_pointer() {
            let size = self.program.type_size(lhs.type_id).max(1);
            let count = rhs.get_u64(&self.program.memory)?;
            let target = Addr(lhs.pointer_word(&self.program.memory)?);
            let moved = if op == Op::Add {
                target.offset((count * size) as i64)
            } else {
                target.offset(-((count * size) as i64))
            };
            let result = Value::make_pointer(
                lhs.type_id,
                lhs.pointer_level,
                moved,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.stack.push(result);
            return Ok(());
        }

        if op_fn != INVALID_ID {
            // skip the rhs implicit-cast id; the operator overload path
            // binds it itself
            let _cast = self.read_u16();
            let lhs_actual = lhs.actual(&self.program.memory)?;
            let this = Value::make_pointer(
                lhs_actual.type_id,
                1,
                lhs_actual.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.run_inline_fn(lhs_actual.type_id, op_fn, this, Some(rhs), true, out)?;
            return Ok(());
        }

        let program = &mut self.program;
        let mem = &mut program.memory;
        let result = match op {
            Op::Add => lhs.add(&rhs, mem, Region::Stack)?,
            Op::Sub => lhs.sub(&rhs, mem, Region::Stack)?,
            Op::Mul => lhs.mul(&rhs, mem, Region::Stack)?,
            Op::Div => lhs.div(&rhs, mem, Region::Stack)?,
            Op::Mod => lhs.modulo(&rhs, mem, Region::Stack)?,
            Op::Less => lhs.less(&rhs, mem, Region::Stack)?,
            Op::Greater => lhs.greater(&rhs, mem, Region::Stack)?,
            Op::LessEq => lhs.less_eq(&rhs, mem, Region::Stack)?,
            Op::GreaterEq => lhs.greater_eq(&rhs, mem, Region::Stack)?,
            Op::Eq => lhs.equals(&rhs, mem, Region::Stack)?,
            Op::NotEq => lhs.not_equals(&rhs, mem, Region::Stack)?,
            Op::BitAnd => lhs.bit_and(&rhs, mem, Region::Stack)?,
            Op::BitOr => lhs.bit_or(&rhs, mem, Region::Stack)?,
            Op::Shl => lhs.shift_left(&rhs, mem, Region::Stack)?,
            Op::Shr => lhs.shift_right(&rhs, mem, Region::Stack)?,
            Op::LogicalAnd => lhs.logical_and(&rhs, mem, Region::Stack)?,
            Op::LogicalOr => lhs.logical_or(&rhs, mem, Region::Stack)?,
            _ => unreachable!(),
        };
        self.stack.push(result);
        Ok(())
    }

    fn push_indexed(&mut self, out: &mut dyn Output) -> Result<()> {
        let elem_size = self.read_u64();
        let n_indices = self.read_u8() as usize;
        let index_fn = self.read_u16();

        if index_fn != INVALID_ID {
            let class_id = self.read_u16();
            // receiver sits below the index arguments; bind args first,
            // then pop it
            let num_locals = self.program.class(class_id).function(index_fn).num_locals;
            let target_pc = self.program.class(class_id).function(index_fn).pc;
            let mut call = CallFrame {
                return_pc: 0,
                base_pointer: self.stack.len() as u32,
                use_ret: true,
                pop_this: true,
                loop_count: self.loops.len() as u32,
                scope_count: 0,
            };
            self.push_scope();
            call.scope_count = self.current_scope as u32;
            let mut frame = self.frame_pool.acquire(num_locals);
            self.bind_args(&mut frame, class_id, index_fn, true, out)?;
            call.return_pc = self.pc;

            let receiver = self.pop()?.actual(&self.program.memory)?;
            let this = Value::make_pointer(
                receiver.type_id,
                1,
                receiver.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.this_stack.push(this);
            self.calls.push(call);
            self.frames.push(frame);
            self.pc = target_pc;
            return Ok(());
        }

        let mut dims = [0u32; 8];
        for i in 0..n_indices {
            let index = self.pop()?.actual(&self.program.memory)?;
            dims[i] = index.get_u64(&self.program.memory)? as u32;
        }
        let base = self.pop()?.actual(&self.program.memory)?;
        if base.pointer_level == 0 {
            return Err(Error::NullPointer);
        }

        let elem_plevel = base.pointer_level - 1;
        let object_elem = elem_plevel == 0 && is_class_type(base.type_id);
        let stride = if elem_plevel > 0 {
            8
        } else if object_elem {
            VTABLE_SLOT_SIZE + elem_size
        } else {
            elem_size.max(1)
        };

        let data = if base.is_array {
            let header = ArrayHeader::read(&self.program.memory, base.data)?;
            let index = base.linear_index(&self.program.memory, &dims[..n_indices])?;
            let len = header.element_count();
            if index >= len {
                return Err(Error::IndexOutOfBounds { index, len });
            }
            base.data
                .offset((index * stride) as i64 + if object_elem { VTABLE_SLOT_SIZE as i64 } else { 0 })
        } else {
            let mut target = Addr(self.program.memory.read_u64(base.data)?);
            if target.is_null() {
                return Err(Error::NullPointer);
            }
            let mut level = elem_plevel;
            for i in 0..n_indices {
                if level > 0 {
                    target = target.offset((dims[i] as u64 * 8) as i64);
                    level -= 1;
                } else {
                    target = target.offset(
                        (dims[i] as u64 * stride) as i64
                            + if object_elem && i + 1 == n_indices {
                                VTABLE_SLOT_SIZE as i64
                            } else {
                                0
                            },
                    );
                }
            }
            target
        };

        self.stack.push(Value {
            type_id: base.type_id,
            pointer_level: elem_plevel,
            is_array: false,
            is_reference: false,
            data,
        });
        Ok(())
    }

    fn declare_array(&mut self, out: &mut dyn Output) -> Result<()> {
        let type_id = self.read_u16();
        let elem_plevel = self.read_u8();
        let n_dims = self.read_u8() as usize;
        let n_inits = self.read_u32();
        let slot = self.read_u16();
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(self.read_u32());
        }

        let array = Value::make_array(
            &self.program.classes,
            type_id,
            elem_plevel,
            &dims,
            &mut self.program.memory,
            Region::Stack,
        )?;

        if elem_plevel == 0 && is_class_type(type_id) {
            self.register_scope_object(array);
            let mark = self.pending_ctors.len();
            self.add_ctor_recursive(array, false)?;
            self.execute_pending_ctors(mark, out)?;
        }

        let stride = elem_stride(&self.program.classes, type_id, elem_plevel);
        let object_elem = elem_plevel == 0 && is_class_type(type_id);
        for i in 0..n_inits as u64 {
            let value = self.pop()?;
            let element = Value {
                type_id,
                pointer_level: elem_plevel,
                is_array: false,
                is_reference: false,
                data: array
                    .data
                    .offset((i * stride) as i64 + if object_elem { VTABLE_SLOT_SIZE as i64 } else { 0 }),
            };
            let size = type_size(&self.program.classes, type_id);
            element.assign(&value, size, &mut self.program.memory)?;
        }

        self.frames
            .last_mut()
            .ok_or(Error::StackUnderflow)?
            .set_local(slot, array);
        Ok(())
    }

    fn trace_state(&self) -> String {
        format!(
            "stack={} frames={} scopes={} loops={}",
            self.stack.len(),
            self.frames.len(),
            self.scope_depth(),
            self.loops.len()
        )
    }

    fn declare_object(&mut self, out: &mut dyn Output) -> Result<()> {
        let type_id = self.read_u16();
        let fn_id = self.read_u16();
        let slot = self.read_u16();

        let object = Value::make_object(
            &self.program.classes,
            type_id,
            &mut self.program.memory,
            Region::Stack,
        )?;
        self.frames
            .last_mut()
            .ok_or(Error::StackUnderflow)?
            .set_local(slot, object);
        self.register_scope_object(object);

        let mark = self.pending_ctors.len();
        self.add_ctor_recursive(object, false)?;
        self.execute_pending_ctors(mark, out)?;

        if fn_id != INVALID_ID {
            let this = Value::make_pointer(
                type_id,
                1,
                object.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.begin_call(type_id, fn_id, false, Some(this), out)?;
        }
        Ok(())
    }

    fn declare_object_assign(&mut self, out: &mut dyn Output) -> Result<()> {
        let type_id = self.read_u16();
        let slot = self.read_u16();
        let copy_fn = self.read_u16();

        let value = self.pop()?;
        let object = Value::make_object(
            &self.program.classes,
            type_id,
            &mut self.program.memory,
            Region::Stack,
        )?;
        self.frames
            .last_mut()
            .ok_or(Error::StackUnderflow)?
            .set_local(slot, object);
        self.register_scope_object(object);

        let mark = self.pending_ctors.len();
        self.add_ctor_recursive(object, false)?;
        self.execute_pending_ctors(mark, out)?;

        if copy_fn != INVALID_ID {
            let this = Value::make_pointer(
                type_id,
                1,
                object.data,
                &mut self.program.memory,
                Region::Stack,
            )?;
            self.run_inline_fn(type_id, copy_fn, this, Some(value), false, out)?;
        } else {
            let size = self.program.type_size(type_id);
            object.assign(&value, size, &mut self.program.memory)?;
        }
        Ok(())
    }
}


// These tests run whole programs through the front end and assert on
// observable behavior: printed output, allocator accounting, and that
// every runtime stack returns to its pre-call depth. Any conforming
// implementation should pass them.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::parser::Parser;
    use crate::program::Program;
    use std::path::Path;

    fn compile(source: &str) -> (Program, u32) {
        let mut program = Program::new(Settings::default());
        let mut parser = Parser::new(&mut program);
        parser.parse_source(source, Path::new("."));
        let errors: Vec<String> = parser.errors().iter().map(|e| e.to_string()).collect();
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        let entry = program.compile().expect("compile failed");
        (program, entry)
    }

    fn run(source: &str) -> (Vec<String>, Vm) {
        let (program, entry) = compile(source);
        let mut vm = Vm::new(program);
        let mut out: Vec<String> = Vec::new();
        vm.run(entry, &mut out).expect("runtime error");

        // call/return balance: every stack is back at its pre-call depth
        assert_eq!(vm.stack_depth(), 0, "value stack not drained");
        assert_eq!(vm.frame_depth(), 0, "frame stack not drained");
        assert_eq!(vm.this_depth(), 0, "this stack not drained");
        assert_eq!(vm.loop_depth(), 0, "loop stack not drained");
        assert_eq!(vm.scope_depth(), 1, "scope stack not balanced");
        (out, vm)
    }

    fn run_err(source: &str) -> Error {
        let (program, entry) = compile(source);
        let mut vm = Vm::new(program);
        let mut out: Vec<String> = Vec::new();
        vm.run(entry, &mut out).expect_err("expected a runtime error")
    }

    fn lines(out: &[String]) -> Vec<String> {
        out.concat().lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn recursive_function() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static int32 fib(int32 n) {
                    if (n < 2) return n;
                    return fib(n - 1) + fib(n - 2);
                }
                static void Main() {
                    IO.Println(fib(10));
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["55"]);
    }

    #[test]
    fn locals_arithmetic_and_compound_assignment() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 x = 10;
                    x += 5;
                    x *= 2;
                    x -= 6;
                    x /= 4;
                    IO.Println(x);
                    real64 r = 1.5;
                    r += 2.25;
                    IO.Println(r);
                    x++;
                    ++x;
                    x--;
                    IO.Println(x);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["6", "3.75", "7"]);
    }

    #[test]
    fn loops_break_and_continue() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 sum = 0;
                    for (int32 i = 0; i < 10; i++) {
                        if (i == 3) continue;
                        if (i == 7) break;
                        sum += i;
                    }
                    IO.Println(sum);

                    int32 n = 0;
                    while (true) {
                        n++;
                        if (n >= 4) break;
                    }
                    IO.Println(n);
                }
            }
            "#,
        );
        // 0+1+2+4+5+6 = 18
        assert_eq!(lines(&out), vec!["18", "4"]);
    }

    #[test]
    fn generic_container_push_get() {
        let (out, vm) = run(
            r#"
            Import IO;
            class Vec -> template[class T] {
                T data[16];
                uint32 count;
                void Push(T v) {
                    data[count] = v;
                    count++;
                }
                T Get(uint32 i) {
                    return data[i];
                }
            }
            class M {
                static void Main() {
                    Vec<int32> v;
                    v.Push(1);
                    v.Push(2);
                    v.Push(3);
                    IO.Println(v.Get(1));
                    Vec<int32> w;
                    w.Push(9);
                    IO.Println(w.Get(0));
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["2", "9"]);
        // Vec<int32> was synthesized exactly once
        let instances = vm
            .program
            .classes
            .iter()
            .filter(|c| c.name == "Vec<int32>")
            .count();
        assert_eq!(instances, 1);
    }

    #[test]
    fn template_instantiation_is_idempotent() {
        let (mut program, _) = compile(
            r#"
            Import IO;
            class Box -> template[class T] {
                T item;
            }
            class M {
                static void Main() {
                    Box<int32> b;
                    IO.Println(0);
                }
            }
            "#,
        );
        use crate::template::{TemplateArg, TemplateInstantiation};
        let template_id = program.class_id("Box");
        let inst = TemplateInstantiation {
            args: vec![TemplateArg::concrete_type(crate::types::TYPE_INT32, 0)],
        };
        let first = program.instantiate_template(template_id, &inst).unwrap();
        let second = program.instantiate_template(template_id, &inst).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, program.class_id("Box<int32>"));
    }

    #[test]
    fn inheritance_virtual_dispatch() {
        let (out, vm) = run(
            r#"
            Import IO;
            class A {
                virtual int32 f() { return 1; }
            }
            class B -> inherit[A] {
                virtual int32 f() { return 2; }
            }
            class M {
                static void Main() {
                    A* a = new B();
                    IO.Println(a->f());
                    delete a;
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["2"]);
        let mem = &vm.program.memory;
        assert_eq!(mem.heap_allocs(), mem.heap_frees());
    }

    #[test]
    fn non_virtual_calls_use_static_type() {
        let (out, _) = run(
            r#"
            Import IO;
            class A {
                int32 g() { return 10; }
                virtual int32 f() { return 1; }
            }
            class B -> inherit[A] {
                virtual int32 f() { return 2; }
            }
            class M {
                static void Main() {
                    B b;
                    IO.Println(b.f());
                    IO.Println(b.g());
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["2", "10"]);
    }

    #[test]
    fn operator_overload_adds_componentwise() {
        let (out, _) = run(
            r#"
            Import IO;
            class Vec3 {
                real64 x;
                real64 y;
                real64 z;
                Vec3(real64 a, real64 b, real64 c) {
                    x = a;
                    y = b;
                    z = c;
                }
                Vec3 operator+(Vec3 o) {
                    return Vec3(x + o.x, y + o.y, z + o.z);
                }
            }
            class M {
                static void Main() {
                    Vec3 c = Vec3(1.0, 2.0, 3.0) + Vec3(4.0, 5.0, 6.0);
                    IO.Println(c.x);
                    IO.Println(c.y);
                    IO.Println(c.z);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["5", "7", "9"]);
    }

    #[test]
    fn destructors_run_in_reverse_declaration_order() {
        let (out, _) = run(
            r#"
            Import IO;
            class Tracer {
                int32 id;
                Tracer(int32 i) {
                    id = i;
                    IO.Println(id);
                }
                ~Tracer() {
                    IO.Println(id + 100);
                }
            }
            class M {
                static void Main() {
                    if (true) {
                        Tracer a(1);
                        Tracer b(2);
                    }
                    IO.Println(999);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["1", "2", "102", "101", "999"]);
    }

    #[test]
    fn constructor_destructor_counts_balance() {
        let (out, _) = run(
            r#"
            Import IO;
            class Counter {
                static int32 lives;
                Counter() { lives += 1; }
                ~Counter() { lives -= 1; }
            }
            class Pair {
                Counter first;
                Counter second;
            }
            class M {
                static void Main() {
                    if (true) {
                        Counter a;
                        Pair p;
                        Counter arr[3];
                    }
                    IO.Println(Counter.lives);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["0"]);
    }

    #[test]
    fn array_literal_and_bounds() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 xs[3] = {10, 20, 30};
                    IO.Println(xs[2]);
                    xs[1] = 25;
                    IO.Println(xs[0] + xs[1]);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["30", "35"]);

        let e = run_err(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 xs[3] = {10, 20, 30};
                    IO.Println(xs[3]);
                }
            }
            "#,
        );
        assert!(matches!(e, Error::IndexOutOfBounds { index: 3, len: 3 }));
    }

    #[test]
    fn two_dimensional_arrays_are_row_major() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 grid[2][3];
                    for (int32 i = 0; i < 2; i++) {
                        for (int32 j = 0; j < 3; j++) {
                            grid[i][j] = i * 3 + j;
                        }
                    }
                    IO.Println(grid[1][2]);
                    IO.Println(grid[0][1]);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["5", "1"]);
    }

    #[test]
    fn division_by_zero_aborts() {
        let e = run_err(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 a = 1;
                    int32 b = 0;
                    IO.Println(a / b);
                }
            }
            "#,
        );
        assert_eq!(e, Error::DivideByZero);
    }

    #[test]
    fn heap_arrays_new_and_delete() {
        let (out, vm) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32* xs = new int32[4];
                    xs[0] = 7;
                    xs[3] = 11;
                    IO.Println(xs[0] + xs[3]);
                    delete[] xs;
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["18"]);
        let mem = &vm.program.memory;
        assert_eq!(mem.heap_allocs(), mem.heap_frees());
    }

    #[test]
    fn pointers_address_of_and_dereference() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    int32 x = 41;
                    int32* p = &x;
                    IO.Println(*p + 1);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["42"]);
    }

    #[test]
    fn references_alias_their_referent() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Add(int32& v) {
                    v = v + 5;
                }
                static void Main() {
                    int32 x = 10;
                    Add(x);
                    IO.Println(x);
                    int32& r = x;
                    r = 99;
                    IO.Println(x);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["15", "99"]);
    }

    #[test]
    fn static_fields_initialize_before_main() {
        let (out, _) = run(
            r#"
            Import IO;
            class Config {
                static int32 level = 3;
                static int32 bonus;
            }
            class M {
                static void Main() {
                    IO.Println(Config.level);
                    IO.Println(Config.bonus);
                    Config.bonus = Config.level * 2;
                    IO.Println(Config.bonus);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["3", "0", "6"]);
    }

    #[test]
    fn module_math_and_constants() {
        let (out, _) = run(
            r#"
            Import IO;
            Import Math;
            class M {
                static void Main() {
                    IO.Println(Math.Sqrt(16.0));
                    IO.Println(Math.Max(2.0, 7.0));
                    IO.Println(Math.Floor(Math.PI));
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["4", "7", "3"]);
    }

    #[test]
    fn strings_strlen_and_print() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    char* s = "hello";
                    IO.Println(s);
                    IO.Println(strlen(s));
                    IO.Print("a\tb");
                    IO.Println("");
                }
            }
            "#,
        );
        assert_eq!(out.concat(), "hello\n5\na\tb\n");
    }

    #[test]
    fn sizeof_and_offsetof() {
        let (out, _) = run(
            r#"
            Import IO;
            class P {
                int32 a;
                int32 b;
            }
            class M {
                static void Main() {
                    IO.Println(sizeof(int32));
                    IO.Println(sizeof(P));
                    IO.Println(sizeof(P*));
                    IO.Println(offsetof(P.b));
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["4", "8", "8", "4"]);
    }

    #[test]
    fn casts_between_primitives() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static void Main() {
                    real64 r = 3.9;
                    int32 i = (int32) r;
                    IO.Println(i);
                    IO.Println((int32) 2.5 + 1);
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["3", "3"]);
    }

    #[test]
    fn methods_on_members_and_this() {
        let (out, _) = run(
            r#"
            Import IO;
            class Inner {
                int32 v;
                int32 doubled() { return v * 2; }
            }
            class Outer {
                Inner inner;
                int32 get() {
                    inner.v = 21;
                    return inner.doubled();
                }
            }
            class M {
                static void Main() {
                    Outer o;
                    IO.Println(o.get());
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["42"]);
    }

    #[test]
    fn overload_picks_best_conversion() {
        let (out, _) = run(
            r#"
            Import IO;
            class M {
                static int32 pick(int32 v) { return 1; }
                static int32 pick(real64 v) { return 2; }
                static void Main() {
                    int16 small = 3;
                    real32 narrow = 1.5;
                    IO.Println(pick(small));
                    IO.Println(pick(narrow));
                }
            }
            "#,
        );
        assert_eq!(lines(&out), vec!["1", "2"]);
    }

    #[test]
    fn unresolved_overload_is_a_compile_error() {
        let mut program = Program::new(Settings::default());
        let mut parser = Parser::new(&mut program);
        parser.parse_source(
            r#"
            Import IO;
            class M {
                static void Main() {
                    missing(1);
                }
            }
            "#,
            Path::new("."),
        );
        assert!(parser.errors().is_empty());
        let errors = program.compile().expect_err("expected resolve errors");
        assert!(errors.iter().any(|e| e.contains("missing")));
    }

    #[test]
    fn imports_resolve_files_once() {
        let dir = std::env::temp_dir().join("teal_import_test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("Util.tls"),
            "Import \"Main.tls\";\nclass Util { static int32 three() { return 3; } }\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("Main.tls"),
            "Import IO;\nImport \"Util.tls\";\nclass M { static void Main() { IO.Println(Util.three()); } }\n",
        )
        .unwrap();

        let mut program = Program::new(Settings::default());
        let mut parser = Parser::new(&mut program);
        parser.parse_file(&dir.join("Main.tls"));
        let errors: Vec<String> = parser.errors().iter().map(|e| e.to_string()).collect();
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        let entry = program.compile().expect("compile failed");
        let mut vm = Vm::new(program);
        let mut out: Vec<String> = Vec::new();
        vm.run(entry, &mut out).expect("runtime error");
        assert_eq!(lines(&out), vec!["3"]);
    }
}
