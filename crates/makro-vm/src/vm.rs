use std::io::{self, Write};
use std::time::Instant;

use arrayvec::ArrayVec;
use makro_common::error::{
    report_err, AttributeError, Error, ErrorS, IoError, NameError, OverflowError, Result,
    TraceFrame, TypeError,
};
use termcolor::WriteColor;

use crate::compiler::Compiler;
use crate::config::Config;
use crate::gc::{Gc, ObjectRef, Trace};
use crate::native::NATIVES;
use crate::object::{
    Object, ObjectClass, ObjectClosure, ObjectInstance, ObjectNative, ObjectString, ObjectType,
    ObjectUpvalue,
};
use crate::op;
use crate::table::Table;
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * STACK_MAX_PER_FRAME;
const STACK_MAX_PER_FRAME: usize = u8::MAX as usize + 1;

/// Why a call to [`VM::interpret`] failed.
#[derive(Debug, PartialEq)]
pub enum InterpretError {
    Compile(Vec<ErrorS>),
    Runtime { error: ErrorS, traceback: Vec<TraceFrame> },
}

impl InterpretError {
    /// Renders every error as a diagnostic against `source`, which must be
    /// the VM's accumulated source (see [`VM::source`]).
    pub fn report(&self, writer: &mut dyn WriteColor, source: &str) -> io::Result<()> {
        match self {
            InterpretError::Compile(errors) => {
                for e in errors {
                    report_err(writer, source, e, &[])?;
                }
                Ok(())
            }
            InterpretError::Runtime { error, traceback } => {
                report_err(writer, source, error, traceback)
            }
        }
    }
}

#[derive(Debug)]
pub struct VM {
    gc: Gc,
    globals: Table,
    /// Open upvalues, sorted by the stack slot they point to.
    open_upvalues: Vec<ObjectRef>,

    /// The topmost frame is the one currently executing.
    frames: ArrayVec<CallFrame, FRAMES_MAX>,
    stack: Vec<Value>,

    /// Every source ever interpreted, so that spans stay valid across calls
    /// to [`VM::interpret`].
    source: String,
    start_time: Instant,
}

impl Default for VM {
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}

impl VM {
    pub fn with_config(config: Config) -> Self {
        let mut gc = Gc::new(&config);
        let mut globals = Table::default();
        for &(name, function) in NATIVES {
            let name_ref = gc.intern(name);
            let native = gc.alloc(ObjectNative { name, function });
            globals.set(gc.str_key(name_ref), native.into());
        }

        Self {
            gc,
            globals,
            open_upvalues: Vec::new(),
            frames: ArrayVec::new(),
            stack: Vec::with_capacity(STACK_MAX),
            source: String::new(),
            start_time: Instant::now(),
        }
    }

    /// Compiles and runs `source`. Globals persist across calls; after a
    /// runtime error the stack and frames are reset.
    pub fn interpret(
        &mut self,
        source: &str,
        stdout: &mut impl Write,
    ) -> Result<(), InterpretError> {
        let offset = self.source.len();
        self.source.reserve(source.len() + 1);
        self.source.push_str(source);
        self.source.push('\n');

        let program = makro_syntax::parse(source, offset).map_err(InterpretError::Compile)?;
        let function = Compiler::compile(&program, &mut self.gc, &self.globals)
            .map_err(InterpretError::Compile)?;

        // The function stays on the stack while its closure is allocated.
        self.stack.push(function.into());
        let closure = self.alloc(ObjectClosure { function, upvalues: Vec::new() });
        self.pop();
        self.stack.push(closure.into());

        self.call_closure(closure, 0)
            .and_then(|()| self.run(stdout))
            .map_err(|error| self.runtime_error(error))
    }

    fn run(&mut self, stdout: &mut impl Write) -> Result<()> {
        loop {
            if cfg!(feature = "vm-trace") {
                self.trace_op();
            }

            match self.read_u8() {
                op::CONSTANT => {
                    let constant = self.read_value();
                    self.push(constant)?;
                }
                op::NULL => self.push(Value::Null)?,
                op::TRUE => self.push(Value::TRUE)?,
                op::FALSE => self.push(Value::FALSE)?,
                op::POP => {
                    self.pop();
                }
                op::GET_LOCAL => {
                    let slot = self.frame().base + self.read_u8() as usize;
                    let value = self.stack[slot];
                    self.push(value)?;
                }
                op::SET_LOCAL => {
                    let slot = self.frame().base + self.read_u8() as usize;
                    let value = self.peek(0);
                    self.stack[slot] = value;
                }
                op::GET_GLOBAL => {
                    let name = self.read_object();
                    match self.globals.get(self.gc.str_key(name)) {
                        Some(value) => self.push(value)?,
                        None => return self.error(self.not_defined(name)),
                    }
                }
                op::DEFINE_GLOBAL => {
                    let name = self.read_object();
                    let key = self.gc.str_key(name);
                    let value = self.peek(0);
                    self.globals.set(key, value);
                    self.pop();
                }
                op::SET_GLOBAL => {
                    let name = self.read_object();
                    let key = self.gc.str_key(name);
                    let value = self.peek(0);
                    if self.globals.set(key, value) {
                        // Assignment never creates a global.
                        self.globals.delete(key);
                        return self.error(self.not_defined(name));
                    }
                }
                op::GET_UPVALUE => {
                    let upvalue = self.read_upvalue();
                    let value = match self.gc.upvalue(upvalue) {
                        ObjectUpvalue::Open(slot) => self.stack[*slot],
                        ObjectUpvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                op::SET_UPVALUE => {
                    let upvalue = self.read_upvalue();
                    let value = self.peek(0);
                    match self.gc.upvalue_mut(upvalue) {
                        ObjectUpvalue::Open(slot) => self.stack[*slot] = value,
                        ObjectUpvalue::Closed(closed) => *closed = value,
                    }
                }
                op::GET_PROPERTY => {
                    let name = self.read_object();
                    let instance = self.as_instance(self.peek(0))?;
                    let instance = self.gc.instance(instance);
                    match instance.fields.get(self.gc.str_key(name)) {
                        Some(value) => {
                            self.pop();
                            self.push(value)?;
                        }
                        None => {
                            return self.error(AttributeError::NoSuchAttribute {
                                type_: self.gc.string(self.gc.class(instance.class).name).to_string(),
                                name: self.gc.string(name).to_string(),
                            });
                        }
                    }
                }
                op::SET_PROPERTY => {
                    let name = self.read_object();
                    let instance = self.as_instance(self.peek(1))?;
                    let key = self.gc.str_key(name);
                    let value = self.peek(0);

                    let fields = &mut self.gc.instance_mut(instance).fields;
                    let capacity = fields.capacity();
                    fields.set(key, value);
                    if fields.capacity() != capacity {
                        self.gc.resize(instance);
                        if self.gc.should_collect(0) {
                            self.collect_garbage();
                        }
                    }

                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                op::EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a == b).into())?;
                }
                op::GREATER => self.binary_op_number(|a, b| (a > b).into(), ">")?,
                op::LESS => self.binary_op_number(|a, b| (a < b).into(), "<")?,
                op::ADD => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let result = match (a, b) {
                        (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                        (Value::Object(a), Value::Object(b))
                            if self.is_string(a) && self.is_string(b) =>
                        {
                            let result =
                                [self.gc.string(a).as_str(), self.gc.string(b).as_str()].concat();
                            // Both operands stay on the stack in case this
                            // allocation collects.
                            self.intern(result).into()
                        }
                        _ => {
                            return self.error(TypeError::UnsupportedOperandInfix {
                                op: "+".to_string(),
                                lt_type: self.gc.type_name(a).to_string(),
                                rt_type: self.gc.type_name(b).to_string(),
                                expected: "two numbers or two strings".to_string(),
                            });
                        }
                    };
                    self.pop();
                    self.pop();
                    self.push(result)?;
                }
                op::SUBTRACT => self.binary_op_number(|a, b| (a - b).into(), "-")?,
                op::MULTIPLY => self.binary_op_number(|a, b| (a * b).into(), "*")?,
                op::DIVIDE => self.binary_op_number(|a, b| (a / b).into(), "/")?,
                op::NOT => {
                    let value = self.pop();
                    self.push(value.is_falsey().into())?;
                }
                op::NEGATE => match self.peek(0) {
                    Value::Number(number) => {
                        self.pop();
                        self.push(Value::Number(-number))?;
                    }
                    value => {
                        return self.error(TypeError::UnsupportedOperandPrefix {
                            op: "-".to_string(),
                            rt_type: self.gc.type_name(value).to_string(),
                            expected: "number".to_string(),
                        });
                    }
                },
                op::PRINT => {
                    let value = self.pop();
                    if writeln!(stdout, "{}", self.gc.display(value)).is_err() {
                        return self.error(IoError::WriteError { file: "stdout".to_string() });
                    }
                }
                op::JUMP => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                op::JUMP_IF_FALSE => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                op::LOOP => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                op::CALL => {
                    let arg_count = self.read_u8() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                op::CLOSURE => {
                    let function = self.read_object();
                    let upvalue_count = self.gc.function(function).upvalue_count;

                    let mut upvalues = Vec::with_capacity(upvalue_count.into());
                    for _ in 0..upvalue_count {
                        let is_local = self.read_u8() != 0;
                        let idx = self.read_u8() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().base + idx;
                            self.capture_upvalue(slot)
                        } else {
                            self.gc.closure(self.frame().closure).upvalues[idx]
                        };
                        upvalues.push(upvalue);
                    }

                    let closure = self.alloc(ObjectClosure { function, upvalues });
                    self.push(closure.into())?;
                }
                op::CLOSE_UPVALUE => {
                    let slot = self.stack.len() - 1;
                    self.close_upvalues(slot);
                    self.pop();
                }
                op::RETURN => {
                    let value = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("returned without a call frame"),
                    };
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(value)?;
                }
                op::CLASS => {
                    let name = self.read_object();
                    let class = self.alloc(ObjectClass { name });
                    self.push(class.into())?;
                }
                byte => unreachable!("invalid opcode: {byte:#X}"),
            }
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        let object = match callee {
            Value::Object(object) => object,
            _ => {
                return self.error(TypeError::NotCallable {
                    type_: self.gc.type_name(callee).to_string(),
                });
            }
        };

        match self.gc.get(object).type_() {
            ObjectType::Closure => self.call_closure(object, arg_count),
            ObjectType::Native => {
                let function = self.gc.native(object).function;
                let args_start = self.stack.len() - arg_count;
                let result = function(self, &self.stack[args_start..]);
                self.stack.truncate(args_start - 1);
                self.push(result)?;
                Ok(())
            }
            ObjectType::Class => {
                // The class stays on the stack as the callee while the
                // instance is allocated.
                let instance = self.alloc(ObjectInstance::new(object));
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack.truncate(callee_slot);
                self.push(instance.into())?;
                Ok(())
            }
            type_ => self.error(TypeError::NotCallable { type_: type_.name().to_string() }),
        }
    }

    fn call_closure(&mut self, closure: ObjectRef, arg_count: usize) -> Result<()> {
        let function = self.gc.closure(closure).function;
        let arity = self.gc.function(function).arity as usize;
        if arg_count != arity {
            let name = match self.gc.function(function).name {
                Some(name) => self.gc.string(name).to_string(),
                None => "script".to_string(),
            };
            return self.error(TypeError::ArityMismatch { name, exp_args: arity, got_args: arg_count });
        }

        if self.frames.is_full() {
            return self.error(OverflowError::StackOverflow);
        }
        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure, function, ip: 0, base });
        Ok(())
    }

    /// Binary operator that acts on numbers.
    fn binary_op_number(&mut self, op: fn(f64, f64) -> Value, op_str: &str) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b))?;
                Ok(())
            }
            _ => self.error(TypeError::UnsupportedOperandInfix {
                op: op_str.to_string(),
                lt_type: self.gc.type_name(a).to_string(),
                rt_type: self.gc.type_name(b).to_string(),
                expected: "two numbers".to_string(),
            }),
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjectRef {
        let mut insert_idx = self.open_upvalues.len();
        for (idx, &upvalue) in self.open_upvalues.iter().enumerate().rev() {
            let open_slot = self.open_slot(upvalue);
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                break;
            }
            insert_idx = idx;
        }

        let upvalue = self.alloc(ObjectUpvalue::Open(slot));
        self.open_upvalues.insert(insert_idx, upvalue);
        upvalue
    }

    /// Closes every open upvalue that points at `boundary` or above.
    fn close_upvalues(&mut self, boundary: usize) {
        while let Some(&upvalue) = self.open_upvalues.last() {
            let slot = self.open_slot(upvalue);
            if slot < boundary {
                break;
            }
            *self.gc.upvalue_mut(upvalue) = ObjectUpvalue::Closed(self.stack[slot]);
            self.open_upvalues.pop();
        }
    }

    fn open_slot(&self, upvalue: ObjectRef) -> usize {
        match self.gc.upvalue(upvalue) {
            ObjectUpvalue::Open(slot) => *slot,
            ObjectUpvalue::Closed(_) => unreachable!("closed upvalue in open list"),
        }
    }

    fn as_instance(&self, value: Value) -> Result<ObjectRef> {
        match value {
            Value::Object(object) if self.gc.get(object).type_() == ObjectType::Instance => {
                Ok(object)
            }
            _ => {
                let type_ = self.gc.type_name(value).to_string();
                self.error(AttributeError::NotAnInstance { type_ })
            }
        }
    }

    fn is_string(&self, object: ObjectRef) -> bool {
        self.gc.get(object).type_() == ObjectType::String
    }

    fn not_defined(&self, name: ObjectRef) -> NameError {
        NameError::NotDefined { name: self.gc.string(name).to_string() }
    }

    fn intern(&mut self, value: String) -> ObjectRef {
        match self.gc.find_interned(&value) {
            Some(object) => object,
            None => self.alloc(ObjectString::new(value)),
        }
    }

    /// Allocates `object`, collecting first if the heap has grown past its
    /// threshold. Anything the new object refers to is kept alive.
    fn alloc(&mut self, object: impl Into<Object>) -> ObjectRef {
        let object = object.into();
        if self.gc.should_collect(object.size()) {
            object.trace(&mut self.gc);
            self.collect_garbage();
        }
        self.gc.alloc(object)
    }

    fn collect_garbage(&mut self) {
        for value in &self.stack {
            value.trace(&mut self.gc);
        }
        for frame in &self.frames {
            self.gc.mark(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.gc.mark(upvalue);
        }
        self.globals.trace(&mut self.gc);
        self.gc.collect_garbage();
    }

    /// Builds the traceback for `error` and resets the stack, so that the
    /// next call to [`VM::interpret`] starts clean.
    #[cold]
    fn runtime_error(&mut self, error: ErrorS) -> InterpretError {
        let traceback = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.gc.function(frame.function);
                let span = &function.chunk.spans[frame.ip.saturating_sub(1)];
                TraceFrame {
                    function: function.name.map(|name| self.gc.string(name).to_string()),
                    line: self.line(span.start),
                }
            })
            .collect();
        tracing::debug!(error = %error.0, "runtime error");

        // Closures that escaped into globals must not point into the
        // discarded stack.
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretError::Runtime { error, traceback }
    }

    /// 1-based line number of a byte offset into the accumulated source.
    fn line(&self, offset: usize) -> usize {
        let offset = offset.min(self.source.len());
        self.source.as_bytes()[..offset].iter().filter(|&&byte| byte == b'\n').count() + 1
    }

    /// Wraps an [`Error`] in the span of the last executed instruction.
    #[cold]
    fn error<T>(&self, err: impl Into<Error>) -> Result<T> {
        let frame = self.frame();
        let chunk = &self.gc.function(frame.function).chunk;
        let span = chunk.spans[frame.ip.saturating_sub(1)].clone();
        Err((err.into(), span))
    }

    fn frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    /// Reads an instruction / byte from the current [`Chunk`](crate::chunk::Chunk).
    fn read_u8(&mut self) -> u8 {
        let frame = self.frame_mut();
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        self.gc.function(function).chunk.ops[ip]
    }

    /// Reads a big-endian 16-bit operand.
    fn read_u16(&mut self) -> u16 {
        let byte1 = self.read_u8();
        let byte2 = self.read_u8();
        u16::from_be_bytes([byte1, byte2])
    }

    /// Reads a constant-pool operand.
    fn read_value(&mut self) -> Value {
        let idx = self.read_u8() as usize;
        self.gc.function(self.frame().function).chunk.constants[idx]
    }

    fn read_object(&mut self) -> ObjectRef {
        match self.read_value() {
            Value::Object(object) => object,
            value => unreachable!("expected object constant, got {value:?}"),
        }
    }

    fn read_upvalue(&mut self) -> ObjectRef {
        let idx = self.read_u8() as usize;
        self.gc.closure(self.frame().closure).upvalues[idx]
    }

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= STACK_MAX {
            return self.error(OverflowError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("stack underflow"),
        }
    }

    fn peek(&self, n: usize) -> Value {
        self.stack[self.stack.len() - n - 1]
    }

    fn trace_op(&self) {
        let frame = self.frame();
        let stack = self.stack[frame.base..]
            .iter()
            .map(|&value| format!("[ {} ]", self.gc.display(value)))
            .collect::<String>();
        let mut op = String::new();
        self.gc.function(frame.function).chunk.disassemble_op(frame.ip, &self.gc, &mut op);
        tracing::trace!("     {stack}\n{op}");
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    /// Looks up a global by name.
    pub fn global(&self, name: &str) -> Option<Value> {
        let name = self.gc.find_interned(name)?;
        self.globals.get(self.gc.str_key(name))
    }

    /// Everything interpreted so far. Error spans index into this.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }
}

#[derive(Debug)]
struct CallFrame {
    closure: ObjectRef,
    /// Cached from `closure`.
    function: ObjectRef,
    /// Index of the next instruction in the function's chunk.
    ip: usize,
    /// Stack index of slot 0, which holds the callee.
    base: usize,
}

#[cfg(test)]
mod tests {
    use makro_common::error::SyntaxError;
    use pretty_assertions::assert_eq;

    use super::*;

    fn run(vm: &mut VM, source: &str) -> (String, Result<(), InterpretError>) {
        let mut stdout = Vec::new();
        let result = vm.interpret(source, &mut stdout);
        (String::from_utf8(stdout).unwrap(), result)
    }

    fn run_ok(source: &str) -> String {
        let mut vm = VM::default();
        let (stdout, result) = run(&mut vm, source);
        assert_eq!(result, Ok(()));
        assert!(vm.stack.is_empty());
        stdout
    }

    fn runtime_error(vm: &mut VM, source: &str) -> (Error, Vec<TraceFrame>) {
        match run(vm, source).1 {
            Err(InterpretError::Runtime { error: (error, _), traceback }) => (error, traceback),
            result => panic!("expected runtime error, got {result:?}"),
        }
    }

    #[test]
    fn add_globals() {
        assert_eq!(run_ok("var a = 1; var b = 2; print a + b;"), "3\n");
    }

    #[test]
    fn closures_do_not_share_counters() {
        let source = r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var a = makeCounter();
            var b = makeCounter();
            print a();
            print a();
            print b();
        "#;
        assert_eq!(run_ok(source), "1\n2\n1\n");
    }

    #[test]
    fn closures_share_captured_local() {
        let source = r#"
            var get;
            var set;
            fun outer() {
                var x = "before";
                fun g() { return x; }
                fun s(value) { x = value; }
                get = g;
                set = s;
                s("inside");
                print g();
            }
            outer();
            set("after");
            print get();
        "#;
        assert_eq!(run_ok(source), "inside\nafter\n");
    }

    #[test]
    fn closed_upvalue_survives_scope() {
        let source = r#"
            var f;
            {
                var a = "block";
                fun g() { print a; }
                f = g;
            }
            f();
        "#;
        assert_eq!(run_ok(source), "block\n");
    }

    #[test]
    fn concatenation_is_interned() {
        let mut vm = VM::default();
        let (stdout, result) = run(&mut vm, r#"var s = "foo" + "bar"; print s; print s == "foobar";"#);
        assert_eq!(result, Ok(()));
        assert_eq!(stdout, "foobar\ntrue\n");

        let s = vm.global("s").unwrap().as_object().unwrap();
        assert_eq!(vm.gc().find_interned("foobar"), Some(s));
    }

    #[test]
    fn stack_overflow() {
        let mut vm = VM::default();
        let (error, traceback) = runtime_error(&mut vm, "fun f() { f(); }\nf();");
        assert_eq!(error, Error::from(OverflowError::StackOverflow));
        assert_eq!(traceback.len(), FRAMES_MAX);
        assert_eq!(traceback.last(), Some(&TraceFrame { function: None, line: 2 }));
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn deep_temporaries_overflow_the_stack() {
        // Every level leaves a callee and 254 arguments on the stack before
        // the innermost call runs, without adding a frame.
        let mut expr = "0".to_string();
        for _ in 0..70 {
            expr = format!("clock({}{expr})", "0, ".repeat(254));
        }
        let mut vm = VM::default();
        let (error, traceback) = runtime_error(&mut vm, &format!("print {expr};"));
        assert_eq!(error, Error::from(OverflowError::StackOverflow));
        assert_eq!(traceback, vec![TraceFrame { function: None, line: 1 }]);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn escaped_closure_survives_runtime_error() {
        let mut vm = VM::default();
        let source = "var f;\n\
                      fun outer() { var x = \"kept\"; fun g() { return x; } f = g; nope(); }\n\
                      outer();";
        let (error, _) = runtime_error(&mut vm, source);
        assert_eq!(error, Error::from(NameError::NotDefined { name: "nope".to_string() }));
        assert!(vm.open_upvalues.is_empty());

        let (stdout, result) = run(&mut vm, "print f();");
        assert_eq!(result, Ok(()));
        assert_eq!(stdout, "kept\n");
    }

    #[test]
    fn arity_mismatch_resets_vm() {
        let mut vm = VM::default();
        let (error, traceback) =
            runtime_error(&mut vm, "fun add(a, b) { return a + b; }\nprint add(1);");
        assert_eq!(
            error,
            Error::from(TypeError::ArityMismatch { name: "add".to_string(), exp_args: 2, got_args: 1 })
        );
        assert_eq!(traceback, vec![TraceFrame { function: None, line: 2 }]);
        assert!(vm.stack.is_empty());

        // Globals survive, and the VM is usable again.
        let (stdout, result) = run(&mut vm, "print add(1, 2);");
        assert_eq!(result, Ok(()));
        assert_eq!(stdout, "3\n");
    }

    #[test]
    fn traceback_is_innermost_first() {
        let mut vm = VM::default();
        let source = "fun inner() {\n  return -\"x\";\n}\nfun outer() {\n  inner();\n}\nouter();";
        let (_, traceback) = runtime_error(&mut vm, source);
        assert_eq!(
            traceback,
            vec![
                TraceFrame { function: Some("inner".to_string()), line: 2 },
                TraceFrame { function: Some("outer".to_string()), line: 5 },
                TraceFrame { function: None, line: 7 },
            ]
        );
    }

    #[test]
    fn failed_assignment_does_not_define_global() {
        let mut vm = VM::default();
        let (error, _) = runtime_error(&mut vm, "x = 1;");
        assert_eq!(error, Error::from(NameError::NotDefined { name: "x".to_string() }));
        assert_eq!(vm.global("x"), None);

        let (error, _) = runtime_error(&mut vm, "print x;");
        assert_eq!(error, Error::from(NameError::NotDefined { name: "x".to_string() }));
    }

    #[test]
    fn instances_have_fields() {
        let source = r#"
            class Point {}
            var p = Point(1, 2);
            p.x = 3;
            p.y = p.x * 2;
            print p.x + p.y;
            print p;
            print Point;
        "#;
        assert_eq!(run_ok(source), "9\nPoint instance\nPoint\n");
    }

    #[test]
    fn property_errors() {
        let mut vm = VM::default();
        let (error, _) = runtime_error(&mut vm, "class A {} print A().missing;");
        assert_eq!(
            error,
            Error::from(AttributeError::NoSuchAttribute { type_: "A".to_string(), name: "missing".to_string() })
        );

        let (error, _) = runtime_error(&mut vm, "var n = 1; n.field = 2;");
        assert_eq!(error, Error::from(AttributeError::NotAnInstance { type_: "number".to_string() }));
    }

    #[test]
    fn type_errors() {
        let mut vm = VM::default();
        let (error, _) = runtime_error(&mut vm, "print 1 + \"a\";");
        assert_eq!(
            error,
            Error::from(TypeError::UnsupportedOperandInfix {
                op: "+".to_string(),
                lt_type: "number".to_string(),
                rt_type: "string".to_string(),
                expected: "two numbers or two strings".to_string(),
            })
        );

        let (error, _) = runtime_error(&mut vm, "print true < 1;");
        assert_eq!(
            error,
            Error::from(TypeError::UnsupportedOperandInfix {
                op: "<".to_string(),
                lt_type: "bool".to_string(),
                rt_type: "number".to_string(),
                expected: "two numbers".to_string(),
            })
        );

        let (error, _) = runtime_error(&mut vm, "var x = \"str\"; x();");
        assert_eq!(error, Error::from(TypeError::NotCallable { type_: "string".to_string() }));
    }

    #[test]
    fn control_flow() {
        let source = r#"
            var sum = 0;
            for (var i = 0; i < 5; i = i + 1) {
                if (i == 3) sum = sum + 100; else sum = sum + i;
            }
            print sum;
            var n = 3;
            while (n > 0) n = n - 1;
            print n;
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            print fib(10);
        "#;
        assert_eq!(run_ok(source), "107\n0\n55\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        let source = r#"
            print null or "default";
            print false and undefined;
            print 1 and 2;
            print !null;
            print 1 != 2;
            print 2 >= 2;
            print 3 <= 2;
        "#;
        assert_eq!(run_ok(source), "default\nfalse\n2\ntrue\ntrue\ntrue\nfalse\n");
    }

    #[test]
    fn print_formats() {
        let source = r#"
            fun f() {}
            print f;
            print clock;
            print 1.5;
            print -0.25;
            print 10 / 4;
            print null;
        "#;
        assert_eq!(run_ok(source), "<fn f>\n<native fn>\n1.5\n-0.25\n2.5\nnull\n");
    }

    #[test]
    fn clock_is_monotonic() {
        let source = "var a = clock(); var b = clock(); print b >= a; print a >= 0;";
        assert_eq!(run_ok(source), "true\ntrue\n");
    }

    #[test]
    fn compile_errors_are_reported() {
        let mut vm = VM::default();
        match run(&mut vm, "print 1 +;\nreturn;").1 {
            Err(InterpretError::Compile(errors)) => assert!(!errors.is_empty()),
            result => panic!("expected compile error, got {result:?}"),
        }
        match run(&mut vm, "return 1;").1 {
            Err(InterpretError::Compile(errors)) => {
                assert_eq!(errors[0].0, Error::from(SyntaxError::ReturnOutsideFunction));
            }
            result => panic!("expected compile error, got {result:?}"),
        }
    }

    #[test]
    fn repl_globals_persist() {
        let mut vm = VM::default();
        assert_eq!(run(&mut vm, "var greeting = \"hi\";").1, Ok(()));
        let (stdout, result) = run(&mut vm, "print greeting;");
        assert_eq!(result, Ok(()));
        assert_eq!(stdout, "hi\n");
    }

    #[test]
    fn gc_stress_preserves_reachable_objects() {
        let config = Config { gc_stress: true, ..Config::default() };
        let mut vm = VM::with_config(config);
        let source = r#"
            class Node {}
            fun list(n) {
                var head = null;
                for (var i = 0; i < n; i = i + 1) {
                    var node = Node();
                    node.value = "item" + "!";
                    node.next = head;
                    head = node;
                }
                return head;
            }
            var l = list(20);
            var count = 0;
            while (l != null) { count = count + 1; l = l.next; }
            print count;
            fun adder(x) { fun add(y) { return x + y; } return add; }
            print adder("a")("b");
        "#;
        let (stdout, result) = run(&mut vm, source);
        assert_eq!(result, Ok(()));
        assert_eq!(stdout, "20\nab\n");
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let config = Config { gc_initial_threshold: 0, ..Config::default() };
        let mut vm = VM::with_config(config);
        let source = r#"
            for (var i = 0; i < 100; i = i + 1) {
                var garbage = "x" + "y";
            }
        "#;
        assert_eq!(run(&mut vm, source).1, Ok(()));

        vm.collect_garbage();
        // Only the `clock` native and its name are left.
        assert_eq!(vm.gc().object_count(), 2);
        assert_eq!(vm.gc().find_interned("xy"), None);
        assert!(vm.global("clock").is_some());
    }
}
