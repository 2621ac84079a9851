use crate::{
    chunk::{Chunk, Op},
    compiler,
    error::{ErrorMsg, InterpretError, RuntimeError},
    heap::{GcConfig, Heap},
    natives,
    object::{BoundMethod, Class, Closure, Instance, Native, NativeFn, ObjRef, Object, Upvalue},
    table::{MapKey, StrKey, Table},
    value::Value,
};
use log::{debug, log_enabled, trace, Level};
use std::io::{self, Write};

pub const FRAMES_MAX: usize = 64;

#[derive(Copy, Clone, Debug)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Stack index of the callee, which is local slot zero
    base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<StrKey, Value>,
    /// Sorted by stack slot, lowest first
    open_upvalues: Vec<ObjRef>,
    /// Built-in methods shared by every list
    list_methods: Table<StrKey, ObjRef>,
    out: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl Vm {
    pub fn new(config: GcConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(config),
            stack: Vec::default(),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::default(),
            open_upvalues: Vec::default(),
            list_methods: Table::default(),
            out: Box::new(io::stdout()),
        };
        natives::install(&mut vm);
        vm
    }

    /// Sends `print` output somewhere other than stdout
    pub fn with_output(mut self, out: impl Write + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        trace!("Compiling {source}");
        let function = compiler::compile(source, self).map_err(InterpretError::Compile)?;

        self.push(Value::Object(function));
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::default(),
        }));
        self.pop();
        self.push(Value::Object(closure));

        let result = self.call_closure(closure, 0).and_then(|()| self.run());
        if result.is_err() {
            self.reset_stack();
        }
        Ok(result?)
    }

    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let (key, native) = self.make_native(name, arity, function);
        self.globals.insert(key, Value::Object(native));
    }

    pub(crate) fn define_list_method(&mut self, name: &str, arity: u8, function: NativeFn) {
        let (key, native) = self.make_native(name, arity, function);
        self.list_methods.insert(key, native);
    }

    fn make_native(&mut self, name: &str, arity: u8, function: NativeFn) -> (StrKey, ObjRef) {
        let name_ref = self.intern(name);
        self.push(Value::Object(name_ref));
        let native = self.alloc(Object::Native(Native {
            name: name.to_string(),
            arity,
            function,
        }));
        self.pop();
        (self.heap.str_key(name_ref), native)
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        let name = self.heap.find_interned(name)?;
        self.globals.get(&self.heap.str_key(name)).copied()
    }

    // Allocation

    /// Allocates an object, collecting first if the heap is due. Whatever
    /// `extra_roots` marks survives alongside the VM's own roots, as does
    /// everything the new object references.
    pub fn alloc_with<F>(&mut self, object: Object, extra_roots: F) -> ObjRef
    where
        F: FnOnce(&mut Heap),
    {
        if self.heap.should_collect() {
            self.heap.mark(&object);
            extra_roots(&mut self.heap);
            self.collect_garbage();
        }
        self.heap.alloc(object)
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.alloc_with(object, |_| ())
    }

    pub fn intern_with<F>(&mut self, s: &str, extra_roots: F) -> ObjRef
    where
        F: FnOnce(&mut Heap),
    {
        if let Some(r) = self.heap.find_interned(s) {
            return r;
        }
        if self.heap.should_collect() {
            extra_roots(&mut self.heap);
            self.collect_garbage();
        }
        self.heap.intern(s)
    }

    pub fn intern(&mut self, s: &str) -> ObjRef {
        self.intern_with(s, |_| ())
    }

    /// Runs a full collection. Returns the number of bytes freed.
    pub fn collect_garbage(&mut self) -> usize {
        debug!("GC: begin");
        self.mark_roots();
        self.heap.collect()
    }

    fn mark_roots(&mut self) {
        self.heap.mark(&self.stack);
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        self.heap.mark(&self.open_upvalues);
        self.heap.mark(&self.globals);
        self.heap.mark(&self.list_methods);
    }

    // Stack and frames

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn chunk(&self) -> &Chunk {
        let closure = self.heap.closure(self.frame().closure);
        &self.heap.function(closure.function).chunk
    }

    fn read_op(&mut self) -> Op {
        let op = self.chunk().code[self.frame().ip];
        self.frame_mut().ip += 1;
        op
    }

    fn read_constant(&self, idx: u8) -> Value {
        self.chunk().constants[idx as usize]
    }

    fn read_object(&self, idx: u8) -> ObjRef {
        match self.read_constant(idx) {
            Value::Object(r) => r,
            v => unreachable!("expected object constant, found {v:?}"),
        }
    }

    fn read_string(&self, idx: u8) -> StrKey {
        self.heap.str_key(self.read_object(idx))
    }

    fn reset_stack(&mut self) {
        // Closures that escaped before the error keep working
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
    }

    pub(crate) fn error(&self, msg: ErrorMsg) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(self.heap.closure(frame.closure).function);
                let line = function.chunk.lines[frame.ip.saturating_sub(1)];
                match function.name {
                    Some(name) => format!("[line {line}] in {}()", self.heap.string(name).chars),
                    None => format!("[line {line}] in script"),
                }
            })
            .collect();
        RuntimeError { msg, trace }
    }

    fn undefined_variable(&self, name: StrKey) -> RuntimeError {
        let name = self.heap.string(name.obj).chars.clone();
        self.error(ErrorMsg::UndefinedVar(name))
    }

    fn undefined_property(&self, name: StrKey) -> RuntimeError {
        let name = self.heap.string(name.obj).chars.clone();
        self.error(ErrorMsg::UndefinedProperty(name))
    }

    pub(crate) fn object(&self, value: Value) -> Option<&Object> {
        value.as_object().map(|r| &self.heap[r])
    }

    pub(crate) fn object_mut(&mut self, value: Value) -> Option<&mut Object> {
        match value {
            Value::Object(r) => Some(&mut self.heap[r]),
            _ => None,
        }
    }

    /// Accounts for an object that grew in place
    pub(crate) fn remeasure(&mut self, value: Value) {
        if let Value::Object(r) = value {
            self.heap.remeasure(r);
        }
    }

    fn as_str(&self, value: Value) -> Option<&str> {
        match self.object(value) {
            Some(Object::Str(s)) => Some(&s.chars),
            _ => None,
        }
    }

    pub(crate) fn map_key(&self, value: Value) -> Result<MapKey, RuntimeError> {
        match value {
            Value::Number(n) => Ok(MapKey::number(n)),
            Value::Object(r) if matches!(self.heap[r], Object::Str(_)) => {
                Ok(MapKey::Str(self.heap.str_key(r)))
            }
            _ => Err(self.error(ErrorMsg::InvalidMapKey)),
        }
    }

    fn format_stack(&self) -> String {
        self.stack
            .iter()
            .map(|v| format!("[ {} ]", self.heap.format_value(*v)))
            .collect()
    }

    // Execution

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if log_enabled!(Level::Debug) {
                trace!("STACK: {}", self.format_stack());
                debug!("{}", self.chunk().decode(self.frame().ip, &self.heap).0);
            }
            match self.read_op() {
                Op::Constant(c) => {
                    let value = self.read_constant(c);
                    self.push(value);
                }
                Op::Null => self.push(Value::Null),
                Op::True => self.push(Value::Boolean(true)),
                Op::False => self.push(Value::Boolean(false)),
                Op::Pop => {
                    self.pop();
                }
                Op::Dup => self.push(self.peek(0)),
                Op::GetLocal(slot) => {
                    let value = self.stack[self.frame().base + slot as usize];
                    self.push(value);
                }
                Op::SetLocal(slot) => {
                    let idx = self.frame().base + slot as usize;
                    self.stack[idx] = self.peek(0);
                }
                Op::GetGlobal(c) => {
                    let name = self.read_string(c);
                    let value = *self
                        .globals
                        .get(&name)
                        .ok_or_else(|| self.undefined_variable(name))?;
                    self.push(value);
                }
                Op::DefineGlobal(c) => {
                    let name = self.read_string(c);
                    self.globals.insert(name, self.peek(0));
                    let value = self.pop();
                    debug!(
                        "Define {} -> {}",
                        self.heap.string(name.obj).chars,
                        self.heap.format_value(value)
                    );
                }
                Op::SetGlobal(c) => {
                    let name = self.read_string(c);
                    if self.globals.insert(name, self.peek(0)) {
                        self.globals.remove(&name);
                        return Err(self.undefined_variable(name));
                    }
                }
                Op::GetUpvalue(idx) => {
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[idx as usize];
                    let value = match *self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Op::SetUpvalue(idx) => {
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[idx as usize];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                Op::GetProperty(c) => {
                    let name = self.read_string(c);
                    match self.object(self.peek(0)) {
                        Some(Object::Instance(instance)) => {
                            let class = instance.class;
                            if let Some(value) = instance.fields.get(&name).copied() {
                                self.pop();
                                self.push(value);
                            } else {
                                let method = self.class_method(class, name)?;
                                self.bind_method(method)?;
                            }
                        }
                        Some(Object::List(_)) => {
                            let method = self.list_method(name)?;
                            self.bind_method(method)?;
                        }
                        _ => return Err(self.error(ErrorMsg::NoProperties)),
                    }
                }
                Op::SetProperty(c) => {
                    let name = self.read_string(c);
                    let value = self.peek(0);
                    let target = self.peek(1);
                    let Some(Object::Instance(instance)) = self.object_mut(target) else {
                        return Err(self.error(ErrorMsg::NoFields));
                    };
                    if instance.fields.insert(name, value) {
                        self.remeasure(target);
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                Op::GetSuper(c) => {
                    let name = self.read_string(c);
                    let superclass = self.pop().as_object().expect("superclass is an object");
                    let method = self.class_method(superclass, name)?;
                    self.bind_method(method)?;
                }
                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Boolean(a == b));
                }
                Op::Greater => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Boolean(a > b));
                }
                Op::Less => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Boolean(a < b));
                }
                Op::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (a, b) => {
                        let (Some(a), Some(b)) = (self.as_str(a), self.as_str(b)) else {
                            return Err(self.error(ErrorMsg::ExpectedNumsOrStrs));
                        };
                        let joined = format!("{a}{b}");
                        // Both operands stay on the stack until the result exists
                        let result = self.intern(&joined);
                        self.pop();
                        self.pop();
                        self.push(Value::Object(result));
                    }
                },
                Op::Sub => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a - b));
                }
                Op::Mul => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a * b));
                }
                Op::Div => {
                    let (a, b) = self.pop_numbers()?;
                    if b == 0.0 {
                        return Err(self.error(ErrorMsg::DivisionByZero));
                    }
                    self.push(Value::Number(a / b));
                }
                Op::Mod => {
                    let (a, b) = self.pop_numbers()?;
                    if b == 0.0 {
                        return Err(self.error(ErrorMsg::ModuloByZero));
                    }
                    self.push(Value::Number(a % b));
                }
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Boolean(value.is_falsey()));
                }
                Op::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.error(ErrorMsg::ExpectedNumber));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                Op::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    writeln!(self.out, "{text}")
                        .map_err(|e| self.error(ErrorMsg::Output(e.to_string())))?;
                }
                Op::Jump(offset) => self.frame_mut().ip += offset as usize,
                Op::JumpIfFalse(offset) => {
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                Op::Loop(offset) => self.frame_mut().ip -= offset as usize,
                Op::Call(args) => self.call_value(self.peek(args as usize), args)?,
                Op::Invoke(c, args) => {
                    let name = self.read_string(c);
                    self.invoke(name, args)?;
                }
                Op::SuperInvoke(c, args) => {
                    let name = self.read_string(c);
                    let superclass = self.pop().as_object().expect("superclass is an object");
                    let method = self.class_method(superclass, name)?;
                    self.call_closure(method, args)?;
                }
                Op::Closure(c) => self.make_closure(self.read_object(c)),
                Op::Capture { .. } => unreachable!("capture outside of a closure"),
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Op::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                Op::Class(c) => {
                    let class = self.alloc(Object::Class(Class {
                        name: self.read_object(c),
                        methods: Table::default(),
                    }));
                    self.push(Value::Object(class));
                }
                Op::Inherit => {
                    let methods = match self.object(self.peek(1)) {
                        Some(Object::Class(superclass)) => superclass.methods.clone(),
                        _ => return Err(self.error(ErrorMsg::SuperclassNotClass)),
                    };
                    let subclass = self.peek(0);
                    if let Some(Object::Class(class)) = self.object_mut(subclass) {
                        class.methods.extend_from(&methods);
                    }
                    self.remeasure(subclass);
                    self.pop();
                }
                Op::Method(c) => {
                    let name = self.read_string(c);
                    let method = self.peek(0).as_object().expect("method is a closure");
                    let target = self.peek(1);
                    if let Some(Object::Class(class)) = self.object_mut(target) {
                        class.methods.insert(name, method);
                    }
                    self.remeasure(target);
                    self.pop();
                }
                Op::List(count) => {
                    let start = self.stack.len() - count as usize;
                    let items = self.stack[start..].to_vec();
                    let list = self.alloc(Object::List(items));
                    self.stack.truncate(start);
                    self.push(Value::Object(list));
                }
                Op::Map(count) => {
                    let start = self.stack.len() - 2 * count as usize;
                    let mut map = Table::default();
                    for pair in self.stack[start..].chunks(2) {
                        map.insert(self.map_key(pair[0])?, pair[1]);
                    }
                    let map = self.alloc(Object::Map(map));
                    self.stack.truncate(start);
                    self.push(Value::Object(map));
                }
                Op::Index => self.index()?,
                Op::Slice => self.slice()?,
                Op::SetIndex => self.set_index()?,
            }
        }
    }

    /// Pops two numeric operands, leaving the stack untouched on a type error
    fn pop_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.error(ErrorMsg::ExpectedNumbers));
        };
        self.pop();
        self.pop();
        Ok((a, b))
    }

    // Calls

    fn call_value(&mut self, callee: Value, args: u8) -> Result<(), RuntimeError> {
        let Some(r) = callee.as_object() else {
            return Err(self.error(ErrorMsg::NotCallable));
        };
        let callee_slot = self.stack.len() - args as usize - 1;
        match &self.heap[r] {
            Object::Closure(_) => self.call_closure(r, args),
            Object::Native(_) => self.call_native(r, args, false),
            Object::Class(class) => {
                let initializer = class.methods.get(&self.heap.str_key(class.name)).copied();
                let instance = self.alloc(Object::Instance(Instance {
                    class: r,
                    fields: Table::default(),
                }));
                self.stack[callee_slot] = Value::Object(instance);
                match initializer {
                    Some(initializer) => self.call_closure(initializer, args),
                    None if args != 0 => Err(self.error(ErrorMsg::Arity {
                        expected: 0,
                        got: args,
                    })),
                    None => Ok(()),
                }
            }
            Object::BoundMethod(bound) => {
                let method = bound.method;
                self.stack[callee_slot] = bound.receiver;
                if matches!(self.heap[method], Object::Native(_)) {
                    self.call_native(method, args, true)
                } else {
                    self.call_closure(method, args)
                }
            }
            _ => Err(self.error(ErrorMsg::NotCallable)),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, args: u8) -> Result<(), RuntimeError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity;
        if args != arity {
            return Err(self.error(ErrorMsg::Arity {
                expected: arity,
                got: args,
            }));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error(ErrorMsg::StackOverflow));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - args as usize - 1,
        });
        Ok(())
    }

    /// Calls a host function. Built-in methods also see the receiver, which
    /// sits in the callee slot, as their first argument.
    fn call_native(
        &mut self,
        native: ObjRef,
        args: u8,
        with_receiver: bool,
    ) -> Result<(), RuntimeError> {
        let Object::Native(Native {
            arity, function, ..
        }) = self.heap[native]
        else {
            unreachable!("expected native function");
        };
        if args != arity {
            return Err(self.error(ErrorMsg::Arity {
                expected: arity,
                got: args,
            }));
        }
        let callee_slot = self.stack.len() - args as usize - 1;
        let first = if with_receiver {
            callee_slot
        } else {
            callee_slot + 1
        };
        let arguments = self.stack[first..].to_vec();
        let result = function(self, &arguments).map_err(|msg| self.error(ErrorMsg::Native(msg)))?;
        self.stack.truncate(callee_slot);
        self.push(result);
        Ok(())
    }

    fn invoke(&mut self, name: StrKey, args: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(args as usize);
        match self.object(receiver) {
            Some(Object::Instance(instance)) => {
                let class = instance.class;
                // A field holding a callable shadows any method
                if let Some(field) = instance.fields.get(&name).copied() {
                    let callee_slot = self.stack.len() - args as usize - 1;
                    self.stack[callee_slot] = field;
                    return self.call_value(field, args);
                }
                let method = self.class_method(class, name)?;
                self.call_closure(method, args)
            }
            Some(Object::List(_)) => {
                let method = self.list_method(name)?;
                self.call_native(method, args, true)
            }
            _ => Err(self.error(ErrorMsg::NoMethods)),
        }
    }

    fn class_method(&self, class: ObjRef, name: StrKey) -> Result<ObjRef, RuntimeError> {
        let Object::Class(class) = &self.heap[class] else {
            unreachable!("expected class");
        };
        class
            .methods
            .get(&name)
            .copied()
            .ok_or_else(|| self.undefined_property(name))
    }

    fn list_method(&self, name: StrKey) -> Result<ObjRef, RuntimeError> {
        self.list_methods
            .get(&name)
            .copied()
            .ok_or_else(|| self.undefined_property(name))
    }

    /// Replaces the receiver on top of the stack with `method` bound to it
    fn bind_method(&mut self, method: ObjRef) -> Result<(), RuntimeError> {
        let bound = self.alloc(Object::BoundMethod(BoundMethod {
            receiver: self.peek(0),
            method,
        }));
        self.pop();
        self.push(Value::Object(bound));
        Ok(())
    }

    // Closures and upvalues

    fn make_closure(&mut self, function: ObjRef) {
        let count = self.heap.function(function).upvalue_count;
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(count),
        }));
        // On the stack before capturing, since capturing allocates
        self.push(Value::Object(closure));
        for _ in 0..count {
            let Op::Capture { is_local, index } = self.read_op() else {
                unreachable!("closure without capture descriptors");
            };
            let upvalue = if is_local {
                self.capture_upvalue(self.frame().base + index as usize)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index as usize]
            };
            if let Object::Closure(closure) = &mut self.heap[closure] {
                closure.upvalues.push(upvalue);
            }
        }
    }

    fn open_slot(&self, upvalue: ObjRef) -> usize {
        match self.heap[upvalue] {
            Object::Upvalue(Upvalue::Open(slot)) => slot,
            _ => unreachable!("closed upvalue in the open list"),
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        match self
            .open_upvalues
            .binary_search_by_key(&slot, |u| self.open_slot(*u))
        {
            Ok(idx) => self.open_upvalues[idx],
            Err(idx) => {
                let upvalue = self.alloc(Object::Upvalue(Upvalue::Open(slot)));
                self.open_upvalues.insert(idx, upvalue);
                upvalue
            }
        }
    }

    /// Closes every open upvalue at or above `last`
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.last() {
            let slot = self.open_slot(upvalue);
            if slot < last {
                break;
            }
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(self.stack[slot]);
            self.open_upvalues.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedBuffer;

    fn run_test(source: &str) -> String {
        let out = SharedBuffer::default();
        let mut vm = Vm::default().with_output(out.clone());
        vm.interpret(source).unwrap();
        out.contents()
    }

    fn run_err_test(source: &str) -> RuntimeError {
        let mut vm = Vm::default().with_output(SharedBuffer::default());
        match vm.interpret(source) {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run_test("print 1 + 2 * 3;"), "7\n");
        assert_eq!(run_test("print (1 + 2) * 3 - 4 / 2;"), "7\n");
        assert_eq!(run_test("print 7 % 3;"), "1\n");
        assert_eq!(run_test("print -(2);"), "-2\n");
        assert_eq!(run_test("print 1 + 2 * 3 == 7;"), "true\n");
    }

    #[test]
    fn strings_concatenate_and_intern() {
        assert_eq!(run_test("print \"ab\" + \"cd\";"), "abcd\n");
        assert_eq!(run_test("print \"ab\" + \"cd\" == \"abcd\";"), "true\n");
    }

    #[test]
    fn type_errors() {
        assert_eq!(
            run_err_test("print 1 + \"a\";").msg,
            ErrorMsg::ExpectedNumsOrStrs
        );
        assert_eq!(run_err_test("print -\"a\";").msg, ErrorMsg::ExpectedNumber);
        assert_eq!(run_err_test("print 1 < true;").msg, ErrorMsg::ExpectedNumbers);
        assert_eq!(run_err_test("print 1 / 0;").msg, ErrorMsg::DivisionByZero);
        assert_eq!(run_err_test("print 1 % 0;").msg, ErrorMsg::ModuloByZero);
    }

    #[test]
    fn globals() {
        assert_eq!(run_test("var a = 1; a = a + 1; print a;"), "2\n");
        assert_eq!(
            run_err_test("print missing;").msg,
            ErrorMsg::UndefinedVar("missing".to_string())
        );
        assert_eq!(
            run_err_test("missing = 1;").msg,
            ErrorMsg::UndefinedVar("missing".to_string())
        );
    }

    #[test]
    fn runtime_error_trace() {
        let e = run_err_test("fn f() {\n  return 1 + nil_value;\n}\nf();");
        assert_eq!(e.trace, vec!["[line 2] in f()", "[line 4] in script"]);
    }

    #[test]
    fn stack_overflow() {
        let e = run_err_test("fn f() { f(); } f();");
        assert_eq!(e.msg, ErrorMsg::StackOverflow);
        assert_eq!(e.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn recovers_after_runtime_error() {
        let out = SharedBuffer::default();
        let mut vm = Vm::default().with_output(out.clone());
        assert!(vm.interpret("var a = 1; print a; a();").is_err());
        vm.interpret("print a + 1;").unwrap();
        assert_eq!(out.contents(), "1\n2\n");
    }

    #[test]
    fn escaped_closures_survive_runtime_error() {
        let out = SharedBuffer::default();
        let mut vm = Vm::default().with_output(out.clone());
        let source = "var g; fn f() { var x = 1; fn h() { return x; } g = h; missing(); } f();";
        assert!(vm.interpret(source).is_err());
        vm.interpret("print g();").unwrap();
        assert_eq!(out.contents(), "1\n");
    }

    #[test]
    fn growing_objects_count_towards_gc() {
        let mut vm = Vm::default().with_output(SharedBuffer::default());
        let before = vm.heap().bytes_allocated();
        vm.interpret(
            r#"
            var l = [];
            var m = {};
            class C {}
            var c = C();
            for (var i = 0; i < 1000; i += 1) {
                l.push(i);
                m[i] = i;
                c.f = i;
            }
            "#,
        )
        .unwrap();
        let list_bytes = 1000 * std::mem::size_of::<Value>();
        assert!(vm.heap().bytes_allocated() >= before + 2 * list_bytes);
    }

    #[test]
    fn natives() {
        assert_eq!(run_test("print len(\"héllo\");"), "5\n");
        assert_eq!(run_test("print len([1, 2]);"), "2\n");
        assert_eq!(run_test("print clock() > 0;"), "true\n");
        assert_eq!(
            run_err_test("len(1);").msg,
            ErrorMsg::Native("len() expects a string, list or map.".to_string())
        );
        assert_eq!(
            run_err_test("len();").msg,
            ErrorMsg::Arity {
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn define_native() {
        fn double(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
            match args[0] {
                Value::Number(n) => Ok(Value::Number(n * 2.0)),
                _ => Err("double() expects a number.".to_string()),
            }
        }
        let out = SharedBuffer::default();
        let mut vm = Vm::default().with_output(out.clone());
        vm.define_native("double", 1, double);
        vm.interpret("print double(21);").unwrap();
        assert_eq!(out.contents(), "42\n");
    }

    #[test]
    fn get_global() {
        let mut vm = Vm::default().with_output(SharedBuffer::default());
        vm.interpret("var answer = 42;").unwrap();
        assert_eq!(vm.get_global("answer"), Some(Value::Number(42.0)));
        assert_eq!(vm.get_global("question"), None);
    }
}
