use crate::{
    chunk::Chunk,
    table::{MapKey, StrKey, Table},
    value::Value,
    vm::Vm,
};
use std::mem;

/// Handle to an object living in the [`Heap`](crate::heap::Heap). It stays
/// valid for as long as the object is reachable from a root.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) usize);

/// Host callback. Method natives receive the receiver as `args[0]`.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

#[derive(Debug)]
pub enum Object {
    Str(ObjString),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    List(Vec<Value>),
    Map(Table<MapKey, Value>),
}

#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

#[derive(Debug, Default)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the top-level script
    pub name: Option<ObjRef>,
}

#[derive(Debug)]
pub struct Native {
    pub name: String,
    pub arity: u8,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Upvalue {
    /// Still on the stack, at this absolute slot
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    /// Closures only
    pub methods: Table<StrKey, ObjRef>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table<StrKey, Value>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    /// A closure, or a native for built-in methods
    pub method: ObjRef,
}

impl Object {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Function(_) => "function",
            Self::Native(_) => "native",
            Self::Closure(_) => "closure",
            Self::Upvalue(_) => "upvalue",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::BoundMethod(_) => "bound method",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Approximate number of bytes owned by the object, used to pace the
    /// collector
    pub fn size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.chars.capacity(),
            Self::Function(f) => {
                f.chunk.code.capacity() * mem::size_of::<crate::chunk::Op>()
                    + f.chunk.constants.capacity() * mem::size_of::<Value>()
                    + f.chunk.lines.capacity() * mem::size_of::<usize>()
            }
            Self::Native(n) => n.name.capacity(),
            Self::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
            Self::Class(c) => c.methods.allocated_bytes(),
            Self::Instance(i) => i.fields.allocated_bytes(),
            Self::List(items) => items.capacity() * mem::size_of::<Value>(),
            Self::Map(map) => map.allocated_bytes(),
            Self::Upvalue(_) | Self::BoundMethod(_) => 0,
        };
        mem::size_of::<Self>() + payload
    }
}
