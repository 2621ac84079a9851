use crate::{heap::Heap, value::Value};
use std::fmt::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Constant(u8),
    Null,
    True,
    False,
    Pop,
    Dup,
    GetLocal(u8),
    SetLocal(u8),
    GetGlobal(u8),
    DefineGlobal(u8),
    SetGlobal(u8),
    GetUpvalue(u8),
    SetUpvalue(u8),
    GetProperty(u8),
    SetProperty(u8),
    GetSuper(u8),
    Equal,
    Greater,
    Less,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Not,
    Negate,
    Print,
    Jump(u16),
    JumpIfFalse(u16),
    Loop(u16),
    Call(u8),
    /// Method name constant, argument count
    Invoke(u8, u8),
    SuperInvoke(u8, u8),
    /// Followed by one `Capture` per upvalue of the function
    Closure(u8),
    Capture { is_local: bool, index: u8 },
    CloseUpvalue,
    Return,
    Class(u8),
    Inherit,
    Method(u8),
    List(u8),
    /// Number of key/value pairs
    Map(u8),
    Index,
    Slice,
    SetIndex,
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = format!("{self:?}");
        let name = name
            .split(|c| c == '(' || c == ' ')
            .next()
            .unwrap_or_default();
        // `pad` so that width specifiers line up the disassembly
        f.pad(&name.to_uppercase())
    }
}

#[derive(Debug, Default, Clone)]
pub struct Chunk {
    pub code: Vec<Op>,
    pub constants: Vec<Value>,
    /// Source line of each instruction in `code`
    pub lines: Vec<usize>,
}

impl Chunk {
    /// Appends an instruction and returns its offset
    pub fn write(&mut self, op: Op, line: usize) -> usize {
        self.code.push(op);
        self.lines.push(line);
        self.code.len() - 1
    }

    /// Adds a value to the constant pool and returns its index. The caller
    /// checks that the index fits the one-byte operand.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Decodes the instruction at the given offset and pretty prints it with some metadata
    pub fn decode(&self, offset: usize, heap: &Heap) -> (String, usize) {
        let mut s = format!("{offset:0>4} ");
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            s.push_str("   | ");
        } else {
            s.push_str(&format!("{:>4} ", self.lines[offset]));
        }

        let op = self.code[offset];
        let constant = |idx: u8| {
            self.constants
                .get(idx as usize)
                .map(|v| heap.format_value(*v))
                .unwrap_or_else(|| "<invalid constant>".to_string())
        };
        match op {
            Op::Constant(c)
            | Op::GetGlobal(c)
            | Op::DefineGlobal(c)
            | Op::SetGlobal(c)
            | Op::GetProperty(c)
            | Op::SetProperty(c)
            | Op::GetSuper(c)
            | Op::Closure(c)
            | Op::Class(c)
            | Op::Method(c) => s.push_str(&format!("{op:<16} {c:>4} '{}'", constant(c))),
            Op::Invoke(c, args) | Op::SuperInvoke(c, args) => {
                s.push_str(&format!("{op:<16} ({args} args) {c:>4} '{}'", constant(c)))
            }
            Op::GetLocal(n)
            | Op::SetLocal(n)
            | Op::GetUpvalue(n)
            | Op::SetUpvalue(n)
            | Op::Call(n)
            | Op::List(n)
            | Op::Map(n) => s.push_str(&format!("{op:<16} {n:>4}")),
            Op::Jump(jump) | Op::JumpIfFalse(jump) => {
                s.push_str(&format!("{op:<16} {offset:>4} -> {}", offset + 1 + jump as usize))
            }
            Op::Loop(jump) => s.push_str(&format!(
                "{op:<16} {offset:>4} -> {}",
                (offset + 1).saturating_sub(jump as usize)
            )),
            Op::Capture { is_local, index } => s.push_str(&format!(
                "{:<16} {} {index}",
                "|",
                if is_local { "local" } else { "upvalue" }
            )),
            _ => s.push_str(&format!("{op}")),
        }
        (s, offset + 1)
    }
}

/// Disassembles a whole chunk under a header naming it
pub fn decode_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = format!("=== {name} ===");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (s, new_offset) = chunk.decode(offset, heap);
        out.push('\n');
        out.push_str(&s);
        offset = new_offset;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names() {
        assert_eq!(Op::Constant(3).to_string(), "CONSTANT");
        assert_eq!(Op::JumpIfFalse(2).to_string(), "JUMPIFFALSE");
        assert_eq!(
            Op::Capture {
                is_local: true,
                index: 0
            }
            .to_string(),
            "CAPTURE"
        );
        assert_eq!(Op::Return.to_string(), "RETURN");
    }

    #[test]
    fn decode_shows_constants_and_jumps() {
        let heap = Heap::default();
        let mut chunk = Chunk::default();
        let c = chunk.add_constant(Value::Number(1.5));
        chunk.write(Op::Constant(c as u8), 1);
        chunk.write(Op::JumpIfFalse(1), 1);
        chunk.write(Op::Pop, 2);
        chunk.write(Op::Return, 2);

        let (first, next) = chunk.decode(0, &heap);
        assert_eq!(next, 1);
        assert!(first.starts_with("0000    1 CONSTANT"));
        assert!(first.ends_with("'1.5'"));
        let (jump, _) = chunk.decode(1, &heap);
        assert!(jump.contains("   | "));
        assert!(jump.ends_with("1 -> 3"));

        let listing = decode_chunk(&chunk, "test", &heap);
        assert_eq!(listing.lines().count(), 5);
    }
}
