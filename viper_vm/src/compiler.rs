//! Single-pass compiler: a Pratt parser that pulls tokens from the lexer and
//! emits bytecode straight into the chunk of the function being compiled.
//!
//! Nested function declarations push a [`FunctionState`] each, so the stack
//! of states doubles as the chain of enclosing functions that upvalue
//! resolution walks. Anything allocated while compiling goes through the VM,
//! with the names and constants of every unfinished function passed along as
//! extra roots.

use crate::{
    chunk::{decode_chunk, Chunk, Op},
    error::{CompileError, ErrorMsg, Location},
    heap::Heap,
    object::{Function, ObjRef, Object},
    value::Value,
    vm::Vm,
};
use log::{debug, log_enabled, warn, Level};
use std::mem;
use viper_syntax::{
    lex::Lexer,
    token::{Token, TokenKind},
};

const MAX_LOCALS: usize = u8::MAX as usize + 1;
const MAX_UPVALUES: usize = u8::MAX as usize + 1;
const MAX_ARGS: usize = u8::MAX as usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Index,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Ternary,
            Self::Ternary => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Index,
            Self::Index | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local {
    name: String,
    /// `None` while the initializer is still being compiled
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

#[derive(Debug)]
struct FunctionState {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot zero holds the callee, or the receiver for methods
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            function: Function {
                name,
                ..Function::default()
            },
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::default(),
            scope_depth: 0,
        }
    }
}

#[derive(Debug)]
struct ClassState {
    has_superclass: bool,
}

/// Marks what unfinished functions reference, since none of it is
/// reachable from the VM yet
fn mark_frames(heap: &mut Heap, frames: &[FunctionState]) {
    for frame in frames {
        heap.mark(&frame.function);
    }
}

struct Compiler<'src, 'vm> {
    lexer: Lexer<'src>,
    vm: &'vm mut Vm,
    current: Token,
    previous: Token,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

/// Compiles a whole script into its top-level function
pub fn compile(source: &str, vm: &mut Vm) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, vm);
    compiler.advance();
    while !compiler.match_token(TokenKind::EOF) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    if compiler.errors.is_empty() {
        Ok(function)
    } else {
        Err(compiler.errors)
    }
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Self {
        Self {
            lexer: Lexer::new(source),
            vm,
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            panic_mode: false,
            errors: Vec::default(),
            frames: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::default(),
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'vm>>,
            Option<ParseFn<'src, 'vm>>,
            Precedence,
        ) = match kind {
            TokenKind::LPAREN => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::LBRACKET => (Some(Self::list), Some(Self::index), Precedence::Index),
            TokenKind::LBRACE => (Some(Self::map), None, Precedence::None),
            TokenKind::DOT => (None, Some(Self::dot), Precedence::Call),
            TokenKind::QUESTION => (None, Some(Self::ternary), Precedence::Ternary),
            TokenKind::MINUS => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::PLUS => (None, Some(Self::binary), Precedence::Term),
            TokenKind::SLASH | TokenKind::STAR | TokenKind::MODULO => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::BANG => (Some(Self::unary), None, Precedence::None),
            TokenKind::BANG_EQUAL | TokenKind::EQUAL_EQUAL => {
                (None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::GREATER
            | TokenKind::GREATER_EQUAL
            | TokenKind::LESS
            | TokenKind::LESS_EQUAL => (None, Some(Self::binary), Precedence::Comparison),
            TokenKind::IDENT => (Some(Self::variable), None, Precedence::None),
            TokenKind::STRING => (Some(Self::string), None, Precedence::None),
            TokenKind::NUMBER => (Some(Self::number), None, Precedence::None),
            TokenKind::AND => (None, Some(Self::and), Precedence::And),
            TokenKind::OR => (None, Some(Self::or), Precedence::Or),
            TokenKind::TRUE | TokenKind::FALSE | TokenKind::NULL => {
                (Some(Self::literal), None, Precedence::None)
            }
            TokenKind::THIS => (Some(Self::this), None, Precedence::None),
            TokenKind::SUPER => (Some(Self::super_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    // Token plumbing

    fn advance(&mut self) {
        self.previous = mem::replace(&mut self.current, Token::synthetic(""));
        loop {
            match self.lexer.next_token() {
                Ok(token) => {
                    self.current = token;
                    break;
                }
                Err(e) => self.report(e.line, Location::None, e.msg.into()),
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, msg: &'static str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(ErrorMsg::Expected(msg));
        }
    }

    /// Consumes a compound assignment operator and returns the arithmetic
    /// it stands for
    fn match_compound(&mut self) -> Option<Op> {
        let op = match self.current.kind {
            TokenKind::PLUS_EQUAL => Op::Add,
            TokenKind::MINUS_EQUAL => Op::Sub,
            TokenKind::STAR_EQUAL => Op::Mul,
            TokenKind::SLASH_EQUAL => Op::Div,
            TokenKind::MODULO_EQUAL => Op::Mod,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    // Error reporting

    fn error(&mut self, msg: ErrorMsg) {
        let token = self.previous.clone();
        self.error_at(&token, msg);
    }

    fn error_at_current(&mut self, msg: ErrorMsg) {
        let token = self.current.clone();
        self.error_at(&token, msg);
    }

    fn error_at(&mut self, token: &Token, msg: ErrorMsg) {
        let location = if token.kind == TokenKind::EOF {
            Location::End
        } else {
            Location::At(token.lexeme.clone())
        };
        self.report(token.line, location, msg);
    }

    fn report(&mut self, line: usize, location: Location, msg: ErrorMsg) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError {
            line,
            location,
            msg,
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::EOF) {
            if self.previous.kind == TokenKind::SEMICOLON {
                return;
            }
            match self.current.kind {
                TokenKind::CLASS
                | TokenKind::FN
                | TokenKind::VAR
                | TokenKind::FOR
                | TokenKind::IF
                | TokenKind::WHILE
                | TokenKind::PRINT
                | TokenKind::RETURN
                | TokenKind::SWITCH
                | TokenKind::IMPORT => return,
                _ => self.advance(),
            }
        }
    }

    // Emitting bytecode

    fn state(&mut self) -> &mut FunctionState {
        self.frames
            .last_mut()
            .expect("compiler always has a function state")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().function.chunk
    }

    fn emit(&mut self, op: Op) -> usize {
        let line = self.previous.line;
        self.chunk().write(op, line)
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Null);
        }
        self.emit(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.chunk().add_constant(value);
        u8::try_from(idx).unwrap_or_else(|_| {
            self.error(ErrorMsg::TooManyConstants);
            0
        })
    }

    fn emit_constant(&mut self, value: Value) {
        let c = self.make_constant(value);
        self.emit(Op::Constant(c));
    }

    /// Emits a forward jump with a placeholder offset, to be patched later
    fn emit_jump(&mut self, op: fn(u16) -> Op) -> usize {
        self.emit(op(u16::MAX))
    }

    fn patch_jump(&mut self, at: usize) {
        let distance = self.chunk().code.len() - at - 1;
        let offset = u16::try_from(distance).unwrap_or_else(|_| {
            self.error(ErrorMsg::JumpTooLarge);
            u16::MAX
        });
        let chunk = self.chunk();
        chunk.code[at] = match chunk.code[at] {
            Op::Jump(_) => Op::Jump(offset),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(offset),
            op => unreachable!("cannot patch {op}"),
        };
    }

    fn emit_loop(&mut self, start: usize) {
        let distance = self.chunk().code.len() - start + 1;
        let offset = u16::try_from(distance).unwrap_or_else(|_| {
            self.error(ErrorMsg::LoopTooLarge);
            u16::MAX
        });
        self.emit(Op::Loop(offset));
    }

    // Allocation through the VM, rooting unfinished functions

    fn intern(&mut self, s: &str) -> ObjRef {
        let Self { vm, frames, .. } = &mut *self;
        vm.intern_with(s, |heap| mark_frames(heap, frames))
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.intern(name);
        self.make_constant(Value::Object(s))
    }

    fn begin_function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.clone();
        let name = self.intern(&name);
        self.frames.push(FunctionState::new(kind, Some(name)));
    }

    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueRef>) {
        self.emit_return();
        let state = self
            .frames
            .pop()
            .expect("compiler always has a function state");
        if log_enabled!(Level::Debug) && self.errors.is_empty() {
            let heap = self.vm.heap();
            let name = heap.function_name(&state.function);
            debug!("{}", decode_chunk(&state.function.chunk, &name, heap));
        }
        let Self { vm, frames, .. } = &mut *self;
        let function = vm.alloc_with(Object::Function(state.function), |heap| {
            mark_frames(heap, frames)
        });
        (function, state.upvalues)
    }

    // Scopes and variables

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.state();
            let depth = state.scope_depth;
            let captured = match state.locals.last() {
                Some(local) if local.depth.map_or(false, |d| d > depth) => local.is_captured,
                _ => break,
            };
            state.locals.pop();
            self.emit(if captured { Op::CloseUpvalue } else { Op::Pop });
        }
    }

    fn add_local(&mut self, name: String) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error(ErrorMsg::TooManyLocals);
            return;
        }
        self.state().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        let name = self.previous.lexeme.clone();
        let duplicate = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth.map_or(true, |d| d >= depth))
            .any(|l| l.name == name);
        if duplicate {
            self.error(ErrorMsg::DuplicateLocal);
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, msg: &'static str) -> u8 {
        self.consume(TokenKind::IDENT, msg);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global));
    }

    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<u8> {
        let (slot, initialized) = self.frames[frame]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i, l.depth.is_some()))?;
        if !initialized {
            self.error(ErrorMsg::SelfInitializer);
        }
        Some(slot as u8)
    }

    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<u8> {
        if frame == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(frame - 1, name) {
            self.frames[frame - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(frame, local, true));
        }
        let upvalue = self.resolve_upvalue(frame - 1, name)?;
        Some(self.add_upvalue(frame, upvalue, false))
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> u8 {
        let upvalue = UpvalueRef { index, is_local };
        let upvalues = &self.frames[frame].upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == upvalue) {
            return existing as u8;
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error(ErrorMsg::TooManyUpvalues);
            return 0;
        }
        let state = &mut self.frames[frame];
        state.upvalues.push(upvalue);
        state.function.upvalue_count = state.upvalues.len();
        (state.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.frames.len() - 1;
        let (get, set) = if let Some(slot) = self.resolve_local(top, name) {
            (Op::GetLocal(slot), Op::SetLocal(slot))
        } else if let Some(idx) = self.resolve_upvalue(top, name) {
            (Op::GetUpvalue(idx), Op::SetUpvalue(idx))
        } else {
            let c = self.identifier_constant(name);
            (Op::GetGlobal(c), Op::SetGlobal(c))
        };

        if can_assign && self.match_token(TokenKind::EQUAL) {
            self.expression();
            self.emit(set);
        } else if let Some(op) = can_assign.then(|| self.match_compound()).flatten() {
            self.emit(get);
            self.expression();
            self.emit(op);
            self.emit(set);
        } else {
            self.emit(get);
        }
    }

    // Declarations

    fn declaration(&mut self) {
        if self.match_token(TokenKind::CLASS) {
            self.class_declaration();
        } else if self.match_token(TokenKind::FN) {
            self.fn_declaration();
        } else if self.match_token(TokenKind::VAR) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::IDENT, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit(Op::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::LESS) {
            self.consume(TokenKind::IDENT, "Expect superclass name.");
            self.variable(false);
            if self.previous.lexeme == class_name {
                self.error(ErrorMsg::InheritFromSelf);
            }

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit(Op::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LBRACE, "Expect '{' before class body.");
        while !self.check(TokenKind::RBRACE) && !self.check(TokenKind::EOF) {
            self.method(&class_name);
        }
        self.consume(TokenKind::RBRACE, "Expect '}' after class body.");
        self.emit(Op::Pop);

        if self.classes.pop().map_or(false, |c| c.has_superclass) {
            self.end_scope();
        }
    }

    fn method(&mut self, class_name: &str) {
        self.consume(TokenKind::IDENT, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);
        // A method named after its class is the initializer
        let kind = if name == class_name {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit(Op::Method(constant));
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_function(kind);
        self.begin_scope();

        self.consume(TokenKind::LPAREN, "Expect '(' after function name.");
        if !self.check(TokenKind::RPAREN) {
            let mut arity = 0;
            loop {
                arity += 1;
                if arity > MAX_ARGS {
                    self.error_at_current(ErrorMsg::TooManyParams);
                }
                self.state().function.arity = arity.min(MAX_ARGS) as u8;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::COMMA) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RPAREN, "Expect ')' after parameters.");
        self.consume(TokenKind::LBRACE, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Object(function));
        self.emit(Op::Closure(constant));
        for upvalue in upvalues {
            self.emit(Op::Capture {
                is_local: upvalue.is_local,
                index: upvalue.index,
            });
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::EQUAL) {
            self.expression();
        } else {
            self.emit(Op::Null);
        }
        self.consume(TokenKind::SEMICOLON, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // Statements

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::PRINT => {
                self.advance();
                self.print_statement();
            }
            TokenKind::IF => {
                self.advance();
                self.if_statement();
            }
            TokenKind::RETURN => {
                self.advance();
                self.return_statement();
            }
            TokenKind::WHILE => {
                self.advance();
                self.while_statement();
            }
            TokenKind::FOR => {
                self.advance();
                self.for_statement();
            }
            TokenKind::SWITCH => {
                self.advance();
                self.switch_statement();
            }
            TokenKind::BREAK | TokenKind::CONTINUE | TokenKind::IMPORT => {
                self.advance();
                self.ignored_statement();
            }
            TokenKind::LBRACE => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBRACE) && !self.check(TokenKind::EOF) {
            self.declaration();
        }
        self.consume(TokenKind::RBRACE, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::SEMICOLON, "Expect ';' after value.");
        self.emit(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::SEMICOLON, "Expect ';' after expression.");
        self.emit(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LPAREN, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RPAREN, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        self.emit(Op::Pop);
        if self.match_token(TokenKind::ELSE) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LPAREN, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RPAREN, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LPAREN, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::SEMICOLON) {
            // No initializer
        } else if self.match_token(TokenKind::VAR) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::SEMICOLON) {
            self.expression();
            self.consume(TokenKind::SEMICOLON, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit(Op::Pop);
        }

        if !self.match_token(TokenKind::RPAREN) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit(Op::Pop);
            self.consume(TokenKind::RPAREN, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error(ErrorMsg::TopLevelReturn);
        }
        if self.match_token(TokenKind::SEMICOLON) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error(ErrorMsg::InitializerReturn);
            }
            self.expression();
            self.consume(TokenKind::SEMICOLON, "Expect ';' after return value.");
            self.emit(Op::Return);
        }
    }

    /// The subject lives in a hidden local for the duration of the switch.
    /// Each case compares a copy of it and falls to the next case on
    /// mismatch; a matching body jumps past the remaining cases.
    fn switch_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LPAREN, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RPAREN, "Expect ')' after value.");
        // Not a valid identifier, so user code can never resolve it
        self.add_local("switch subject".to_string());
        self.mark_initialized();
        self.consume(TokenKind::LBRACE, "Expect '{' before switch cases.");

        let mut end_jumps = Vec::default();
        let mut next_case: Option<usize> = None;
        let mut seen_default = false;
        while !self.check(TokenKind::RBRACE) && !self.check(TokenKind::EOF) {
            let is_default = if self.match_token(TokenKind::CASE) {
                false
            } else if self.match_token(TokenKind::DEFAULT) {
                true
            } else {
                self.error_at_current(ErrorMsg::Expected("Expect 'case' or 'default'."));
                self.advance();
                continue;
            };
            if seen_default {
                self.error(ErrorMsg::DefaultNotLast);
            }
            // Discard the failed comparison of the previous case
            if let Some(jump) = next_case.take() {
                self.patch_jump(jump);
                self.emit(Op::Pop);
            }

            if is_default {
                seen_default = true;
                self.consume(TokenKind::COLON, "Expect ':' after 'default'.");
            } else {
                self.emit(Op::Dup);
                self.expression();
                self.consume(TokenKind::COLON, "Expect ':' after case value.");
                self.emit(Op::Equal);
                next_case = Some(self.emit_jump(Op::JumpIfFalse));
                self.emit(Op::Pop);
            }

            self.begin_scope();
            while !self.check(TokenKind::CASE)
                && !self.check(TokenKind::DEFAULT)
                && !self.check(TokenKind::RBRACE)
                && !self.check(TokenKind::EOF)
            {
                self.declaration();
            }
            self.end_scope();
            end_jumps.push(self.emit_jump(Op::Jump));
        }

        if let Some(jump) = next_case {
            self.patch_jump(jump);
            self.emit(Op::Pop);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RBRACE, "Expect '}' after switch cases.");
        self.end_scope();
    }

    /// `break`, `continue` and `import` parse but compile to nothing
    fn ignored_statement(&mut self) {
        let keyword = self.previous.lexeme.clone();
        if self.previous.kind == TokenKind::IMPORT
            && !self.match_token(TokenKind::STRING)
            && !self.match_token(TokenKind::IDENT)
        {
            self.error_at_current(ErrorMsg::Expected("Expect module name after 'import'."));
        }
        warn!(
            "[line {}] '{keyword}' is not supported and will be ignored",
            self.previous.line
        );
        self.match_token(TokenKind::SEMICOLON);
    }

    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error(ErrorMsg::ExpectedExpr);
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && (self.match_token(TokenKind::EQUAL) || self.match_compound().is_some()) {
            self.error(ErrorMsg::InvalidAssignTarget);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0;
        if !self.check(TokenKind::RPAREN) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error(ErrorMsg::TooManyArgs);
                }
                count += 1;
                if !self.match_token(TokenKind::COMMA) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RPAREN, "Expect ')' after arguments.");
        count.min(MAX_ARGS) as u8
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RPAREN, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error(viper_syntax::error::ErrorMsg::MalformedNumber.into()),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme.clone();
        let s = self.intern(&lexeme);
        self.emit_constant(Value::Object(s));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::TRUE => self.emit(Op::True),
            TokenKind::FALSE => self.emit(Op::False),
            TokenKind::NULL => self.emit(Op::Null),
            kind => unreachable!("{kind:?} is not a literal"),
        };
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(ErrorMsg::ThisOutsideClass);
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error(ErrorMsg::SuperOutsideClass),
            Some(class) if !class.has_superclass => {
                self.error(ErrorMsg::SuperWithoutSuperclass)
            }
            _ => (),
        }
        self.consume(TokenKind::DOT, "Expect '.' after 'super'.");
        self.consume(TokenKind::IDENT, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LPAREN) {
            let args = self.argument_list();
            self.named_variable("super", false);
            self.emit(Op::SuperInvoke(name, args));
        } else {
            self.named_variable("super", false);
            self.emit(Op::GetSuper(name));
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::MINUS => self.emit(Op::Negate),
            TokenKind::BANG => self.emit(Op::Not),
            kind => unreachable!("{kind:?} is not a unary operator"),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Self::rule(kind).precedence.next());
        let ops: &[Op] = match kind {
            TokenKind::BANG_EQUAL => &[Op::Equal, Op::Not],
            TokenKind::EQUAL_EQUAL => &[Op::Equal],
            TokenKind::GREATER => &[Op::Greater],
            TokenKind::GREATER_EQUAL => &[Op::Less, Op::Not],
            TokenKind::LESS => &[Op::Less],
            TokenKind::LESS_EQUAL => &[Op::Greater, Op::Not],
            TokenKind::PLUS => &[Op::Add],
            TokenKind::MINUS => &[Op::Sub],
            TokenKind::STAR => &[Op::Mul],
            TokenKind::SLASH => &[Op::Div],
            TokenKind::MODULO => &[Op::Mod],
            kind => unreachable!("{kind:?} is not a binary operator"),
        };
        for op in ops {
            self.emit(*op);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.consume(TokenKind::COLON, "Expect ':' after then branch of ternary.");
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(else_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let args = self.argument_list();
        self.emit(Op::Call(args));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::IDENT, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::EQUAL) {
            self.expression();
            self.emit(Op::SetProperty(name));
        } else if let Some(op) = can_assign.then(|| self.match_compound()).flatten() {
            self.emit(Op::Dup);
            self.emit(Op::GetProperty(name));
            self.expression();
            self.emit(op);
            self.emit(Op::SetProperty(name));
        } else if self.match_token(TokenKind::LPAREN) {
            let args = self.argument_list();
            self.emit(Op::Invoke(name, args));
        } else {
            self.emit(Op::GetProperty(name));
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        if self.match_token(TokenKind::COLON) {
            self.expression();
            self.consume(TokenKind::RBRACKET, "Expect ']' after slice.");
            self.emit(Op::Slice);
            return;
        }
        self.consume(TokenKind::RBRACKET, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::EQUAL) {
            self.expression();
            self.emit(Op::SetIndex);
        } else {
            self.emit(Op::Index);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count = 0;
        if !self.check(TokenKind::RBRACKET) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error(ErrorMsg::TooManyListItems);
                }
                count += 1;
                if !self.match_token(TokenKind::COMMA) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBRACKET, "Expect ']' after list items.");
        self.emit(Op::List(count.min(MAX_ARGS) as u8));
    }

    fn map(&mut self, _can_assign: bool) {
        let mut count = 0;
        if !self.check(TokenKind::RBRACE) {
            loop {
                self.expression();
                self.consume(TokenKind::COLON, "Expect ':' after map key.");
                self.expression();
                if count == MAX_ARGS {
                    self.error(ErrorMsg::TooManyMapEntries);
                }
                count += 1;
                if !self.match_token(TokenKind::COMMA) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBRACE, "Expect '}' after map entries.");
        self.emit(Op::Map(count.min(MAX_ARGS) as u8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_test(source: &str) -> Vec<Op> {
        let mut vm = Vm::default();
        let function = compile(source, &mut vm).expect("compiles");
        vm.heap().function(function).chunk.code.clone()
    }

    fn compile_err_test(source: &str) -> Vec<String> {
        let mut vm = Vm::default();
        compile(source, &mut vm)
            .expect_err("fails to compile")
            .into_iter()
            .map(|e| e.to_string())
            .collect()
    }

    #[test]
    fn precedence() {
        assert_eq!(
            compile_test("1 + 2 * 3;"),
            vec![
                Op::Constant(0),
                Op::Constant(1),
                Op::Constant(2),
                Op::Mul,
                Op::Add,
                Op::Pop,
                Op::Null,
                Op::Return,
            ]
        );
    }

    #[test]
    fn derived_comparisons() {
        let code = compile_test("1 <= 2;");
        assert_eq!(&code[2..4], &[Op::Greater, Op::Not]);
    }

    #[test]
    fn locals_use_slots() {
        let code = compile_test("{ var a = 1; print a; }");
        assert_eq!(
            code,
            vec![
                Op::Constant(0),
                Op::GetLocal(1),
                Op::Print,
                Op::Pop,
                Op::Null,
                Op::Return,
            ]
        );
    }

    #[test]
    fn compound_assignment_on_globals() {
        let code = compile_test("var x = 1; x += 2;");
        assert_eq!(
            &code[2..],
            &[
                Op::GetGlobal(2),
                Op::Constant(3),
                Op::Add,
                Op::SetGlobal(2),
                Op::Pop,
                Op::Null,
                Op::Return,
            ]
        );
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let mut vm = Vm::default();
        let script = compile(
            "fn outer() { var x = 1; fn inner() { return x; } return inner; }",
            &mut vm,
        )
        .unwrap();
        let heap = vm.heap();
        let Value::Object(outer) = heap.function(script).chunk.constants[1] else {
            panic!("expected function constant");
        };
        let outer = heap.function(outer);
        assert!(outer.chunk.code.contains(&Op::Capture {
            is_local: true,
            index: 1
        }));
        assert_eq!(outer.upvalue_count, 0);
    }

    #[test]
    fn jumps_are_patched() {
        let code = compile_test("if (true) print 1; else print 2;");
        assert_eq!(code[1], Op::JumpIfFalse(4));
        assert_eq!(code[5], Op::Jump(3));
    }

    #[test]
    fn ignored_statements_emit_nothing() {
        assert_eq!(
            compile_test("break; continue import \"lib\";"),
            vec![Op::Null, Op::Return]
        );
    }

    #[test]
    fn errors() {
        assert_eq!(
            compile_err_test("a + b = c;"),
            vec!["[line 1] Error at '=': Invalid assignment target."]
        );
        assert_eq!(
            compile_err_test("return 1;"),
            vec!["[line 1] Error at 'return': Can't return from top-level code."]
        );
        assert_eq!(
            compile_err_test("print this;"),
            vec!["[line 1] Error at 'this': Can't use 'this' outside of a class."]
        );
        assert_eq!(
            compile_err_test("class A < A {}"),
            vec!["[line 1] Error at 'A': A class can't inherit from itself."]
        );
        assert_eq!(
            compile_err_test("class A { f() { super.f(); } }"),
            vec!["[line 1] Error at 'super': Can't use 'super' in a class with no superclass."]
        );
        assert_eq!(
            compile_err_test("{ var a = 1; var a = 2; }"),
            vec!["[line 1] Error at 'a': Already a variable with this name in this scope."]
        );
        assert_eq!(
            compile_err_test("{ var a = a; }"),
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer."]
        );
        assert_eq!(
            compile_err_test("class A { A() { return 1; } }"),
            vec!["[line 1] Error at 'return': Can't return a value from an initializer."]
        );
        assert_eq!(
            compile_err_test("print 1"),
            vec!["[line 1] Error at end: Expect ';' after value."]
        );
        assert_eq!(
            compile_err_test("switch (1) { default: print 1; case 2: print 2; }"),
            vec!["[line 1] Error at 'case': 'default' must be the last case in a switch."]
        );
    }

    #[test]
    fn errors_recover_at_statement_boundaries() {
        let errors = compile_err_test("var = 1;\nprint ;\nvar ok = 2;\n\"open");
        assert_eq!(
            errors,
            vec![
                "[line 1] Error at '=': Expect variable name.",
                "[line 2] Error at ';': Expect expression.",
                "[line 4] Error: Unterminated string.",
            ]
        );
    }

    #[test]
    fn too_many_constants() {
        let source: String = (0..300).map(|i| format!("{i};")).collect();
        let errors = compile_err_test(&source);
        assert_eq!(
            errors[0],
            "[line 1] Error at '256': Too many constants in one chunk."
        );
    }
}
