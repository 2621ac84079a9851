use std::fmt::Display;
use thiserror::Error as ThisError;

#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum ErrorMsg {
    // Lexical errors
    #[error(transparent)]
    Lexical(#[from] viper_syntax::error::ErrorMsg),
    // Compile errors
    #[error("{0}")]
    Expected(&'static str),
    #[error("Expect expression.")]
    ExpectedExpr,
    #[error("Invalid assignment target.")]
    InvalidAssignTarget,
    #[error("Too many local variables in function.")]
    TooManyLocals,
    #[error("Too many closure variables in function.")]
    TooManyUpvalues,
    #[error("Can't have more than 255 parameters.")]
    TooManyParams,
    #[error("Can't have more than 255 arguments.")]
    TooManyArgs,
    #[error("Too many constants in one chunk.")]
    TooManyConstants,
    #[error("Can't have more than 255 items in a list literal.")]
    TooManyListItems,
    #[error("Can't have more than 255 entries in a map literal.")]
    TooManyMapEntries,
    #[error("Too much code to jump over.")]
    JumpTooLarge,
    #[error("Loop body too large.")]
    LoopTooLarge,
    #[error("Already a variable with this name in this scope.")]
    DuplicateLocal,
    #[error("Can't read local variable in its own initializer.")]
    SelfInitializer,
    #[error("Can't return from top-level code.")]
    TopLevelReturn,
    #[error("Can't return a value from an initializer.")]
    InitializerReturn,
    #[error("Can't use 'this' outside of a class.")]
    ThisOutsideClass,
    #[error("Can't use 'super' outside of a class.")]
    SuperOutsideClass,
    #[error("Can't use 'super' in a class with no superclass.")]
    SuperWithoutSuperclass,
    #[error("A class can't inherit from itself.")]
    InheritFromSelf,
    #[error("'default' must be the last case in a switch.")]
    DefaultNotLast,
    // Runtime errors
    #[error("Operand must be a number.")]
    ExpectedNumber,
    #[error("Operands must be numbers.")]
    ExpectedNumbers,
    #[error("Operands must be two numbers or two strings.")]
    ExpectedNumsOrStrs,
    #[error("Division by zero.")]
    DivisionByZero,
    #[error("Modulo by zero.")]
    ModuloByZero,
    #[error("Undefined variable '{0}'.")]
    UndefinedVar(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Only instances have properties.")]
    NoProperties,
    #[error("Only instances have fields.")]
    NoFields,
    #[error("Only instances have methods.")]
    NoMethods,
    #[error("Superclass must be a class.")]
    SuperclassNotClass,
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Expected {expected} arguments but got {got}.")]
    Arity { expected: u8, got: u8 },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Index must be an integer.")]
    IndexNotInteger,
    #[error("String index out of range.")]
    StringIndexOutOfRange,
    #[error("List index out of range.")]
    ListIndexOutOfRange,
    #[error("Slice bounds out of range.")]
    SliceOutOfRange,
    #[error("Key not found in map.")]
    MissingKey,
    #[error("Maps can't be sliced.")]
    MapSlice,
    #[error("Map keys must be numbers or strings.")]
    InvalidMapKey,
    #[error("Only strings, lists and maps can be indexed.")]
    NotIndexable,
    #[error("Strings are immutable.")]
    ImmutableString,
    #[error("Only lists and maps support index assignment.")]
    NotIndexAssignable,
    #[error("{0}")]
    Native(String),
    #[error("Failed to write output: {0}")]
    Output(String),
}

/// Where a compile error was found
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    At(String),
    End,
    /// Lexical errors carry no location
    None,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::At(lexeme) => write!(f, " at '{lexeme}'"),
            Self::End => f.write_str(" at end"),
            Self::None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, ThisError)]
#[error("[line {line}] Error{location}: {msg}")]
pub struct CompileError {
    pub line: usize,
    pub location: Location,
    pub msg: ErrorMsg,
}

/// A runtime error along with the call stack at the point of failure,
/// innermost frame first
#[derive(Clone, Debug, PartialEq, ThisError)]
#[error("{msg}{}", trace_lines(.trace))]
pub struct RuntimeError {
    pub msg: ErrorMsg,
    pub trace: Vec<String>,
}

fn trace_lines(trace: &[String]) -> String {
    trace.iter().map(|line| format!("\n{line}")).collect()
}

#[derive(Debug, ThisError)]
pub enum InterpretError {
    #[error("{}", join_lines(.0))]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn join_lines(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_format() {
        let at = CompileError {
            line: 3,
            location: Location::At("x".to_string()),
            msg: ErrorMsg::InvalidAssignTarget,
        };
        assert_eq!(at.to_string(), "[line 3] Error at 'x': Invalid assignment target.");
        let end = CompileError {
            line: 1,
            location: Location::End,
            msg: ErrorMsg::Expected("Expect ';' after value."),
        };
        assert_eq!(end.to_string(), "[line 1] Error at end: Expect ';' after value.");
        let lexical = CompileError {
            line: 2,
            location: Location::None,
            msg: viper_syntax::error::ErrorMsg::UnterminatedString.into(),
        };
        assert_eq!(lexical.to_string(), "[line 2] Error: Unterminated string.");
    }

    #[test]
    fn runtime_error_format() {
        let e = RuntimeError {
            msg: ErrorMsg::Arity {
                expected: 1,
                got: 2,
            },
            trace: vec!["[line 2] in f()".to_string(), "[line 4] in script".to_string()],
        };
        assert_eq!(
            e.to_string(),
            "Expected 1 arguments but got 2.\n[line 2] in f()\n[line 4] in script"
        );
    }
}
