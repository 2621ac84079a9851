use thiserror::Error as ThisError;

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ErrorMsg {
    #[error("Unexpected character.")]
    UnexpectedChar,
    #[error("Unterminated string.")]
    UnterminatedString,
    #[error("Unterminated block comment.")]
    UnterminatedComment,
    #[error("Malformed number.")]
    MalformedNumber,
}

/// A lexical error. The lexer hands these out in place of a token,
/// and the caller decides whether to keep going.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("[line {line}] Error: {msg}")]
pub struct Error {
    pub line: usize,
    pub msg: ErrorMsg,
    pub lexeme: String,
}
