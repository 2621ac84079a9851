use std::{fmt::Display, ops::AddAssign};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl AddAssign for TextRange {
    fn add_assign(&mut self, rhs: Self) {
        self.start += rhs.start;
        self.end += rhs.end;
    }
}

/// The enum variants are in SCREAMING_SNAKE_CASE as they technically
/// represent constants, but Rust does not allow const enum variants.
#[allow(nonstandard_style)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    // Symbols
    LBRACKET,
    RBRACKET,
    LPAREN,
    RPAREN,
    LBRACE,
    RBRACE,
    COMMA,
    DOT,
    COLON,
    SEMICOLON,
    QUESTION,
    // Arithmetic
    BANG,
    MINUS,
    PLUS,
    SLASH,
    STAR,
    MODULO,
    // Compound assignment
    MINUS_EQUAL,
    PLUS_EQUAL,
    SLASH_EQUAL,
    STAR_EQUAL,
    MODULO_EQUAL,
    // Comparisons
    BANG_EQUAL,
    EQUAL_EQUAL,
    GREATER,
    GREATER_EQUAL,
    LESS,
    LESS_EQUAL,
    // Literals
    IDENT,
    STRING,
    NUMBER,
    // Keywords
    AND,
    BREAK,
    CASE,
    CLASS,
    CONTINUE,
    DEFAULT,
    ELSE,
    FALSE,
    FN,
    FOR,
    IF,
    IMPORT,
    NULL,
    OR,
    PRINT,
    RETURN,
    SUPER,
    SWITCH,
    THIS,
    TRUE,
    VAR,
    WHILE,
    // Miscellaneous tokens
    EQUAL,
    COMMENT,
    WHITESPACE,
    EOF,
}

impl TokenKind {
    pub fn from_char(c: char) -> Option<Self> {
        let token = match c {
            '[' => Self::LBRACKET,
            ']' => Self::RBRACKET,
            '(' => Self::LPAREN,
            ')' => Self::RPAREN,
            '{' => Self::LBRACE,
            '}' => Self::RBRACE,
            ',' => Self::COMMA,
            '.' => Self::DOT,
            ':' => Self::COLON,
            ';' => Self::SEMICOLON,
            '?' => Self::QUESTION,
            ' ' | '\t' | '\r' | '\n' => Self::WHITESPACE,
            _ => return None,
        };
        Some(token)
    }

    pub fn from_keyword(kw: &str) -> Option<Self> {
        let token = match kw {
            "and" => Self::AND,
            "break" => Self::BREAK,
            "case" => Self::CASE,
            "class" => Self::CLASS,
            "continue" => Self::CONTINUE,
            "default" => Self::DEFAULT,
            "else" => Self::ELSE,
            "false" => Self::FALSE,
            "fn" => Self::FN,
            "for" => Self::FOR,
            "if" => Self::IF,
            "import" => Self::IMPORT,
            "null" => Self::NULL,
            "or" => Self::OR,
            "print" => Self::PRINT,
            "return" => Self::RETURN,
            "super" => Self::SUPER,
            "switch" => Self::SWITCH,
            "this" => Self::THIS,
            "true" => Self::TRUE,
            "var" => Self::VAR,
            "while" => Self::WHILE,
            _ => return None,
        };
        Some(token)
    }

    /// Tokens that are dropped before the token stream reaches the compiler
    pub fn is_trivia(self) -> bool {
        matches!(self, Self::WHITESPACE | Self::COMMENT)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub range: TextRange,
    pub line: usize,
    pub lexeme: String,
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.lexeme)
    }
}

impl Token {
    pub fn new(kind: TokenKind, range: TextRange, line: usize, lexeme: String) -> Self {
        Self {
            kind,
            range,
            line,
            lexeme,
        }
    }

    /// A placeholder used before the first token has been read
    pub fn synthetic(lexeme: &str) -> Self {
        Self::new(TokenKind::EOF, TextRange::default(), 1, lexeme.to_string())
    }
}
