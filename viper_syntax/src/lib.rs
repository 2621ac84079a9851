pub mod error;
pub mod lex;
pub mod token;
