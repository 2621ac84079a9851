pub mod chunk;
pub mod compiler;
pub mod error;
pub mod heap;
mod index;
mod natives;
pub mod object;
pub mod output;
pub mod table;
pub mod value;
pub mod vm;

pub use error::InterpretError;
pub use heap::GcConfig;
pub use vm::Vm;
