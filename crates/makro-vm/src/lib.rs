mod chunk;
mod compiler;
mod config;
mod gc;
mod native;
mod object;
mod op;
mod table;
mod value;
mod vm;

pub use compiler::Compiler;
pub use config::Config;
pub use gc::{Gc, ObjectRef};
pub use native::NativeFn;
pub use value::Value;
pub use vm::{InterpretError, FRAMES_MAX, VM};
