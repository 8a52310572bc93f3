pub mod ast;
pub mod bytes;
pub mod context;
pub mod emit;
pub mod flow;
pub mod gsic;
pub mod hash;
pub mod opcode;
pub mod process;
pub mod reader;
pub mod rosetta;
pub mod vm;
pub mod vtable;
pub mod walker;

pub use hash::HashIndex;
pub use opcode::{default_registry, Opcode, OpcodeRegistry};
pub use process::{process_data, process_file, Options, RunState};
pub use reader::{reader_for, ScriptReader};
pub use rosetta::RosettaSink;
