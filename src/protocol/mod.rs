//! Wire protocol: opcodes, error subcodes, and the binary frame codec.

pub mod frame;
pub mod opcode;

pub use frame::Frame;
