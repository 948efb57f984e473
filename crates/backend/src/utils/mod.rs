pub mod bytes;
pub mod evm;
pub mod opcode;
