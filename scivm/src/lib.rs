//! A virtual machine for SCI-style bytecode: a segmented, typed heap
//! addressed by segment:offset value pairs, mark-and-sweep garbage
//! collection, selector dispatch over single inheritance and a stack
//! machine interpreter.
//!
//! The crate is organized around three pillars:
//! - [`seg_manager::SegManager`] owns the heap of [`segment::SegmentObj`]s
//!   and every pointer dereference goes through it,
//! - [`vm::VmState`] carries the interpreter registers, the execution
//!   stack and the bytecode loop,
//! - [`loader::ScriptLoader`] feeds decoded scripts in from the outside.

pub mod debug;
pub mod frame;
pub mod gc;
pub mod kernel;
pub mod loader;
pub mod opcode;
mod reg;
pub mod script;
pub mod seg_manager;
pub mod segment;
pub mod selector;
pub mod vm;

pub use reg::{NULL_REG, Reg, SIGNAL_REG, SegmentId, make_reg};
