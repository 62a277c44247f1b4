//! This is the compiler as a library.  See `src/bin` directory for the
//! executable programs using this library.

// Several Isa/InstrEncoder methods are only reachable from certain
// targets; keeping the trait surface uniform across all five matters
// more than silencing the unused-on-this-target warnings it produces.
#![allow(dead_code)]

pub mod ast;
pub mod asm;
pub mod common;
pub mod container;
pub mod diag;
pub mod lower;
pub mod pipeline;
pub mod stack;
pub mod target;
pub mod wire;
