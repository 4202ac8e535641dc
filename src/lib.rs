//! Compiler for the Wybe language: a statically typed imperative language
//! with explicitly flowed parameters, lowered through a three-address
//! SSA-style primitive form with per-procedure optimisation and a bottom-up
//! alias analysis that proves destructive updates safe.

pub mod backend;
pub mod compiler;
pub mod error;
pub mod frontend;
pub mod index;
pub mod middle;

pub use compiler::{driver, CompilerState, LogCategory, Options};
pub use error::{CompileError, Diagnostic, Result, Severity};
