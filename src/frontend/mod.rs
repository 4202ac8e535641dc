use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod ast;
pub mod intern;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl SourceFile {
    pub fn from_memory(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            origin: SourceFileOrigin::Memory,
        }
    }
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}

/// A point in some source file. Lines and columns are 1-based as reported to
/// the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An optional source position. Positions only ever feed diagnostics; they
/// never affect the meaning of the node they are attached to.
pub type OptPos = Option<Position>;

/// A value coupled with the place it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placed<T> {
    pub value: T,
    pub pos: OptPos,
}

impl<T> Placed<T> {
    pub fn new(value: T, pos: OptPos) -> Self {
        Self { value, pos }
    }

    pub fn unplaced(value: T) -> Self {
        Self { value, pos: None }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Placed<U> {
        Placed {
            value: f(self.value),
            pos: self.pos,
        }
    }

    /// Re-wraps a different value at the same position.
    pub fn rewrap<U>(&self, value: U) -> Placed<U> {
        Placed {
            value,
            pos: self.pos.clone(),
        }
    }
}
