//! Compile-time diagnostics.
//!
//! A compile error aborts the module being compiled; it carries an error
//! class, a message and the source position the compiler was at. Warnings
//! use the same payload but are routed through a [`WarningSink`] and never
//! unwind.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

/// Classes of compile errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Lexical or grammatical problems.
    Syntax,
    /// Undeclared or conflicting symbols, shadowing violations.
    Scope,
    /// Reads of (maybe-)uninitialized variables.
    Init,
    /// Wrong class in an operator or construct.
    Type,
    /// Wrong argument counts, incomplete tuples.
    Arity,
    /// Instruction operand or jump out of range.
    Range,
    /// Bad numeric literals, compile-time division by zero.
    Numeric,
    /// try/throw misuse.
    Exception,
    /// Module loading and include failures.
    Io,
    /// Compiler invariant violation.
    Internal,
}

/// A fatal compile error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based source line, 0 when unknown.
    pub line: usize,
    /// 1-based source column, 0 when unknown.
    pub col: usize,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind: &'static str = self.kind.into();
        if self.line > 0 {
            write!(f, "{}:{}: {} error: {}", self.line, self.col, kind, self.message)
        } else {
            write!(f, "{kind} error: {}", self.message)
        }
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

/// A non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}: warning: {}", self.line, self.col, self.message)
        } else {
            write!(f, "warning: {}", self.message)
        }
    }
}

/// Destination for warnings emitted during compilation.
pub trait WarningSink {
    fn warning(&mut self, warning: &Warning);
}

/// Prints warnings to stderr.
#[derive(Debug, Default)]
pub struct StderrWarnings;

impl WarningSink for StderrWarnings {
    fn warning(&mut self, warning: &Warning) {
        eprintln!("{warning}");
    }
}

/// Collects warnings for later inspection; useful in tests and embedders.
#[derive(Debug, Default)]
pub struct CollectWarnings {
    pub warnings: Vec<Warning>,
}

impl WarningSink for CollectWarnings {
    fn warning(&mut self, warning: &Warning) {
        self.warnings.push(warning.clone());
    }
}

/// Discards warnings.
#[derive(Debug, Default)]
pub struct NoWarnings;

impl WarningSink for NoWarnings {
    fn warning(&mut self, _warning: &Warning) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_position_and_kind() {
        let e = CompileError {
            kind: ErrorKind::Scope,
            message: "duplicate case value".to_string(),
            line: 3,
            col: 9,
        };
        assert_eq!(e.to_string(), "3:9: Scope error: duplicate case value");
    }

    #[test]
    fn collect_sink_stores_warnings() {
        let mut sink = CollectWarnings::default();
        sink.warning(&Warning {
            message: "x".to_string(),
            line: 1,
            col: 1,
        });
        assert_eq!(sink.warnings.len(), 1);
    }
}
