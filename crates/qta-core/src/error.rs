//! Error taxonomy for the DSL parser, interpreter, and simulation engine
//! (spec-defined: `ParseError`, `UnitError`, `ScopeError`, `ReferenceError`,
//! `DomainError`, `InternalError`).
//!
//! Parse errors are collected into a `Vec` and the whole program is rejected;
//! runtime errors abort the current trial as a structured [`TrialFailure`].

use thiserror::Error;

/// A single parse failure with source position, as returned in the `Vec`
/// produced by a failed [`crate::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into() }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("unit '{0}' is not recognized")]
    Unknown(String),
    #[error("cannot convert '{from}' to '{to}' for command '{command}'")]
    Incompatible { from: String, to: String, command: String },
    #[error("ratio unit '{0}' could not be resolved in this context")]
    UnresolvedRatio(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("command requires an application to be selected")]
    NoApplication,
    #[error("command requires a substance to be selected")]
    NoSubstance,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unknown substance '{0}'")]
    UnknownSubstance(String),
    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),
    #[error("unknown stream '{0}'")]
    UnknownStream(String),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("division by zero while evaluating '{0}'")]
    DivisionByZero(String),
    #[error("negative value not permitted for '{0}'")]
    NegativeNotPermitted(String),
}

/// Top-level error for everything that can go wrong once a [`crate::Program`]
/// has been parsed: scoping, unit conversion, and execution.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("unit error: {0}")]
    Unit(#[from] UnitError),
    #[error("scope error: {0}")]
    Scope(#[from] ScopeError),
    #[error("reference error: {0}")]
    Reference(#[from] ReferenceError),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable tag used in [`TrialFailure::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Unit(_) => "UnitError",
            EngineError::Scope(_) => "ScopeError",
            EngineError::Reference(_) => "ReferenceError",
            EngineError::Domain(_) => "DomainError",
            EngineError::Internal(_) => "InternalError",
        }
    }
}

/// Structured failure surfaced when a trial aborts mid-run (spec §7): names
/// the failing command's context so the driver can report it without
/// re-deriving state from a stack trace.
#[derive(Debug, Clone)]
pub struct TrialFailure {
    pub kind: String,
    pub scenario: String,
    pub trial: u32,
    pub year: i32,
    pub application: Option<String>,
    pub substance: Option<String>,
    pub message: String,
}

impl std::fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in scenario '{}' trial {} year {}{}{}: {}",
            self.kind,
            self.scenario,
            self.trial,
            self.year,
            self.application.as_ref().map(|a| format!(" app '{a}'")).unwrap_or_default(),
            self.substance.as_ref().map(|s| format!(" substance '{s}'")).unwrap_or_default(),
            self.message,
        )
    }
}

impl std::error::Error for TrialFailure {}
