//! Parser and simulation engine for Montreal Protocol / Kigali Amendment
//! policy scenarios expressed in the `.qta` DSL.

pub mod ast;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod pushdown;
pub mod result;
pub mod scenario;
pub mod stream;
pub mod unit;

pub use ast::Program;
pub use engine::Engine;
pub use error::{EngineError, ParseError, TrialFailure};
pub use result::{EngineResult, ResultRow};
pub use scenario::{DriverConfig, ErrorPolicy, ScenarioDriver};

/// Parse a `.qta` source file into a [`Program`]. Syntax errors are
/// collected rather than stopping at the first one.
pub fn parse(source: &str) -> Result<Program, Vec<ParseError>> {
    parser::Parser::new(source).parse_program()
}

/// Parse `source` and report only whether it is well-formed, discarding the
/// resulting [`Program`].
pub fn validate(source: &str) -> bool {
    parse(source).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_a_minimal_program() {
        let src = r#"
            start default
                start application "Foams"
                    start substance "HFC-245fa"
                        enable manufacture
                    end
                end
            end
        "#;
        assert!(validate(src));
    }

    #[test]
    fn validate_rejects_malformed_source() {
        assert!(!validate("start default\n  this is not a valid stanza body\n"));
    }
}
