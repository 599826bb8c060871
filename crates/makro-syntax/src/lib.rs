pub mod ast;
pub mod lexer;
pub mod parser;

use makro_common::error::{Error, ErrorS, SyntaxError};

use crate::ast::Program;

/// Parses a complete program. `offset` is added to every span, so that
/// sources appended to a shared buffer (as in a REPL) keep unique spans.
pub fn parse(source: &str, offset: usize) -> Result<Program, Vec<ErrorS>> {
    parser::parse(source, offset)
}

/// Returns `false` if `source` ends in the middle of a statement, i.e. more
/// input could still make it parse.
pub fn is_complete(source: &str) -> bool {
    match parse(source, 0) {
        Ok(_) => true,
        Err(errors) => !errors
            .iter()
            .any(|(e, _)| matches!(e, Error::SyntaxError(SyntaxError::UnrecognizedEOF { .. }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_input() {
        assert!(is_complete("print 1;"));
        assert!(!is_complete("fun f() {"));
        assert!(!is_complete("print 1"));
        // Complete, but wrong.
        assert!(is_complete("print );"));
    }
}
