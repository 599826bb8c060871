use lalrpop_util::{lalrpop_mod, ParseError};
use makro_common::error::{Error, ErrorS, SyntaxError};

use crate::ast::Program;
use crate::lexer::{Lexer, Token};

/// Maximum number of parameters / arguments in a single function call.
pub(crate) const MAX_ARGS: usize = u8::MAX as usize;

lalrpop_mod!(
    #[allow(clippy::all)]
    grammar,
    "/grammar.rs"
);

/// Parses `source`, shifting every span by `offset`. Lexer errors and parser
/// errors are collected together; the grammar recovers at declaration
/// boundaries, so one mistake does not hide the ones after it.
pub fn parse(source: &str, offset: usize) -> Result<Program, Vec<ErrorS>> {
    let mut errors = Vec::new();
    let mut tokens = Vec::new();
    for token in Lexer::new(source) {
        match token {
            Ok((start, token, end)) => tokens.push(Ok((start + offset, token, end + offset))),
            Err((e, span)) => errors.push((e, span.start + offset..span.end + offset)),
        }
    }

    let mut recovered = Vec::new();
    let result = grammar::ProgramParser::new().parse(&mut recovered, tokens);
    errors.extend(recovered.into_iter().map(|recovery| from_parse_error(recovery.error)));

    let program = match result {
        Ok(program) => program,
        Err(e) => {
            errors.push(from_parse_error(e));
            Program::default()
        }
    };
    if errors.is_empty() {
        Ok(program)
    } else {
        errors.sort_unstable_by_key(|(_, span)| (span.start, span.end));
        Err(errors)
    }
}

fn from_parse_error(e: ParseError<usize, Token, ErrorS>) -> ErrorS {
    match e {
        ParseError::InvalidToken { location } => (
            Error::SyntaxError(SyntaxError::UnexpectedInput { token: String::new() }),
            location..location,
        ),
        ParseError::UnrecognizedEOF { location, expected } => {
            (Error::SyntaxError(SyntaxError::UnrecognizedEOF { expected }), location..location)
        }
        ParseError::UnrecognizedToken { token: (start, token, end), expected } => (
            Error::SyntaxError(SyntaxError::UnrecognizedToken { token: token.to_string(), expected }),
            start..end,
        ),
        ParseError::ExtraToken { token: (start, token, end) } => (
            Error::SyntaxError(SyntaxError::UnrecognizedToken {
                token: token.to_string(),
                expected: Vec::new(),
            }),
            start..end,
        ),
        ParseError::User { error } => error,
    }
}
