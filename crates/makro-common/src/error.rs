use std::fmt::{self, Display, Formatter};
use std::io;

use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files::SimpleFile;
use codespan_reporting::term;
use termcolor::WriteColor;
use thiserror::Error;

use crate::types::{Span, Spanned};

pub type ErrorS = Spanned<Error>;
pub type Result<T, E = ErrorS> = std::result::Result<T, E>;

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("AttributeError: {0}")]
    AttributeError(AttributeError),
    #[error("IOError: {0}")]
    IoError(IoError),
    #[error("NameError: {0}")]
    NameError(NameError),
    #[error("OverflowError: {0}")]
    OverflowError(OverflowError),
    #[error("SyntaxError: {0}")]
    SyntaxError(SyntaxError),
    #[error("TypeError: {0}")]
    TypeError(TypeError),
}

impl Error {
    /// The category of the error, used as the diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AttributeError(_) => "AttributeError",
            Error::IoError(_) => "IOError",
            Error::NameError(_) => "NameError",
            Error::OverflowError(_) => "OverflowError",
            Error::SyntaxError(_) => "SyntaxError",
            Error::TypeError(_) => "TypeError",
        }
    }

    fn message(&self) -> String {
        match self {
            Error::AttributeError(e) => e.to_string(),
            Error::IoError(e) => e.to_string(),
            Error::NameError(e) => e.to_string(),
            Error::OverflowError(e) => e.to_string(),
            Error::SyntaxError(e) => e.to_string(),
            Error::TypeError(e) => e.to_string(),
        }
    }

    fn notes(&self) -> Vec<String> {
        match self {
            Error::SyntaxError(
                SyntaxError::UnrecognizedEOF { expected }
                | SyntaxError::UnrecognizedToken { expected, .. },
            ) => vec![format!("expected: {}", one_of(expected))],
            _ => Vec::new(),
        }
    }
}

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AttributeError {
    #[error("{type_:?} object has no attribute {name:?}")]
    NoSuchAttribute { type_: String, name: String },
    #[error("only instances have fields, not {type_:?}")]
    NotAnInstance { type_: String },
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum IoError {
    #[error("unable to write to file: {file:?}")]
    WriteError { file: String },
}

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NameError {
    #[error("cannot read local variable {name:?} in its own initializer")]
    AccessInsideInitializer { name: String },
    #[error("name {name:?} is already defined")]
    AlreadyDefined { name: String },
    #[error("name {name:?} is not defined")]
    NotDefined { name: String },
}

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum OverflowError {
    #[error("jump body is too large")]
    JumpTooLarge,
    #[error("stack overflow")]
    StackOverflow,
    #[error("cannot use more than 255 arguments in a function")]
    TooManyArgs,
    #[error("cannot define more than 256 constants in a function")]
    TooManyConstants,
    #[error("cannot define more than 256 local variables in a function")]
    TooManyLocals,
    #[error("cannot use more than 256 closure variables in a function")]
    TooManyUpvalues,
}

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SyntaxError {
    #[error(r#""return" outside function"#)]
    ReturnOutsideFunction,
    #[error("unexpected input: {token:?}")]
    UnexpectedInput { token: String },
    #[error("unexpected end of file")]
    UnrecognizedEOF { expected: Vec<String> },
    #[error("unexpected {token:?}")]
    UnrecognizedToken { token: String, expected: Vec<String> },
    #[error("unterminated string")]
    UnterminatedString,
}

#[remain::sorted]
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TypeError {
    #[error("{name}() takes {exp_args} arguments but {got_args} were given")]
    ArityMismatch { name: String, exp_args: usize, got_args: usize },
    #[error("{type_:?} object is not callable")]
    NotCallable { type_: String },
    #[error("unsupported operand type(s) for {op}: {lt_type:?} and {rt_type:?}, expected {expected}")]
    UnsupportedOperandInfix { op: String, lt_type: String, rt_type: String, expected: String },
    #[error("unsupported operand type for {op}: {rt_type:?}, expected {expected}")]
    UnsupportedOperandPrefix { op: String, rt_type: String, expected: String },
}

macro_rules! impl_from_error {
    ($($error:tt),+) => {$(
        impl From<$error> for Error {
            fn from(e: $error) -> Self {
                Error::$error(e)
            }
        }
    )+};
}

impl_from_error!(AttributeError, IoError, NameError, OverflowError, SyntaxError, TypeError);

/// One activation record of a runtime traceback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceFrame {
    /// `None` for the top-level script.
    pub function: Option<String>,
    pub line: usize,
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

fn one_of(tokens: &[String]) -> String {
    let (token_last, tokens) = match tokens.split_last() {
        Some((token_last, &[])) => return token_last.to_string(),
        Some((token_last, tokens)) => (token_last, tokens),
        None => return "nothing".to_string(),
    };

    let mut output = String::new();
    for token in tokens {
        output.push_str(token);
        output.push_str(", ");
    }
    output.push_str("or ");
    output.push_str(token_last);
    output
}

pub fn as_diagnostic(e: &Error, span: &Span) -> Diagnostic<()> {
    Diagnostic::error()
        .with_code(e.code())
        .with_message(e.message())
        .with_labels(vec![Label::primary((), span.clone())])
        .with_notes(e.notes())
}

/// Renders an error against the source it was raised in. Traceback frames, if
/// any, are attached as notes, innermost first.
pub fn report_err(
    writer: &mut dyn WriteColor,
    source: &str,
    (e, span): &ErrorS,
    traceback: &[TraceFrame],
) -> io::Result<()> {
    let file = SimpleFile::new("<script>", source);
    let config = term::Config::default();

    let mut diagnostic = as_diagnostic(e, span);
    diagnostic.notes.extend(traceback.iter().map(TraceFrame::to_string));

    term::emit(writer, &config, &file, &diagnostic).map_err(|e| match e {
        codespan_reporting::files::Error::Io(e) => e,
        e => io::Error::new(io::ErrorKind::Other, e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use termcolor::NoColor;

    use super::*;

    #[test]
    fn error_display_has_category() {
        let e = Error::from(TypeError::ArityMismatch {
            name: "add".to_string(),
            exp_args: 2,
            got_args: 1,
        });
        assert_eq!(e.to_string(), "TypeError: add() takes 2 arguments but 1 were given");
        assert_eq!(Error::from(OverflowError::StackOverflow).to_string(), "OverflowError: stack overflow");
    }

    #[test]
    fn trace_frame_display() {
        let script = TraceFrame { function: None, line: 3 };
        let function = TraceFrame { function: Some("fib".to_string()), line: 1 };
        assert_eq!(script.to_string(), "[line 3] in script");
        assert_eq!(function.to_string(), "[line 1] in fib()");
    }

    #[test]
    fn one_of_expected_tokens() {
        assert_eq!(one_of(&[]), "nothing");
        assert_eq!(one_of(&[";".to_string()]), ";");
        assert_eq!(one_of(&["(".to_string(), ")".to_string(), ";".to_string()]), "(, ), or ;");
    }

    #[test]
    fn report_includes_traceback() {
        let source = "print -true;\n";
        let e = (
            Error::from(TypeError::UnsupportedOperandPrefix {
                op: "-".to_string(),
                rt_type: "bool".to_string(),
                expected: "number".to_string(),
            }),
            6..11,
        );
        let mut writer = NoColor::new(Vec::new());
        report_err(&mut writer, source, &e, &[TraceFrame { function: None, line: 1 }]).unwrap();

        let output = String::from_utf8(writer.into_inner()).unwrap();
        assert!(output.contains("TypeError"));
        assert!(output.contains("[line 1] in script"));
    }
}
