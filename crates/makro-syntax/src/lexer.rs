use std::fmt::{self, Display, Formatter};

use logos::{Logos, Span};
use makro_common::error::{Error, ErrorS, SyntaxError};

pub type SpannedToken = (usize, Token, usize);

/// Token stream in the `(start, token, end)` shape the parser consumes.
///
/// A run of input that `logos` cannot match is reported once, as a single
/// `UnexpectedInput` covering everything up to the next gap in the source.
pub struct Lexer<'a> {
    inner: logos::Lexer<'a, Token>,
    lookahead: Option<SpannedToken>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { inner: Token::lexer(source), lookahead: None }
    }

    /// Extends `span` over every token that directly follows it. The first
    /// token after a gap is kept in `lookahead`.
    fn swallow_adjacent(&mut self, mut span: Span) -> Span {
        while let Some(token) = self.inner.next() {
            let next = self.inner.span();
            if next.start != span.end {
                self.lookahead = Some((next.start, token, next.end));
                break;
            }
            span.end = next.end;
        }
        span
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<SpannedToken, ErrorS>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(token) = self.lookahead.take() {
            return Some(Ok(token));
        }

        let token = self.inner.next()?;
        let span = self.inner.span();
        if token != Token::Error {
            return Some(Ok((span.start, token, span.end)));
        }

        if self.inner.slice().starts_with('"') {
            return Some(Err((SyntaxError::UnterminatedString.into(), span)));
        }
        let span = self.swallow_adjacent(span);
        let token = self.inner.source()[span.clone()].to_string();
        Some(Err((Error::SyntaxError(SyntaxError::UnexpectedInput { token }), span)))
    }
}

#[derive(Clone, Debug, Logos, PartialEq)]
pub enum Token {
    // Keywords.
    #[token("and")]
    And,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("null")]
    Null,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,

    // Literals.
    #[regex("[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Identifier(String),
    #[regex(r#""[^"]*""#, |lex| {
        let quoted = lex.slice();
        quoted[1..quoted.len() - 1].to_string()
    })]
    String(String),
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>())]
    Number(f64),

    // Punctuation.
    #[token("(")]
    LtParen,
    #[token(")")]
    RtParen,
    #[token("{")]
    LtBrace,
    #[token("}")]
    RtBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(";")]
    Semicolon,

    // Operators.
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token("/")]
    Slash,
    #[token("*")]
    Asterisk,
    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    #[regex(r"//.*", logos::skip)]
    #[regex(r"[ \r\n\t\f]+", logos::skip)]
    #[error]
    Error,
}

impl Token {
    /// Source text of tokens that carry no payload.
    fn lexeme(&self) -> Option<&'static str> {
        Some(match self {
            Token::And => "and",
            Token::Class => "class",
            Token::Else => "else",
            Token::False => "false",
            Token::For => "for",
            Token::Fun => "fun",
            Token::If => "if",
            Token::Null => "null",
            Token::Or => "or",
            Token::Print => "print",
            Token::Return => "return",
            Token::True => "true",
            Token::Var => "var",
            Token::While => "while",
            Token::LtParen => "(",
            Token::RtParen => ")",
            Token::LtBrace => "{",
            Token::RtBrace => "}",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Semicolon => ";",
            Token::Minus => "-",
            Token::Plus => "+",
            Token::Slash => "/",
            Token::Asterisk => "*",
            Token::Bang => "!",
            Token::BangEqual => "!=",
            Token::Equal => "=",
            Token::EqualEqual => "==",
            Token::Greater => ">",
            Token::GreaterEqual => ">=",
            Token::Less => "<",
            Token::LessEqual => "<=",
            Token::Identifier(_) | Token::String(_) | Token::Number(_) | Token::Error => {
                return None
            }
        })
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(name) => f.write_str(name),
            Token::String(string) => write!(f, "{string:?}"),
            Token::Number(number) => write!(f, "{number}"),
            Token::Error => f.write_str("<error>"),
            token => f.write_str(token.lexeme().unwrap_or_default()),
        }
    }
}
