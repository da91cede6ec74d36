//! Lexer for type expressions in manifests
//!
//! Uses the logos library. Spans are byte offsets into the expression string.

use crate::ty::Span;
use logos::Logos;

/// Type expression token
#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    /// `any`
    #[token("any")]
    Any,

    /// `->`
    #[token("->")]
    Arrow,

    /// `<`
    #[token("<")]
    LAngle,

    /// `>`
    #[token(">")]
    RAngle,

    /// `(`
    #[token("(")]
    LParen,

    /// `)`
    #[token(")")]
    RParen,

    /// `,`
    #[token(",")]
    Comma,

    /// `.`
    #[token(".")]
    Dot,

    /// `&`
    #[token("&")]
    Amp,

    /// `:`
    #[token(":")]
    Colon,

    /// Identifier
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Unrecognized character
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    /// Offending character
    pub found: char,
    /// Location
    pub span: Span,
}

/// Tokenize a type expression
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                let found = source[range.start..].chars().next().unwrap_or('\0');
                return Err(LexError { found, span });
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_bound_generic() {
        let tokens: Vec<Token> = tokenize("Pair<Int32, T>")
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("Pair".into()),
                Token::LAngle,
                Token::Ident("Int32".into()),
                Token::Comma,
                Token::Ident("T".into()),
                Token::RAngle,
            ]
        );
    }

    #[test]
    fn test_tokenize_function_and_any() {
        let tokens = tokenize("(any P & Q) -> Bool").unwrap();
        assert_eq!(tokens[1].0, Token::Any);
        assert_eq!(tokens[6].0, Token::Arrow);
        assert_eq!(tokens[6].1, Span::new(12, 14));
    }

    #[test]
    fn test_tokenize_rejects_unknown_character() {
        let err = tokenize("Int32?").unwrap_err();
        assert_eq!(err.found, '?');
        assert_eq!(err.span.start, 5);
    }
}
