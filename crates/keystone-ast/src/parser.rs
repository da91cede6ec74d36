//! Recursive-descent parser for type expressions
//!
//! Grammar:
//!
//! ```text
//! type     := postfix [ '->' type ]          (only after a parenthesized list)
//! postfix  := primary { '.' 'Type' }
//! primary  := '(' [ type { ',' type } ] ')'
//!           | 'any' path { '&' path }
//!           | path [ '<' type { ',' type } '>' ]
//! path     := ident [ '.' ident ]
//! ```

use crate::lexer::{tokenize, LexError, Token};
use crate::ty::Span;
use thiserror::Error;

/// Unresolved type expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// Possibly qualified, possibly generic name
    Named {
        /// Module qualifier
        module: Option<String>,
        /// Name
        name: String,
        /// Generic arguments
        args: Vec<TypeExpr>,
        /// Location
        span: Span,
    },
    /// Tuple
    Tuple(Vec<TypeExpr>),
    /// Function
    Function {
        /// Parameters
        params: Vec<TypeExpr>,
        /// Result
        result: Box<TypeExpr>,
    },
    /// Protocol composition
    Existential(Vec<(Option<String>, String, Span)>),
    /// Metatype
    Metatype(Box<TypeExpr>),
}

/// Type expression syntax error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Unrecognized character
    #[error("Unexpected character '{0}'")]
    BadCharacter(char, Span),

    /// Unexpected token
    #[error("Expected {expected}, found {found}")]
    Unexpected {
        /// What the parser wanted
        expected: &'static str,
        /// What it saw
        found: String,
        /// Location
        span: Span,
    },

    /// Input ended early
    #[error("Unexpected end of type expression, expected {0}")]
    UnexpectedEnd(&'static str),
}

impl ParseError {
    /// Location of the error, if known
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::BadCharacter(_, span) | ParseError::Unexpected { span, .. } => Some(*span),
            ParseError::UnexpectedEnd(_) => None,
        }
    }
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError::BadCharacter(err.found, err.span)
    }
}

/// Parse a complete type expression
pub fn parse_type(source: &str) -> Result<TypeExpr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ty = parser.parse_type()?;
    if let Some((token, span)) = parser.peek_entry() {
        return Err(ParseError::Unexpected {
            expected: "end of type",
            found: format!("{:?}", token),
            span,
        });
    }
    Ok(ty)
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_entry(&self) -> Option<(Token, Span)> {
        self.tokens.get(self.pos).cloned()
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let entry = self.tokens.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<Span, ParseError> {
        match self.bump() {
            Some((token, span)) if token == want => Ok(span),
            Some((token, span)) => Err(ParseError::Unexpected {
                expected,
                found: format!("{:?}", token),
                span,
            }),
            None => Err(ParseError::UnexpectedEnd(expected)),
        }
    }

    fn ident(&mut self) -> Result<(String, Span), ParseError> {
        match self.bump() {
            Some((Token::Ident(name), span)) => Ok((name, span)),
            Some((token, span)) => Err(ParseError::Unexpected {
                expected: "identifier",
                found: format!("{:?}", token),
                span,
            }),
            None => Err(ParseError::UnexpectedEnd("identifier")),
        }
    }

    fn parse_type(&mut self) -> Result<TypeExpr, ParseError> {
        let parenthesized = self.peek() == Some(&Token::LParen);
        let ty = self.parse_postfix()?;
        if self.peek() == Some(&Token::Arrow) {
            let params = match ty {
                TypeExpr::Tuple(elements) if parenthesized => elements,
                other if parenthesized => vec![other],
                _ => {
                    let (token, span) = self.bump().unwrap_or((Token::Arrow, Span::new(0, 0)));
                    return Err(ParseError::Unexpected {
                        expected: "parenthesized parameter list before '->'",
                        found: format!("{:?}", token),
                        span,
                    });
                }
            };
            self.bump();
            let result = self.parse_type()?;
            return Ok(TypeExpr::Function {
                params,
                result: Box::new(result),
            });
        }
        Ok(ty)
    }

    fn parse_postfix(&mut self) -> Result<TypeExpr, ParseError> {
        let mut ty = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.bump();
            let (name, span) = self.ident()?;
            if name != "Type" {
                return Err(ParseError::Unexpected {
                    expected: "'Type'",
                    found: name,
                    span,
                });
            }
            ty = TypeExpr::Metatype(Box::new(ty));
        }
        Ok(ty)
    }

    fn parse_primary(&mut self) -> Result<TypeExpr, ParseError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.bump();
                let mut elements = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    elements.push(self.parse_type()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.bump();
                        elements.push(self.parse_type()?);
                    }
                }
                self.expect(Token::RParen, "')'")?;
                if elements.len() == 1 && self.peek() != Some(&Token::Arrow) {
                    return Ok(elements.remove(0));
                }
                Ok(TypeExpr::Tuple(elements))
            }
            Some(Token::Any) => {
                self.bump();
                let mut protocols = vec![self.parse_path()?];
                while self.peek() == Some(&Token::Amp) {
                    self.bump();
                    protocols.push(self.parse_path()?);
                }
                Ok(TypeExpr::Existential(protocols))
            }
            Some(Token::Ident(_)) => {
                let (module, name, span) = self.parse_path()?;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::LAngle) {
                    self.bump();
                    args.push(self.parse_type()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.bump();
                        args.push(self.parse_type()?);
                    }
                    self.expect(Token::RAngle, "'>'")?;
                }
                Ok(TypeExpr::Named {
                    module,
                    name,
                    args,
                    span,
                })
            }
            Some(_) => {
                let (token, span) = self.bump().unwrap_or((Token::Comma, Span::new(0, 0)));
                Err(ParseError::Unexpected {
                    expected: "type",
                    found: format!("{:?}", token),
                    span,
                })
            }
            None => Err(ParseError::UnexpectedEnd("type")),
        }
    }

    /// `Name` or `Module.Name`; a trailing `.Type` is left for postfix parsing
    fn parse_path(&mut self) -> Result<(Option<String>, String, Span), ParseError> {
        let (first, span) = self.ident()?;
        let qualified = matches!(
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)),
            (Some((Token::Dot, _)), Some((Token::Ident(next), _))) if next != "Type"
        );
        if qualified {
            self.bump();
            let (name, end) = self.ident()?;
            return Ok((Some(first), name, Span::new(span.start, end.end)));
        }
        Ok((None, first, span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, args: Vec<TypeExpr>) -> TypeExpr {
        TypeExpr::Named {
            module: None,
            name: name.to_string(),
            args,
            span: Span::new(0, 0),
        }
    }

    /// Zero out spans so structural comparisons stay readable
    fn strip(ty: TypeExpr) -> TypeExpr {
        match ty {
            TypeExpr::Named {
                module, name, args, ..
            } => TypeExpr::Named {
                module,
                name,
                args: args.into_iter().map(strip).collect(),
                span: Span::new(0, 0),
            },
            TypeExpr::Tuple(e) => TypeExpr::Tuple(e.into_iter().map(strip).collect()),
            TypeExpr::Function { params, result } => TypeExpr::Function {
                params: params.into_iter().map(strip).collect(),
                result: Box::new(strip(*result)),
            },
            TypeExpr::Existential(p) => TypeExpr::Existential(
                p.into_iter()
                    .map(|(m, n, _)| (m, n, Span::new(0, 0)))
                    .collect(),
            ),
            TypeExpr::Metatype(inner) => TypeExpr::Metatype(Box::new(strip(*inner))),
        }
    }

    #[test]
    fn test_parse_generic() {
        let ty = strip(parse_type("Pair<Int32, Box<T>>").unwrap());
        assert_eq!(
            ty,
            named(
                "Pair",
                vec![named("Int32", vec![]), named("Box", vec![named("T", vec![])])]
            )
        );
    }

    #[test]
    fn test_parse_tuple_and_parens() {
        assert_eq!(
            strip(parse_type("(Int32, Bool)").unwrap()),
            TypeExpr::Tuple(vec![named("Int32", vec![]), named("Bool", vec![])])
        );
        assert_eq!(strip(parse_type("(Int32)").unwrap()), named("Int32", vec![]));
        assert_eq!(parse_type("()").unwrap(), TypeExpr::Tuple(vec![]));
    }

    #[test]
    fn test_parse_function() {
        let ty = strip(parse_type("(Int32) -> (Bool, Bool)").unwrap());
        assert_eq!(
            ty,
            TypeExpr::Function {
                params: vec![named("Int32", vec![])],
                result: Box::new(TypeExpr::Tuple(vec![
                    named("Bool", vec![]),
                    named("Bool", vec![])
                ])),
            }
        );
    }

    #[test]
    fn test_parse_qualified_and_metatype() {
        let ty = parse_type("Lib.Base.Type").unwrap();
        match ty {
            TypeExpr::Metatype(inner) => match *inner {
                TypeExpr::Named { module, name, .. } => {
                    assert_eq!(module.as_deref(), Some("Lib"));
                    assert_eq!(name, "Base");
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_existential() {
        let ty = strip(parse_type("any Shape & Lib.Drawable").unwrap());
        assert_eq!(
            ty,
            TypeExpr::Existential(vec![
                (None, "Shape".to_string(), Span::new(0, 0)),
                (Some("Lib".to_string()), "Drawable".to_string(), Span::new(0, 0)),
            ])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_type("Pair<Int32"),
            Err(ParseError::UnexpectedEnd("'>'"))
        ));
        assert!(matches!(
            parse_type("Int32 -> Bool"),
            Err(ParseError::Unexpected { .. })
        ));
        assert!(matches!(
            parse_type("Int32 Bool"),
            Err(ParseError::Unexpected { expected: "end of type", .. })
        ));
    }
}
