use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
pub enum Token {
    // Keywords
    #[token("fn")]
    Fn,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("elsif")]
    Elsif,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(".")]
    Dot,
    #[token("@")]
    At,
    #[token("$")]
    Dollar,

    // Operators
    #[token("=")]
    Assign,
    #[token("==")]
    Eq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f32>().ok())]
    Float(f32),

    /// Magnitude of an integer literal, up to `2^31` so that `-2147483648`
    /// can be written. Larger literals fail here and surface as a lex error.
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u32>().ok().filter(|n| *n <= INT_LITERAL_MAX))]
    Int(u32),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Text(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Largest integer literal magnitude: `i32::MAX + 1`, valid only when negated.
pub const INT_LITERAL_MAX: u32 = i32::MIN.unsigned_abs();

/// Lex source code into a stream of tokens with positions.
///
/// Lexing does not stop at the first bad character: every error is collected
/// and the good tokens are still returned so the parser can report its own
/// errors in the same run.
pub fn lex(source: &str) -> (Vec<(Token, Span)>, Vec<LexError>) {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push((token, Span::from(span))),
            Err(()) => {
                let snippet = source[span.clone()].to_string();
                errors.push(LexError {
                    position: span.start,
                    span: Span::from(span),
                    suggestion: suggest_fix(&snippet),
                    snippet,
                });
            }
        }
    }

    (tokens, errors)
}

/// Every lex error comes with a suggested fix.
fn suggest_fix(bad_token: &str) -> String {
    if bad_token.starts_with('"') {
        "Unterminated string literal: close it with '\"'.".to_string()
    } else if bad_token.starts_with('\'') {
        "Strings use double quotes.".to_string()
    } else if bad_token.chars().all(|c| c.is_ascii_digit()) {
        format!(
            "Integer literal '{}' does not fit in 32 bits (range {} to {}).",
            bad_token,
            i32::MIN,
            i32::MAX
        )
    } else if bad_token == "&" || bad_token == "|" {
        format!("Logical operators are doubled: '{0}{0}'.", bad_token)
    } else {
        format!("Unexpected character(s): '{}'.", bad_token)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Lex error at position {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub position: usize,
    pub span: Span,
    pub snippet: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "lex errors: {:?}", errors);
        tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_simple_function() {
        let toks = tokens("fn add(a, b) { return a + b; }");
        assert_eq!(toks[0], Token::Fn);
        assert_eq!(toks[1], Token::Ident("add".to_string()));
        assert_eq!(toks[2], Token::LParen);
        assert!(toks.contains(&Token::Return));
        assert!(toks.contains(&Token::Plus));
        assert_eq!(toks.last(), Some(&Token::RBrace));
    }

    #[test]
    fn lex_literals() {
        assert_eq!(
            tokens(r#"42 2.5 "hello world" true false"#),
            vec![
                Token::Int(42),
                Token::Float(2.5),
                Token::Text("hello world".to_string()),
                Token::True,
                Token::False,
            ]
        );
    }

    #[test]
    fn integer_literal_limit() {
        assert_eq!(tokens("2147483648"), vec![Token::Int(2_147_483_648)]);
        let (_, errors) = lex("2147483649");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].suggestion.contains("-2147483648 to 2147483647"), "{}", errors[0].suggestion);
    }

    #[test]
    fn lex_empty_string() {
        assert_eq!(tokens(r#""""#), vec![Token::Text(String::new())]);
    }

    #[test]
    fn keywords_are_not_identifiers() {
        assert_eq!(tokens("elsif elsewhere"), vec![Token::Elsif, Token::Ident("elsewhere".to_string())]);
    }

    #[test]
    fn lex_two_char_operators() {
        assert_eq!(
            tokens("== != <= >= && || = < > !"),
            vec![
                Token::Eq,
                Token::NotEq,
                Token::LessEq,
                Token::GreaterEq,
                Token::AndAnd,
                Token::OrOr,
                Token::Assign,
                Token::Less,
                Token::Greater,
                Token::Bang,
            ]
        );
    }

    #[test]
    fn lex_comment_ignored() {
        let toks = tokens("// a comment\nfn");
        assert_eq!(toks, vec![Token::Fn]);
    }

    #[test]
    fn lex_external_and_ref_sigils() {
        assert_eq!(
            tokens("$log(@main)"),
            vec![
                Token::Dollar,
                Token::Ident("log".to_string()),
                Token::LParen,
                Token::At,
                Token::Ident("main".to_string()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let (toks, _) = lex("fn  main");
        assert_eq!(toks[1].1, Span { start: 4, end: 8 });
    }

    #[test]
    fn errors_are_collected_not_fatal() {
        let (toks, errors) = lex("fn # main ~ ()");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].snippet, "#");
        assert_eq!(errors[0].position, 3);
        assert_eq!(errors[1].snippet, "~");
        assert!(toks.iter().any(|(t, _)| *t == Token::Ident("main".to_string())));
        assert!(toks.iter().any(|(t, _)| *t == Token::RParen));
    }

    #[test]
    fn integer_overflow_is_lex_error() {
        let (_, errors) = lex("x = 99999999999;");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].suggestion.contains("32 bits"));
    }

    #[test]
    fn single_ampersand_suggests_double() {
        let (_, errors) = lex("a & b");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].suggestion.contains("&&"));
    }
}
