// Expression Lexer
// Tokenizes step conditions and ${{ }} interpolation bodies

use std::fmt;

/// Token types for condition expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    True,
    False,
    String(String),

    // Identifiers and references
    Identifier(String),

    // Operators
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
    Not, // !
    Dot, // .
    Comma,

    // Delimiters
    LParen,
    RParen,

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

/// Lexer for condition expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input, always ending with `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '.' => {
                self.advance();
                Ok(Token::Dot)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            '=' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Eq)
                } else {
                    Err(LexError {
                        message: "expected '==' operator".to_string(),
                        position: pos,
                    })
                }
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    Ok(Token::And)
                } else {
                    Err(LexError {
                        message: "expected '&&' operator".to_string(),
                        position: pos,
                    })
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    Ok(Token::Or)
                } else {
                    Err(LexError {
                        message: "expected '||' operator".to_string(),
                        position: pos,
                    })
                }
            }
            '\'' | '"' => self.read_string(ch),
            c if c.is_alphanumeric() || c == '_' => Ok(self.read_identifier()),
            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();

        loop {
            match self.advance() {
                // A doubled quote is an escaped quote
                Some((_, c)) if c == quote => {
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
            }
        }

        Ok(Token::String(value))
    }

    /// Identifiers may contain '-', so a hyphenated dimension name such as
    /// `target-os` lexes as a single token.
    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

/// A fragment of an interpolated string
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Literal text copied as-is
    Text(String),
    /// Body of a `${{ ... }}` expression, trimmed
    Expression(String),
}

/// Split a string into literal text and `${{ }}` expression fragments.
///
/// An opening `${{` without a matching `}}` is kept as literal text.
pub fn split_interpolation(input: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${{") {
        let after_open = &rest[start + 3..];
        let Some(end) = after_open.find("}}") else {
            break;
        };

        if start > 0 {
            fragments.push(Fragment::Text(rest[..start].to_string()));
        }
        fragments.push(Fragment::Expression(after_open[..end].trim().to_string()));
        rest = &after_open[end + 2..];
    }

    if !rest.is_empty() {
        fragments.push(Fragment::Text(rest.to_string()));
    }

    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lex_comparison() {
        assert_eq!(
            lex("toolchain == 'nightly'"),
            vec![
                Token::Identifier("toolchain".to_string()),
                Token::Eq,
                Token::String("nightly".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_function_call() {
        let tokens = lex("startsWith(matrix.rust, \"nightly\")");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("startsWith".to_string()),
                Token::LParen,
                Token::Identifier("matrix".to_string()),
                Token::Dot,
                Token::Identifier("rust".to_string()),
                Token::Comma,
                Token::String("nightly".to_string()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_logical_operators() {
        let tokens = lex("!a && b || c != 'x'");
        assert_eq!(tokens[0], Token::Not);
        assert_eq!(tokens[2], Token::And);
        assert_eq!(tokens[4], Token::Or);
        assert_eq!(tokens[6], Token::Ne);
    }

    #[test]
    fn test_lex_hyphenated_identifier() {
        assert_eq!(
            lex("matrix.target-os == 'linux'")[2],
            Token::Identifier("target-os".to_string())
        );
    }

    #[test]
    fn test_lex_escaped_quote() {
        assert_eq!(lex("'it''s'")[0], Token::String("it's".to_string()));
    }

    #[test]
    fn test_lex_keywords_case_insensitive() {
        assert_eq!(lex("TRUE")[0], Token::True);
        assert_eq!(lex("False")[0], Token::False);
    }

    #[test]
    fn test_lex_errors() {
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a > b").tokenize().is_err());
    }

    #[test]
    fn test_split_interpolation() {
        let fragments = split_interpolation("+${{ matrix.rust }} --target=${{os}}");
        assert_eq!(
            fragments,
            vec![
                Fragment::Text("+".to_string()),
                Fragment::Expression("matrix.rust".to_string()),
                Fragment::Text(" --target=".to_string()),
                Fragment::Expression("os".to_string()),
            ]
        );
    }

    #[test]
    fn test_split_interpolation_unclosed() {
        assert_eq!(
            split_interpolation("keep ${{ this"),
            vec![Fragment::Text("keep ${{ this".to_string())]
        );
        assert!(split_interpolation("").is_empty());
    }
}
