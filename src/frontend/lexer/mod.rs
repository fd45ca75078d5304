// Quill lexer
// Created by: Anqi Shen
// Changelog:
//      26-06-15: Initial version
//      26-06-16: String escapes, // comments, two-char operators

pub mod token;

use crate::frontend::SourceError;
use token::{Token, TokenKind};

pub struct Lexer<'s> {
    chars: std::iter::Peekable<std::str::Chars<'s>>,
    line: usize,
    col: usize,
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: usize, col: usize) -> SourceError {
        SourceError {
            message: message.into(),
            line,
            col,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(&c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    // only a comment if followed by a second slash
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek() == Some(&'/') {
                        while let Some(&c) = self.chars.peek() {
                            if c == '\n' {
                                break;
                            }
                            self.bump();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    pub fn lex(mut self) -> Result<Vec<Token>, SourceError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (line, col) = (self.line, self.col);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    text: String::new(),
                    line,
                    col,
                });
                return Ok(tokens);
            };
            let (kind, text) = match c {
                '0'..='9' => {
                    let mut text = String::new();
                    while let Some(&d) = self.chars.peek() {
                        if d.is_ascii_digit() {
                            text.push(self.bump().expect("peeked"));
                        } else {
                            break;
                        }
                    }
                    let value: i32 = text.parse().map_err(|_| {
                        self.error(format!("integer literal '{}' out of range", text), line, col)
                    })?;
                    (TokenKind::Int(value), text)
                }
                '"' => {
                    self.bump();
                    let mut value = String::new();
                    loop {
                        match self.bump() {
                            Some('"') => break,
                            Some('\\') => match self.bump() {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some('\\') => value.push('\\'),
                                Some('"') => value.push('"'),
                                _ => {
                                    return Err(self.error(
                                        "bad escape in string literal",
                                        line,
                                        col,
                                    ))
                                }
                            },
                            Some('\n') | None => {
                                return Err(self.error(
                                    "unterminated string literal",
                                    line,
                                    col,
                                ))
                            }
                            Some(ch) => value.push(ch),
                        }
                    }
                    let text = value.clone();
                    (TokenKind::Str(value), text)
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut text = String::new();
                    while let Some(&d) = self.chars.peek() {
                        if d.is_ascii_alphanumeric() || d == '_' {
                            text.push(self.bump().expect("peeked"));
                        } else {
                            break;
                        }
                    }
                    let kind = match text.as_str() {
                        "global" => TokenKind::KwGlobal,
                        "if" => TokenKind::KwIf,
                        "else" => TokenKind::KwElse,
                        "while" => TokenKind::KwWhile,
                        "return" => TokenKind::KwReturn,
                        "fun" => TokenKind::KwFun,
                        "true" => TokenKind::KwTrue,
                        "false" => TokenKind::KwFalse,
                        "None" => TokenKind::KwNone,
                        _ => TokenKind::Ident(text.clone()),
                    };
                    (kind, text)
                }
                _ => {
                    self.bump();
                    let two = |kinds: (TokenKind, TokenKind), lexer: &mut Self, next: char| {
                        if lexer.chars.peek() == Some(&next) {
                            lexer.bump();
                            kinds.1
                        } else {
                            kinds.0
                        }
                    };
                    let kind = match c {
                        '{' => TokenKind::LBrace,
                        '}' => TokenKind::RBrace,
                        '[' => TokenKind::LBracket,
                        ']' => TokenKind::RBracket,
                        '(' => TokenKind::LParen,
                        ')' => TokenKind::RParen,
                        ',' => TokenKind::Comma,
                        ':' => TokenKind::Colon,
                        ';' => TokenKind::Semicolon,
                        '.' => TokenKind::Dot,
                        '*' => TokenKind::Star,
                        '/' => TokenKind::Slash,
                        '+' => TokenKind::Plus,
                        '-' => TokenKind::Minus,
                        '!' => TokenKind::Bang,
                        '&' => TokenKind::Amp,
                        '|' => TokenKind::Bar,
                        '=' => two((TokenKind::Assign, TokenKind::EqEq), &mut self, '='),
                        '<' => two((TokenKind::Lt, TokenKind::Leq), &mut self, '='),
                        '>' => two((TokenKind::Gt, TokenKind::Geq), &mut self, '='),
                        other => {
                            return Err(self.error(
                                format!("unexpected character '{}'", other),
                                line,
                                col,
                            ))
                        }
                    };
                    let text = match kind {
                        TokenKind::EqEq => "==".to_string(),
                        TokenKind::Leq => "<=".to_string(),
                        TokenKind::Geq => ">=".to_string(),
                        _ => c.to_string(),
                    };
                    (kind, text)
                }
            };
            tokens.push(Token {
                kind,
                text,
                line,
                col,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_program_fragment() {
        let tokens = Lexer::new("x = 1; while (x < 5) { x = x + 1; } // tail\nprint(x);")
            .lex()
            .unwrap();
        let kinds: Vec<&TokenKind> = tokens.iter().map(|t| &t.kind).collect();
        assert!(matches!(kinds[0], TokenKind::Ident(name) if name == "x"));
        assert!(kinds.contains(&&TokenKind::KwWhile));
        assert!(kinds.contains(&&TokenKind::Lt));
        assert_eq!(tokens.last().map(|t| t.kind.clone()), Some(TokenKind::Eof));
    }

    #[test]
    fn string_escapes() {
        let tokens = Lexer::new("\"a\\n\\\"b\\\"\"").lex().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str("a\n\"b\"".to_string()));
    }

    #[test]
    fn reports_unterminated_string() {
        let err = Lexer::new("\"abc").lex().unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
