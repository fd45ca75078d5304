// Quill textual bytecode format
// Created by: Anqi Shen
// Changelog:
// 2026-06-19: Reader and printer for the on-disk function literal form;
//            round-trips through `compile` and `vm`.

use crate::bytecode::{Constant, Function, Instruction, Op};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("bytecode parse error at line {line}, column {col}: {message}")]
pub struct TextError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Assign,
    Comma,
    Eof,
}

struct Lexer<'s> {
    chars: std::iter::Peekable<std::str::Chars<'s>>,
    line: usize,
    col: usize,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str) -> Self {
        Lexer {
            chars: src.chars().peekable(),
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

    fn error(&self, message: impl Into<String>) -> TextError {
        TextError {
            message: message.into(),
            line: self.line,
            col: self.col,
        }
    }

    fn lex(mut self) -> Result<Vec<(Token, usize, usize)>, TextError> {
        let mut tokens = Vec::new();
        loop {
            while let Some(&c) = self.chars.peek() {
                if c.is_whitespace() {
                    self.bump();
                } else {
                    break;
                }
            }
            let (line, col) = (self.line, self.col);
            let Some(&c) = self.chars.peek() else {
                tokens.push((Token::Eof, line, col));
                return Ok(tokens);
            };
            let token = match c {
                '{' => {
                    self.bump();
                    Token::LBrace
                }
                '}' => {
                    self.bump();
                    Token::RBrace
                }
                '[' => {
                    self.bump();
                    Token::LBracket
                }
                ']' => {
                    self.bump();
                    Token::RBracket
                }
                '=' => {
                    self.bump();
                    Token::Assign
                }
                ',' => {
                    self.bump();
                    Token::Comma
                }
                '"' => {
                    self.bump();
                    let mut text = String::new();
                    loop {
                        match self.bump() {
                            Some('"') => break,
                            Some('\\') => match self.bump() {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some('\\') => text.push('\\'),
                                Some('"') => text.push('"'),
                                _ => return Err(self.error("bad escape in string literal")),
                            },
                            Some(ch) => text.push(ch),
                            None => return Err(self.error("unterminated string literal")),
                        }
                    }
                    Token::Str(text)
                }
                c if c.is_ascii_digit() || c == '-' => {
                    let mut text = String::new();
                    text.push(self.bump().expect("peeked"));
                    while let Some(&d) = self.chars.peek() {
                        if d.is_ascii_digit() {
                            text.push(self.bump().expect("peeked"));
                        } else {
                            break;
                        }
                    }
                    let value: i64 = text
                        .parse()
                        .map_err(|_| self.error(format!("bad integer '{}'", text)))?;
                    Token::Int(value)
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
                    Token::Ident(text)
                }
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            };
            tokens.push((token, line, col));
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn error(&self, message: impl Into<String>) -> TextError {
        let (_, line, col) = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        TextError {
            message: message.into(),
            line: *line,
            col: *col,
        }
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].0.clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), TextError> {
        if *self.peek() == token {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), TextError> {
        match self.peek() {
            Token::Ident(name) if name == word => {
                self.bump();
                Ok(())
            }
            _ => Err(self.error(format!("expected '{}'", word))),
        }
    }

    fn parse_function(&mut self) -> Result<Function, TextError> {
        self.expect_keyword("function")?;
        self.expect(Token::LBrace, "'{'")?;

        self.expect_keyword("functions")?;
        self.expect(Token::Assign, "'='")?;
        self.expect(Token::LBracket, "'['")?;
        let mut functions = Vec::new();
        while matches!(self.peek(), Token::Ident(name) if name == "function") {
            functions.push(self.parse_function()?);
            if *self.peek() == Token::Comma {
                self.bump();
            }
        }
        self.expect(Token::RBracket, "']'")?;
        self.expect(Token::Comma, "','")?;

        self.expect_keyword("constants")?;
        self.expect(Token::Assign, "'='")?;
        let constants = self.parse_constants()?;
        self.expect(Token::Comma, "','")?;

        self.expect_keyword("parameter_count")?;
        self.expect(Token::Assign, "'='")?;
        let parameter_count = match self.bump() {
            Token::Int(v) if v >= 0 => v as usize,
            _ => return Err(self.error("expected non-negative parameter count")),
        };
        self.expect(Token::Comma, "','")?;

        let local_vars = self.parse_ident_list("local_vars")?;
        let local_ref_vars = self.parse_ident_list("local_ref_vars")?;
        let free_vars = self.parse_ident_list("free_vars")?;
        let names = self.parse_ident_list("names")?;

        self.expect_keyword("instructions")?;
        self.expect(Token::Assign, "'='")?;
        self.expect(Token::LBracket, "'['")?;
        let mut instructions = Vec::new();
        while let Token::Ident(_) = self.peek() {
            let Token::Ident(mnemonic) = self.bump() else {
                unreachable!()
            };
            let op = Op::from_mnemonic(&mnemonic)
                .ok_or_else(|| self.error(format!("unknown opcode '{}'", mnemonic)))?;
            let operand = if let Token::Int(v) = self.peek() {
                let v = *v;
                self.bump();
                Some(
                    i32::try_from(v)
                        .map_err(|_| self.error("instruction operand out of range"))?,
                )
            } else {
                None
            };
            instructions.push(Instruction::new(op, operand));
        }
        self.expect(Token::RBracket, "']'")?;
        self.expect(Token::RBrace, "'}'")?;

        Ok(Function {
            functions,
            constants,
            parameter_count,
            local_vars,
            local_ref_vars,
            free_vars,
            names,
            instructions,
            ..Function::default()
        })
    }

    fn parse_constants(&mut self) -> Result<Vec<Constant>, TextError> {
        self.expect(Token::LBracket, "'['")?;
        let mut constants = Vec::new();
        loop {
            match self.peek() {
                Token::RBracket => break,
                Token::Int(v) => {
                    let v = *v;
                    self.bump();
                    let v = i32::try_from(v)
                        .map_err(|_| self.error("integer constant out of range"))?;
                    constants.push(Constant::Int(v));
                }
                Token::Str(_) => {
                    let Token::Str(s) = self.bump() else {
                        unreachable!()
                    };
                    constants.push(Constant::Str(s));
                }
                Token::Ident(name) => {
                    let c = match name.as_str() {
                        "None" => Constant::None,
                        "true" => Constant::Bool(true),
                        "false" => Constant::Bool(false),
                        other => {
                            return Err(self.error(format!("unknown constant '{}'", other)))
                        }
                    };
                    self.bump();
                    constants.push(c);
                }
                _ => return Err(self.error("expected constant")),
            }
            if *self.peek() == Token::Comma {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(Token::RBracket, "']'")?;
        Ok(constants)
    }

    fn parse_ident_list(&mut self, field: &str) -> Result<Vec<String>, TextError> {
        self.expect_keyword(field)?;
        self.expect(Token::Assign, "'='")?;
        self.expect(Token::LBracket, "'['")?;
        let mut idents = Vec::new();
        while let Token::Ident(_) = self.peek() {
            let Token::Ident(name) = self.bump() else {
                unreachable!()
            };
            idents.push(name);
            if *self.peek() == Token::Comma {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(Token::RBracket, "']'")?;
        self.expect(Token::Comma, "','")?;
        Ok(idents)
    }
}

/// Parse the textual form of a function literal.
pub fn parse(src: &str) -> Result<Function, TextError> {
    let tokens = Lexer::new(src).lex()?;
    let mut parser = Parser { tokens, pos: 0 };
    let function = parser.parse_function()?;
    match parser.peek() {
        Token::Eof => Ok(function),
        _ => Err(parser.error("unexpected tokens after function literal")),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn write_function(out: &mut String, func: &Function, indent: usize) {
    let pad = "  ".repeat(indent);
    let inner = "  ".repeat(indent + 1);
    let _ = writeln!(out, "{}function {{", pad);

    let _ = write!(out, "{}functions = [", inner);
    if func.functions.is_empty() {
        let _ = writeln!(out, "],");
    } else {
        let _ = writeln!(out);
        for (i, child) in func.functions.iter().enumerate() {
            write_function(out, child, indent + 2);
            if i + 1 < func.functions.len() {
                let _ = writeln!(out, ",");
            } else {
                let _ = writeln!(out);
            }
        }
        let _ = writeln!(out, "{}],", inner);
    }

    let consts: Vec<String> = func
        .constants
        .iter()
        .map(|c| match c {
            Constant::None => "None".to_string(),
            Constant::Bool(b) => b.to_string(),
            Constant::Int(i) => i.to_string(),
            Constant::Str(s) => format!("\"{}\"", escape(s)),
        })
        .collect();
    let _ = writeln!(out, "{}constants = [{}],", inner, consts.join(", "));
    let _ = writeln!(out, "{}parameter_count = {},", inner, func.parameter_count);
    let _ = writeln!(out, "{}local_vars = [{}],", inner, func.local_vars.join(", "));
    let _ = writeln!(
        out,
        "{}local_ref_vars = [{}],",
        inner,
        func.local_ref_vars.join(", ")
    );
    let _ = writeln!(out, "{}free_vars = [{}],", inner, func.free_vars.join(", "));
    let _ = writeln!(out, "{}names = [{}],", inner, func.names.join(", "));
    let _ = writeln!(out, "{}instructions = [", inner);
    for inst in &func.instructions {
        match inst.operand {
            Some(v) => {
                let _ = writeln!(out, "{}  {} {}", inner, inst.op.mnemonic(), v);
            }
            None => {
                let _ = writeln!(out, "{}  {}", inner, inst.op.mnemonic());
            }
        }
    }
    let _ = writeln!(out, "{}]", inner);
    let _ = write!(out, "{}}}", pad);
}

/// Pretty-print a function tree in the same grammar `parse` accepts.
pub fn print(func: &Function) -> String {
    let mut out = String::new();
    write_function(&mut out, func, 0);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::{parse, print};
    use crate::bytecode::{Constant, Op};

    const SAMPLE: &str = r#"
function {
  functions = [
    function {
      functions = [],
      constants = [],
      parameter_count = 1,
      local_vars = [x],
      local_ref_vars = [],
      free_vars = [],
      names = [],
      instructions = [
        load_local 0
        return
      ]
    }
  ],
  constants = [None, true, -3, "hi\n"],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [print],
  instructions = [
    load_const 0
    goto -1
    return
  ]
}
"#;

    #[test]
    fn parses_nested_function_literals() {
        let func = parse(SAMPLE).unwrap();
        assert_eq!(func.functions.len(), 1);
        assert_eq!(func.functions[0].parameter_count, 1);
        assert_eq!(
            func.constants,
            vec![
                Constant::None,
                Constant::Bool(true),
                Constant::Int(-3),
                Constant::Str("hi\n".to_string())
            ]
        );
        assert_eq!(func.instructions.len(), 3);
        assert_eq!(func.instructions[1].op, Op::Goto);
        assert_eq!(func.instructions[1].operand, Some(-1));
    }

    #[test]
    fn print_parse_round_trip() {
        let func = parse(SAMPLE).unwrap();
        let text = print(&func);
        let reparsed = parse(&text).unwrap();
        assert_eq!(reparsed.constants, func.constants);
        assert_eq!(reparsed.instructions, func.instructions);
        assert_eq!(reparsed.functions.len(), func.functions.len());
        assert_eq!(reparsed.names, func.names);
    }

    #[test]
    fn reports_position_on_error() {
        let err = parse("function { functions = [ bogus ] }").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("']'"));
    }
}
