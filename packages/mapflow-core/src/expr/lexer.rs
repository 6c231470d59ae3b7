//! Expression lexer.
//!
//! Produces a flat token stream for the parser. Numeric literals follow the
//! usual ladder: bare digits lex as int32, a decimal point promotes to
//! float, an exponent promotes to double. `-` is always lexed as the binary
//! operator; the parser reinterprets it as negation in operand position.

use super::token::BinaryOp;
use super::ExprError;

#[derive(Clone, Debug, PartialEq)]
pub enum LexToken {
    Int(i32),
    Float(f32),
    Double(f64),
    /// Identifier: user variable, function name or keyword.
    Name(String),
    /// `x` or `x$N`.
    SrcVar(Option<u8>),
    /// `x$$`.
    SrcNewest,
    /// `y`.
    DstVar,
    /// `t_x`, `t_x$N`.
    SrcTime(Option<u8>),
    /// `t_y`.
    DstTime,
    Op(BinaryOp),
    /// `!` in operand position; `!=` lexes as an operator.
    Not,
    Assign,
    Question,
    Colon,
    Semicolon,
    Comma,
    Dot,
    /// `->`
    Lambda,
    OpenParen,
    CloseParen,
    OpenSquare,
    CloseSquare,
    OpenCurly,
    CloseCurly,
    End,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    /// Lexes the whole input, appending a terminating [`LexToken::End`].
    pub fn tokenize(mut self) -> Result<Vec<(LexToken, usize)>, ExprError> {
        let mut out = Vec::new();
        loop {
            let at = self.pos;
            let tok = self.next_token()?;
            let done = tok == LexToken::End;
            out.push((tok, at));
            if done {
                return Ok(out);
            }
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn peek_at(&self, ahead: usize) -> u8 {
        *self.src.get(self.pos + ahead).unwrap_or(&0)
    }

    fn next_token(&mut self) -> Result<LexToken, ExprError> {
        while self.peek().is_ascii_whitespace() {
            self.pos += 1;
        }
        let at = self.pos;
        let c = self.peek();
        if c == 0 {
            return Ok(LexToken::End);
        }
        if c.is_ascii_digit() {
            return self.lex_number(at);
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return self.lex_name(at);
        }
        self.pos += 1;
        let two = self.peek();
        Ok(match c {
            b'+' => LexToken::Op(BinaryOp::Add),
            b'-' => {
                if two == b'>' {
                    self.pos += 1;
                    LexToken::Lambda
                } else {
                    LexToken::Op(BinaryOp::Subtract)
                }
            }
            b'*' => LexToken::Op(BinaryOp::Multiply),
            b'/' => LexToken::Op(BinaryOp::Divide),
            b'%' => LexToken::Op(BinaryOp::Modulo),
            b'=' => {
                if two == b'=' {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::Equal)
                } else {
                    LexToken::Assign
                }
            }
            b'!' => {
                if two == b'=' {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::NotEqual)
                } else {
                    LexToken::Not
                }
            }
            b'<' => match two {
                b'=' => {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::LessEqual)
                }
                b'<' => {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::ShiftLeft)
                }
                _ => LexToken::Op(BinaryOp::Less),
            },
            b'>' => match two {
                b'=' => {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::GreaterEqual)
                }
                b'>' => {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::ShiftRight)
                }
                _ => LexToken::Op(BinaryOp::Greater),
            },
            b'&' => {
                if two == b'&' {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::LogicalAnd)
                } else {
                    LexToken::Op(BinaryOp::BitAnd)
                }
            }
            b'|' => {
                if two == b'|' {
                    self.pos += 1;
                    LexToken::Op(BinaryOp::LogicalOr)
                } else {
                    LexToken::Op(BinaryOp::BitOr)
                }
            }
            b'^' => LexToken::Op(BinaryOp::BitXor),
            b'?' => LexToken::Question,
            b':' => LexToken::Colon,
            b';' => LexToken::Semicolon,
            b',' => LexToken::Comma,
            b'.' => LexToken::Dot,
            b'(' => LexToken::OpenParen,
            b')' => LexToken::CloseParen,
            b'[' => LexToken::OpenSquare,
            b']' => LexToken::CloseSquare,
            b'{' => LexToken::OpenCurly,
            b'}' => LexToken::CloseCurly,
            _ => {
                return Err(ExprError::Syntax {
                    at,
                    what: format!("unknown character '{}'", c as char),
                })
            }
        })
    }

    fn lex_number(&mut self, at: usize) -> Result<LexToken, ExprError> {
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        let mut is_float = false;
        let mut is_double = false;
        if self.peek() == b'.' && self.peek_at(1).is_ascii_digit() {
            is_float = true;
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.peek() == b'e' || self.peek() == b'E' {
            let save = self.pos;
            self.pos += 1;
            if self.peek() == b'+' || self.peek() == b'-' {
                self.pos += 1;
            }
            if self.peek().is_ascii_digit() {
                is_double = true;
                while self.peek().is_ascii_digit() {
                    self.pos += 1;
                }
            } else {
                // not an exponent after all ("2e" could start "2*ema(...)")
                self.pos = save;
            }
        }
        let text = std::str::from_utf8(&self.src[at..self.pos]).unwrap_or("");
        if is_double {
            text.parse::<f64>()
                .map(LexToken::Double)
                .map_err(|_| ExprError::Syntax {
                    at,
                    what: format!("bad number literal '{}'", text),
                })
        } else if is_float {
            text.parse::<f32>()
                .map(LexToken::Float)
                .map_err(|_| ExprError::Syntax {
                    at,
                    what: format!("bad number literal '{}'", text),
                })
        } else {
            text.parse::<i32>()
                .map(LexToken::Int)
                .map_err(|_| ExprError::Syntax {
                    at,
                    what: format!("integer literal '{}' out of range", text),
                })
        }
    }

    fn lex_name(&mut self, at: usize) -> Result<LexToken, ExprError> {
        while {
            let c = self.peek();
            c.is_ascii_alphanumeric() || c == b'_'
        } {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.src[at..self.pos]).unwrap_or("");
        match name {
            "x" => self.lex_src_suffix(false),
            "y" => Ok(LexToken::DstVar),
            "t_x" => self.lex_src_suffix(true),
            "t_y" => Ok(LexToken::DstTime),
            "pi" => Ok(LexToken::Float(std::f32::consts::PI)),
            "e" => Ok(LexToken::Float(std::f32::consts::E)),
            _ => Ok(LexToken::Name(name.to_string())),
        }
    }

    /// Consumes an optional `$N` / `$$` source selector after `x` or `t_x`.
    fn lex_src_suffix(&mut self, time: bool) -> Result<LexToken, ExprError> {
        if self.peek() != b'$' {
            return Ok(if time {
                LexToken::SrcTime(None)
            } else {
                LexToken::SrcVar(None)
            });
        }
        let at = self.pos;
        self.pos += 1;
        if self.peek() == b'$' {
            self.pos += 1;
            if time {
                return Err(ExprError::Syntax {
                    at,
                    what: "timetag of x$$ is not addressable".into(),
                });
            }
            return Ok(LexToken::SrcNewest);
        }
        if !self.peek().is_ascii_digit() {
            return Err(ExprError::Syntax {
                at,
                what: "expected signal index after '$'".into(),
            });
        }
        let start = self.pos;
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        let idx: u32 = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap_or("")
            .parse()
            .map_err(|_| ExprError::Syntax {
                at,
                what: "bad signal index".into(),
            })?;
        if idx as usize >= super::token::MAX_SOURCES {
            return Err(ExprError::Syntax {
                at,
                what: format!("signal index {} out of range", idx),
            });
        }
        Ok(if time {
            LexToken::SrcTime(Some(idx as u8))
        } else {
            LexToken::SrcVar(Some(idx as u8))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<LexToken> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn numbers_follow_the_type_ladder() {
        assert_eq!(lex("42")[0], LexToken::Int(42));
        assert_eq!(lex("2.5")[0], LexToken::Float(2.5));
        assert_eq!(lex("1e3")[0], LexToken::Double(1000.0));
        assert_eq!(lex("2.5e-1")[0], LexToken::Double(0.25));
    }

    #[test]
    fn source_selectors() {
        assert_eq!(lex("x")[0], LexToken::SrcVar(None));
        assert_eq!(lex("x$1")[0], LexToken::SrcVar(Some(1)));
        assert_eq!(lex("x$$")[0], LexToken::SrcNewest);
        assert_eq!(lex("t_x$0")[0], LexToken::SrcTime(Some(0)));
        assert_eq!(lex("t_y")[0], LexToken::DstTime);
    }

    #[test]
    fn two_character_operators() {
        assert_eq!(
            lex("a >= b")[1],
            LexToken::Op(BinaryOp::GreaterEqual)
        );
        assert_eq!(lex("a >> b")[1], LexToken::Op(BinaryOp::ShiftRight));
        assert_eq!(lex("a != b")[1], LexToken::Op(BinaryOp::NotEqual));
        assert_eq!(lex("(a,b) -> a")[5], LexToken::Lambda);
    }

    #[test]
    fn full_statement() {
        let toks = lex("y = x*2 + 1;");
        assert_eq!(
            toks,
            vec![
                LexToken::DstVar,
                LexToken::Assign,
                LexToken::SrcVar(None),
                LexToken::Op(BinaryOp::Multiply),
                LexToken::Int(2),
                LexToken::Op(BinaryOp::Add),
                LexToken::Int(1),
                LexToken::Semicolon,
                LexToken::End,
            ]
        );
    }

    #[test]
    fn dot_stays_a_token_after_names() {
        let toks = lex("x.vector.mean()");
        assert_eq!(toks[0], LexToken::SrcVar(None));
        assert_eq!(toks[1], LexToken::Dot);
        assert_eq!(toks[2], LexToken::Name("vector".into()));
    }

    #[test]
    fn unknown_character_is_an_error() {
        assert!(Lexer::new("y = x # 2").tokenize().is_err());
    }
}
