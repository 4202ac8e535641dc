use std::{collections::BTreeMap, iter::Peekable, str::Chars, str::FromStr};

use once_cell::sync::Lazy;
use strum::EnumString;

use super::{intern::InternedSymbol, Position, SourceFile};

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    file_name: String,
    chars: Peekable<Chars<'source>>,
    line: usize,
    column: usize,
    peeked: Option<Token>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Keyword(Keyword),
    Ident(InternedSymbol),

    /* Literals */
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),

    /* Delimiters */
    OpenParen,  // (
    CloseParen, // )
    Comma,      // ,
    Colon,      // :
    Bar,        // |
    Dot,        // .

    /* Flow prefixes */
    Question, // ?
    Bang,     // !

    /* Operators */
    Equals,    // =
    NotEquals, // ~=
    Less,      // <
    LessEq,    // <=
    Greater,   // >
    GreaterEq, // >=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Module,
    Type,
    Resource,
    Use,
    From,
    Pub,
    Proc,
    Func,
    Test,
    If,
    Then,
    Else,
    End,
    Do,
    While,
    Until,
    Break,
    Next,
    Foreign,
    Mod,
    True,
    False,
}

/// Table of single char tokens (matched after longer sequences are checked
/// for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        (',', TokenKind::Comma),
        (':', TokenKind::Colon),
        ('|', TokenKind::Bar),
        ('.', TokenKind::Dot),
        ('?', TokenKind::Question),
        ('!', TokenKind::Bang),
        ('=', TokenKind::Equals),
        ('<', TokenKind::Less),
        ('>', TokenKind::Greater),
        ('+', TokenKind::Plus),
        ('-', TokenKind::Minus),
        ('*', TokenKind::Star),
        ('/', TokenKind::Slash),
    ])
});

/// A lexing failure: malformed literal, stray character. The parser turns
/// these into diagnostics and resynchronises.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub pos: Position,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            file_name: source.origin.to_string(),
            chars: source.contents.chars().peekable(),
            line: 1,
            column: 1,
            peeked: None,
        }
    }

    pub fn source(&self) -> &SourceFile {
        self.source
    }

    pub fn position(&self) -> Position {
        Position::new(self.file_name.clone(), self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn ignore_whitespace_and_comments(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '#' {
                while let Some(c) = self.chars.peek().copied() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    pub fn peek(&mut self) -> Result<Option<Token>, LexError> {
        if self.peeked.is_none() {
            self.peeked = self.read_token()?;
        }
        Ok(self.peeked.clone())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Token>, LexError> {
        if let Some(token) = self.peeked.take() {
            return Ok(Some(token));
        }
        self.read_token()
    }

    /// Consumes one raw character. Error recovery uses this to get past
    /// input the tokeniser refuses to consume.
    pub fn skip_char(&mut self) {
        self.bump();
    }

    fn read_token(&mut self) -> Result<Option<Token>, LexError> {
        self.ignore_whitespace_and_comments();

        let pos = self.position();
        let Some(c) = self.chars.peek().copied() else {
            return Ok(None);
        };

        if c.is_ascii_digit() {
            return Ok(Some(self.read_number(pos)?));
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            return Ok(Some(self.read_word(pos)));
        }

        if c == '"' {
            return Ok(Some(self.read_string(pos)?));
        }

        if c == '\'' {
            return Ok(Some(self.read_char(pos)?));
        }

        // Two-char operators before the single-char table
        if c == '~' {
            self.bump();
            return match self.chars.peek() {
                Some('=') => {
                    self.bump();
                    Ok(Some(Token {
                        kind: TokenKind::NotEquals,
                        pos,
                    }))
                }
                _ => Err(LexError {
                    message: "Expected '=' after '~'".into(),
                    pos,
                }),
            };
        }

        if let Some(kind) = SINGLE_TOKENS.get(&c).cloned() {
            self.bump();

            let kind = match (kind, self.chars.peek().copied()) {
                (TokenKind::Less, Some('=')) => {
                    self.bump();
                    TokenKind::LessEq
                }
                (TokenKind::Greater, Some('=')) => {
                    self.bump();
                    TokenKind::GreaterEq
                }
                (kind, _) => kind,
            };

            return Ok(Some(Token { kind, pos }));
        }

        Err(LexError {
            message: format!("Unexpected character {c:?}"),
            pos,
        })
    }

    fn read_word(&mut self, pos: Position) -> Token {
        let mut word = String::new();

        while let Some(c) = self.chars.peek().copied() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }

        let kind = match Keyword::from_str(&word) {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Ident(InternedSymbol::new(&word)),
        };

        Token { kind, pos }
    }

    fn read_number(&mut self, pos: Position) -> Result<Token, LexError> {
        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.chars.peek().copied() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                // Only a fraction if a digit follows; `1.fld` is field access
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if !lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }

        let kind = if is_float {
            TokenKind::FloatLit(text.parse().map_err(|_| LexError {
                message: format!("Malformed float literal {text:?}"),
                pos: pos.clone(),
            })?)
        } else {
            TokenKind::IntLit(text.parse().map_err(|_| LexError {
                message: format!("Malformed integer literal {text:?}"),
                pos: pos.clone(),
            })?)
        };

        Ok(Token { kind, pos })
    }

    fn read_string(&mut self, pos: Position) -> Result<Token, LexError> {
        self.bump(); // opening quote

        let mut contents = String::new();
        loop {
            match self.bump() {
                Some('"') => {
                    return Ok(Token {
                        kind: TokenKind::StringLit(contents),
                        pos,
                    })
                }
                Some('\\') => match self.bump() {
                    Some('n') => contents.push('\n'),
                    Some('t') => contents.push('\t'),
                    Some(c) => contents.push(c),
                    None => break,
                },
                Some(c) => contents.push(c),
                None => break,
            }
        }

        Err(LexError {
            message: "Reached end of file while reading string literal".into(),
            pos,
        })
    }

    fn read_char(&mut self, pos: Position) -> Result<Token, LexError> {
        self.bump(); // opening quote

        let c = match self.bump() {
            Some('\\') => match self.bump() {
                Some('n') => '\n',
                Some('t') => '\t',
                Some(c) => c,
                None => {
                    return Err(LexError {
                        message: "Reached end of file while reading character literal".into(),
                        pos,
                    })
                }
            },
            Some(c) => c,
            None => {
                return Err(LexError {
                    message: "Reached end of file while reading character literal".into(),
                    pos,
                })
            }
        };

        match self.bump() {
            Some('\'') => Ok(Token {
                kind: TokenKind::CharLit(c),
                pos,
            }),
            _ => Err(LexError {
                message: "Expected closing quote after character literal".into(),
                pos,
            }),
        }
    }
}
