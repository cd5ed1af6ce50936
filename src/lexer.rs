//! A module implementing lexical analysis (tokenization) for one line of shell input.
//!
//! The lexer splits a line into words and the single-character operators `|`, `<`,
//! `>` and `&`, strips quotes, counts pipes and tags builtin words found in command
//! position. The parser only ever sees the resulting [`TokenStream`].

use crate::builtin::Builtin;
use std::fmt;
use thiserror::Error;

/// Operators recognized by the lexer. Each one is a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// The pipe operator, `|`.
    Pipe,
    /// Input redirection symbol, `<`.
    RedirectIn,
    /// Output redirection symbol, `>`.
    RedirectOut,
    /// Background marker, `&`.
    Background,
}

impl Operator {
    fn from_char(ch: char) -> Option<Self> {
        match ch {
            '|' => Some(Operator::Pipe),
            '<' => Some(Operator::RedirectIn),
            '>' => Some(Operator::RedirectOut),
            '&' => Some(Operator::Background),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Pipe => "|",
            Operator::RedirectIn => "<",
            Operator::RedirectOut => ">",
            Operator::Background => "&",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Anything that is not an operator, with quotes already removed.
    Word(String),
    /// One of `|`, `<`, `>`, `&`.
    Op(Operator),
}

impl Token {
    pub fn word(text: impl Into<String>) -> Self {
        Token::Word(text.into())
    }

    pub fn text(&self) -> &str {
        match self {
            Token::Word(text) => text,
            Token::Op(op) => op.as_str(),
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self, Token::Op(_))
    }
}

/// A builtin word found at the head of a command, and the index of that command
/// within the line (0 for the first command, 1 after the first `|`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinTag {
    pub builtin: Builtin,
    pub command_index: usize,
}

/// Tokens of one input line together with the out-of-band tags the parser needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStream {
    tokens: Vec<Token>,
    builtins: Vec<BuiltinTag>,
    pipe_count: usize,
}

impl TokenStream {
    /// Build a stream from already split tokens, tagging builtins the same way the
    /// lexer does for unquoted words.
    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self::tag(tokens.into_iter().map(|token| (token, false)))
    }

    fn tag(tokens: impl IntoIterator<Item = (Token, bool)>) -> Self {
        let mut stream = TokenStream::default();
        let mut at_command_head = true;
        for (token, quoted) in tokens {
            match &token {
                Token::Op(Operator::Pipe) => {
                    stream.pipe_count += 1;
                    at_command_head = true;
                }
                Token::Word(word) => {
                    if at_command_head && !quoted {
                        if let Some(builtin) = Builtin::from_word(word) {
                            stream.builtins.push(BuiltinTag {
                                builtin,
                                command_index: stream.pipe_count,
                            });
                        }
                    }
                    at_command_head = false;
                }
                Token::Op(_) => at_command_head = false,
            }
            stream.tokens.push(token);
        }
        stream
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn builtins(&self) -> &[BuiltinTag] {
        &self.builtins
    }

    pub fn pipe_count(&self) -> usize {
        self.pipe_count
    }

    /// Number of commands implied by the pipes on the line.
    pub fn command_count(&self) -> usize {
        self.pipe_count + 1
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Errors that can occur during the lexical analysis process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexingError {
    /// A closing quote (single or double) was not found.
    #[error("unterminated quote")]
    UnfinishedQuote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingSingleQuote,
    ReadingDoubleQuote,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    buffer: String,
    // Any part of the current word was quoted; such words are never builtins.
    quoted: bool,
    out: Vec<(Token, bool)>,
}

impl LexingFSM {
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            buffer: String::new(),
            quoted: false,
            out: Vec::new(),
        }
    }

    /// Runs the machine over the whole line.
    ///
    /// # Returns
    /// The tagged [`TokenStream`], or a [`LexingError`] if a quote is left open.
    fn make_tokens(mut self) -> Result<TokenStream, LexingError> {
        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start => self.handle_start(ch),
                LexingState::ReadingWord => self.handle_word(ch),
                LexingState::ReadingSingleQuote => self.handle_quote(ch, '\''),
                LexingState::ReadingDoubleQuote => self.handle_quote(ch, '"'),
            }
        }

        if matches!(
            self.state,
            LexingState::ReadingSingleQuote | LexingState::ReadingDoubleQuote
        ) {
            return Err(LexingError::UnfinishedQuote);
        }

        self.finalize_word();
        Ok(TokenStream::tag(self.out))
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn handle_start(&mut self, ch: char) {
        match ch {
            c if c.is_whitespace() => {}
            c => {
                self.state = LexingState::ReadingWord;
                self.handle_word(c);
            }
        }
    }

    fn handle_word(&mut self, ch: char) {
        if let Some(op) = Operator::from_char(ch) {
            self.finalize_word();
            self.out.push((Token::Op(op), false));
            self.state = LexingState::Start;
            return;
        }
        match ch {
            c if c.is_whitespace() => {
                self.finalize_word();
                self.state = LexingState::Start;
            }
            '\'' => {
                self.quoted = true;
                self.state = LexingState::ReadingSingleQuote;
            }
            '"' => {
                self.quoted = true;
                self.state = LexingState::ReadingDoubleQuote;
            }
            c => self.buffer.push(c),
        }
    }

    fn handle_quote(&mut self, ch: char, closing: char) {
        if ch == closing {
            self.state = LexingState::ReadingWord;
        } else {
            self.buffer.push(ch);
        }
    }

    /// Pushes the pending word, if any. Empty words (`""`) produce no token.
    fn finalize_word(&mut self) {
        if !self.buffer.is_empty() {
            let word = std::mem::take(&mut self.buffer);
            self.out.push((Token::Word(word), self.quoted));
        }
        self.quoted = false;
    }
}

/// The main entry point function to perform lexical analysis.
///
/// # Returns
/// `Result<TokenStream, LexingError>`: the tagged tokens of `line`, or a `LexingError`
/// if a quote is never closed.
pub fn split_into_tokens(line: &str) -> Result<TokenStream, LexingError> {
    LexingFSM::new(line).make_tokens()
}
