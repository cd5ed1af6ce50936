use crate::lexer::Token;
use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// One pipeline stage: the program to run and where its standard streams go.
///
/// `argv` is never empty once the parser hands a command out; `argv[0]` names the
/// program and is looked up on `PATH` at exec time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
    /// File to read standard input from instead of the terminal or a pipe.
    pub input: Option<PathBuf>,
    /// File to write standard output to, created or truncated.
    pub output: Option<PathBuf>,
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input: None,
            output: None,
        }
    }

    /// Copy a run of tokens into a fresh argv.
    pub fn from_tokens(tokens: &[Token]) -> Self {
        Self::new(tokens.iter().map(Token::text))
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Commands connected stage to stage by pipes. Stage 0 reads the terminal unless
/// redirected; the last stage writes the terminal unless redirected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    pub commands: Vec<Command>,
    /// Launch without waiting (trailing `&`).
    pub background: bool,
}

impl Pipeline {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            background: false,
        }
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
