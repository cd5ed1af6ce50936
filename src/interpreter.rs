use crate::builtin;
use crate::command::ExitCode;
use crate::env::Environment;
use crate::launcher::{self, LaunchError, Launched};
use crate::lexer::{self, LexingError};
use crate::parser::{self, ParseError, Parsed};
use crate::reaper::Reaper;
use anyhow::Context;
use chrono::{Local, NaiveTime};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of the line buffer; a line keeps at most `READ_BUFFER_SIZE - 1` bytes.
pub const READ_BUFFER_SIZE: usize = 512;

/// Status of a line that was rejected before anything ran.
const INVALID_INPUT: ExitCode = 2;
/// Status of a pipeline that could not be launched.
const LAUNCH_FAILURE: ExitCode = 1;

#[derive(Debug, Error)]
enum EvalError {
    #[error("invalid input: {0}")]
    Lex(#[from] LexingError),
    #[error("invalid input: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl EvalError {
    fn exit_code(&self) -> ExitCode {
        match self {
            EvalError::Lex(_) | EvalError::Parse(_) => INVALID_INPUT,
            EvalError::Launch(_) => LAUNCH_FAILURE,
        }
    }
}

/// Reads lines, turns them into pipelines and runs them.
///
/// Each line goes through the lexer and parser; the result is either nothing, a
/// builtin run in-process against the [`Environment`], or a pipeline handed to the
/// launcher. Background pipelines are tracked by a [`Reaper`] which is polled before
/// every prompt.
///
/// Example
/// ```
/// use pipeshell::Interpreter;
/// let mut sh = Interpreter::default();
/// let code = sh.eval("true | true", &mut std::io::sink());
/// assert_eq!(code, 0);
/// ```
pub struct Interpreter {
    env: Environment,
    reaper: Reaper,
    last_status: ExitCode,
}

impl Interpreter {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            reaper: Reaper::new(),
            last_status: 0,
        }
    }

    /// Status of the most recent non-empty line.
    pub fn last_status(&self) -> ExitCode {
        self.last_status
    }

    pub fn should_exit(&self) -> bool {
        self.env.should_exit
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Evaluate one line of input.
    ///
    /// Errors are reported on `stderr` as `ERROR: ...` and reflected in the returned
    /// status; they never stop the interpreter. An empty line leaves the last status
    /// untouched.
    pub fn eval(&mut self, line: &str, stderr: &mut dyn Write) -> ExitCode {
        let line = truncate_line(line);
        match self.eval_line(line, stderr) {
            Ok(Some(status)) => self.last_status = status,
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, line, "line rejected");
                let _ = writeln!(stderr, "ERROR: {err}");
                self.last_status = err.exit_code();
            }
        }
        self.last_status
    }

    fn eval_line(
        &mut self,
        line: &str,
        stderr: &mut dyn Write,
    ) -> Result<Option<ExitCode>, EvalError> {
        let tokens = lexer::split_into_tokens(line)?;
        match parser::parse(&tokens)? {
            Parsed::Empty => Ok(None),
            Parsed::Builtin(call) => Ok(Some(builtin::dispatch(&call, &mut self.env, stderr))),
            Parsed::Pipeline(pipeline) => {
                let launched = launcher::launch(&pipeline)?;
                let status = launched.exit_code();
                if let Launched::Background(pids) = launched {
                    info!(?pids, "started background job");
                    self.reaper.track(pids);
                }
                Ok(Some(status))
            }
        }
    }

    /// Collect finished background jobs; returns how many were collected.
    pub fn reap_background(&mut self) -> usize {
        self.reaper.reap().len()
    }

    /// Run the read-eval loop on standard input until `exit` or end of input.
    ///
    /// With `show_prompt` the session is interactive: a login banner, a `<login>$ `
    /// prompt and line editing with history. Without it lines are read plainly, which
    /// suits scripts piped into the shell.
    pub fn repl(&mut self, show_prompt: bool) -> anyhow::Result<()> {
        let login = self.env.login_name();
        let (mut input, prompt) = if show_prompt {
            println!("{}", banner(&login, Local::now().time()));
            (LineReader::editor()?, format!("{login}$ "))
        } else {
            (LineReader::plain(io::stdin().lock()), String::new())
        };

        let mut stderr = io::stderr();
        while !self.env.should_exit {
            self.reap_background();
            match input.next_line(&prompt) {
                Input::Line(line) => {
                    self.eval(&line, &mut stderr);
                }
                Input::Rejected(reason) => {
                    let _ = writeln!(stderr, "ERROR: invalid input: {reason}");
                    self.last_status = INVALID_INPUT;
                }
                Input::Interrupted => continue,
                Input::Eof => break,
            }
        }
        debug!(last_status = self.last_status, "session finished");
        Ok(())
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Environment::new())
    }
}

/// `login by <login>, at HH:MM:SS`
pub fn banner(login: &str, at: NaiveTime) -> String {
    format!("login by {login}, at {}", at.format("%H:%M:%S"))
}

/// Cut `line` to what fits the line buffer, never splitting a character.
pub fn truncate_line(line: &str) -> &str {
    let limit = READ_BUFFER_SIZE - 1;
    if line.len() <= limit {
        return line;
    }
    let mut end = limit;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    debug!(len = line.len(), kept = end, "input line truncated");
    &line[..end]
}

enum Input {
    Line(String),
    /// Read but unusable; reported and skipped.
    Rejected(String),
    Interrupted,
    Eof,
}

enum LineReader {
    Editor(DefaultEditor),
    Plain(Box<dyn BufRead>),
}

impl LineReader {
    fn editor() -> anyhow::Result<Self> {
        let editor = DefaultEditor::new().context("failed to create line editor")?;
        Ok(LineReader::Editor(editor))
    }

    fn plain(reader: impl BufRead + 'static) -> Self {
        LineReader::Plain(Box::new(reader))
    }

    /// Next line without its terminator. A failing reader counts as end of input.
    fn next_line(&mut self, prompt: &str) -> Input {
        match self {
            LineReader::Editor(rl) => match rl.readline(prompt) {
                Ok(line) => {
                    let _ = rl.add_history_entry(line.as_str());
                    Input::Line(line)
                }
                Err(ReadlineError::Interrupted) => Input::Interrupted,
                Err(ReadlineError::Eof) => Input::Eof,
                Err(ReadlineError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                    Input::Rejected(err.to_string())
                }
                Err(err) => {
                    warn!(error = %err, "line editor failed, ending session");
                    Input::Eof
                }
            },
            LineReader::Plain(reader) => {
                let mut bytes = Vec::new();
                match reader.read_until(b'\n', &mut bytes) {
                    Ok(0) => Input::Eof,
                    Ok(_) => {
                        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
                            bytes.pop();
                        }
                        Input::Line(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Err(err) => {
                        warn!(error = %err, "read failed, ending session");
                        Input::Eof
                    }
                }
            }
        }
    }
}
