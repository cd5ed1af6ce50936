use crate::command::ExitCode;
use crate::env::Environment;
use argh::{EarlyExit, FromArgs};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Commands implemented inside the interpreter and never forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Exit,
}

impl Builtin {
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "cd" => Some(Builtin::Cd),
            "exit" => Some(Builtin::Exit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Cd => Cd::name(),
            Builtin::Exit => Exit::name(),
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A line that reduced to a single builtin invocation. `args` holds every token of
/// the line after the builtin word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinCall {
    pub builtin: Builtin,
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("cd: HOME is not set and the current user has no home directory")]
    NoHome,
    #[error("cd: {}: {source}", path.display())]
    ChangeDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Return value follows shell conventions: 0 for success, non-zero for error.
    fn execute(self, env: &mut Environment) -> Result<ExitCode, BuiltinError>;
}

/// Run a builtin call against the interpreter environment.
///
/// Failures are reported on `stderr` and turned into a non-zero exit code; a builtin
/// never aborts the interpreter.
pub fn dispatch(call: &BuiltinCall, env: &mut Environment, stderr: &mut dyn Write) -> ExitCode {
    let args: Vec<&str> = call.args.iter().map(String::as_str).collect();
    let result = match call.builtin {
        Builtin::Cd => {
            // Everything after `cd` is a path, even when it starts with a dash.
            let paths: Vec<&str> = std::iter::once("--").chain(args.iter().copied()).collect();
            run::<Cd>(&paths, env)
        }
        Builtin::Exit => run::<Exit>(&args, env),
    };
    match result {
        Ok(Outcome::Ran(code)) => code,
        Ok(Outcome::Help(text)) => {
            let _ = writeln!(stderr, "{}", text.trim_end());
            0
        }
        Err(err) => {
            tracing::debug!(builtin = %call.builtin, error = %err, "builtin failed");
            let _ = writeln!(stderr, "ERROR: {err}");
            1
        }
    }
}

enum Outcome {
    Ran(ExitCode),
    Help(String),
}

fn run<T: BuiltinCommand>(args: &[&str], env: &mut Environment) -> Result<Outcome, BuiltinError> {
    match T::from_args(&[T::name()], args) {
        Ok(cmd) => cmd.execute(env).map(Outcome::Ran),
        Err(EarlyExit {
            output,
            status: Ok(()),
        }) => Ok(Outcome::Help(output)),
        Err(EarlyExit { output, .. }) => Err(BuiltinError::Usage(output.trim().to_string())),
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// Without a target, changes to $HOME, or to the home directory of the current user.
pub struct Cd {
    #[argh(positional, greedy)]
    /// directory to switch to; absolute or relative to the current directory.
    pub args: Vec<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode, BuiltinError> {
        let target = match self.args.as_slice() {
            [] => env.home_dir().ok_or(BuiltinError::NoHome)?,
            [dir] => PathBuf::from(dir),
            _ => return Err(BuiltinError::Usage(String::from("cd <dir>"))),
        };

        let new_dir = if target.is_absolute() {
            target
        } else {
            env.current_dir.join(target)
        };

        let canonical = fs::canonicalize(&new_dir).map_err(|source| BuiltinError::ChangeDir {
            path: new_dir.clone(),
            source,
        })?;

        std::env::set_current_dir(&canonical).map_err(|source| BuiltinError::ChangeDir {
            path: canonical.clone(),
            source,
        })?;
        tracing::debug!(dir = %canonical.display(), "changed directory");
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Exit the shell.
pub struct Exit {
    #[argh(positional, greedy)]
    /// ignored.
    pub _args: Vec<String>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode, BuiltinError> {
        env.should_exit = true;
        Ok(0)
    }
}
