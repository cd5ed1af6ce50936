use nix::unistd::{Uid, User};
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;

/// Mutable, user-level view of the process environment used by the interpreter.
///
/// The environment contains:
/// - `vars`: overrides consulted before the process environment (e.g. `HOME` for `cd`);
///   a `None` override hides the process value.
/// - `current_dir`: the working directory, kept in sync by the `cd` builtin.
/// - `should_exit`: set by the `exit` builtin; the read-eval loop stops when it is true.
#[derive(Debug, Clone)]
pub struct Environment {
    pub vars: HashMap<String, Option<String>>,
    pub current_dir: PathBuf,
    pub should_exit: bool,
}

impl Environment {
    /// Capture the current process state.
    ///
    /// Variables are left empty and looked up lazily through [`Environment::get_var`],
    /// so children launched later see the real process environment unchanged.
    pub fn new() -> Self {
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars: HashMap::new(),
            current_dir,
            should_exit: false,
        }
    }

    /// Get the value of an environment variable.
    ///
    /// Looks up the key in `self.vars` first, falling back to `std::env::var`.
    pub fn get_var(&self, key: &str) -> Option<String> {
        match self.vars.get(key) {
            Some(overridden) => overridden.clone(),
            None => stdenv::var(key).ok(),
        }
    }

    /// Set or override a variable in `self.vars`.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), Some(val.into()));
    }

    /// Treat a variable as unset, whatever the process environment holds.
    pub fn unset_var(&mut self, key: impl Into<String>) {
        self.vars.insert(key.into(), None);
    }

    /// Home directory of the user: `HOME`, or the password database entry of the
    /// current user when `HOME` is unset.
    pub fn home_dir(&self) -> Option<PathBuf> {
        match self.get_var("HOME") {
            Some(home) => Some(PathBuf::from(home)),
            None => passwd_home(),
        }
    }

    /// Name to show in the prompt: `USER`, `LOGNAME`, then the password database.
    pub fn login_name(&self) -> String {
        self.get_var("USER")
            .or_else(|| self.get_var("LOGNAME"))
            .or_else(|| {
                User::from_uid(Uid::current())
                    .ok()
                    .flatten()
                    .map(|user| user.name)
            })
            .unwrap_or_else(|| String::from("?"))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn passwd_home() -> Option<PathBuf> {
    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => Some(user.dir),
        Ok(None) => None,
        Err(errno) => {
            tracing::debug!(%errno, "password database lookup failed");
            None
        }
    }
}
