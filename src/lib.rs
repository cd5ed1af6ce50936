//! A small command-line pipeline shell.
//!
//! A line is split into words and the operators `|`, `<`, `>` and `&`, checked
//! against the pipeline grammar and then either handled in-process (the `cd` and
//! `exit` builtins) or launched as a chain of child processes connected by pipes.
//! Redirect files are opened by the children themselves, and background pipelines are
//! collected by a non-blocking [`reaper::Reaper`] between prompts.
//!
//! The main entry point is [`Interpreter`], which evaluates single lines with
//! [`Interpreter::eval`] or runs a whole session with [`Interpreter::repl`]. The
//! lower layers are public too: [`lexer`] and [`parser`] turn text into
//! [`command::Pipeline`] values, and [`launcher::launch`] runs them.

pub mod builtin;
pub mod command;
pub mod env;
mod interpreter;
pub mod launcher;
pub mod lexer;
pub mod parser;
pub mod reaper;

pub use interpreter::{Interpreter, READ_BUFFER_SIZE, banner, truncate_line};
