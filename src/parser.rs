//! Pipeline parser.
//!
//! Turns the [`TokenStream`] of one line into either a [`Pipeline`] ready for the
//! launcher, a [`BuiltinCall`] for the dispatcher, or nothing at all for an empty
//! line. Lines without a `|` go through the single-command grammar, lines with one
//! through the pipeline grammar; both are small state machines over the token
//! classes WORD, PIPE, REDIRECT_IN, REDIRECT_OUT and BACKGROUND.

use crate::builtin::{Builtin, BuiltinCall};
use crate::command::{Command, Pipeline};
use crate::lexer::{BuiltinTag, Operator, Token, TokenStream};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Direction of a file redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    Input,
    Output,
}

impl RedirectKind {
    fn of(op: Operator) -> Option<Self> {
        match op {
            Operator::RedirectIn => Some(RedirectKind::Input),
            Operator::RedirectOut => Some(RedirectKind::Output),
            _ => None,
        }
    }
}

impl fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectKind::Input => f.write_str("<"),
            RedirectKind::Output => f.write_str(">"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("`{0}` is missing a file name")]
    MissingRedirectTarget(RedirectKind),
    #[error("`{redirect}` must be followed by a file name, found `{found}`")]
    OperatorAsRedirectTarget {
        redirect: RedirectKind,
        found: Operator,
    },
    #[error("more than one `{0}` redirect")]
    DuplicateRedirect(RedirectKind),
    #[error("`&` must be the last token")]
    BackgroundNotLast,
    #[error("missing command")]
    MissingCommand,
    #[error("unexpected argument `{0}` after a redirect")]
    StrayWord(String),
    #[error("empty command in pipeline")]
    EmptyStage,
    #[error("`|` cannot be followed by `{0}`")]
    PipeFollowedByOperator(Operator),
    #[error("input redirect is only valid at the head of a pipeline")]
    InputRedirectNotAtHead,
    #[error("output redirect must terminate the pipeline")]
    OutputRedirectNotAtEnd,
    #[error("more than one builtin on the line")]
    MultipleBuiltins,
    #[error("`{0}` cannot be part of a pipeline")]
    BuiltinInPipeline(Builtin),
    #[error("`{builtin}` found in command position {position}")]
    BuiltinOutOfBounds { builtin: Builtin, position: usize },
}

/// Per-line parser state. Built fresh for every line from the stream's tags and
/// threaded through the parse; nothing here outlives the line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseContext {
    /// Commands implied by the number of pipes.
    pub command_count: usize,
    /// Builtins tagged by the lexer, with their command positions.
    pub builtins: Vec<BuiltinTag>,
    /// Set when the line ends in `&`.
    pub background: bool,
}

impl ParseContext {
    pub fn for_line(stream: &TokenStream) -> Self {
        Self {
            command_count: stream.command_count(),
            builtins: stream.builtins().to_vec(),
            background: false,
        }
    }

    /// The builtin this line reduces to, if any.
    ///
    /// Builtins never take part in pipelines, and only one may appear per line.
    fn lone_builtin(&self) -> Result<Option<BuiltinTag>, ParseError> {
        match self.builtins.as_slice() {
            [] => Ok(None),
            [tag] if self.command_count > 1 => Err(ParseError::BuiltinInPipeline(tag.builtin)),
            [tag] if tag.command_index > 1 => {
                Err(ParseError::BuiltinOutOfBounds {
                    builtin: tag.builtin,
                    position: tag.command_index,
                })
            }
            [tag] => Ok(Some(*tag)),
            _ => Err(ParseError::MultipleBuiltins),
        }
    }
}

/// What a line asks the interpreter to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Blank line.
    Empty,
    Builtin(BuiltinCall),
    Pipeline(Pipeline),
}

/// Parse one line with a fresh [`ParseContext`].
pub fn parse(stream: &TokenStream) -> Result<Parsed, ParseError> {
    let mut ctx = ParseContext::for_line(stream);
    parse_line(stream, &mut ctx)
}

/// Parse one line, recording the background flag in `ctx`.
pub fn parse_line(stream: &TokenStream, ctx: &mut ParseContext) -> Result<Parsed, ParseError> {
    let tokens = stream.tokens();
    if tokens.is_empty() {
        return Ok(Parsed::Empty);
    }

    if let Some(tag) = ctx.lone_builtin()? {
        return Ok(Parsed::Builtin(BuiltinCall {
            builtin: tag.builtin,
            args: tokens.iter().skip(1).map(|t| t.text().to_string()).collect(),
        }));
    }

    let has_pipe = tokens.iter().any(|t| *t == Token::Op(Operator::Pipe));
    let commands = if has_pipe {
        parse_pipeline(tokens, ctx)?
    } else {
        vec![parse_single_command(tokens, ctx)?]
    };

    Ok(Parsed::Pipeline(Pipeline {
        commands,
        background: ctx.background,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleState {
    /// Right after argv: a redirect or `&` comes next.
    Argv,
    /// A redirect operator was read; its file name comes next.
    Target(RedirectKind),
    /// After a redirect file name: only redirects or `&` may follow.
    Redirected,
    /// `&` was read; the line must end here.
    Done,
}

/// `WORD+ (< WORD)? (> WORD)? &?`, the two redirects in either order.
fn parse_single_command(tokens: &[Token], ctx: &mut ParseContext) -> Result<Command, ParseError> {
    let argv_len = tokens.iter().take_while(|t| !t.is_operator()).count();
    if argv_len == 0 {
        return Err(ParseError::MissingCommand);
    }
    let mut command = Command::from_tokens(&tokens[..argv_len]);
    let mut state = SingleState::Argv;

    for token in &tokens[argv_len..] {
        state = match (state, token) {
            (SingleState::Done, _) => return Err(ParseError::BackgroundNotLast),
            (SingleState::Target(kind), Token::Word(file)) => {
                set_redirect(&mut command, kind, file)?;
                SingleState::Redirected
            }
            (SingleState::Target(redirect), Token::Op(found)) => {
                return Err(ParseError::OperatorAsRedirectTarget {
                    redirect,
                    found: *found,
                });
            }
            (SingleState::Argv | SingleState::Redirected, Token::Word(word)) => {
                return Err(ParseError::StrayWord(word.clone()));
            }
            (_, Token::Op(op)) => match RedirectKind::of(*op) {
                Some(kind) => SingleState::Target(kind),
                None if *op == Operator::Background => {
                    ctx.background = true;
                    SingleState::Done
                }
                // Lines with a pipe never reach this grammar.
                None => return Err(ParseError::EmptyStage),
            },
        };
    }

    if let SingleState::Target(kind) = state {
        return Err(ParseError::MissingRedirectTarget(kind));
    }
    Ok(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
    /// Start of a stage: a word must come first.
    Start,
    /// Collecting the stage's argv.
    Argv,
    /// A redirect operator was read; its file name comes next.
    Target(RedirectKind),
    /// After a redirect file name: no more words in this stage.
    Redirected,
    /// `&` was read; the line must end here.
    Done,
}

/// Stages separated by `|`. Only the first stage may read a file (`< f`), only the
/// last may write one (`> f`), and `&` may only close the line.
fn parse_pipeline(tokens: &[Token], ctx: &mut ParseContext) -> Result<Vec<Command>, ParseError> {
    let last_stage = ctx.command_count.saturating_sub(1);
    let mut commands = Vec::with_capacity(ctx.command_count);
    let mut current = Command::default();
    let mut state = StageState::Start;
    let mut argv_start = 0;

    for (idx, token) in tokens.iter().enumerate() {
        // Redirects only follow argv, so the stage starts over from its words.
        if state == StageState::Argv && token.is_operator() {
            current = Command::from_tokens(&tokens[argv_start..idx]);
        }
        let stage = commands.len();
        state = match (state, token) {
            (StageState::Done, _) => return Err(ParseError::BackgroundNotLast),
            (StageState::Start, Token::Word(_)) => {
                argv_start = idx;
                StageState::Argv
            }
            (StageState::Argv, Token::Word(_)) => StageState::Argv,
            (StageState::Start, Token::Op(op)) => {
                return Err(match (stage, op) {
                    (0, Operator::Pipe) => ParseError::EmptyStage,
                    (0, _) => ParseError::MissingCommand,
                    (_, op) => ParseError::PipeFollowedByOperator(*op),
                });
            }
            (StageState::Target(kind), Token::Word(file)) => {
                set_redirect(&mut current, kind, file)?;
                StageState::Redirected
            }
            (StageState::Target(redirect), Token::Op(found)) => {
                return Err(ParseError::OperatorAsRedirectTarget {
                    redirect,
                    found: *found,
                });
            }
            (StageState::Redirected, Token::Word(word)) => {
                return Err(ParseError::StrayWord(word.clone()));
            }
            (_, Token::Op(Operator::Pipe)) => {
                if current.output.is_some() {
                    return Err(ParseError::OutputRedirectNotAtEnd);
                }
                commands.push(std::mem::take(&mut current));
                StageState::Start
            }
            (_, Token::Op(Operator::RedirectIn)) => {
                if stage != 0 {
                    return Err(ParseError::InputRedirectNotAtHead);
                }
                StageState::Target(RedirectKind::Input)
            }
            (_, Token::Op(Operator::RedirectOut)) => {
                if stage != last_stage {
                    return Err(ParseError::OutputRedirectNotAtEnd);
                }
                StageState::Target(RedirectKind::Output)
            }
            (_, Token::Op(Operator::Background)) => {
                ctx.background = true;
                StageState::Done
            }
        };
    }

    match state {
        StageState::Start => return Err(ParseError::EmptyStage),
        StageState::Target(kind) => return Err(ParseError::MissingRedirectTarget(kind)),
        StageState::Argv => commands.push(Command::from_tokens(&tokens[argv_start..])),
        StageState::Redirected | StageState::Done => commands.push(current),
    }
    Ok(commands)
}

fn set_redirect(command: &mut Command, kind: RedirectKind, file: &str) -> Result<(), ParseError> {
    let slot = match kind {
        RedirectKind::Input => &mut command.input,
        RedirectKind::Output => &mut command.output,
    };
    if slot.is_some() {
        return Err(ParseError::DuplicateRedirect(kind));
    }
    *slot = Some(PathBuf::from(file));
    Ok(())
}
