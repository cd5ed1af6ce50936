//! Process launcher.
//!
//! Allocates the pipes of a [`Pipeline`], forks one child per stage, wires each
//! child's stdin/stdout to its redirect file or pipe end, execs the program and, for
//! foreground pipelines, waits on every stage in order.
//!
//! Everything a child needs (C strings for argv and redirect paths) is prepared
//! before the fork. Between fork and exec the child only makes raw system calls:
//! `open`, `fcntl`, `dup2`, `close`, `execvp`, `write` and `_exit`.

use crate::command::{Command, ExitCode, Pipeline};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl, open};
use nix::sys::signal::{Signal, kill};
use nix::sys::stat::Mode;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid, close, dup2, execvp, fork};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Exit status of a child that failed to rebind a standard stream.
const REDIRECT_FAILURE: i32 = 1;
/// Exit status of a child whose program could not be found.
const NOT_FOUND: i32 = 127;
/// Exit status of a child whose program was found but could not be executed.
const NOT_EXECUTABLE: i32 = 126;

const STDIN: RawFd = 0;
const STDOUT: RawFd = 1;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("fork: {0}")]
    Fork(#[source] Errno),
    #[error("pipe: {0}")]
    Pipe(#[source] Errno),
    #[error("argument contains a NUL byte: {0:?}")]
    NulInArgument(String),
    #[error("empty command")]
    EmptyCommand,
}

/// How a waited-for stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Exited(i32),
    Signaled(i32),
}

impl StageStatus {
    /// Terminal statuses only; stops and continues are not an end.
    pub(crate) fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(StageStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(StageStatus::Signaled(signal as i32)),
            _ => None,
        }
    }

    /// Shell-style exit code: the exit status, or 128 + signal number.
    pub fn code(self) -> ExitCode {
        match self {
            StageStatus::Exited(code) => code,
            StageStatus::Signaled(signal) => 128 + signal,
        }
    }
}

/// What the launcher did with a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launched {
    /// Ran in the foreground; one status per stage, in stage order.
    Foreground(Vec<StageStatus>),
    /// Detached; process ids of the stages, in stage order.
    Background(Vec<Pid>),
}

impl Launched {
    /// Status of the pipeline as a whole: its last stage's, or 0 when detached.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Launched::Foreground(statuses) => statuses.last().map_or(0, |s| s.code()),
            Launched::Background(_) => 0,
        }
    }
}

/// One pipe, carrying the output of stage `i` to the input of stage `i + 1`.
#[derive(Debug)]
struct Pipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self, LaunchError> {
        let (read_end, write_end) = cloexec_pipe().map_err(LaunchError::Pipe)?;
        Ok(Self {
            read_end,
            write_end,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_end, write_end))
}

/// The N-1 pipes of an N-stage pipeline, indexed by the stage writing into them.
///
/// Dropping the set closes every descriptor in the calling process.
#[derive(Debug, Default)]
pub(crate) struct PipeSet {
    pipes: Vec<Pipe>,
}

impl PipeSet {
    pub(crate) fn for_stages(stages: usize) -> Result<Self, LaunchError> {
        let pipes = (1..stages)
            .map(|_| Pipe::new())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pipes })
    }

    /// Read end feeding `stage`; none for the first stage.
    pub(crate) fn incoming(&self, stage: usize) -> Option<RawFd> {
        let pipe = self.pipes.get(stage.checked_sub(1)?)?;
        Some(pipe.read_end.as_raw_fd())
    }

    /// Write end `stage` feeds; none for the last stage.
    pub(crate) fn outgoing(&self, stage: usize) -> Option<RawFd> {
        self.pipes.get(stage).map(|pipe| pipe.write_end.as_raw_fd())
    }

    /// Every descriptor of every pipe, both ends.
    fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.pipes
            .iter()
            .flat_map(|pipe| [pipe.read_end.as_raw_fd(), pipe.write_end.as_raw_fd()])
    }
}

/// A stage converted to what `execvp` and `open` take, ready to cross a fork.
#[derive(Debug)]
struct PreparedStage {
    argv: Vec<CString>,
    input: Option<CString>,
    output: Option<CString>,
}

impl PreparedStage {
    fn new(command: &Command) -> Result<Self, LaunchError> {
        if command.argv.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let argv = command
            .argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| LaunchError::NulInArgument(arg.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            argv,
            input: command.input.as_deref().map(path_to_cstring).transpose()?,
            output: command.output.as_deref().map(path_to_cstring).transpose()?,
        })
    }

    fn program(&self) -> &CStr {
        &self.argv[0]
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, LaunchError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LaunchError::NulInArgument(path.display().to_string()))
}

/// Launch every stage of `pipeline`.
///
/// Foreground pipelines are waited on stage by stage; background pipelines return
/// their process ids at once so the caller can hand them to a [`Reaper`].
///
/// If any fork fails the whole launch is abandoned: the stages already started are
/// terminated and collected before the error is returned.
///
/// [`Reaper`]: crate::reaper::Reaper
pub fn launch(pipeline: &Pipeline) -> Result<Launched, LaunchError> {
    let stages = pipeline
        .commands
        .iter()
        .map(PreparedStage::new)
        .collect::<Result<Vec<_>, _>>()?;
    let pipes = PipeSet::for_stages(stages.len())?;

    let mut pids = Vec::with_capacity(stages.len());
    for (idx, stage) in stages.iter().enumerate() {
        match spawn_stage(stage, idx, &pipes) {
            Ok(pid) => {
                debug!(stage = idx, %pid, program = ?stage.program(), "forked");
                pids.push(pid);
            }
            Err(err) => {
                drop(pipes);
                abandon(&pids);
                return Err(err);
            }
        }
    }
    // The children hold their own copies; ours must go before waiting or the last
    // reader never sees end-of-file.
    drop(pipes);

    if pipeline.background {
        debug!(?pids, "pipeline detached");
        return Ok(Launched::Background(pids));
    }
    let statuses = pids.into_iter().map(wait_for).collect();
    Ok(Launched::Foreground(statuses))
}

fn spawn_stage(stage: &PreparedStage, idx: usize, pipes: &PipeSet) -> Result<Pid, LaunchError> {
    // SAFETY: the child only uses buffers prepared before the fork and calls
    // async-signal-safe functions until it execs or leaves through `_exit`, which
    // skips atexit handlers and stdio flushing inherited from the parent.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => run_child(stage, pipes.incoming(idx), pipes.outgoing(idx), pipes),
        Err(errno) => {
            error!(stage = idx, %errno, "fork failed");
            Err(LaunchError::Fork(errno))
        }
    }
}

/// Child side of a fork. Never returns.
fn run_child(
    stage: &PreparedStage,
    stdin_pipe: Option<RawFd>,
    stdout_pipe: Option<RawFd>,
    pipes: &PipeSet,
) -> ! {
    // A redirect wins over the pipe at either end.
    let stdin = match &stage.input {
        Some(path) => redirect(path, OFlag::O_RDONLY, STDIN),
        None => stdin_pipe.map_or(Ok(()), |fd| rebind(fd, STDIN)),
    };
    if let Err((what, errno)) = stdin {
        child_fail(what, errno, REDIRECT_FAILURE);
    }

    let stdout = match &stage.output {
        Some(path) => redirect(
            path,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            STDOUT,
        ),
        None => stdout_pipe.map_or(Ok(()), |fd| rebind(fd, STDOUT)),
    };
    if let Err((what, errno)) = stdout {
        child_fail(what, errno, REDIRECT_FAILURE);
    }

    for fd in pipes.raw_fds() {
        let _ = close(fd);
    }

    match execvp(stage.program(), &stage.argv) {
        Ok(never) => match never {},
        Err(errno) => {
            let status = if errno == Errno::ENOENT {
                NOT_FOUND
            } else {
                NOT_EXECUTABLE
            };
            child_fail(stage.program().to_bytes(), errno, status)
        }
    }
}

/// Open `path` and move it onto `target`.
fn redirect<'a>(path: &'a CStr, flags: OFlag, target: RawFd) -> Result<(), (&'a [u8], Errno)> {
    let mode = Mode::from_bits_truncate(0o644);
    let fd = open(path, flags | OFlag::O_CLOEXEC, mode).map_err(|e| (path.to_bytes(), e))?;
    if fd == target {
        // The stream was closed and the file landed on it; it must survive exec.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(|e| (path.to_bytes(), e))?;
        return Ok(());
    }
    dup2(fd, target).map_err(|e| (path.to_bytes(), e))?;
    let _ = close(fd);
    Ok(())
}

fn rebind(fd: RawFd, target: RawFd) -> Result<(), (&'static [u8], Errno)> {
    dup2(fd, target).map(drop).map_err(|e| (&b"dup2"[..], e))
}

/// Report `ERROR: <what>: <reason>` on stderr and leave the child.
fn child_fail(what: &[u8], errno: Errno, status: i32) -> ! {
    let stderr = std::io::stderr();
    let parts: [&[u8]; 5] = [b"ERROR: ", what, b": ", errno.desc().as_bytes(), b"\n"];
    for part in parts {
        let _ = unistd::write(&stderr, part);
    }
    // SAFETY: only reached in a forked child; nothing of the parent's state needs
    // unwinding or flushing.
    unsafe { nix::libc::_exit(status) }
}

/// Block until `pid` terminates.
fn wait_for(pid: Pid) -> StageStatus {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(stage_status) = StageStatus::from_wait(status) {
                    debug!(%pid, ?stage_status, "stage finished");
                    return stage_status;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                warn!(%pid, "child already collected");
                return StageStatus::Exited(0);
            }
            Err(errno) => {
                error!(%pid, %errno, "waitpid failed");
                return StageStatus::Exited(1);
            }
        }
    }
}

/// Terminate and collect stages of a launch that is being abandoned.
fn abandon(pids: &[Pid]) {
    for &pid in pids {
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            warn!(%pid, %errno, "could not terminate abandoned stage");
        }
    }
    for &pid in pids {
        wait_for(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> Command {
        Command::new(["sh", "-c", script])
    }

    #[test]
    fn test_pipe_set_has_one_pipe_between_each_pair_of_stages() {
        assert_eq!(PipeSet::for_stages(1).unwrap().raw_fds().count(), 0);
        assert_eq!(PipeSet::for_stages(4).unwrap().raw_fds().count(), 6);
    }

    #[test]
    fn test_pipe_set_accessors_connect_neighbours() {
        let pipes = PipeSet::for_stages(3).unwrap();

        assert_eq!(pipes.incoming(0), None);
        assert_eq!(pipes.outgoing(2), None);

        // stage 0 writes where stage 1 reads, stage 1 writes where stage 2 reads
        assert_eq!(pipes.outgoing(0), Some(pipes.pipes[0].write_end.as_raw_fd()));
        assert_eq!(pipes.incoming(1), Some(pipes.pipes[0].read_end.as_raw_fd()));
        assert_eq!(pipes.outgoing(1), Some(pipes.pipes[1].write_end.as_raw_fd()));
        assert_eq!(pipes.incoming(2), Some(pipes.pipes[1].read_end.as_raw_fd()));
        assert_eq!(pipes.raw_fds().count(), 4);
    }

    #[test]
    fn test_foreground_single_command_reports_exit_status() {
        let ok = launch(&Pipeline::new(vec![Command::new(["true"])])).unwrap();
        assert_eq!(ok, Launched::Foreground(vec![StageStatus::Exited(0)]));

        let failed = launch(&Pipeline::new(vec![sh("exit 3")])).unwrap();
        assert_eq!(failed.exit_code(), 3);
    }

    #[test]
    fn test_signaled_stage_maps_to_128_plus_signal() {
        let launched = launch(&Pipeline::new(vec![sh("kill -TERM $$")])).unwrap();
        assert_eq!(launched, Launched::Foreground(vec![StageStatus::Signaled(15)]));
        assert_eq!(launched.exit_code(), 143);
    }

    #[test]
    fn test_missing_program_fails_only_the_child() {
        let launched = launch(&Pipeline::new(vec![Command::new([
            "pipeshell-no-such-program-xyz",
        ])]))
        .unwrap();
        assert_eq!(launched, Launched::Foreground(vec![StageStatus::Exited(NOT_FOUND)]));
    }

    #[test]
    fn test_missing_input_file_fails_before_exec() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let command = sh(&format!("touch {}", marker.display())).with_input(dir.path().join("absent"));

        let launched = launch(&Pipeline::new(vec![command])).unwrap();

        assert_eq!(launched.exit_code(), REDIRECT_FAILURE);
        assert!(!marker.exists(), "program must not run when stdin cannot be rebound");
    }

    #[test]
    fn test_output_redirect_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::write(&out, "old contents that are longer\n").unwrap();

        let command = Command::new(["echo", "new"]).with_output(&out);
        launch(&Pipeline::new(vec![command])).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "new\n");
    }

    #[test]
    fn test_redirect_wins_over_pipe_at_the_output_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        fs::write(&input, "b\na\n").unwrap();

        let pipeline = Pipeline::new(vec![
            Command::new(["cat"]).with_input(&input),
            Command::new(["sort"]),
            Command::new(["tr", "a-z", "A-Z"]).with_output(&out),
        ]);
        let launched = launch(&pipeline).unwrap();

        assert_eq!(
            launched,
            Launched::Foreground(vec![StageStatus::Exited(0); 3])
        );
        assert_eq!(fs::read_to_string(&out).unwrap(), "A\nB\n");
    }

    #[test]
    fn test_redirect_onto_a_closed_stream_survives_exec() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let path = path_to_cstring(&out).unwrap();
        let argv = [c"echo".to_owned(), c"payload".to_owned()];

        // SAFETY: the child only closes, opens and execs, then leaves via `_exit`.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                // With stdout closed, `open` hands back descriptor 1 itself.
                let _ = close(STDOUT);
                let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
                let status = match redirect(&path, flags, STDOUT) {
                    Ok(()) => {
                        let _ = execvp(&argv[0], &argv);
                        NOT_EXECUTABLE
                    }
                    Err(_) => REDIRECT_FAILURE,
                };
                unsafe { nix::libc::_exit(status) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(wait_for(child), StageStatus::Exited(0));
                assert_eq!(fs::read_to_string(&out).unwrap(), "payload\n");
            }
        }
    }

    #[test]
    fn test_nul_in_argument_is_rejected_before_fork() {
        let err = launch(&Pipeline::new(vec![Command::new(["echo", "a\0b"])])).unwrap_err();
        assert!(matches!(err, LaunchError::NulInArgument(_)));
    }

    #[test]
    fn test_background_launch_does_not_wait() {
        let started = std::time::Instant::now();
        let launched = launch(&Pipeline::new(vec![Command::new(["sleep", "2"])]).in_background())
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        let Launched::Background(pids) = launched else {
            panic!("expected a background launch");
        };
        assert_eq!(pids.len(), 1);
        kill(pids[0], Signal::SIGKILL).unwrap();
        assert_eq!(wait_for(pids[0]), StageStatus::Signaled(Signal::SIGKILL as i32));
    }
}
