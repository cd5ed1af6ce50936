use pipeshell::Interpreter;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn run(sh: &mut Interpreter, line: &str) -> (i32, String) {
    let mut err = Vec::new();
    let code = sh.eval(line, &mut err);
    (code, String::from_utf8(err).unwrap())
}

fn quoted(path: &Path) -> String {
    format!("'{}'", path.display())
}

#[test]
fn test_three_stage_pipeline_composes_transformations() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    fs::write(&input, "pear\napple\nfig\n").unwrap();

    let mut sh = Interpreter::default();
    let line = format!(
        "cat < {} | sort | tr a-z A-Z > {}",
        quoted(&input),
        quoted(&output)
    );
    let (code, err) = run(&mut sh, &line);

    assert_eq!(code, 0, "stderr: {err}");
    assert_eq!(fs::read_to_string(&output).unwrap(), "APPLE\nFIG\nPEAR\n");
}

#[test]
fn test_redirects_on_a_single_command_in_either_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    fs::write(&input, "one\ntwo\n").unwrap();

    let mut sh = Interpreter::default();
    for (idx, order) in ["in-first", "out-first"].into_iter().enumerate() {
        let output = dir.path().join(format!("out{idx}.txt"));
        let line = match order {
            "in-first" => format!("wc -l < {} > {}", quoted(&input), quoted(&output)),
            _ => format!("wc -l > {} < {}", quoted(&output), quoted(&input)),
        };
        assert_eq!(run(&mut sh, &line).0, 0);
        assert_eq!(fs::read_to_string(&output).unwrap().trim(), "2");
    }
}

#[test]
fn test_long_chain_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    fs::write(&input, "through the chain\n").unwrap();

    let mut line = format!("cat < {}", quoted(&input));
    for _ in 0..8 {
        line.push_str(" | cat");
    }
    line.push_str(&format!(" > {}", quoted(&output)));

    let mut sh = Interpreter::default();
    assert_eq!(run(&mut sh, &line).0, 0);
    assert_eq!(fs::read_to_string(&output).unwrap(), "through the chain\n");
}

#[test]
fn test_background_pipeline_does_not_block() {
    let mut sh = Interpreter::default();
    let started = Instant::now();
    let (code, err) = run(&mut sh, "sleep 3 | cat &");
    assert_eq!(code, 0, "stderr: {err}");
    assert!(started.elapsed() < Duration::from_secs(3));

    let deadline = Instant::now() + Duration::from_secs(15);
    let mut collected = 0;
    while collected < 2 && Instant::now() < deadline {
        collected += sh.reap_background();
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(collected, 2);
}

#[test]
fn test_cd_with_two_arguments_keeps_working_directory() {
    let before = std::env::current_dir().unwrap();
    let mut sh = Interpreter::default();

    let (code, err) = run(&mut sh, "cd one two");

    assert_eq!(code, 1);
    assert_eq!(err, "ERROR: usage: cd <dir>\n");
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[test]
fn test_unknown_program_fails_with_127() {
    let mut sh = Interpreter::default();
    let (code, _) = run(&mut sh, "pipeshell-definitely-not-a-program");
    assert_eq!(code, 127);
}

#[test]
fn test_missing_input_file_fails_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");

    let mut sh = Interpreter::default();
    let line = format!(
        "cat < {} > {}",
        quoted(&dir.path().join("absent.txt")),
        quoted(&output)
    );
    assert_ne!(run(&mut sh, &line).0, 0);
    assert!(!output.exists());
}

#[test]
fn test_misplaced_output_redirect_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");

    let mut sh = Interpreter::default();
    let (code, err) = run(&mut sh, &format!("echo hi > {} | cat", quoted(&output)));

    assert_eq!(code, 2);
    assert_eq!(
        err,
        "ERROR: invalid input: output redirect must terminate the pipeline\n"
    );
    assert!(!output.exists());
}

#[test]
fn test_binary_runs_a_script_without_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");
    let script = format!(
        "echo hello | tr a-z A-Z > {}\nls &\nexit\necho unreachable > {}\n",
        quoted(&output),
        quoted(&dir.path().join("never.txt"))
    );

    let mut child = Command::new(env!("CARGO_BIN_EXE_pipeshell"))
        .arg("-n")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    let result = child.wait_with_output().unwrap();

    assert!(result.status.success(), "{result:?}");
    assert_eq!(fs::read_to_string(&output).unwrap(), "HELLO\n");
    assert!(!dir.path().join("never.txt").exists());
    assert!(!String::from_utf8_lossy(&result.stdout).contains("login by"));
}

#[test]
fn test_binary_reports_errors_and_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");
    let script = format!("| cat\necho after > {}\n", quoted(&output));

    let mut child = Command::new(env!("CARGO_BIN_EXE_pipeshell"))
        .arg("--no-prompt")
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    let result = child.wait_with_output().unwrap();

    assert!(result.status.success());
    assert_eq!(
        String::from_utf8_lossy(&result.stderr),
        "ERROR: invalid input: empty command in pipeline\n"
    );
    assert_eq!(fs::read_to_string(&output).unwrap(), "after\n");
}

#[test]
fn test_binary_survives_non_utf8_line() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");
    let mut script = b"echo \xff\n".to_vec();
    script.extend_from_slice(format!("echo after > {}\n", quoted(&output)).as_bytes());

    let mut child = Command::new(env!("CARGO_BIN_EXE_pipeshell"))
        .arg("-n")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(&script).unwrap();
    let result = child.wait_with_output().unwrap();

    assert!(result.status.success(), "{result:?}");
    assert!(result.stderr.is_empty(), "{result:?}");
    assert_eq!(fs::read_to_string(&output).unwrap(), "after\n");
}
