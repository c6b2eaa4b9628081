//! Integration tests that drive the smleval binary against scripted interpreters.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

const FAKE_SML: &str = r#"printf 'Fake ML v0.1\n- '
while IFS= read -r line; do
  case "$line" in
    *raise*) printf 'uncaught exception Fail [Fail: boom]\n- ' ;;
    *) printf 'val it = 2 : int\n- ' ;;
  esac
done
"#;

const SILENT_SML: &str = "sleep 5\n";

const BROKEN_SML: &str = "echo 'sml: unable to load heap image' >&2\nexit 1\n";

fn combined_output(output: &Output) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

fn smleval_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_smleval").expect("smleval test binary not built")
}

fn write_script(tag: &str, body: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("smleval-{tag}-{}.sh", std::process::id()));
    fs::write(&path, body).expect("write fake interpreter");
    path
}

fn smleval_with(script: &PathBuf) -> Command {
    let mut cmd = Command::new(smleval_bin());
    cmd.env_remove("SMLEVAL_SML_CMD")
        .env_remove("SMLEVAL_SML_ARGS")
        .env_remove("SMLEVAL_PROMPT_PATTERN")
        .env("SMLEVAL_CONFIG_DIR", env::temp_dir().join("smleval-no-config"))
        .arg("--sml-cmd")
        .arg("sh")
        .arg("--sml-args")
        .arg(shell_words::quote(&script.to_string_lossy()).into_owned());
    cmd
}

#[test]
fn smleval_help_lists_subcommands_and_flags() {
    let output = Command::new(smleval_bin())
        .arg("--help")
        .output()
        .expect("run smleval --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("smleval"));
    assert!(combined.contains("eval-region"));
    assert!(combined.contains("--prompt-pattern"));
    assert!(combined.contains("--overlay-dismiss-delay"));
}

#[test]
fn smleval_eval_prints_the_value() {
    let script = write_script("value", FAKE_SML);
    let output = smleval_with(&script)
        .args(["eval", "1 + 1"])
        .output()
        .expect("run smleval eval");
    let _ = fs::remove_file(&script);
    let combined = combined_output(&output);
    assert!(output.status.success(), "{combined}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("=> 2"), "{combined}");
}

#[test]
fn smleval_eval_full_reply_keeps_the_echo() {
    let script = write_script("full", FAKE_SML);
    let output = smleval_with(&script)
        .args(["--only-show-value", "false", "eval", "1 + 1;"])
        .output()
        .expect("run smleval eval");
    let _ = fs::remove_file(&script);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("=> val it = 2 : int"), "{stdout}");
}

#[test]
fn smleval_interpreter_error_exits_nonzero() {
    let script = write_script("error", FAKE_SML);
    let output = smleval_with(&script)
        .args(["eval", "raise Fail \"boom\""])
        .output()
        .expect("run smleval eval");
    let _ = fs::remove_file(&script);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("!! uncaught exception Fail"), "{stdout}");
}

#[test]
fn smleval_reports_startup_timeout() {
    let script = write_script("silent", SILENT_SML);
    let output = smleval_with(&script)
        .args(["--startup-timeout-ms", "200", "eval", "1 + 1"])
        .output()
        .expect("run smleval eval");
    let _ = fs::remove_file(&script);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("did not show a prompt within 200ms"), "{stdout}");
}

#[test]
fn smleval_reports_interpreter_exit_without_waiting_out_startup() {
    let script = write_script("broken", BROKEN_SML);
    let started = Instant::now();
    let output = smleval_with(&script)
        .args(["--startup-timeout-ms", "10000", "eval", "1 + 1"])
        .output()
        .expect("run smleval eval");
    let _ = fs::remove_file(&script);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("interpreter exited before showing a prompt"), "{stdout}");
    assert!(stdout.contains("unable to load heap image"), "{stdout}");
}

#[test]
fn smleval_rejects_invalid_prompt_pattern() {
    let output = Command::new(smleval_bin())
        .env("SMLEVAL_CONFIG_DIR", env::temp_dir().join("smleval-no-config"))
        .args(["--prompt-pattern", "[", "eval", "1"])
        .output()
        .expect("run smleval with bad prompt pattern");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("invalid prompt regex"));
}
