//! Child process plumbing shared by the runner and the automation engine.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// A shell line plus where and how to run it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandLine {
    pub line: String,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Output of a piped, non-interactive run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captured {
    /// `None` when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn shell_flag(shell: &str) -> &'static str {
    let name = shell.rsplit(['/', '\\']).next().unwrap_or(shell);
    if name.eq_ignore_ascii_case("cmd") || name.eq_ignore_ascii_case("cmd.exe") {
        "/C"
    } else {
        "-c"
    }
}

/// `<shell> -c <line>` with the working dir and env applied. Stdio is left to the caller.
pub fn shell_command(shell: &str, cmd: &CommandLine) -> Command {
    let mut command = Command::new(shell);
    command.arg(shell_flag(shell)).arg(&cmd.line);
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir);
    }
    command.envs(cmd.env.iter());
    command.kill_on_drop(true);
    command
}

/// [`shell_command`] with the child leading its own process group, so a
/// signal reaches every process the line starts. Only for piped runs: a
/// passthrough child must stay in the terminal's foreground group.
pub fn grouped_shell_command(shell: &str, cmd: &CommandLine) -> Command {
    #[allow(unused_mut)]
    let mut command = shell_command(shell, cmd);
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Run with piped output, keeping at most `max_bytes` per stream.
///
/// On timeout the whole process group is killed, so grandchildren holding
/// the pipes cannot keep the run alive.
pub async fn run_captured(
    shell: &str,
    cmd: &CommandLine,
    timeout: Option<Duration>,
    max_bytes: usize,
) -> io::Result<Captured> {
    let mut child = grouped_shell_command(shell, cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let wait = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map(|s| (s.code(), false)),
                Err(_) => {
                    kill_group(&mut child)?;
                    child.wait().await?;
                    Ok((None, true))
                }
            },
            None => child.wait().await.map(|s| (s.code(), false)),
        }
    };

    let (out, err, status) = tokio::join!(
        read_capped(stdout, max_bytes),
        read_capped(stderr, max_bytes),
        wait
    );
    let (exit_code, timed_out) = status?;

    Ok(Captured {
        exit_code,
        stdout: lossy(out?),
        stderr: lossy(err?),
        timed_out,
    })
}

/// Run with the agent's own stdio. Only the exit code is observed.
pub async fn run_passthrough(shell: &str, cmd: &CommandLine) -> io::Result<Option<i32>> {
    let status = shell_command(shell, cmd)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;
    Ok(status.code())
}

/// Hand the line to a terminal launcher: `<terminal...> <shell> -c <line>`.
pub async fn run_in_terminal(
    terminal_command: &[String],
    shell: &str,
    cmd: &CommandLine,
) -> io::Result<Option<i32>> {
    let Some((program, args)) = terminal_command.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no terminal command configured",
        ));
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .arg(shell)
        .arg(shell_flag(shell))
        .arg(&cmd.line)
        .envs(cmd.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir);
    }
    let status = command.status().await?;
    Ok(status.code())
}

/// Ask the child's process group to stop (SIGINT). A child that was already
/// reaped is left alone.
#[cfg(unix)]
pub fn interrupt(child: &mut Child) -> io::Result<()> {
    signal_group(child, nix::sys::signal::Signal::SIGINT)
}

#[cfg(not(unix))]
pub fn interrupt(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// SIGKILL the child's process group, falling back to the child alone when
/// it does not lead one.
#[cfg(unix)]
pub fn kill_group(child: &mut Child) -> io::Result<()> {
    match signal_group(child, nix::sys::signal::Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(_) => child.start_kill(),
    }
}

#[cfg(not(unix))]
pub fn kill_group(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    killpg(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max_bytes: usize) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(kept);
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = max_bytes.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(kept)
}

pub(crate) fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn line(s: &str) -> CommandLine {
        CommandLine {
            line: s.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let out = run_captured("sh", &line("printf out; printf err >&2; exit 3"), None, 1024)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn truncates_output_per_stream() {
        let out = run_captured("sh", &line("printf 0123456789"), None, 4).await.unwrap();
        assert_eq!(out.stdout, "0123");
        assert!(out.success());
    }

    #[tokio::test]
    async fn applies_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = line("printf \"$GREETING \"; pwd");
        cmd.env.insert("GREETING".into(), "hi".into());
        cmd.working_dir = Some(dir.path().display().to_string());
        let out = run_captured("sh", &cmd, None, 4096).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.starts_with("hi "));
        assert!(out.stdout.trim_end().ends_with(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let out = run_captured("sh", &line("exec sleep 5"), Some(Duration::from_millis(100)), 64)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
    }

    #[tokio::test]
    async fn timeout_reaches_grandchildren() {
        let started = std::time::Instant::now();
        let out = run_captured("sh", &line("sleep 3; echo done"), Some(Duration::from_millis(100)), 64)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert_eq!(out.stdout, "");
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn interrupt_reaches_the_whole_group() {
        let mut child = grouped_shell_command("sh", &line("sleep 5; sleep 5"))
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        interrupt(&mut child).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("group did not stop")
            .unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_working_dir_is_a_spawn_error() {
        let mut cmd = line("true");
        cmd.working_dir = Some("/definitely/not/here".into());
        assert!(run_captured("sh", &cmd, None, 64).await.is_err());
    }

    #[tokio::test]
    async fn empty_terminal_command_is_rejected() {
        let err = run_in_terminal(&[], "sh", &line("true")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
