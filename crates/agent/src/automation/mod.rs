//! Interactive automation engine.
//!
//! Drives a child that expects a human: output is watched on both streams,
//! scripted input is written to stdin in rule order, and the child can be
//! interrupted after a rule fires. All timers are plain deadlines evaluated by
//! one `select!` loop, so rule order never depends on which stream spoke first.

pub mod scanner;

use std::io;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace, warn};

use relay_core::task::AutoResponseRule;

use crate::config::AutomationConfig;
use crate::process::{self, CommandLine};
use scanner::{Arming, CompiledRule, Window};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Spawned,
    ResponseArmed(usize),
    ResponseFired(usize),
    Draining,
    Closed,
}

/// How the child was attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Inherited stdio; only the exit code is observed.
    #[default]
    Passthrough,
    /// Piped stdio driven by auto-response rules.
    Scripted,
    /// Handed to a terminal window.
    Terminal,
    /// Non-interactive: piped output, no input.
    Captured,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineOutcome {
    pub mode: Mode,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Rule indices in the order they fired.
    pub fired: Vec<usize>,
    /// Rules passed over because a later timer came due first.
    pub skipped: Vec<usize>,
    pub interrupted: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] io::Error),
    #[error("i/o with child failed: {0}")]
    Io(#[from] io::Error),
}

pub struct AutomationEngine {
    shell: String,
    config: AutomationConfig,
    max_output_bytes: usize,
}

impl AutomationEngine {
    pub fn new(shell: impl Into<String>, config: AutomationConfig, max_output_bytes: usize) -> Self {
        Self {
            shell: shell.into(),
            config,
            max_output_bytes,
        }
    }

    /// Run `cmd` under `rules`. No rules means plain passthrough.
    pub async fn run(
        &self,
        cmd: &CommandLine,
        rules: &[AutoResponseRule],
    ) -> Result<EngineOutcome, EngineError> {
        if rules.is_empty() {
            return self.passthrough(cmd, vec![]).await;
        }
        if !self.config.patterns_enabled {
            let warning = "pattern matching is disabled; auto-responses skipped".to_string();
            warn!(command = %cmd.line, "{warning}");
            return self.passthrough(cmd, vec![warning]).await;
        }
        match scanner::compile(rules) {
            Ok(compiled) => self.scripted(cmd, compiled).await,
            Err(e) => {
                let warning = format!("{e}; auto-responses skipped");
                warn!(command = %cmd.line, "{warning}");
                self.passthrough(cmd, vec![warning]).await
            }
        }
    }

    async fn passthrough(
        &self,
        cmd: &CommandLine,
        warnings: Vec<String>,
    ) -> Result<EngineOutcome, EngineError> {
        let exit_code = process::run_passthrough(&self.shell, cmd)
            .await
            .map_err(EngineError::Spawn)?;
        Ok(EngineOutcome {
            mode: Mode::Passthrough,
            exit_code,
            warnings,
            ..Default::default()
        })
    }

    async fn scripted(
        &self,
        cmd: &CommandLine,
        rules: Vec<CompiledRule>,
    ) -> Result<EngineOutcome, EngineError> {
        let mut child = process::grouped_shell_command(&self.shell, cmd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(EngineError::Spawn)?;
        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let mut session = Session::new(&self.config, rules, self.max_output_bytes);
        session.transition(EngineState::Spawned);
        session.arm(0, Instant::now());

        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];

        loop {
            if session.exited && stdout.is_none() && stderr.is_none() {
                break;
            }
            let timer = session.next_timer();
            let deadline = timer.map(|(at, _)| at);

            tokio::select! {
                read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                    match read? {
                        0 => stdout = None,
                        n => session.on_output(Stream::Stdout, &out_buf[..n]).await,
                    }
                }
                read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                    match read? {
                        0 => stderr = None,
                        n => session.on_output(Stream::Stderr, &err_buf[..n]).await,
                    }
                }
                status = child.wait(), if !session.exited => {
                    session.on_exit(status?.code());
                }
                _ = sleep_or_never(deadline) => {
                    if let Some((_, timer)) = timer {
                        if session.on_timer(timer, &mut child, &mut stdin).await {
                            stdout = None;
                            stderr = None;
                        }
                    }
                }
            }
        }

        session.transition(EngineState::Closed);
        Ok(session.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Fire rule `index`, skipping any pending rules before it.
    Fire { index: usize, bootstrap: bool },
    Interrupt,
    Kill,
    /// Stop waiting on pipes still held open after the child exited.
    DrainTimeout,
}

struct Session<'a> {
    config: &'a AutomationConfig,
    rules: Vec<CompiledRule>,
    state: EngineState,
    spawned_at: Instant,
    cursor: usize,
    fire_at: Option<Instant>,
    rules_done: bool,
    bootstrap_done: bool,
    saw_output: bool,
    echo_failed: bool,
    windows: [Window; 2],
    collected: [Vec<u8>; 2],
    max_output_bytes: usize,
    interrupt_at: Option<Instant>,
    kill_at: Option<Instant>,
    drain_until: Option<Instant>,
    exited: bool,
    outcome: EngineOutcome,
}

impl<'a> Session<'a> {
    fn new(config: &'a AutomationConfig, rules: Vec<CompiledRule>, max_output_bytes: usize) -> Self {
        Self {
            config,
            rules,
            state: EngineState::Idle,
            spawned_at: Instant::now(),
            cursor: 0,
            fire_at: None,
            rules_done: false,
            bootstrap_done: false,
            saw_output: false,
            echo_failed: false,
            windows: [Window::default(), Window::default()],
            collected: [Vec::new(), Vec::new()],
            max_output_bytes,
            interrupt_at: None,
            kill_at: None,
            drain_until: None,
            exited: false,
            outcome: EngineOutcome {
                mode: Mode::Scripted,
                ..Default::default()
            },
        }
    }

    fn transition(&mut self, next: EngineState) {
        trace!(from = ?self.state, to = ?next, "engine state");
        self.state = next;
    }

    fn arm(&mut self, index: usize, now: Instant) {
        self.cursor = index;
        if index >= self.rules.len() {
            self.rules_done = true;
            self.fire_at = None;
            self.transition(EngineState::Draining);
            return;
        }
        let rule = &self.rules[index];
        self.fire_at = match rule.arming() {
            Arming::Immediate => Some(self.spawned_at + rule.rule.delay()),
            Arming::Delayed => Some(now + rule.rule.delay()),
            Arming::Triggered => None,
        };
        self.transition(EngineState::ResponseArmed(index));
        self.scan_trigger();
    }

    /// Arm the current triggered rule's delay if its pattern is already in
    /// the unconsumed output of either stream.
    fn scan_trigger(&mut self) {
        if self.rules_done || self.fire_at.is_some() {
            return;
        }
        let rule = &self.rules[self.cursor];
        let Some(pattern) = &rule.pattern else {
            return;
        };
        for slot in [Stream::Stdout as usize, Stream::Stderr as usize] {
            if let Some(end) = self.windows[slot].find(pattern) {
                self.windows[slot].consume_to(end);
                self.windows[1 - slot].consume_all();
                debug!(rule = self.cursor, stream = slot, "trigger matched");
                self.fire_at = Some(Instant::now() + rule.rule.delay());
                return;
            }
        }
    }

    fn next_timer(&self) -> Option<(Instant, Timer)> {
        let mut best: Option<(Instant, Timer)> = None;

        if !self.exited && !self.rules_done {
            if let Some(at) = self.fire_at {
                earliest(&mut best, at, Timer::Fire { index: self.cursor, bootstrap: false });
            }
            for (index, rule) in self.rules.iter().enumerate().skip(self.cursor + 1) {
                if rule.arming() == Arming::Immediate {
                    let at = self.spawned_at + rule.rule.delay();
                    earliest(&mut best, at, Timer::Fire { index, bootstrap: false });
                }
            }
            if !self.bootstrap_done && !self.saw_output {
                let target = self
                    .rules
                    .iter()
                    .enumerate()
                    .skip(self.cursor)
                    .find(|(_, r)| r.arming() != Arming::Triggered);
                if let Some((index, rule)) = target {
                    if rule.arming() == Arming::Delayed {
                        let at = self.spawned_at + Duration::from_millis(self.config.bootstrap_ms);
                        earliest(&mut best, at, Timer::Fire { index, bootstrap: true });
                    }
                }
            }
        }
        if !self.exited {
            if let Some(at) = self.interrupt_at {
                earliest(&mut best, at, Timer::Interrupt);
            }
            if let Some(at) = self.kill_at {
                earliest(&mut best, at, Timer::Kill);
            }
        }
        if let Some(at) = self.drain_until {
            earliest(&mut best, at, Timer::DrainTimeout);
        }
        best
    }

    async fn on_output(&mut self, stream: Stream, chunk: &[u8]) {
        self.saw_output = true;
        let slot = stream as usize;

        if !(self.rules_done && !self.config.collect_after_rules) {
            let room = self.max_output_bytes.saturating_sub(self.collected[slot].len());
            self.collected[slot].extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        if self.config.echo_output {
            let echoed = match stream {
                Stream::Stdout => tokio::io::stdout().write_all(chunk).await,
                Stream::Stderr => tokio::io::stderr().write_all(chunk).await,
            };
            if let Err(e) = echoed {
                if !self.echo_failed {
                    debug!(?stream, error = %e, "echoing child output failed");
                    self.echo_failed = true;
                }
            }
        }

        if self.rules_done {
            return;
        }
        self.windows[slot].push(chunk);
        self.scan_trigger();
    }

    fn on_exit(&mut self, code: Option<i32>) {
        debug!(exit_code = ?code, "child exited");
        self.exited = true;
        self.outcome.exit_code = code;
        self.interrupt_at = None;
        self.kill_at = None;
        self.drain_until = Some(Instant::now() + Duration::from_millis(self.config.kill_after_ms));
        if !matches!(self.state, EngineState::Draining) {
            self.transition(EngineState::Draining);
        }
    }

    /// Handle a due timer. Returns true when the output pipes should be abandoned.
    async fn on_timer(
        &mut self,
        timer: Timer,
        child: &mut Child,
        stdin: &mut Option<ChildStdin>,
    ) -> bool {
        let now = Instant::now();
        match timer {
            Timer::Fire { index, bootstrap } => {
                if bootstrap {
                    self.bootstrap_done = true;
                }
                self.outcome.skipped.extend(self.cursor..index);
                self.fire(index, stdin, now).await;
            }
            Timer::Interrupt => {
                self.interrupt_at = None;
                match process::interrupt(child) {
                    Ok(()) => {
                        debug!("interrupt sent");
                        self.outcome.interrupted = true;
                        self.kill_at = Some(now + Duration::from_millis(self.config.kill_after_ms));
                    }
                    Err(e) => self.warn(format!("interrupt failed: {e}")),
                }
            }
            Timer::Kill => {
                self.kill_at = None;
                if let Err(e) = process::kill_group(child) {
                    self.warn(format!("kill failed: {e}"));
                }
            }
            Timer::DrainTimeout => {
                self.drain_until = None;
                return true;
            }
        }
        false
    }

    async fn fire(&mut self, index: usize, stdin: &mut Option<ChildStdin>, now: Instant) {
        let bytes = self.rules[index].rule.input_bytes();
        if let Some(pipe) = stdin.as_mut() {
            let written = match pipe.write_all(&bytes).await {
                Ok(()) => pipe.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.warn(format!("writing input for rule {index} failed: {e}"));
            }
        }
        self.outcome.fired.push(index);
        self.transition(EngineState::ResponseFired(index));
        debug!(rule = index, "auto-response fired");

        if self.rules[index].rule.close_after {
            self.interrupt_at = Some(now + Duration::from_millis(self.config.close_grace_ms));
            self.rules_done = true;
            self.fire_at = None;
            self.transition(EngineState::Draining);
        } else {
            self.arm(index + 1, now);
        }
    }

    fn warn(&mut self, warning: String) {
        warn!("{warning}");
        self.outcome.warnings.push(warning);
    }

    fn finish(self) -> EngineOutcome {
        let [out, err] = self.collected;
        EngineOutcome {
            stdout: process::lossy(out),
            stderr: process::lossy(err),
            ..self.outcome
        }
    }
}

fn earliest(best: &mut Option<(Instant, Timer)>, at: Instant, timer: Timer) {
    if best.map_or(true, |(current, _)| at < current) {
        *best = Some((at, timer));
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
