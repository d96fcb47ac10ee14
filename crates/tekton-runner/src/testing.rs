//! Test doubles for the process boundaries.
//!
//! Compiled for unit tests and, behind the `test-support` feature, for the
//! integration tests, so no external process is ever started.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::error::{Result, RunnerError};
use crate::forward::{ForwardProcess, ForwardSpec, Launcher};

struct Rule {
    program: String,
    needles: Vec<String>,
    /// Outputs handed out in order; the last one repeats.
    outputs: VecDeque<CommandOutput>,
}

impl Rule {
    fn matches(&self, inv: &Invocation) -> bool {
        inv.program == self.program
            && self
                .needles
                .iter()
                .all(|n| inv.args.iter().any(|a| a.contains(n.as_str())))
    }

    fn next_output(&mut self) -> CommandOutput {
        if self.outputs.len() > 1 {
            self.outputs.pop_front().unwrap_or_default()
        } else {
            self.outputs.front().cloned().unwrap_or_default()
        }
    }
}

/// [`CommandRunner`] answering from scripted rules and recording every call.
///
/// The first rule whose program matches and whose needles all appear in the
/// arguments answers. Unmatched invocations succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, program: &str, needles: &[&str], outputs: Vec<CommandOutput>) {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            needles: needles.iter().map(|n| (*n).to_string()).collect(),
            outputs: outputs.into(),
        });
    }

    /// Answer matching calls with `stdout`.
    pub fn on(&self, program: &str, needles: &[&str], stdout: &str) -> &Self {
        self.push(program, needles, vec![CommandOutput::ok(stdout)]);
        self
    }

    /// Answer successive matching calls with each of `stdouts` in turn.
    pub fn on_sequence(&self, program: &str, needles: &[&str], stdouts: &[&str]) {
        self.push(
            program,
            needles,
            stdouts.iter().map(|s| CommandOutput::ok(*s)).collect(),
        );
    }

    /// Fail matching calls with `stderr`.
    pub fn fail(&self, program: &str, needles: &[&str], stderr: &str) -> &Self {
        self.push(program, needles, vec![CommandOutput::failed(stderr)]);
        self
    }

    /// Every invocation seen so far.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose arguments contain `needle`.
    pub fn calls_with(&self, program: &str, needle: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program && c.args.iter().any(|a| a.contains(needle)))
            .collect()
    }

    pub fn count(&self, program: &str, needle: &str) -> usize {
        self.calls_with(program, needle).len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let mut rules = self.rules.lock().unwrap();
        Ok(rules
            .iter_mut()
            .find(|r| r.matches(invocation))
            .map(Rule::next_output)
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// [`Launcher`] that tracks how many fake forwards are alive.
#[derive(Default)]
pub struct FakeLauncher {
    live: Arc<AtomicUsize>,
    launched: Mutex<Vec<ForwardSpec>>,
    fail_with: Mutex<Option<String>>,
    delays: Mutex<HashMap<u16, Duration>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards started and not yet terminated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Every spec passed to `launch`.
    pub fn launched(&self) -> Vec<ForwardSpec> {
        self.launched.lock().unwrap().clone()
    }

    /// Hold launches on `port` for `delay` before they come up.
    pub fn delay_port(&self, port: u16, delay: Duration) {
        self.delays.lock().unwrap().insert(port, delay);
    }

    /// Make the next launch fail.
    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

struct FakeForward {
    live: Arc<AtomicUsize>,
    running: bool,
}

#[async_trait]
impl ForwardProcess for FakeForward {
    fn is_running(&mut self) -> bool {
        self.running
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>> {
        if let Some(message) = self.fail_with.lock().unwrap().take() {
            return Err(RunnerError::external("socat", message));
        }
        let delay = self.delays.lock().unwrap().get(&spec.external_port).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.launched.lock().unwrap().push(spec.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeForward {
            live: Arc::clone(&self.live),
            running: true,
        }))
    }
}
