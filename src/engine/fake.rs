//! Scriptable command runner for tests
//!
//! Responses are matched by argv prefix, most recently scripted first.
//! Every invocation lands in a call log with a monotonic sequence number for
//! both its start and its end, so tests can assert on ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub tool: String,
    pub args: Vec<String>,
    pub started: u64,
    pub finished: u64,
}

impl Call {
    pub fn verb(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    pub fn line(&self) -> String {
        self.args.join(" ")
    }
}

#[derive(Debug, Clone)]
struct Script {
    tool: Option<String>,
    prefix: Vec<String>,
    output: Option<CommandOutput>,
    delay: Option<Duration>,
    times: Option<usize>,
}

#[derive(Default)]
struct State {
    scripts: Vec<Script>,
    calls: Vec<Call>,
}

/// Records calls and replays canned output
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<State>>,
    clock: Arc<AtomicU64>,
}

fn words(prefix: &str) -> Vec<String> {
    prefix.split_whitespace().map(str::to_string).collect()
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        combined: stdout.as_bytes().to_vec(),
        stdout: stdout.as_bytes().to_vec(),
        success: true,
        code: Some(0),
    }
}

pub fn fail(combined: &str) -> CommandOutput {
    CommandOutput {
        combined: combined.as_bytes().to_vec(),
        stdout: Vec::new(),
        success: false,
        code: Some(1),
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, script: Script) {
        self.state.lock().scripts.push(script);
    }

    /// Respond to any tool invocation whose args start with `prefix`
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(Script {
            tool: None,
            prefix: words(prefix),
            output: Some(output),
            delay: None,
            times: None,
        });
        self
    }

    /// Respond only for the given tool
    pub fn on_tool(&self, tool: &str, prefix: &str, output: CommandOutput) -> &Self {
        self.push(Script {
            tool: Some(tool.to_string()),
            prefix: words(prefix),
            output: Some(output),
            delay: None,
            times: None,
        });
        self
    }

    /// Respond `times` times, then fall through to older scripts
    pub fn on_times(&self, prefix: &str, output: CommandOutput, times: usize) -> &Self {
        self.push(Script {
            tool: None,
            prefix: words(prefix),
            output: Some(output),
            delay: None,
            times: Some(times),
        });
        self
    }

    /// Sleep before answering matching calls
    pub fn delay(&self, prefix: &str, delay: Duration) -> &Self {
        self.push(Script {
            tool: None,
            prefix: words(prefix),
            output: None,
            delay: Some(delay),
            times: None,
        });
        self
    }

    /// Make matching calls fail to spawn
    pub fn unavailable(&self, prefix: &str) -> &Self {
        self.push(Script {
            tool: None,
            prefix: words(prefix),
            output: None,
            delay: None,
            times: Some(usize::MAX),
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Arg lines of every recorded call, in start order
    pub fn lines(&self) -> Vec<String> {
        let mut calls = self.calls();
        calls.sort_by_key(|c| c.started);
        calls.iter().map(Call::line).collect()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls().iter().filter(|c| c.verb() == verb).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }
}

enum Planned {
    Respond(CommandOutput),
    Unavailable,
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, tool: &str, args: &[String]) -> Result<CommandOutput> {
        let started = self.tick();

        let (delay, planned) = {
            let mut state = self.state.lock();
            let mut delay = None;
            let mut planned = None;
            for script in state.scripts.iter_mut().rev() {
                if script.tool.as_deref().map(|t| t != tool).unwrap_or(false) {
                    continue;
                }
                if !args.starts_with(&script.prefix) {
                    continue;
                }
                if script.delay.is_some() {
                    delay = delay.or(script.delay);
                    continue;
                }
                if planned.is_some() {
                    continue;
                }
                match script.times {
                    Some(0) => continue,
                    Some(ref mut n) if *n != usize::MAX => *n -= 1,
                    _ => {}
                }
                planned = Some(match &script.output {
                    Some(output) => Planned::Respond(output.clone()),
                    None => Planned::Unavailable,
                });
            }
            (delay, planned.unwrap_or_else(|| Planned::Respond(ok(""))))
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let finished = self.tick();
        self.state.lock().calls.push(Call {
            tool: tool.to_string(),
            args: args.to_vec(),
            started,
            finished,
        });

        match planned {
            Planned::Respond(output) => Ok(output),
            Planned::Unavailable => Err(Error::EngineUnavailable(format!(
                "{} is not running",
                tool
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        words(line)
    }

    #[tokio::test]
    async fn test_latest_script_wins() {
        let fake = FakeRunner::new();
        fake.on("get", ok("first"));
        fake.on("get -Hp", ok("second"));

        let out = fake.run("zpool", &args("get -Hp name")).await.unwrap();
        assert_eq!(out.stdout_str(), "second");

        let out = fake.run("zpool", &args("get size")).await.unwrap();
        assert_eq!(out.stdout_str(), "first");

        let out = fake.run("zpool", &args("status")).await.unwrap();
        assert!(out.success);
        assert_eq!(fake.count("get"), 2);
    }

    #[tokio::test]
    async fn test_times_falls_through() {
        let fake = FakeRunner::new();
        fake.on("status", ok("healthy"));
        fake.on_times("status", fail("boom"), 1);

        assert!(!fake.run("zpool", &args("status")).await.unwrap().success);
        assert!(fake.run("zpool", &args("status")).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let fake = FakeRunner::new();
        fake.unavailable("status");
        assert!(fake.run("zpool", &args("status")).await.is_err());
        assert_eq!(fake.calls().len(), 1);
    }
}
