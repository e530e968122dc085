use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Program and arguments for one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScript {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Spawn,
    StdinWrite,
    NonZeroExit,
    Parse,
    Timeout,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Spawn => "spawn",
            FailureStage::StdinWrite => "stdin-write",
            FailureStage::NonZeroExit => "nonzero-exit",
            FailureStage::Parse => "parse",
            FailureStage::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub stage: FailureStage,
    pub diagnostic: String,
}

impl WorkerFailure {
    pub fn new(stage: FailureStage, diagnostic: impl Into<String>) -> Self {
        Self {
            stage,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Terminal result of one worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(WorkerFailure),
}

impl Outcome {
    pub fn failure(stage: FailureStage, diagnostic: impl Into<String>) -> Self {
        Outcome::Failure(WorkerFailure::new(stage, diagnostic))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure(failure) => failure.stage.as_str(),
        }
    }
}

/// Runs a worker to completion. Implementations never error out of `invoke`:
/// every failure is reported as `Outcome::Failure`.
#[async_trait]
pub trait WorkerRunner: Send + Sync + 'static {
    async fn invoke(&self, script: &WorkerScript, payload: Vec<u8>) -> Outcome;
}
