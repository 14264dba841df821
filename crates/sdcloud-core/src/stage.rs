//! Stage identifiers and outcome classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The worker pool a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Cpu,
    Gpu,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::Cpu => f.write_str("cpu"),
            Pool::Gpu => f.write_str("gpu"),
        }
    }
}

impl FromStr for Pool {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Pool::Cpu),
            "gpu" => Ok(Pool::Gpu),
            other => Err(Error::InvalidInput(format!("unknown pool: {other}"))),
        }
    }
}

/// A dotted `pool.name` stage identifier, e.g. `cpu.stage_0` or `gpu.stage_2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId {
    pool: Pool,
    name: String,
}

impl StageId {
    pub fn new(pool: Pool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pool, self.name)
    }
}

impl FromStr for StageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pool, name) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidInput(format!("malformed stage id: {s}")))?;
        if name.is_empty() {
            return Err(Error::InvalidInput(format!("malformed stage id: {s}")));
        }
        Ok(Self {
            pool: pool.parse()?,
            name: name.to_string(),
        })
    }
}

impl TryFrom<String> for StageId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageId> for String {
    fn from(id: StageId) -> Self {
        id.to_string()
    }
}

/// The result of running a single stage's container to completion.
///
/// Classification follows a strict priority order: a read timeout on the log
/// stream always wins (the container is force-removed and the stage is
/// fatal), then a `Traceback` in the captured log, then the `ExitCodeError`
/// sentinel emitted by the shell trap; anything else is a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success { log: String },
    Fatal { log: String, reason: FatalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    ReadTimeout,
    Traceback,
    ExitCodeError,
}

impl StageOutcome {
    /// Classify captured container logs in the priority order the container
    /// runner contract requires.
    pub fn classify(log: &str, timed_out: bool) -> Self {
        if timed_out {
            return StageOutcome::Fatal {
                log: log.to_string(),
                reason: FatalReason::ReadTimeout,
            };
        }
        if log.contains("Traceback") {
            return StageOutcome::Fatal {
                log: log.to_string(),
                reason: FatalReason::Traceback,
            };
        }
        if log.contains("ExitCodeError") {
            return StageOutcome::Fatal {
                log: log.to_string(),
                reason: FatalReason::ExitCodeError,
            };
        }
        StageOutcome::Success {
            log: log.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }
}
