// src/session/stage.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered pipeline stages a run moves through.
///
/// `Done` is a sentinel: processing "until done" means processing until the
/// last real stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStage {
    Nop,
    Load,
    Build,
    Compile,
    Run,
    Postprocess,
    Done,
}

impl RunStage {
    /// The stages that do actual work, in order.
    pub const WORK: [RunStage; 5] = [
        RunStage::Load,
        RunStage::Build,
        RunStage::Compile,
        RunStage::Run,
        RunStage::Postprocess,
    ];

    /// `Done` is treated like the last real stage.
    pub fn effective(self) -> RunStage {
        match self {
            RunStage::Done => RunStage::Postprocess,
            other => other,
        }
    }

    pub fn next(self) -> Option<RunStage> {
        match self {
            RunStage::Nop => Some(RunStage::Load),
            RunStage::Load => Some(RunStage::Build),
            RunStage::Build => Some(RunStage::Compile),
            RunStage::Compile => Some(RunStage::Run),
            RunStage::Run => Some(RunStage::Postprocess),
            RunStage::Postprocess => Some(RunStage::Done),
            RunStage::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Nop => "NOP",
            RunStage::Load => "LOAD",
            RunStage::Build => "BUILD",
            RunStage::Compile => "COMPILE",
            RunStage::Run => "RUN",
            RunStage::Postprocess => "POSTPROCESS",
            RunStage::Done => "DONE",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NOP" => Ok(RunStage::Nop),
            "LOAD" => Ok(RunStage::Load),
            "BUILD" => Ok(RunStage::Build),
            "COMPILE" => Ok(RunStage::Compile),
            "RUN" => Ok(RunStage::Run),
            "POSTPROCESS" => Ok(RunStage::Postprocess),
            "DONE" => Ok(RunStage::Done),
            other => Err(format!("invalid stage: {other}")),
        }
    }
}
