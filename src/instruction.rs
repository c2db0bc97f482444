//! Instruction records and their decoding.
//!
//! One record is one line of JSON. Records that fail to decode, or that
//! neither create a user nor name a command, are dropped by the daemon
//! with a warning and never produce a status byte.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// One job submitted by the caller.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Instruction {
    /// Arguments appended after the runner prefix
    pub command: Vec<String>,
    /// Allocate the next uid/gid pair instead of running a command
    pub create_new_user: bool,
    /// `[A-Za-z0-9_-]+` token handed to the runner after its config prefix
    pub runner_config: String,
    pub runner_environment: BTreeMap<String, String>,
    /// Byte limit for the runner; zero or negative means unlimited
    pub runner_memory: i64,
    /// Must name an allowlisted runner
    pub runner: String,
    pub stdin_pipe_path: PathBuf,
    pub stdout_pipe_path: PathBuf,
    pub stderr_pipe_path: PathBuf,
    /// Group that can open the three pipes (stdin for reading, stdout/stderr for writing)
    pub gid: u32,
}

/// What the daemon should do with a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    CreateUser,
    Execute,
}

/// Why a record was skipped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("blank record")]
    Blank,
    #[error("malformed record: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("instruction has no command and does not create a user")]
    Empty,
}

impl Instruction {
    pub fn kind(&self) -> InstructionKind {
        if self.create_new_user {
            InstructionKind::CreateUser
        } else {
            InstructionKind::Execute
        }
    }
}

/// Decodes one newline-delimited record.
pub fn decode(record: &[u8]) -> Result<Instruction, DecodeError> {
    if record.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Blank);
    }
    let instruction: Instruction =
        serde_json::from_slice(record).map_err(DecodeError::Malformed)?;
    if !instruction.create_new_user && instruction.command.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(instruction)
}
