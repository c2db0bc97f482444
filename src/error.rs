use std::path::PathBuf;

/// Conditions that terminate the whole daemon.
///
/// Anything that could leave a later instruction running with credentials
/// other than the ones intended lands here. Per-instruction execution
/// failures are reported as a status byte instead (see `executor::StatusByte`).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("using a disallowed runner {runner:?}, not within {allowed:?}")]
    DisallowedRunner { runner: String, allowed: Vec<String> },

    #[error("invalid runner configuration token {0:?}")]
    InvalidRunnerConfig(String),

    #[error("invalid runner environment entry {0:?}")]
    InvalidEnvironment(String),

    #[error("uid {uid} is higher than the maximum ({max_uid}): restart required")]
    IdentityExhausted { uid: u32, max_uid: u32 },

    #[error("failed to switch filesystem gid to {requested}, still {actual}")]
    CredentialSwitch { requested: u32, actual: u32 },

    #[error("failed to open {path}: {source}")]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permission bits of {path} are {actual:o}, expected {expected:o}: possible tampering")]
    PermissionMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("{0} bytes in command buffer before exit code has been sent")]
    ProtocolViolation(usize),

    #[error("instruction stream error: {0}")]
    Source(#[source] std::io::Error),

    #[error("result channel error: {0}")]
    Report(#[source] std::io::Error),

    #[error("privileged section failed: {0}")]
    PrivilegedSection(String),
}
