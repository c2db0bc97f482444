use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub runner: RunnerConfig,
    pub control: ControlConfig,
    pub pipes: PipesConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IdentityConfig {
    pub starting_uid: u32,
    pub starting_gid: u32,
    pub max_uid: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            starting_uid: 1000,
            starting_gid: 1000,
            max_uid: 1004,
        }
    }
}

/// Fixed tokens used to build the runner prefix of every exec.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory the runner binaries are invoked from, including the trailing slash
    pub path: String,
    /// Runner names a caller may select
    pub allowed: Vec<String>,
    pub config_flag: String,
    pub config_prefix: String,
    pub environment_flag: String,
    pub memory_flag: String,
    /// Passed to the runner on every invocation
    pub additional_flag: String,
    /// Emitted between the runner flags and the caller's command when set
    pub trailing_marker: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            path: "/usr/bin/".to_string(),
            allowed: vec!["strace".to_string(), "strace+".to_string()],
            config_flag: "-e".to_string(),
            config_prefix: "trace=".to_string(),
            environment_flag: "-E".to_string(),
            memory_flag: "-O".to_string(),
            additional_flag: "-f".to_string(),
            trailing_marker: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub abort_pipe: PathBuf,
    pub shutdown_pipe: PathBuf,
    pub fallback_abort_pipe: PathBuf,
    pub fallback_shutdown_pipe: PathBuf,
    /// Process exit code used after an abort
    pub abort_exit_code: i32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            abort_pipe: PathBuf::from("/pipes/abort"),
            shutdown_pipe: PathBuf::from("/pipes/shutdown"),
            fallback_abort_pipe: PathBuf::from("/pipes/abort"),
            fallback_shutdown_pipe: PathBuf::from("/pipes/shutdown"),
            abort_exit_code: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PipesConfig {
    /// When set, every stdio endpoint must carry exactly these permission bits
    pub expected_mode: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Newline-delimited records on the daemon's own stdin, results on stdout
    Stream,
    /// A single mailbox path reopened for every record, results on stdout
    Fifo { path: PathBuf },
    /// A directory of named pipes created at startup
    Mailbox {
        base_dir: PathBuf,
        #[serde(default = "default_mailbox_mode")]
        mode: u32,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Stream
    }
}

fn default_mailbox_mode() -> u32 {
    0o660
}

impl SourceConfig {
    /// Human-readable description of the instruction transport
    pub fn description(&self) -> String {
        match self {
            SourceConfig::Stream => "stdin stream".to_string(),
            SourceConfig::Fifo { path } => format!("fifo ({})", path.display()),
            SourceConfig::Mailbox { base_dir, mode } => {
                format!("mailbox ({}, mode {mode:o})", base_dir.display())
            }
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${PIPES_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.starting_uid > self.identity.max_uid {
            anyhow::bail!(
                "starting uid {} is above max uid {}",
                self.identity.starting_uid,
                self.identity.max_uid
            );
        }
        if self.runner.allowed.is_empty() {
            anyhow::bail!("no runners are allowlisted");
        }
        if let Some(bad) = self
            .runner
            .allowed
            .iter()
            .find(|r| r.is_empty() || r.contains('/'))
        {
            anyhow::bail!("invalid runner name {bad:?}");
        }
        Ok(())
    }

    /// Full paths of the allowlisted runners, in configuration order
    pub fn runner_paths(&self) -> Vec<String> {
        self.runner
            .allowed
            .iter()
            .map(|r| format!("{}{r}", self.runner.path))
            .collect()
    }
}
