//! Builds the argv handed to the exec primitive.
//!
//! The argv is a plain vector of arguments, never a shell string, so
//! nothing here quotes or escapes. Validation is limited to the runner
//! allowlist, the config token charset and the shape of environment
//! entries.
use crate::config::RunnerConfig;
use crate::error::ExecError;
use crate::instruction::Instruction;

/// Immutable runner allowlist plus the flag tokens of every invocation.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    config: RunnerConfig,
    /// Fixed arguments inserted before every caller command
    subcommand_prefix: Vec<String>,
}

impl RunnerSpec {
    pub fn new(config: RunnerConfig, subcommand_prefix: Vec<String>) -> Self {
        Self {
            config,
            subcommand_prefix,
        }
    }

    pub fn is_allowed(&self, runner: &str) -> bool {
        self.config.allowed.iter().any(|allowed| allowed == runner)
    }

    /// Validates `instruction` and returns the full argv, runner binary first.
    pub fn build(&self, instruction: &Instruction) -> Result<Vec<String>, ExecError> {
        if !self.is_allowed(&instruction.runner) {
            return Err(ExecError::DisallowedRunner {
                runner: instruction.runner.clone(),
                allowed: self.config.allowed.clone(),
            });
        }
        if !is_config_token(&instruction.runner_config) {
            return Err(ExecError::InvalidRunnerConfig(
                instruction.runner_config.clone(),
            ));
        }

        let mut argv = vec![
            format!("{}{}", self.config.path, instruction.runner),
            self.config.config_flag.clone(),
            format!("{}{}", self.config.config_prefix, instruction.runner_config),
            self.config.additional_flag.clone(),
        ];

        if instruction.runner_memory > 0 {
            argv.push(self.config.memory_flag.clone());
            argv.push(instruction.runner_memory.to_string());
        }

        for (key, value) in &instruction.runner_environment {
            if !is_environment_entry(key, value) {
                return Err(ExecError::InvalidEnvironment(key.clone()));
            }
            argv.push(self.config.environment_flag.clone());
            argv.push(format!("{key}={value}"));
        }

        if let Some(marker) = &self.config.trailing_marker {
            argv.push(marker.clone());
        }
        argv.extend(self.subcommand_prefix.iter().cloned());
        argv.extend(instruction.command.iter().cloned());
        Ok(argv)
    }
}

/// `[A-Za-z0-9_-]+`
pub fn is_config_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

// Keys may not be empty or contain '=' (the runner splits on the first one).
// NUL cannot cross exec in either half.
fn is_environment_entry(key: &str, value: &str) -> bool {
    !key.is_empty() && !key.contains(['=', '\0']) && !value.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> RunnerSpec {
        RunnerSpec::new(RunnerConfig::default(), Vec::new())
    }

    fn instruction(runner: &str, config: &str, command: &[&str]) -> Instruction {
        Instruction {
            command: command.iter().map(|s| s.to_string()).collect(),
            runner: runner.to_string(),
            runner_config: config.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_basic_argv() {
        let argv = spec()
            .build(&instruction("strace", "net", &["echo", "hi"]))
            .unwrap();
        assert_eq!(
            argv,
            vec!["/usr/bin/strace", "-e", "trace=net", "-f", "echo", "hi"]
        );
    }

    #[test]
    fn test_build_with_memory_and_environment() {
        let mut i = instruction("strace+", "file_io-2", &["python3", "-c", "print(1)"]);
        i.runner_memory = 1 << 20;
        i.runner_environment = BTreeMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/tmp/home dir".to_string()),
        ]);
        let argv = spec().build(&i).unwrap();
        assert_eq!(
            argv,
            vec![
                "/usr/bin/strace+",
                "-e",
                "trace=file_io-2",
                "-f",
                "-O",
                "1048576",
                "-E",
                "HOME=/tmp/home dir",
                "-E",
                "PATH=/usr/bin",
                "python3",
                "-c",
                "print(1)",
            ]
        );
    }

    #[test]
    fn test_non_positive_memory_is_unlimited() {
        for memory in [0, -1, i64::MIN] {
            let mut i = instruction("strace", "net", &["true"]);
            i.runner_memory = memory;
            let argv = spec().build(&i).unwrap();
            assert!(!argv.contains(&"-O".to_string()));
        }
    }

    #[test]
    fn test_environment_order_is_deterministic() {
        let mut a = instruction("strace", "net", &["env"]);
        let mut b = a.clone();
        for (k, v) in [("Z", "1"), ("A", "2"), ("M", "3")] {
            a.runner_environment.insert(k.to_string(), v.to_string());
        }
        for (k, v) in [("M", "3"), ("Z", "1"), ("A", "2")] {
            b.runner_environment.insert(k.to_string(), v.to_string());
        }
        assert_eq!(spec().build(&a).unwrap(), spec().build(&b).unwrap());
    }

    #[test]
    fn test_disallowed_runner() {
        let err = spec()
            .build(&instruction("bash", "net", &["echo"]))
            .unwrap_err();
        assert!(matches!(err, ExecError::DisallowedRunner { ref runner, .. } if runner == "bash"));
        // Path tricks are just unknown names
        assert!(spec().build(&instruction("../strace", "net", &["echo"])).is_err());
        assert!(spec().build(&instruction("", "net", &["echo"])).is_err());
    }

    #[test]
    fn test_runner_checked_before_config() {
        let err = spec().build(&instruction("bash", "", &["echo"])).unwrap_err();
        assert!(matches!(err, ExecError::DisallowedRunner { .. }));
    }

    #[test]
    fn test_invalid_config_tokens() {
        for bad in ["", " ", "net ", "a;b", "$(id)", "a/b", "trace=net", "ü", "a\nb", "*"] {
            let err = spec()
                .build(&instruction("strace", bad, &["echo"]))
                .unwrap_err();
            assert!(
                matches!(err, ExecError::InvalidRunnerConfig(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_valid_config_tokens() {
        for good in ["net", "NET", "a-b_c", "0", "-", "_"] {
            assert!(is_config_token(good), "{good:?} should be accepted");
        }
    }

    #[test]
    fn test_invalid_environment_entries() {
        for (k, v) in [("", "x"), ("A=B", "x"), ("A\0", "x"), ("A", "x\0y")] {
            let mut i = instruction("strace", "net", &["env"]);
            i.runner_environment.insert(k.to_string(), v.to_string());
            assert!(matches!(
                spec().build(&i),
                Err(ExecError::InvalidEnvironment(_))
            ));
        }
    }

    #[test]
    fn test_environment_values_pass_verbatim() {
        let mut i = instruction("strace", "net", &["env"]);
        i.runner_environment
            .insert("X".to_string(), "$(rm -rf /); `id` 'q' \"d\"=".to_string());
        let argv = spec().build(&i).unwrap();
        assert_eq!(argv[5], "X=$(rm -rf /); `id` 'q' \"d\"=");
    }

    #[test]
    fn test_trailing_marker_and_subcommand_prefix() {
        let config = RunnerConfig {
            trailing_marker: Some("--".to_string()),
            ..Default::default()
        };
        let spec = RunnerSpec::new(config, vec!["/usr/bin/timeout".to_string(), "10".to_string()]);
        let argv = spec.build(&instruction("strace", "net", &["echo", "hi"])).unwrap();
        assert_eq!(
            argv,
            vec![
                "/usr/bin/strace",
                "-e",
                "trace=net",
                "-f",
                "--",
                "/usr/bin/timeout",
                "10",
                "echo",
                "hi"
            ]
        );
    }
}
