//! Invocation of the amd-smi CLI.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::SmiConfig;
use crate::error::SourceError;

/// Something that produces a raw amd-smi JSON document.
#[async_trait]
pub trait SmiSource: Send + Sync {
    /// Fetch one document. Called once per collection cycle.
    async fn fetch(&self) -> Result<Vec<u8>, SourceError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Runs the amd-smi binary and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandSource {
    config: SmiConfig,
}

impl CommandSource {
    pub fn new(config: SmiConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

#[async_trait]
impl SmiSource for CommandSource {
    async fn fetch(&self) -> Result<Vec<u8>, SourceError> {
        let command = self.describe();
        debug!(command = %command, "Executing amd-smi");

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                command: command.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(SourceError::Spawn { command, source }),
            Err(_) => {
                return Err(SourceError::Timeout {
                    command,
                    timeout: self.timeout(),
                });
            }
        };

        if !output.status.success() {
            return Err(SourceError::Exit {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    fn describe(&self) -> String {
        let mut parts = Vec::with_capacity(self.config.args.len() + 1);
        parts.push(self.config.command.as_str());
        parts.extend(self.config.args.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Serves a fixed document, or a fixed failure, on every fetch.
#[derive(Debug, Clone)]
pub struct StaticSource {
    document: Result<Vec<u8>, String>,
}

impl StaticSource {
    pub fn new(document: impl Into<Vec<u8>>) -> Self {
        Self {
            document: Ok(document.into()),
        }
    }

    /// A source whose fetch always fails as if amd-smi could not be run.
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self {
            document: Err(stderr.into()),
        }
    }
}

#[async_trait]
impl SmiSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<u8>, SourceError> {
        match &self.document {
            Ok(bytes) => Ok(bytes.clone()),
            Err(stderr) => Err(SourceError::Spawn {
                command: self.describe(),
                source: std::io::Error::other(stderr.clone()),
            }),
        }
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sh(script: &str, timeout_secs: u64) -> CommandSource {
        CommandSource::new(SmiConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::from([("COLUMNS".to_string(), "1000".to_string())]),
            timeout_secs,
        })
    }

    #[tokio::test]
    async fn test_command_source_returns_stdout() {
        let source = sh("printf '[]'", 5);
        let bytes = source.fetch().await.unwrap();
        assert_eq!(bytes, b"[]");
    }

    #[tokio::test]
    async fn test_command_source_passes_env() {
        let source = sh("printf '%s' \"$COLUMNS\"", 5);
        let bytes = source.fetch().await.unwrap();
        assert_eq!(bytes, b"1000");
    }

    #[tokio::test]
    async fn test_command_source_non_zero_exit() {
        let source = sh("echo 'no GPUs found' >&2; exit 3", 5);
        let err = source.fetch().await.unwrap_err();
        match err {
            SourceError::Exit { stderr, status, .. } => {
                assert_eq!(stderr, "no GPUs found");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_command_source_timeout() {
        let source = sh("sleep 5", 1);
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_command_source_missing_binary() {
        let source = CommandSource::new(SmiConfig {
            command: "/nonexistent/amd-smi".to_string(),
            ..SmiConfig::default()
        });
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Spawn { .. }));
    }

    #[test]
    fn test_describe() {
        let source = CommandSource::new(SmiConfig::default());
        assert_eq!(source.describe(), "amd-smi metric --json");
    }

    #[tokio::test]
    async fn test_static_source() {
        assert_eq!(StaticSource::new("[]").fetch().await.unwrap(), b"[]");
        assert!(StaticSource::failing("boom").fetch().await.is_err());
    }
}
