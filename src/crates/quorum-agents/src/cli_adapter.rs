//! Subprocess adapter: fronts a CLI binary as an `Agent` (§4.C Subprocess
//! discipline). Grounded on `orca::executor::adapter::ToolAdapter`'s
//! `async_trait` shape, but wrapping a `tokio::process::Command` child
//! instead of an in-process tool.

use crate::model::{AgentCapabilities, AgentEvent, CliAgentSpec, ExecuteOptions, ExecuteResult};
use crate::traits::{Agent, EventHandler};
use async_trait::async_trait;
use quorum_core::{logging::sanitize_for_logging, CoreError, ErrorCode, Result};
use regex::Regex;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const GRACE_PERIOD: Duration = Duration::from_secs(3);

fn looks_like_secret(var_name: &str) -> bool {
    static PATTERN: &str = r"(?i)(key|token|secret|password|credential)";
    Regex::new(PATTERN).map(|re| re.is_match(var_name)).unwrap_or(false)
}

pub struct CliAgent {
    spec: CliAgentSpec,
    handler: Mutex<Option<EventHandler>>,
}

impl CliAgent {
    pub fn new(spec: CliAgentSpec) -> Self {
        Self { spec, handler: Mutex::new(None) }
    }

    fn emit(&self, event: AgentEvent) {
        if let Ok(guard) = self.handler.lock() {
            if let Some(handler) = guard.as_ref() {
                handler(event);
            }
        }
    }

    fn build_command(&self, options: &ExecuteOptions) -> Command {
        let mut cmd = Command::new(&self.spec.binary);
        cmd.args(&self.spec.base_args);
        cmd.current_dir(&options.workdir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let (Some(model), Some(template)) = (&options.model, &self.spec.model_flag_template) {
            for part in template.replace("{model}", model).split_whitespace() {
                cmd.arg(part);
            }
        }

        if !options.denied_tools.is_empty() {
            if let Some(template) = &self.spec.deny_flag_template {
                let joined = options.denied_tools.iter().cloned().collect::<Vec<_>>().join(",");
                for part in template.replace("{tools}", &joined).split_whitespace() {
                    cmd.arg(part);
                }
            }
        }

        cmd.env_clear();
        for key in &self.spec.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for key in &options.env_passthrough {
            if looks_like_secret(key) && !self.spec.env_allowlist.contains(key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd
    }

    async fn terminate(child: &mut tokio::process::Child) {
        // Polite: close stdin so a well-behaved CLI sees EOF and exits.
        drop(child.stdin.take());
        let waited = tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
        if waited.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.spec.capabilities
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(&self.spec.binary);
        cmd.arg("--version");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let spawn = cmd.spawn();
        let mut child = match spawn {
            Ok(c) => c,
            Err(_) => {
                return Err(CoreError::new(
                    ErrorCode::AgentNotFound,
                    format!("agent binary not found on PATH: {}", self.spec.binary),
                ))
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                Err(CoreError::new(ErrorCode::Cancelled, "ping cancelled"))
            }
            result = tokio::time::timeout(Duration::from_secs(5), child.wait()) => {
                match result {
                    Ok(Ok(status)) if status.success() => Ok(()),
                    Ok(Ok(status)) => Err(CoreError::new(ErrorCode::AgentFatal, format!("ping exited with {status}"))),
                    Ok(Err(e)) => Err(CoreError::internal(e.to_string())),
                    Err(_) => {
                        let _ = child.start_kill();
                        Err(CoreError::new(ErrorCode::AgentTimeout, "ping timed out"))
                    }
                }
            }
        }
    }

    async fn execute(&self, options: ExecuteOptions, cancel: &CancellationToken) -> Result<ExecuteResult> {
        let start = Instant::now();
        let mut cmd = self.build_command(&options);

        let mut child = cmd.spawn().map_err(|_| {
            CoreError::new(ErrorCode::AgentNotFound, format!("agent binary not found on PATH: {}", self.spec.binary))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = options.prompt.clone();
            let _ = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let agent_name = self.spec.name.clone();
        let streaming = self.spec.capabilities.supports_streaming;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut buffered = String::new();
        let mut last_parsed: Option<ExecuteResult> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    Self::terminate(&mut child).await;
                    return Err(CoreError::new(ErrorCode::Cancelled, "agent execution cancelled"));
                }
                _ = tokio::time::sleep(options.timeout), if !options.timeout.is_zero() => {
                    Self::terminate(&mut child).await;
                    return Err(CoreError::new(ErrorCode::AgentTimeout, format!("{agent_name} exceeded {:?}", options.timeout)));
                }
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            if streaming {
                                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                                    self.emit(AgentEvent::new("agent_progress", &agent_name, "progress").with_data(value.clone()));
                                    if let Ok(partial) = serde_json::from_value::<ExecuteResult>(value) {
                                        last_parsed = Some(partial);
                                    }
                                } else {
                                    buffered.push_str(&text);
                                    buffered.push('\n');
                                }
                            } else {
                                buffered.push_str(&text);
                                buffered.push('\n');
                            }
                        }
                        Ok(None) => break,
                        Err(e) => return Err(CoreError::internal(e.to_string())),
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(text)) = line {
                        warn!(agent = %agent_name, "{}", sanitize_for_logging(&text));
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| CoreError::internal(e.to_string()))?;
        if !status.success() {
            let classified = classify_exit(&status);
            return Err(CoreError::new(classified, format!("{agent_name} exited with {status}")));
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        if let Some(mut result) = last_parsed {
            result.duration_ms = duration_ms;
            return Ok(result);
        }

        Ok(ExecuteResult {
            content: buffered,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            artifacts: Vec::new(),
            duration_ms,
        })
    }

    fn set_event_handler(&self, handler: EventHandler) {
        if let Ok(mut guard) = self.handler.lock() {
            *guard = Some(handler);
        }
    }
}

fn classify_exit(status: &std::process::ExitStatus) -> ErrorCode {
    match status.code() {
        Some(42) => ErrorCode::AgentRateLimited,
        Some(77) => ErrorCode::AgentAuth,
        Some(_) => ErrorCode::AgentTransient,
        None => ErrorCode::AgentFatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_like_names_are_detected() {
        assert!(looks_like_secret("API_KEY"));
        assert!(looks_like_secret("GITHUB_TOKEN"));
        assert!(looks_like_secret("password"));
        assert!(!looks_like_secret("WORKDIR"));
    }
}
