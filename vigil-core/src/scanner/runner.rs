//! Executes a scanner descriptor against a target inside the tool container,
//! streaming redacted output to the event bus and returning parsed artifacts.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::ScanOutput;
use crate::scope::ScopePolicy;
use crate::types::ScanId;

use super::descriptor::ScannerDescriptor;
use super::parsers::{self, ParseContext};
use super::redact::redact_line;

/// At most this many raw lines are buffered per scan; beyond it the oldest
/// lines are dropped and the drop is noted in the persisted output.
const MAX_BUFFERED_LINES: usize = 5_000;

#[derive(Debug)]
pub struct ScannerExecution {
    pub output: ScanOutput,
    pub raw_output: String,
    pub exit_code: Option<i32>,
    pub dropped_lines: u64,
}

#[derive(Clone, Debug)]
pub struct ScannerRunner {
    container: String,
    raw_output_cap: usize,
}

impl ScannerRunner {
    pub fn new(container: String, raw_output_cap: usize) -> Self {
        Self {
            container,
            raw_output_cap,
        }
    }

    /// Run one scanner. The caller has already passed the scope gate; this
    /// method only executes and parses.
    pub async fn run(
        &self,
        descriptor: &ScannerDescriptor,
        scan_id: ScanId,
        target: &str,
        batch_targets: &[String],
        scope: &ScopePolicy,
        events: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<ScannerExecution> {
        let mut command = Command::new("docker");
        command.arg("exec");
        if descriptor.batch_stdin {
            command.arg("-i");
        }
        command.arg(&self.container);
        for arg in descriptor.argv {
            if *arg == "{target}" {
                command.arg(target);
            } else {
                command.arg(arg);
            }
        }
        // Batch scanners read a newline-separated target list from stdin
        // (`httpx -l /dev/stdin` style input without a temp file).
        if descriptor.batch_stdin {
            command.args(["-l", "/dev/stdin"]);
        }
        command
            .stdin(if descriptor.batch_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::DependencyUnreachable(format!("tool container: {e}")))?;

        if descriptor.batch_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let feed = if batch_targets.is_empty() {
                    format!("{target}\n")
                } else {
                    let mut joined = batch_targets.join("\n");
                    joined.push('\n');
                    joined
                };
                stdin.write_all(feed.as_bytes()).await?;
                drop(stdin);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("scanner stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Internal("scanner stderr not captured".to_string()))?;

        let mut lines_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut buffer: VecDeque<String> = VecDeque::new();
        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        let mut dropped: u64 = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(descriptor.timeout_secs);

        let mut stdout_open = true;
        let mut stderr_open = true;
        let exit_status = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(EngineError::ScannerTimeout {
                        scanner: descriptor.kind.as_str().to_string(),
                        timeout_secs: descriptor.timeout_secs,
                    });
                }
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(EngineError::Cancelled(format!(
                        "scan {scan_id} cancelled"
                    )));
                }
                line = lines_reader.next_line(), if stdout_open => {
                    match line? {
                        Some(line) => {
                            let redacted = redact_line(&line);
                            if buffer.len() >= MAX_BUFFERED_LINES {
                                buffer.pop_front();
                                dropped += 1;
                            }
                            buffer.push_back(redacted.clone());
                            events.publish(EngineEvent::ScanLine {
                                scan_id,
                                line: redacted,
                            });
                        }
                        None => stdout_open = false,
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line? {
                        Some(line) => {
                            if stderr_tail.len() >= 50 {
                                stderr_tail.pop_front();
                            }
                            stderr_tail.push_back(redact_line(&line));
                        }
                        None => stderr_open = false,
                    }
                }
                status = child.wait(), if !stdout_open && !stderr_open => {
                    break status?;
                }
            }
        };

        let exit_code = exit_status.code();
        let stdout_lines: Vec<String> = buffer.into_iter().collect();

        if !exit_status.success() && stdout_lines.is_empty() {
            let stderr_text: Vec<String> = stderr_tail.into_iter().collect();
            return Err(EngineError::Scanner(format!(
                "{} exited with {:?}: {}",
                descriptor.kind,
                exit_code,
                stderr_text.join(" | ")
            )));
        }

        let ctx = ParseContext { scope, target };
        let mut output = parsers::parse(descriptor.parser, &stdout_lines, &ctx);
        if !exit_status.success() {
            output.warnings.push(format!(
                "{} exited {:?} but produced parseable output",
                descriptor.kind, exit_code
            ));
        }

        let mut raw_output = String::new();
        if dropped > 0 {
            raw_output.push_str(&format!("[{dropped} earlier lines dropped]\n"));
        }
        raw_output.push_str(&stdout_lines.join("\n"));
        raw_output.truncate(floor_char_boundary(&raw_output, self.raw_output_cap));

        Ok(ScannerExecution {
            output,
            raw_output,
            exit_code,
            dropped_lines: dropped,
        })
    }
}

fn floor_char_boundary(raw: &str, max: usize) -> usize {
    if raw.len() <= max {
        return raw.len();
    }
    let mut end = max;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    end
}
