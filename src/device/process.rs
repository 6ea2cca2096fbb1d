//! Local-shell pseudo device.
//!
//! Drives a persistent shell process as if it were a test PC: commands go
//! to the shell's stdin, stdout/stderr lines accumulate in a rolling
//! buffer that `expect` polls. Useful for self-tests and for scripts whose
//! `[PC_*]` sections target the local machine.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::time::Instant;

use super::{Device, DeviceError, DeviceResult};
use crate::config::ProcessDeviceConfig;

pub struct ProcessDevice {
    name: String,
    child: Child,
    stdin: ChildStdin,
    buffer: Arc<Mutex<String>>,
    cursor: usize,
    poll: Duration,
    keep_running: bool,
}

impl ProcessDevice {
    /// Spawns the shell and starts draining its output into the buffer.
    pub async fn spawn(
        name: &str,
        config: &ProcessDeviceConfig,
        poll: Duration,
    ) -> DeviceResult<Self> {
        let mut command = tokio::process::Command::new(&config.shell);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| DeviceError::Connection(format!("failed to spawn {}: {e}", config.shell)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeviceError::Connection("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Connection("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeviceError::Connection("stderr not captured".to_string()))?;

        let buffer = Arc::new(Mutex::new(String::new()));

        let stdout_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
                .map(|line: Result<String, std::io::Error>| line.unwrap_or_default());
        let stderr_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
                .map(|line: Result<String, std::io::Error>| line.unwrap_or_default());
        let mut combined = stream::select(stdout_stream, stderr_stream);

        let sink = buffer.clone();
        tokio::spawn(async move {
            while let Some(line) = combined.next().await {
                if let Ok(mut guard) = sink.lock() {
                    guard.push_str(&line);
                    guard.push('\n');
                }
            }
        });

        Ok(Self {
            name: name.to_string(),
            child,
            stdin,
            buffer,
            cursor: 0,
            poll,
            keep_running: false,
        })
    }

    fn unread(&self) -> String {
        let guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        guard[self.cursor.min(guard.len())..].to_string()
    }
}

#[async_trait]
impl Device for ProcessDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, text: &str) -> DeviceResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Err(DeviceError::Connection(format!(
                "shell exited with {status}"
            )));
        }
        self.stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| DeviceError::SendFailed(e.to_string()))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| DeviceError::SendFailed(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| DeviceError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn expect(&mut self, pattern: &str, timeout: Duration) -> DeviceResult<(bool, String)> {
        let re = Regex::new(pattern).map_err(|e| DeviceError::Pattern {
            pattern: pattern.to_string(),
            source: Box::new(e),
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            {
                let guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                let start = self.cursor.min(guard.len());
                if let Some(m) = re.find(&guard[start..]) {
                    let end = start + m.end();
                    let seen = guard[start..end].to_string();
                    drop(guard);
                    self.cursor = end;
                    return Ok((true, seen));
                }
            }

            // A zero timeout checks the current buffer exactly once.
            if timeout.is_zero() || Instant::now() >= deadline {
                return Ok((false, self.unread()));
            }
            let remaining = deadline - Instant::now();
            tokio::time::sleep(self.poll.min(remaining)).await;
        }
    }

    fn get_buffer(&self) -> String {
        self.unread()
    }

    fn set_keep_running(&mut self, keep: bool) {
        self.keep_running = keep;
    }

    fn keep_running(&self) -> bool {
        self.keep_running
    }
}

impl Drop for ProcessDevice {
    fn drop(&mut self) {
        // Best effort; the child reaps on runtime shutdown otherwise.
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config() -> ProcessDeviceConfig {
        ProcessDeviceConfig {
            shell: "/bin/sh".to_string(),
            working_dir: None,
            keep_running: false,
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut dev = ProcessDevice::spawn("PC1", &sh_config(), Duration::from_millis(20))
            .await
            .unwrap();

        dev.send("echo fos_ready").await.unwrap();
        let (matched, seen) = dev
            .expect("fos_ready", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matched, "buffer was: {seen}");
    }

    #[tokio::test]
    async fn test_buffer_advances_monotonically() {
        let mut dev = ProcessDevice::spawn("PC1", &sh_config(), Duration::from_millis(20))
            .await
            .unwrap();

        dev.send("echo first_marker").await.unwrap();
        let (matched, _) = dev
            .expect("first_marker", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matched);

        // Already-consumed output is not matched again.
        let (matched, _) = dev.expect("first_marker", Duration::ZERO).await.unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn test_expect_timeout_zero_checks_once() {
        let mut dev = ProcessDevice::spawn("PC1", &sh_config(), Duration::from_millis(20))
            .await
            .unwrap();
        let (matched, _) = dev.expect("never_present", Duration::ZERO).await.unwrap();
        assert!(!matched);
    }
}
