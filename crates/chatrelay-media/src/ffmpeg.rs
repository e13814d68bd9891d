use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatrelay_common::{Error, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::MediaConverter;

const STDERR_TAIL_LINES: usize = 5;

/// Transcodes to MP3 with an external `ffmpeg` binary.
///
/// ffmpeg runs in its own process group. If the conversion is cancelled or
/// times out, the whole group is killed so no encoder children linger.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegConverter {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-nostats")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-acodec", "libmp3lame", "-qscale:a", "4"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl MediaConverter for FfmpegConverter {
    async fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let started = Instant::now();
        let child = self.command(input, output).spawn().map_err(|e| {
            Error::Media(format!("failed to start {}: {e}", self.program.display()))
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output_status = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(Error::Media(format!("failed to wait for ffmpeg: {e}"))),
            Err(_) => {
                warn!("ffmpeg exceeded {:?}, killing process group", self.timeout);
                return Err(Error::Timeout(self.timeout));
            }
        };
        group.disarm();

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(Error::Media(format!(
                "ffmpeg exited with {}: {}",
                output_status.status,
                tail.join(" | ")
            )));
        }

        debug!(
            "converted {} in {:?}",
            input.display(),
            started.elapsed()
        );
        Ok(())
    }
}

/// Kills a process group on drop unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = libc::pid_t::try_from(pgid) else {
                return;
            };
            // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc == 0 {
                debug!("killed ffmpeg process group {pgid}");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}
