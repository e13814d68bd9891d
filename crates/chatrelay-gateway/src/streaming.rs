//! Coalesces a streamed completion into periodic edits of one chat message.
//!
//! A single future owns the token stream and three timers: the flush ticker,
//! the idle watchdog (reset on every chunk) and the overall deadline. Whichever
//! fires first wins the `select!`; returning or dropping the future drops the
//! stream, which cancels the upstream request.

use std::time::Duration;

use chatrelay_agents::{LlmStream, Usage};
use chatrelay_channels::{MessageRef, TextFormat, Transport};
use chatrelay_common::{Error, Result};
use chatrelay_config::StreamConfig;
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Upper bound for one intermediate edit.
const EDIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub flush_interval: Duration,
    pub idle_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            idle_timeout: config.idle_timeout(),
            overall_timeout: config.overall_timeout(),
        }
    }
}

/// Result of a completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

pub struct StreamAggregator<'a> {
    transport: &'a dyn Transport,
    target: MessageRef,
    settings: StreamSettings,
}

impl<'a> StreamAggregator<'a> {
    pub fn new(transport: &'a dyn Transport, target: MessageRef, settings: StreamSettings) -> Self {
        Self {
            transport,
            target,
            settings,
        }
    }

    /// Drive `stream` to completion, editing the target message as text
    /// arrives. The final text is sent once more with Markdown formatting.
    pub async fn run(&self, mut stream: LlmStream) -> Result<StreamOutcome> {
        let StreamSettings {
            flush_interval,
            idle_timeout,
            overall_timeout,
        } = self.settings;

        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let idle = tokio::time::sleep(idle_timeout);
        let overall = tokio::time::sleep(overall_timeout);
        tokio::pin!(idle, overall);

        let mut text = String::new();
        let mut sent = String::new();
        let mut model = None;
        let mut usage = None;
        let mut chunks = 0usize;

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        chunks += 1;
                        text.push_str(&chunk.delta);
                        model = chunk.model.or(model);
                        usage = chunk.usage.or(usage);
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                _ = ticker.tick() => {
                    if text.trim() != sent.trim() {
                        // The stream is not polled while the edit runs, so that
                        // time does not count against it.
                        let editing = Instant::now();
                        let edit = self.transport.edit_message(&self.target, &text, TextFormat::Plain);
                        match tokio::time::timeout(EDIT_TIMEOUT, edit).await {
                            Ok(Ok(())) => sent.clone_from(&text),
                            Ok(Err(e)) => debug!("intermediate edit failed: {e}"),
                            Err(_) => debug!("intermediate edit timed out after {EDIT_TIMEOUT:?}"),
                        }
                        let deadline = idle.deadline() + editing.elapsed();
                        idle.as_mut().reset(deadline);
                    }
                }
                _ = &mut idle => {
                    warn!("completion stream stalled after {chunks} chunks");
                    return Err(Error::StreamStalled(idle_timeout));
                }
                _ = &mut overall => {
                    warn!("completion stream exceeded {overall_timeout:?}");
                    return Err(Error::Timeout(overall_timeout));
                }
            }
        }

        if text.trim().is_empty() {
            return Err(Error::Agent("completion stream returned no text".into()));
        }

        deliver_final(self.transport, &self.target, &text).await?;
        debug!(
            "stream finished: {chunks} chunks, {} chars in {:?}",
            text.len(),
            started.elapsed()
        );
        Ok(StreamOutcome { text, model, usage })
    }
}

/// Show the finished reply with Markdown, falling back to plain text when the
/// transport rejects the formatted version.
pub(crate) async fn deliver_final(
    transport: &dyn Transport,
    target: &MessageRef,
    text: &str,
) -> Result<()> {
    if let Err(e) = transport.edit_message(target, text, TextFormat::Markdown).await {
        warn!("markdown edit rejected, sending plain text: {e}");
        transport.edit_message(target, text, TextFormat::Plain).await?;
    }
    Ok(())
}
