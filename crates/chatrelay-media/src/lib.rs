pub mod ffmpeg;

use async_trait::async_trait;
use chatrelay_common::Result;
use std::path::Path;

pub use ffmpeg::FfmpegConverter;

/// Converts a downloaded voice or audio file into a format the transcriber accepts.
#[async_trait]
pub trait MediaConverter: Send + Sync {
    async fn convert(&self, input: &Path, output: &Path) -> Result<()>;
}
