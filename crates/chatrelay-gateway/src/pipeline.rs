use std::sync::Arc;
use std::time::Duration;

use chatrelay_agents::{
    ChatMessage, CompletionRetrier, LlmProvider, LlmRequest, RetryPolicy, Transcriber, Usage,
};
use chatrelay_channels::{MediaRef, MessageRef, TextFormat, Transport};
use chatrelay_common::{
    Error, NewMessage, Result, ResultExt, Role, UpdateId, UsageRecord, User,
};
use chatrelay_config::AppConfig;
use chatrelay_db::ConversationStore;
use chatrelay_media::MediaConverter;
use chatrelay_security::Cryptor;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::messages;
use crate::streaming::{StreamAggregator, StreamSettings, deliver_final};
use crate::typing::{TYPING_INTERVAL, TypingIndicator};
use crate::window::DialogWindowManager;

/// Conversation behavior shared by every turn.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub system_prompt: String,
    pub default_model: String,
    /// Forwarded as the completion request's `user` field.
    pub caller_tag: String,
    pub streaming: bool,
    pub placeholder_text: String,
    pub stream: StreamSettings,
    pub retry: RetryPolicy,
    pub typing_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let retry = &config.retry;
        Self {
            system_prompt: config.conversation.system_prompt.clone(),
            default_model: config.openai.default_model.clone(),
            caller_tag: config.openai.caller_tag.clone(),
            streaming: config.conversation.streaming,
            placeholder_text: config.conversation.placeholder_text.clone(),
            stream: StreamSettings::from(&config.stream),
            retry: RetryPolicy::new(
                retry.initial_delay(),
                retry.factor,
                retry.max_attempts,
                retry.jitter,
                retry.attempt_timeout(),
            ),
            typing_interval: TYPING_INTERVAL,
        }
    }
}

/// Collaborators a pipeline is built from.
#[derive(Clone)]
pub struct PipelineParts {
    pub store: Arc<dyn ConversationStore>,
    pub cryptor: Arc<Cryptor>,
    pub provider: Arc<dyn LlmProvider>,
    pub transcriber: Arc<dyn Transcriber>,
    pub converter: Arc<dyn MediaConverter>,
    pub transport: Arc<dyn Transport>,
}

/// A finished completion, before it is sealed and stored.
#[derive(Debug, Clone)]
struct Completion {
    text: String,
    model: String,
    usage: Option<Usage>,
}

/// Runs one user turn end to end. Callers must hold the chat's turn guard.
pub struct RequestPipeline {
    parts: PipelineParts,
    window: DialogWindowManager,
    settings: PipelineSettings,
    retrier: CompletionRetrier,
    streaming_retrier: CompletionRetrier,
}

impl RequestPipeline {
    pub fn new(parts: PipelineParts, retention: Duration, settings: PipelineSettings) -> Self {
        let window =
            DialogWindowManager::new(Arc::clone(&parts.store), Arc::clone(&parts.cryptor), retention);
        let retrier = CompletionRetrier::new(settings.retry.clone());

        // A streamed attempt is bounded by the stream deadline, not the
        // per-request timeout.
        let mut streaming_policy = settings.retry.clone();
        streaming_policy.attempt_timeout = settings.stream.overall_timeout;
        let streaming_retrier = CompletionRetrier::new(streaming_policy);

        Self {
            parts,
            window,
            settings,
            retrier,
            streaming_retrier,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[instrument(skip(self, user, text), fields(chat_id = %user.chat_id))]
    pub async fn text_turn(&self, user: &User, update_id: UpdateId, text: &str) -> Result<()> {
        let transport = &self.parts.transport;
        let _typing = TypingIndicator::start(
            Arc::clone(transport),
            user.chat_id,
            self.settings.typing_interval,
        );

        let window = self.window.load_window(user, Utc::now()).await?;

        let mut turn = Vec::with_capacity(3);
        if window.messages.is_empty() {
            let prompt = user
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.settings.system_prompt.clone());
            turn.push(ChatMessage::new(Role::System, prompt));
        }
        turn.push(ChatMessage::new(Role::User, text));

        let mut messages = window.messages;
        messages.extend(turn.iter().cloned());
        let request = LlmRequest {
            model: user
                .model
                .clone()
                .unwrap_or_else(|| self.settings.default_model.clone()),
            user: self.settings.caller_tag.clone(),
            messages,
        };

        let placeholder = transport
            .send_message(user.chat_id, &self.settings.placeholder_text, TextFormat::Plain, None)
            .await
            .context("send placeholder")?;

        let completion = match self.complete(&request, &placeholder).await {
            Ok(completion) => completion,
            Err(e) => {
                if let Err(delete_err) = transport.delete_message(&placeholder).await {
                    debug!("failed to delete placeholder: {delete_err}");
                }
                return Err(e.with_context("chat completion"));
            }
        };

        turn.push(ChatMessage::new(Role::Assistant, completion.text.clone()));
        self.persist(user, &turn).await?;

        if let Some(usage) = completion.usage {
            let record = UsageRecord {
                chat_id: user.chat_id,
                update_id,
                dialog_id: user.dialog_id.clone(),
                model: completion.model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            };
            if let Err(e) = self.parts.store.put_usage(record).await {
                warn!("failed to record usage: {e}");
            }
        }

        info!(
            "completed turn with {} context messages, model={}, total_tokens={}",
            request.messages.len(),
            completion.model,
            completion.usage.map(|u| u.total_tokens).unwrap_or_default()
        );
        Ok(())
    }

    /// Transcribe a voice or audio message, show the transcript and, unless
    /// the message was forwarded, answer it as a text turn.
    #[instrument(skip(self, user, media), fields(chat_id = %user.chat_id))]
    pub async fn media_turn(
        &self,
        user: &User,
        update_id: UpdateId,
        media: &MediaRef,
        forwarded: bool,
    ) -> Result<()> {
        let text = {
            let _typing = TypingIndicator::start(
                Arc::clone(&self.parts.transport),
                user.chat_id,
                self.settings.typing_interval,
            );
            self.transcribe(media).await?
        };

        self.parts
            .transport
            .send_message(user.chat_id, &messages::transcript(&text), TextFormat::Plain, None)
            .await
            .context("send transcript")?;

        if forwarded {
            debug!("forwarded media, not starting a completion");
            return Ok(());
        }
        self.text_turn(user, update_id, &text).await
    }

    async fn transcribe(&self, media: &MediaRef) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let source = workdir.path().join("source");
        let converted = workdir.path().join("converted.mp3");

        self.parts
            .transport
            .download_media(media, &source)
            .await
            .context("download media")?;
        self.parts
            .converter
            .convert(&source, &converted)
            .await
            .context("convert media")?;
        let text = self
            .parts
            .transcriber
            .transcribe(&converted)
            .await
            .context("transcribe media")?;

        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Media("transcription is empty".into()));
        }
        Ok(text.to_string())
    }

    async fn complete(&self, request: &LlmRequest, placeholder: &MessageRef) -> Result<Completion> {
        let provider = self.parts.provider.as_ref();
        let transport = self.parts.transport.as_ref();
        let deadline = self.settings.stream.overall_timeout;

        let completion = if self.settings.streaming {
            let aggregator = StreamAggregator::new(transport, *placeholder, self.settings.stream);
            let attempts = self.streaming_retrier.execute(|attempt| {
                let aggregator = &aggregator;
                async move {
                    debug!("streaming completion attempt {attempt}");
                    let stream = provider.complete_stream(request).await?;
                    let outcome = aggregator.run(stream).await?;
                    Ok(Completion {
                        text: outcome.text,
                        model: outcome.model.unwrap_or_else(|| request.model.clone()),
                        usage: outcome.usage,
                    })
                }
            });
            tokio::time::timeout(deadline, attempts)
                .await
                .map_err(|_| Error::Timeout(deadline))??
        } else {
            let attempts = self.retrier.execute(|attempt| async move {
                debug!("completion attempt {attempt}");
                provider.complete(request).await
            });
            let response = tokio::time::timeout(deadline, attempts)
                .await
                .map_err(|_| Error::Timeout(deadline))??;
            if response.content.trim().is_empty() {
                return Err(Error::Agent("completion returned no text".into()));
            }
            deliver_final(transport, placeholder, &response.content).await?;
            Completion {
                text: response.content,
                model: response.model,
                usage: response.usage,
            }
        };
        Ok(completion)
    }

    /// Seal and store the turn in one batch.
    async fn persist(&self, user: &User, turn: &[ChatMessage]) -> Result<()> {
        let created_at = Utc::now();
        let batch = turn
            .iter()
            .map(|message| {
                let sealed = self.parts.cryptor.encrypt(user, &message.content)?;
                Ok(NewMessage {
                    chat_id: user.chat_id,
                    role: message.role,
                    body: sealed.body,
                    version: sealed.version,
                    created_at,
                })
            })
            .collect::<Result<Vec<_>>>()
            .context("seal messages")?;

        self.parts
            .store
            .put_messages(batch)
            .await
            .context("store messages")
    }
}
