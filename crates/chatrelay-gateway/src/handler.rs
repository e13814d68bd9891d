use std::sync::Arc;
use std::time::Instant;

use chatrelay_channels::{Button, EventKind, InboundEvent, TextFormat, Transport};
use chatrelay_common::{ChatId, Error, InputState, NewUser, Result, ResultExt, User};
use chatrelay_db::ConversationStore;
use tracing::{debug, error, info, warn};

use crate::coordinator::ConcurrencyCoordinator;
use crate::messages::{self, CANCEL_PROMPT_CALLBACK, RESET_CALLBACK};
use crate::pipeline::RequestPipeline;

const MAX_INVITE_CODE_LEN: usize = 64;

/// Entry point for every inbound event.
///
/// Admits the event through the [`ConcurrencyCoordinator`], authenticates the
/// sender, routes commands and turns, and reports failures to the user.
pub struct RelayHandler {
    coordinator: Arc<ConcurrencyCoordinator>,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn Transport>,
    pipeline: RequestPipeline,
    /// Models selectable with `/model`, the default first.
    models: Vec<String>,
}

impl RelayHandler {
    pub fn new(
        coordinator: Arc<ConcurrencyCoordinator>,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
        pipeline: RequestPipeline,
        extra_models: &[String],
    ) -> Self {
        let mut models = vec![pipeline.settings().default_model.clone()];
        for model in extra_models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        Self {
            coordinator,
            store,
            transport,
            pipeline,
            models,
        }
    }

    pub fn coordinator(&self) -> &Arc<ConcurrencyCoordinator> {
        &self.coordinator
    }

    pub async fn handle(&self, event: InboundEvent) {
        let started = Instant::now();
        let chat_id = event.chat_id;
        let label = event.kind.label().to_string();

        let Some(_guard) = self.coordinator.admit(chat_id).await else {
            debug!("ignoring update {} for chat {chat_id}: relay is stopping", event.update_id);
            return;
        };

        let result = self.dispatch(&event).await;
        let elapsed = started.elapsed();
        match result {
            Ok(()) => info!("handled {label} for chat {chat_id} in {elapsed:?}"),
            Err(e) => {
                error!("failed to handle {label} for chat {chat_id} after {elapsed:?}: {e}");
                self.report(chat_id, &e).await;
            }
        }
    }

    async fn report(&self, chat_id: ChatId, err: &Error) {
        let Some((text, button)) = messages::for_error(err) else {
            return;
        };
        if let Err(e) = self
            .transport
            .send_message(chat_id, text, TextFormat::Plain, button)
            .await
        {
            warn!("failed to report error to chat {chat_id}: {e}");
        }
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<()> {
        let user = self.authenticate(event).await?;

        match &event.kind {
            EventKind::Command { name, args } => self.command(&user, name, args).await,
            EventKind::Callback { data } if data == RESET_CALLBACK => self.reset(&user).await,
            EventKind::Callback { data } if data == CANCEL_PROMPT_CALLBACK => {
                self.cancel(&user).await
            }
            EventKind::Callback { data } => {
                debug!("ignoring unknown callback '{data}'");
                Ok(())
            }
            EventKind::Text(text) if user.input_state == InputState::AwaitingSystemPrompt => {
                self.apply_prompt(&user, text).await
            }
            EventKind::Text(text) => self.pipeline.text_turn(&user, event.update_id, text).await,
            EventKind::Media { media, forwarded } => {
                self.pipeline
                    .media_turn(&user, event.update_id, media, *forwarded)
                    .await
            }
        }
    }

    /// Load or create the sender. Unapproved users get in only with a valid
    /// `/start <code>`.
    async fn authenticate(&self, event: &InboundEvent) -> Result<User> {
        let mut user = self
            .store
            .create_or_get_user(NewUser {
                chat_id: event.chat_id,
                username: event.sender.username.clone(),
                full_name: event.sender.full_name.clone(),
            })
            .await
            .context("load user")?;
        if user.approved {
            return Ok(user);
        }

        let Some(code) = start_code(&event.kind) else {
            return Err(Error::NotApproved);
        };
        if !self.store.check_invite_code(&mut user, code).await? {
            info!("chat {} presented an invalid invite code", user.chat_id);
            return Err(Error::NotApproved);
        }
        info!(
            "approved chat {} (invited by {:?})",
            user.chat_id, user.invited_by
        );
        Ok(user)
    }

    async fn command(&self, user: &User, name: &str, args: &[String]) -> Result<()> {
        match name {
            "start" => self.reply(user.chat_id, messages::GREETING).await,
            "help" => self.reply(user.chat_id, messages::HELP).await,
            "reset" => self.reset(user).await,
            "invite" => {
                let code = self.store.ensure_invite_code(user.chat_id).await?;
                let link = self.transport.invite_link(&code).await?;
                self.reply(user.chat_id, &messages::invite(&link, &code)).await
            }
            "prompt" if !args.is_empty() => self.apply_prompt(user, &args.join(" ")).await,
            "prompt" => {
                self.store
                    .set_input_state(user.chat_id, InputState::AwaitingSystemPrompt)
                    .await?;
                let current = user
                    .system_prompt
                    .as_deref()
                    .unwrap_or(&self.pipeline.settings().system_prompt);
                self.transport
                    .send_message(
                        user.chat_id,
                        &messages::prompt_request(current),
                        TextFormat::Plain,
                        Some(Button::new(messages::CANCEL_BUTTON, CANCEL_PROMPT_CALLBACK)),
                    )
                    .await?;
                Ok(())
            }
            "prompt_reset" => {
                self.store.set_system_prompt(user.chat_id, None).await?;
                self.store
                    .set_input_state(user.chat_id, InputState::Empty)
                    .await?;
                self.store.reset_dialog(user.chat_id).await?;
                self.reply(user.chat_id, messages::PROMPT_RESET).await
            }
            "cancel" => self.cancel(user).await,
            "model" => self.model(user, args.first().map(String::as_str)).await,
            other => {
                debug!("unknown command /{other}");
                self.reply(user.chat_id, messages::UNKNOWN_COMMAND).await
            }
        }
    }

    async fn reset(&self, user: &User) -> Result<()> {
        let dialog_id = self.store.reset_dialog(user.chat_id).await?;
        debug!("chat {} started dialog {dialog_id}", user.chat_id);
        self.reply(user.chat_id, messages::RESET_DONE).await
    }

    async fn cancel(&self, user: &User) -> Result<()> {
        if user.input_state == InputState::Empty {
            return self.reply(user.chat_id, messages::NOTHING_TO_CANCEL).await;
        }
        self.store
            .set_input_state(user.chat_id, InputState::Empty)
            .await?;
        self.reply(user.chat_id, messages::PROMPT_UNCHANGED).await
    }

    /// Store a new system prompt. The dialog restarts so the prompt applies.
    async fn apply_prompt(&self, user: &User, prompt: &str) -> Result<()> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return self.cancel(user).await;
        }
        self.store
            .set_system_prompt(user.chat_id, Some(prompt))
            .await?;
        self.store
            .set_input_state(user.chat_id, InputState::Empty)
            .await?;
        self.store.reset_dialog(user.chat_id).await?;
        self.reply(user.chat_id, &messages::prompt_updated(prompt)).await
    }

    async fn model(&self, user: &User, requested: Option<&str>) -> Result<()> {
        let default = &self.models[0];
        let Some(requested) = requested else {
            let current = user.model.as_deref().unwrap_or(default);
            return self
                .reply(user.chat_id, &messages::models(current, &self.models))
                .await;
        };

        if requested == "default" || requested == default.as_str() {
            self.store.set_model(user.chat_id, None).await?;
            return self
                .reply(user.chat_id, &messages::model_selected(default))
                .await;
        }
        if !self.models.iter().any(|m| m == requested) {
            return self
                .reply(user.chat_id, &messages::unknown_model(requested))
                .await;
        }
        self.store.set_model(user.chat_id, Some(requested)).await?;
        self.reply(user.chat_id, &messages::model_selected(requested))
            .await
    }

    async fn reply(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.transport
            .send_message(chat_id, text, TextFormat::Plain, None)
            .await?;
        Ok(())
    }
}

/// The invite code of a `/start <code>` command, if it is one.
fn start_code(kind: &EventKind) -> Option<&str> {
    let EventKind::Command { name, args } = kind else {
        return None;
    };
    if name != "start" || args.len() != 1 {
        return None;
    }
    let code = args[0].as_str();
    (1..=MAX_INVITE_CODE_LEN)
        .contains(&code.chars().count())
        .then_some(code)
}
