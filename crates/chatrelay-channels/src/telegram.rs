use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chatrelay_common::{ChatId, Error, Result, UpdateId};
use teloxide::dispatching::{ShutdownToken, UpdateFilterExt};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, ChatAction, FileId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId,
    ParseMode,
};
use teloxide::{ApiError, RequestError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::telegram_fmt::to_telegram_markdown;
use crate::traits::{
    Button, ChannelLifecycle, ChannelStatus, EventKind, InboundEvent, MediaKind, MediaRef,
    MessageRef, Sender, TextFormat, Transport,
};

/// Callback invoked for every inbound event the bot understands.
///
/// The dispatcher awaits it, so events of one chat reach the callback in the
/// order Telegram delivered them while different chats run concurrently.
pub type OnEventFn =
    Arc<dyn Fn(InboundEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as an [`OnEventFn`].
pub fn event_callback<F, Fut>(f: F) -> OnEventFn
where
    F: Fn(InboundEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f(event)) })
}

/// Telegram "Group Anonymous Bot" ID used for anonymous admins.
const ANONYMOUS_BOT_ID: u64 = 1087968824;

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

fn channel_error(action: &str, e: RequestError) -> Error {
    Error::Channel(format!("telegram {action} failed: {e}"))
}

/// Long-polling receiver. Outbound calls go through [`TelegramTransport`].
pub struct TelegramChannel {
    bot: Bot,
    display: String,
    status: ChannelStatus,
    on_event: OnEventFn,
    shutdown: Option<ShutdownToken>,
    task: Option<JoinHandle<()>>,
}

impl TelegramChannel {
    pub fn new(bot: Bot, on_event: OnEventFn) -> Self {
        Self {
            bot,
            display: "Telegram".to_string(),
            status: ChannelStatus::Disconnected,
            on_event,
            shutdown: None,
            task: None,
        }
    }
}

#[async_trait]
impl ChannelLifecycle for TelegramChannel {
    fn display_name(&self) -> &str {
        &self.display
    }

    async fn connect(&mut self) -> Result<()> {
        let on_message = Arc::clone(&self.on_event);
        let on_callback = Arc::clone(&self.on_event);

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(
                move |upd: Update, msg: teloxide::types::Message| {
                    let on_event = Arc::clone(&on_message);
                    async move {
                        match parse_message(UpdateId(i64::from(upd.id.0)), &msg) {
                            Some(event) => on_event(event).await,
                            None => debug!("ignoring unsupported telegram message in chat {}", msg.chat.id),
                        }
                        respond(())
                    }
                },
            ))
            .branch(Update::filter_callback_query().endpoint(
                move |bot: Bot, upd: Update, query: CallbackQuery| {
                    let on_event = Arc::clone(&on_callback);
                    async move {
                        if let Err(e) = bot.answer_callback_query(query.id.clone()).await {
                            debug!("failed to answer callback query: {e}");
                        }
                        if let Some(event) = parse_callback(UpdateId(i64::from(upd.id.0)), &query) {
                            on_event(event).await;
                        }
                        respond(())
                    }
                },
            ));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .default_handler(|upd| async move {
                tracing::trace!("unhandled update: {:?}", upd.kind);
            })
            .build();
        self.shutdown = Some(dispatcher.shutdown_token());

        self.task = Some(tokio::spawn(async move {
            info!("telegram bot polling started");
            dispatcher.dispatch().await;
            info!("telegram bot polling stopped");
        }));

        self.status = ChannelStatus::Connected;
        info!("telegram channel connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(token) = self.shutdown.take() {
            match token.shutdown() {
                Ok(stopped) => stopped.await,
                Err(e) => warn!("telegram dispatcher was not running: {e:?}"),
            }
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("telegram polling task ended abnormally: {e}");
        }
        self.status = ChannelStatus::Disconnected;
        info!("telegram channel disconnected");
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }
}

/// Outbound Telegram Bot API calls.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    bot_username: Arc<OnceCell<String>>,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            bot_username: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    async fn username(&self) -> Result<&str> {
        let name = self
            .bot_username
            .get_or_try_init(|| async {
                let me = self
                    .bot
                    .get_me()
                    .await
                    .map_err(|e| channel_error("getMe", e))?;
                Ok::<_, Error>(me.username().to_string())
            })
            .await?;
        Ok(name.as_str())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        format: TextFormat,
        button: Option<Button>,
    ) -> Result<MessageRef> {
        let mut request = match format {
            TextFormat::Plain => self.bot.send_message(tg_chat(chat_id), text),
            TextFormat::Markdown => self
                .bot
                .send_message(tg_chat(chat_id), to_telegram_markdown(text))
                .parse_mode(ParseMode::MarkdownV2),
        };
        if let Some(button) = button {
            request = request.reply_markup(InlineKeyboardMarkup::new([[
                InlineKeyboardButton::callback(button.text, button.data),
            ]]));
        }

        let sent = request.await.map_err(|e| channel_error("sendMessage", e))?;
        Ok(MessageRef {
            chat_id,
            message_id: sent.id.0,
        })
    }

    async fn edit_message(
        &self,
        target: &MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<()> {
        let chat = tg_chat(target.chat_id);
        let id = MessageId(target.message_id);
        let result = match format {
            TextFormat::Plain => self.bot.edit_message_text(chat, id, text).await,
            TextFormat::Markdown => {
                self.bot
                    .edit_message_text(chat, id, to_telegram_markdown(text))
                    .parse_mode(ParseMode::MarkdownV2)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(channel_error("editMessageText", e)),
        }
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.bot
            .delete_message(tg_chat(target.chat_id), MessageId(target.message_id))
            .await
            .map_err(|e| channel_error("deleteMessage", e))?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: ChatId) -> Result<()> {
        self.bot
            .send_chat_action(tg_chat(chat_id), ChatAction::Typing)
            .await
            .map_err(|e| channel_error("sendChatAction", e))?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef, dest: &Path) -> Result<()> {
        let file = self
            .bot
            .get_file(FileId(media.file_id.clone()))
            .await
            .map_err(|e| channel_error("getFile", e))?;

        let mut out = tokio::fs::File::create(dest).await.map_err(|e| {
            Error::Channel(format!("failed to create {}: {e}", dest.display()))
        })?;
        self.bot
            .download_file(&file.path, &mut out)
            .await
            .map_err(|e| Error::Channel(format!("telegram file download failed: {e}")))?;
        debug!("downloaded {:?} media to {}", media.kind, dest.display());
        Ok(())
    }

    async fn invite_link(&self, code: &str) -> Result<String> {
        let username = self.username().await?;
        Ok(format!("https://t.me/{username}?start={code}"))
    }
}

/// Extract the sender, ignoring other bots and messages without a sender
/// (channel posts).
fn extract_sender(user: Option<&teloxide::types::User>) -> Option<Sender> {
    let user = user?;
    if user.is_bot && user.id.0 != ANONYMOUS_BOT_ID {
        return None;
    }
    Some(Sender {
        username: user.username.clone().unwrap_or_default(),
        full_name: user.full_name(),
    })
}

fn parse_message(update_id: UpdateId, msg: &teloxide::types::Message) -> Option<InboundEvent> {
    let sender = extract_sender(msg.from.as_ref())?;
    let forwarded = msg.forward_origin().is_some();

    let kind = if let Some(text) = msg.text() {
        EventKind::from_text(text)
    } else if let Some(voice) = msg.voice() {
        EventKind::Media {
            media: MediaRef {
                file_id: voice.file.id.0.clone(),
                kind: MediaKind::Voice,
                file_name: None,
            },
            forwarded,
        }
    } else if let Some(audio) = msg.audio() {
        EventKind::Media {
            media: MediaRef {
                file_id: audio.file.id.0.clone(),
                kind: MediaKind::Audio,
                file_name: audio.file_name.clone(),
            },
            forwarded,
        }
    } else {
        return None;
    };

    Some(InboundEvent {
        chat_id: ChatId(msg.chat.id.0),
        update_id,
        sender,
        kind,
    })
}

fn parse_callback(update_id: UpdateId, query: &CallbackQuery) -> Option<InboundEvent> {
    let data = query.data.clone()?;
    let sender = extract_sender(Some(&query.from))?;
    let chat_id = query
        .message
        .as_ref()
        .map(|m| m.chat().id.0)
        .unwrap_or(query.from.id.0 as i64);

    Some(InboundEvent {
        chat_id: ChatId(chat_id),
        update_id,
        sender,
        kind: EventKind::Callback { data },
    })
}
