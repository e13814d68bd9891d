//! User-facing replies.

use chatrelay_channels::Button;
use chatrelay_common::{Error, ErrorKind};

/// Callback data of the "Start again" button.
pub const RESET_CALLBACK: &str = "reset_chat_context";
/// Callback data of the "Cancel" button shown while waiting for a prompt.
pub const CANCEL_PROMPT_CALLBACK: &str = "cancel_system_prompt";

pub const NOT_APPROVED: &str = "⛔ You cannot use this bot";
pub const CONTEXT_TOO_LONG: &str = "⛔ The conversation is too long";
pub const STREAM_STALLED: &str = "⌛ The reply stalled, please try again";
pub const GENERIC_FAILURE: &str = "❌ Something went wrong. Please try again";
pub const RESET_BUTTON: &str = "Start again";
pub const CANCEL_BUTTON: &str = "Cancel";

pub const GREETING: &str = "Hello! You can start using the bot now";
pub const RESET_DONE: &str =
    "✅ New conversation initiated. The model will not remember previous messages.";
pub const PROMPT_UNCHANGED: &str = "System prompt not changed";
pub const PROMPT_RESET: &str = "System prompt restored to the default. A new conversation has started.";
pub const NOTHING_TO_CANCEL: &str = "Nothing to cancel";
pub const TRANSCRIPTION: &str = "Transcription:";
pub const UNKNOWN_COMMAND: &str = "Unknown command. Send /help for the list of commands.";

pub const HELP: &str = "I relay your messages to a language model and stream its replies back.

/reset - start a new conversation
/prompt [text] - show or change the system prompt
/prompt_reset - restore the default system prompt
/model [name] - show or change the model
/invite - invite another user to this bot
/cancel - cancel the current action

Voice and audio messages are transcribed first.";

pub fn invite(link: &str, code: &str) -> String {
    format!("This bot is invite-only. Share this link: {link}\nor the code: {code}")
}

pub fn prompt_request(current: &str) -> String {
    format!("Current system prompt:\n\n{current}\n\nSend the new prompt as your next message.")
}

pub fn prompt_updated(prompt: &str) -> String {
    format!("System prompt updated: {prompt}\n\nA new conversation has started.")
}

pub fn transcript(text: &str) -> String {
    format!("{TRANSCRIPTION}\n\n{text}")
}

pub fn models(current: &str, available: &[String]) -> String {
    let list = available
        .iter()
        .map(|m| {
            if m == current {
                format!("• {m} (current)")
            } else {
                format!("• {m}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Available models:\n{list}\n\nUse /model <name> to switch or /model default to reset.")
}

pub fn model_selected(model: &str) -> String {
    format!("Model set to {model}")
}

pub fn unknown_model(model: &str) -> String {
    format!("Unknown model '{model}'. Send /model to see the available ones.")
}

/// Reply shown for a failed event, if any.
pub fn for_error(error: &Error) -> Option<(&'static str, Option<Button>)> {
    match error.kind() {
        ErrorKind::Shutdown => None,
        ErrorKind::Authorization => Some((NOT_APPROVED, None)),
        ErrorKind::Persistent if matches!(error.root(), Error::ContextTooLong) => Some((
            CONTEXT_TOO_LONG,
            Some(Button::new(RESET_BUTTON, RESET_CALLBACK)),
        )),
        ErrorKind::Stall => Some((STREAM_STALLED, None)),
        _ => Some((GENERIC_FAILURE, None)),
    }
}
