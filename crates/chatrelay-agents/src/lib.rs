pub mod openai;
pub mod providers;
pub mod retry;

pub use openai::OpenAiProvider;
pub use providers::{
    ChatMessage, LlmProvider, LlmRequest, LlmResponse, LlmStream, LlmStreamResponse, Transcriber,
    Usage,
};
pub use retry::{CompletionRetrier, RetryPolicy, is_persistent_error};
