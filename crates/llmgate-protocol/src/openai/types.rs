pub use crate::openai::create_chat_completions::request::{
    CreateChatCompletionRequest, CreateChatCompletionRequestBody, StopConfiguration,
};
pub use crate::openai::create_chat_completions::response::CreateChatCompletionResponse;
pub use crate::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
pub use crate::openai::create_chat_completions::types::*;
pub use crate::openai::list_models::{Model, ModelObjectType, ModelsListResponse};
