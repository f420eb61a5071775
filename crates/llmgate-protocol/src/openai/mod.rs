pub mod create_chat_completions;
pub mod list_models;
pub mod types;

pub use types::*;
