//! Bidirectional translation between the OpenAI chat-completions wire format and the
//! upstream Gemini-style `generateContent` format used by `llmgate-core`'s dispatcher.
pub mod generate_content;
