pub mod count_tokens;
pub mod generate_content;
pub mod types;

pub use types::*;
