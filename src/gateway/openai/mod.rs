pub mod convert;
pub mod handler;
pub mod stream;
pub mod types;

pub use handler::{handle_chat_completions, handle_get_model, handle_list_models};
