//! OpenAI 兼容的图片接口：生成、编辑与当前出图方式查询。

pub mod form;
pub mod handler;
pub mod strategy;
pub mod stream;
pub mod types;

pub use handler::{handle_edits, handle_generations, handle_method};
