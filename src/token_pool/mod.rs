//! 上游会话凭证池：选取、失败记录与冷却，状态持久化在 SQLite。

pub mod cooldown;
pub mod selector;
pub mod store;
pub mod types;

pub use cooldown::{CooldownPolicy, FailureClass};
pub use selector::{FewestFailuresThenLru, PowerOfTwoChoices, SelectionPolicy, policy_from_name};
pub use store::TokenPool;
pub use types::{PoolKind, TokenRecord};
