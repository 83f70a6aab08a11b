pub mod store;
pub mod types;

pub use store::ApiKeyStore;
pub use types::{ApiKey, Caller};
