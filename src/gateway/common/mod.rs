pub mod attempt;
pub mod extract;
pub mod media;

pub use attempt::{Attempted, record_upstream_failure, run_attempts, upstream_app_error};
