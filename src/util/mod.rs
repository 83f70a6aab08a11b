pub mod concurrency;
pub mod id;
pub mod model;
pub mod random;
