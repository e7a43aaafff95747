pub mod error;
pub mod exit;
pub mod log_assert;
pub mod results;
pub mod retry;
pub mod time;
pub mod timeout_future;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
