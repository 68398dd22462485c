pub mod javascript;
pub mod keys;
pub mod polling;
pub mod retry;
pub mod screenshot;

pub use javascript::ScriptGateway;
pub use polling::Poller;
pub use retry::{with_retry, with_retry_mut, RetryPolicy};
pub use screenshot::ScreenshotManager;
