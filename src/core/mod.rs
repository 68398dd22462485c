pub mod browser;
pub mod config;
pub mod scripting;

pub use browser::BrowserControl;
pub use config::{Config, DialogConfig, DomConfig, DownloadConfig, DriverConfig, SessionConfig};
pub use scripting::OsScripting;
