pub mod applescript;
pub mod dialogs;
pub mod downloads;
pub mod handlers;
pub mod navigation;
pub mod safari;
pub mod session;
pub mod state;
pub mod storage;
pub mod tabs;

pub use applescript::{AppleScriptRunner, ScriptOutput};
pub use dialogs::{DialogReport, DialogWatcher, DIALOG_CLOSED_MESSAGE};
pub use downloads::DownloadTracker;
pub use handlers::{register_handlers, SessionHandler};
pub use navigation::{normalize_url, NavigationManager, NavigationResult};
pub use safari::SafariDriver;
pub use session::{InputStrategy, SafariSession};
pub use state::{BrowserStateSummary, RecentEvents};
pub use tabs::{short_id, SwitchPath, TabRegistry};
