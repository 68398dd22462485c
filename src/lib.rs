//! Safari adapter for browser-automation agents.
//!
//! A [`SafariSession`] drives Safari through two control planes: WebDriver
//! ([`SafariDriver`]) for page work and AppleScript ([`AppleScriptRunner`])
//! for the tab and download state WebDriver cannot see. Agent actions arrive
//! as [`BrowserEvent`]s and are answered with a [`BrowserStateSummary`] or an
//! [`EventOutcome`].

pub mod browser;
pub mod core;
pub mod dom;
pub mod errors;
pub mod events;
pub mod testing;
pub mod types;
pub mod utils;

pub use browser::{
    register_handlers, AppleScriptRunner, BrowserStateSummary, SafariDriver, SafariSession,
};
pub use crate::core::{BrowserControl, Config, OsScripting};
pub use dom::{DomNode, DomSnapshot};
pub use errors::{BridgeError, Result};
pub use events::{BrowserEvent, EventBus, EventHandler, EventKind, EventOutcome};
pub use types::*;
