pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHandler};
pub use types::{BrowserEvent, EventKind, EventOutcome, ScrollDirection};
