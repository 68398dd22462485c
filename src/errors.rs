use thiserror::Error;

/// Default agent-facing hint attached to element re-resolution failures.
pub const ELEMENT_GONE_MEMORY: &str =
    "Element changed after page update. Refresh browser state and retry the action.";

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Safari session is not started")]
    NotStarted,

    #[error("Safari startup failed: {0}")]
    Startup(String),

    #[error("Safari session is no longer alive")]
    SessionDead,

    #[error("Script evaluation failed: {0}")]
    Evaluation(String),

    #[error("Extraction payload invalid: {0}")]
    ExtractionPayload(String),

    /// The referenced element could not be re-located on the live page.
    #[error("{message}")]
    ElementGone {
        backend_id: u32,
        message: String,
        memory: String,
    },

    /// A handler-level operation that exhausted its retries.
    #[error("{message}")]
    Operation { message: String, memory: String },

    #[error("Tab not found: {0}")]
    TabNotFound(String),

    #[error("Unsupported by the current Safari backend: {0}")]
    Unsupported(String),

    #[error("AppleScript failed: {0}")]
    AppleScript(String),

    #[error("WebDriver command failed: {0}")]
    WebDriver(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

const STALE_PAIRING_MARKERS: [&str; 3] = [
    "already paired with another webdriver session",
    "already paired with a different session",
    "automation session ended unexpected while attempting to pair",
];

impl BridgeError {
    pub fn element_gone(backend_id: u32) -> Self {
        BridgeError::ElementGone {
            backend_id,
            message: format!("Element index {backend_id} no longer exists"),
            memory: ELEMENT_GONE_MEMORY.to_string(),
        }
    }

    /// Wraps an exhausted operation the way handlers surface it to the agent.
    pub fn operation(name: &str, err: &BridgeError) -> Self {
        BridgeError::Operation {
            message: format!("{name} failed: {err}"),
            memory: format!("{name} failed in Safari session. Refresh state and retry."),
        }
    }

    /// Longer hint for an agent caller, when the error carries one.
    pub fn memory(&self) -> Option<&str> {
        match self {
            BridgeError::ElementGone { memory, .. } | BridgeError::Operation { memory, .. } => {
                Some(memory)
            }
            _ => None,
        }
    }

    /// Short variant label used in aggregated diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NotStarted => "NotStarted",
            BridgeError::Startup(_) => "StartupError",
            BridgeError::SessionDead => "SessionDead",
            BridgeError::Evaluation(_) => "EvaluationError",
            BridgeError::ExtractionPayload(_) => "ExtractionPayloadError",
            BridgeError::ElementGone { .. } => "ElementGoneError",
            BridgeError::Operation { .. } => "BrowserError",
            BridgeError::TabNotFound(_) => "TabNotFound",
            BridgeError::Unsupported(_) => "Unsupported",
            BridgeError::AppleScript(_) => "AppleScriptError",
            BridgeError::WebDriver(_) => "WebDriverError",
            BridgeError::Timeout(_) => "TimeoutError",
            BridgeError::InvalidArgument(_) => "InvalidArgument",
            BridgeError::Configuration(_) => "ConfigurationError",
            BridgeError::Serialization(_) => "SerializationError",
            BridgeError::Io(_) => "IoError",
        }
    }

    pub fn is_element_gone(&self) -> bool {
        matches!(self, BridgeError::ElementGone { .. })
    }

    /// Failures another attempt cannot fix: stale references, already
    /// exhausted inner operations, and caller mistakes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeError::ElementGone { .. }
                | BridgeError::Operation { .. }
                | BridgeError::NotStarted
                | BridgeError::Unsupported(_)
                | BridgeError::InvalidArgument(_)
        )
    }

    /// Safari refuses a new automation session while an old pairing lingers.
    pub fn is_stale_pairing(&self) -> bool {
        let text = self.to_string().to_lowercase();
        STALE_PAIRING_MARKERS
            .iter()
            .any(|marker| text.contains(marker))
    }
}

impl From<fantoccini::error::CmdError> for BridgeError {
    fn from(err: fantoccini::error::CmdError) -> Self {
        BridgeError::WebDriver(err.to_string())
    }
}

impl From<fantoccini::error::NewSessionError> for BridgeError {
    fn from(err: fantoccini::error::NewSessionError) -> Self {
        BridgeError::Startup(format!(
            "{err}. Ensure Safari's Develop > Allow Remote Automation is enabled and run `safaridriver --enable` once."
        ))
    }
}
