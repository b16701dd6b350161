//! # Error Handling
//!
//! Error types for the messaging core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Caller Errors (never retried)                                     │
//! │  │   ├── InvalidContent        - Payload fails kind-specific checks    │
//! │  │   ├── NotAuthorized         - Not a friend / not a group member     │
//! │  │   ├── NotMessageSender      - Recall by someone other than sender   │
//! │  │   ├── RecallWindowExpired   - Recall attempted too late             │
//! │  │   └── AlreadyRecalled       - Message was recalled before           │
//! │  │                                                                      │
//! │  ├── Lookup Errors                                                     │
//! │  │   ├── MessageNotFound                                               │
//! │  │   └── ConversationNotFound                                          │
//! │  │                                                                      │
//! │  ├── Transient Errors (retried by the consumer)                        │
//! │  │   ├── DatabaseError         - SQLite failure                        │
//! │  │   ├── BrokerError           - Fan-out log failure                   │
//! │  │   └── CollaboratorError     - Friend/group service failure          │
//! │  │                                                                      │
//! │  └── Fatal Errors                                                      │
//! │      └── ClockMovedBackwards   - ID generator saw the clock regress    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `DeliveryPending` and `DuplicateSuppressed` are outcomes, not errors: see
//! [`crate::pipeline::SendOutcome`] and [`crate::consumer::EventOutcome`].

use thiserror::Error;

/// Result type alias for messaging core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the messaging core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller Errors (100-199)
    // ========================================================================

    /// Message content failed validation for its kind
    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    /// Sender may not message this target
    #[error("Not authorized to message this target.")]
    NotAuthorized,

    /// Only the original sender may recall a message
    #[error("Only the original sender can recall this message.")]
    NotMessageSender,

    /// The recall window has passed
    #[error("Message can no longer be recalled (window of {window_secs}s has passed).")]
    RecallWindowExpired {
        /// Length of the recall window in seconds
        window_secs: u64,
    },

    /// The message was already recalled
    #[error("Message has already been recalled.")]
    AlreadyRecalled,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Lookup Errors (200-299)
    // ========================================================================

    /// Message not found
    #[error("Message not found.")]
    MessageNotFound,

    /// Conversation not found for this user
    #[error("Conversation not found.")]
    ConversationNotFound,

    // ========================================================================
    // Storage Errors (300-399)
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ========================================================================
    // Broker / Collaborator Errors (400-499)
    // ========================================================================

    /// Fan-out log failure
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Friend/group/profile service failure
    #[error("Collaborator error: {0}")]
    CollaboratorError(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// The system clock moved backwards; issuing ids would risk collisions
    #[error("Clock moved backwards: last id at {last_ms}ms, clock now {now_ms}ms")]
    ClockMovedBackwards {
        /// Timestamp of the last issued id
        last_ms: i64,
        /// Timestamp the clock reported
        now_ms: i64,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable numeric error code
    ///
    /// - 100-199: Caller errors
    /// - 200-299: Lookup errors
    /// - 300-399: Storage
    /// - 400-499: Broker and collaborators
    /// - 900-999: Internal / fatal
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidContent(_) => 100,
            Error::NotAuthorized => 101,
            Error::NotMessageSender => 102,
            Error::RecallWindowExpired { .. } => 103,
            Error::AlreadyRecalled => 104,
            Error::InvalidConfig(_) => 105,

            Error::MessageNotFound => 200,
            Error::ConversationNotFound => 201,

            Error::DatabaseError(_) => 300,

            Error::BrokerError(_) => 400,
            Error::CollaboratorError(_) => 401,

            Error::ClockMovedBackwards { .. } => 900,
            Error::SerializationError(_) => 901,
            Error::Internal(_) => 999,
        }
    }

    /// Whether a later attempt may succeed (the transient store error class)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DatabaseError(_) | Error::BrokerError(_) | Error::CollaboratorError(_)
        )
    }

    /// Whether the process must stop issuing work
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ClockMovedBackwards { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
