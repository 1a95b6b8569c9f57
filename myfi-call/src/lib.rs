pub mod error;
pub mod manager;
pub mod media;
pub mod observer;
pub mod outbox;
pub mod session;

pub use error::{CallError, EndReason, MediaAccessKind, MediaError};
pub use manager::{CallConfig, CallDeps, CallHandle, CallManager, DEFAULT_NO_ANSWER_TIMEOUT};
pub use media::{Connectivity, MediaBackend, MediaEvent, MediaSession};
pub use observer::{
    CallHistorySink, CallObserver, CallRecord, CallStatus, Contact, ContactDirectory,
};
pub use outbox::SignalingOutbox;
pub use session::{CallDirection, CallSnapshot, CallState, format_duration};
