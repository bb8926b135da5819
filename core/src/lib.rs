/// AgeBridge - client core for a two-party elder/young chat with AI annotation
///
/// One persistent duplex connection per participant, an ordered message log
/// that survives reconnects, optimistic sends, image and emoji media, and
/// per-message analysis requests against the backend.

pub mod error;
pub mod config;
pub mod identity;
pub mod protocol;
pub mod message;
pub mod message_store;
pub mod connection;
pub mod backend;
pub mod send;
pub mod media;
pub mod annotation;
pub mod cache;
pub mod session;

pub use error::{AnnotationError, ChatError, Result, SendError, TransportError, UploadError, ValidationError};
pub use config::Config;
pub use identity::{Identity, Role};
pub use message::{Annotation, AnnotationState, DeliveryState, Message, MessageKind, StoreEvent};
pub use message_store::MessageStore;
pub use connection::{ConnectionHandle, ConnectionState, Transport};
pub use backend::{ChatBackend, HttpBackend};
pub use media::{MediaFile, UploadConstraints};
pub use annotation::{AnalysisKind, AnnotationCoordinator};
pub use session::{ChatSession, SessionEvent};
