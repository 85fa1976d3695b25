//! Domain layer types.
//!
//! Identifiers, the normalized message schema, and attachment descriptors
//! shared by providers, the attachment gate, storage, and the pipeline.

mod attachment;
mod message;
mod types;

pub use attachment::{AttachmentCandidate, AttachmentRef};
pub use message::{Address, Body, NormalizedMessage, Provenance};
pub use types::{ProviderMessageId, RecordId, ThreadId};
