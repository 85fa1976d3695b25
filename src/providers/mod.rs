//! Mail provider implementations.
//!
//! - [`MailProvider`] - the capability contract every source implements
//! - [`GmailProvider`] - Gmail REST API
//! - [`LocalProvider`] - a directory of `.eml` files
//! - [`ProviderRegistry`] - name to singleton instance table

pub mod gmail;
pub mod local;
pub mod markdown;
pub mod registry;
mod traits;

pub use gmail::{GmailProvider, GMAIL_API_BASE, GMAIL_PROVIDER};
pub use local::{LocalProvider, LOCAL_PROVIDER};
pub use registry::{ProviderFactory, ProviderRegistry, RegistryError, SharedProvider};
pub use traits::{
    Capabilities, Credentials, DateRange, ListQuery, MailProvider, MessagePage, MessageRef,
    ProviderError, QuotaInfo, Result,
};
