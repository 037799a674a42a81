//! Data-plane gateway: per-sandbox API keys and the authenticated reverse
//! proxy in front of sandbox endpoints.

pub mod headers;
mod keys;
mod policy;
mod proxy;
mod retry;

pub use keys::{ApiKeyRecord, ApiKeyStore};
pub(crate) use keys::generate_secret;
pub use policy::ProxyPolicy;
pub use proxy::{Gateway, validate_sandbox_id};
pub use retry::{RetryOutcome, RetryPolicy, run_with_retry};
