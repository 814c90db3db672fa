//! Remote-facing plumbing for the GoAudits workers.
//!
//! Owns the injectable clock and jitter sources, the secret-provider seam,
//! and the single-operation HTTP client with typed retry. No domain logic
//! and no SQL belong here.

pub mod clock;
pub mod http;
pub mod secrets;

pub use clock::{Clock, FixedJitter, JitterSource, SystemClock, ThreadRngJitter};
pub use http::{ApiClient, RemoteError, RetryPolicy};
pub use secrets::{ambient_database_token, EnvSecretProvider, SecretProvider, VaultSecretProvider};
