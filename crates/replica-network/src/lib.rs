//! Network plumbing for replica fetchers.
//!
//! [`NetworkExecutor`] runs requests through a [`Transport`] and, when a
//! request fails authorization, refreshes credentials through a
//! [`CredentialProvider`] and retries the request once. Only one refresh is
//! in flight at a time no matter how many requests fail concurrently.

mod credentials;
mod error;
mod executor;
mod request;
mod transport;

pub use credentials::{BearerCredentials, CredentialProvider};
pub use error::NetworkError;
pub use executor::{NetworkExecutor, NetworkExecutorConfig, RefreshFailedCallback};
pub use request::{NetworkRequest, NetworkResponse};
pub use transport::{ReqwestTransport, Transport};
