pub mod client_cache;
pub mod failover;
pub mod http_opener;
pub mod rate_limit;
pub mod retry_policy;

pub use client_cache::ClientCache;
pub use failover::{
    AccountCredentials, AccountProvider, OpenedStream, RequestController, StaticAccount,
    StreamOpener, StreamRequest,
};
pub use http_opener::HttpStreamOpener;
pub use rate_limit::RateLimitSnapshot;
pub use retry_policy::{RetryDecision, RetryPolicy};
