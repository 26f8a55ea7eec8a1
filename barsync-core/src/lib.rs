//! BarSync Core: multi-source daily-bar synchronization primitives.
//!
//! This crate contains the failure-handling heart of the sync engine:
//! - Domain types (daily OHLCV bars with sanity checks)
//! - Provider trait with a typed error taxonomy
//! - Two HTTP providers (JSON chart API, CSV-over-HTTP)
//! - Per-provider three-state circuit breaker
//! - Escalating backoff policy for sustained pipeline failure
//! - Fallback orchestrator with a data-sufficiency check

pub mod backoff;
pub mod breaker;
pub mod domain;
pub mod orchestrator;
pub mod provider;
pub mod validate;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use orchestrator::{min_expected_records, FallbackOrchestrator};
pub use provider::{FetchResult, Provider, ProviderError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: coordination types are Send + Sync.
    ///
    /// The driver may run symbols from a worker thread while the CLI holds
    /// the same breakers for status reporting; nothing here may regress to
    /// thread-local state.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::Bar>();
        require_sync::<domain::Bar>();
        require_send::<provider::ProviderError>();
        require_sync::<provider::ProviderError>();
        require_send::<provider::FetchResult>();
        require_sync::<provider::FetchResult>();
        require_send::<breaker::CircuitBreaker>();
        require_sync::<breaker::CircuitBreaker>();
        require_send::<backoff::BackoffPolicy>();
        require_sync::<backoff::BackoffPolicy>();
    }
}
