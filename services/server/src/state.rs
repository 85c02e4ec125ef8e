//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources every
//! connection shares: configuration, the rate limiter and the backend client.

use crate::config::Config;
use relay_core::{llm_client::LLMClient, rate_limit::RateLimiter};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::debug;

/// The shared application state, created once at startup and passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter<IpAddr>>,
    /// `None` when no backend credential is configured.
    pub llm_client: Option<Arc<dyn LLMClient>>,
}

impl AppState {
    pub fn new(config: Config, llm_client: Option<Arc<dyn LLMClient>>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_requests, config.rate_limit_window);
        Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            llm_client,
        }
    }

    /// Periodically drops rate-limit windows that no longer hold live requests.
    pub fn spawn_limiter_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.tracked(), "Evicted idle rate-limit windows.");
                }
            }
        })
    }
}
