//! Fallback chain over two providers.
//!
//! The secondary provider gets exactly one shot, and only when the
//! primary fails before emitting its first chunk. The wrapper peeks that
//! first chunk: once any text has been observed the turn is committed to
//! the primary, and a later failure aborts the turn rather than
//! restarting it on another provider (the user may already be hearing
//! the reply).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::health::ServiceHealth;
use crate::metrics::Metrics;

use super::{GenerateRequest, LlmProvider, TokenStream};

pub struct FallbackProvider {
    primary: Arc<dyn LlmProvider>,
    secondary: Arc<dyn LlmProvider>,
    metrics: Arc<Metrics>,
    activations: AtomicU64,
}

impl FallbackProvider {
    pub fn new(
        primary: Arc<dyn LlmProvider>,
        secondary: Arc<dyn LlmProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            primary,
            secondary,
            metrics,
            activations: AtomicU64::new(0),
        }
    }

    /// Times the secondary provider has been used.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    async fn activate_secondary(&self, request: &GenerateRequest) -> Result<TokenStream> {
        self.activations.fetch_add(1, Ordering::Relaxed);
        self.metrics.llm_fallback_used();
        self.secondary.generate_stream(request).await
    }
}

impl std::fmt::Debug for FallbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackProvider")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream> {
        let mut stream = match self.primary.generate_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    error = %e,
                    "primary provider failed to start, trying secondary once"
                );
                return self.activate_secondary(request).await;
            }
        };

        // The request may also die between headers and the first chunk;
        // that still counts as "before first chunk".
        match stream.next_chunk().await {
            Some(Ok(first)) => Ok(stream.prepend(first)),
            Some(Err(e)) => {
                warn!(
                    primary = self.primary.name(),
                    error = %e,
                    "primary stream failed before first chunk, trying secondary once"
                );
                self.activate_secondary(request).await
            }
            // An empty-but-successful generation is a valid (if odd)
            // response, not a failure.
            None => Ok(TokenStream::new(futures_util::stream::empty())),
        }
    }

    async fn health(&self) -> ServiceHealth {
        match self.primary.health().await {
            ServiceHealth::Ok => ServiceHealth::Ok,
            degraded => match self.secondary.health().await {
                ServiceHealth::Ok => ServiceHealth::Degraded,
                _ => degraded,
            },
        }
    }
}
