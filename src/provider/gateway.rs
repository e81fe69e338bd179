//! Provider gateway: timeout, retry with exponential backoff, metering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{CompletionRequest, Provider, ProviderFailure};
use crate::errors::ProviderError;
use crate::ledger::{Attribution, Cost, CostLedger, TokenUsage};
use crate::playbook::ModelTarget;

/// Timeout and retry settings applied to every invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// A metered, successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
    pub cost: Cost,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Routes requests to registered providers.
pub struct ProviderGateway {
    providers: HashMap<String, Arc<dyn Provider>>,
    ledger: Arc<CostLedger>,
    policy: RetryPolicy,
}

impl ProviderGateway {
    pub fn new(ledger: Arc<CostLedger>, policy: RetryPolicy) -> Self {
        Self {
            providers: HashMap::new(),
            ledger,
            policy,
        }
    }

    /// Register a provider under its own name.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Estimated cost of a request, without calling the provider.
    pub fn estimate(&self, target: &ModelTarget, request: &CompletionRequest) -> Cost {
        self.providers
            .get(&target.provider)
            .and_then(|p| p.pricing(&target.model))
            .map(|pricing| pricing.cost(request.with_model(&target.model).estimated_usage()))
            .unwrap_or_default()
    }

    /// Invoke `target` with retries.
    ///
    /// Every attempt that reports usage is recorded in the ledger before this
    /// returns, including failed attempts the provider billed.
    pub async fn invoke(
        &self,
        target: &ModelTarget,
        request: &CompletionRequest,
        attribution: &Attribution,
    ) -> Result<Invocation, ProviderError> {
        let mut billed = Cost::ZERO;
        self.invoke_billing(target, request, attribution, &mut billed)
            .await
    }

    /// Like [`invoke`](Self::invoke), also returning everything billed across
    /// all attempts, whether or not the call succeeded.
    pub async fn invoke_metered(
        &self,
        target: &ModelTarget,
        request: &CompletionRequest,
        attribution: &Attribution,
    ) -> (Result<Invocation, ProviderError>, Cost) {
        let mut billed = Cost::ZERO;
        let result = self
            .invoke_billing(target, request, attribution, &mut billed)
            .await;
        (result, billed)
    }

    async fn invoke_billing(
        &self,
        target: &ModelTarget,
        request: &CompletionRequest,
        attribution: &Attribution,
        billed: &mut Cost,
    ) -> Result<Invocation, ProviderError> {
        let provider = self.provider(&target.provider)?;
        let request = request.with_model(&target.model);
        let pricing = provider.pricing(&target.model);
        let price = |usage: TokenUsage| pricing.map(|p| p.cost(usage)).unwrap_or_default();

        // The prompt itself must fit the remaining budget
        let input_estimate = TokenUsage::new(request.estimated_usage().input_tokens, 0);
        self.ledger.check(attribution, price(input_estimate))?;

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(
                provider = %target.provider,
                model = %target.model,
                attempt,
                step = attribution.step_id.as_deref(),
                "invoking provider"
            );

            let outcome = match tokio::time::timeout(self.policy.timeout, provider.complete(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderFailure::from(ProviderError::Timeout {
                    provider: target.provider.clone(),
                    timeout_ms: self.policy.timeout.as_millis() as u64,
                })),
            };

            match outcome {
                Ok(completion) => {
                    let cost = price(completion.usage);
                    *billed += cost;
                    self.ledger.record(
                        attribution,
                        &target.provider,
                        &target.model,
                        completion.usage,
                        cost,
                        false,
                    )?;
                    return Ok(Invocation {
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        content: completion.content,
                        usage: completion.usage,
                        cost,
                        duration_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                    });
                }
                Err(failure) => {
                    if let Some(usage) = failure.billed {
                        *billed += price(usage);
                        self.ledger.record(
                            attribution,
                            &target.provider,
                            &target.model,
                            usage,
                            price(usage),
                            true,
                        )?;
                    }

                    let retries_used = attempt - 1;
                    if !failure.error.is_transient() || retries_used >= self.policy.max_retries {
                        error!(
                            provider = %target.provider,
                            model = %target.model,
                            attempts = attempt,
                            "provider call failed: {}",
                            failure.error
                        );
                        return Err(failure.error);
                    }

                    let delay = self.policy.backoff(retries_used);
                    warn!(
                        "{} failed ({}), retrying in {}ms (attempt {}/{})",
                        target,
                        failure.error,
                        delay.as_millis(),
                        attempt,
                        self.policy.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
