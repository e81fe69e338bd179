//! Uniform invocation contract over language-model providers.
//!
//! A [`Provider`] performs one raw completion. The [`ProviderGateway`] wraps
//! every call with budget checks, a timeout, bounded retries and metering
//! into the cost ledger.

pub mod gateway;
pub mod http;

pub use gateway::{Invocation, ProviderGateway, RetryPolicy};
pub use http::OpenAiCompatibleProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::ledger::{ModelPricing, TokenUsage};

/// A single logical completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(model: &str, prompt: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.into(),
            system: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }

    /// Rough token estimate used for budget pre-checks and dry runs.
    pub fn estimated_usage(&self) -> TokenUsage {
        let chars = self.prompt.len() + self.system.as_ref().map_or(0, |s| s.len());
        let input = (chars as u64).div_ceil(4);
        TokenUsage::new(input, u64::from(self.max_tokens.unwrap_or(DEFAULT_OUTPUT_ESTIMATE)))
    }
}

/// Output tokens assumed for estimates when a request sets no limit.
pub const DEFAULT_OUTPUT_ESTIMATE: u32 = 512;

/// A successful raw completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// A failed raw completion, with any usage the provider billed anyway.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub error: ProviderError,
    pub billed: Option<TokenUsage>,
}

impl From<ProviderError> for ProviderFailure {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            billed: None,
        }
    }
}

/// A language-model provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used by steps and config to address this provider.
    fn name(&self) -> &str;

    /// Perform one completion without retries.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderFailure>;

    /// Pricing for a model. Unknown models are metered at zero cost.
    fn pricing(&self, model: &str) -> Option<ModelPricing>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted providers for unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    pub enum Script {
        Reply(String, TokenUsage),
        Fail(ProviderError, Option<TokenUsage>),
        Delay(Duration, String),
    }

    pub struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<Script>>,
        fallback: String,
        pricing: Option<ModelPricing>,
        pub calls: AtomicU32,
    }

    impl ScriptedProvider {
        /// A provider that always answers `fallback` once the script is exhausted.
        pub fn new(name: &str, fallback: &str) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(VecDeque::new()),
                fallback: fallback.to_string(),
                pricing: Some(ModelPricing::new(1.0, 2.0)),
                calls: AtomicU32::new(0),
            }
        }

        pub fn then(self, step: Script) -> Self {
            self.script.lock().unwrap().push_back(step);
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Reply(content, usage)) => Ok(Completion { content, usage }),
                Some(Script::Fail(error, billed)) => Err(ProviderFailure { error, billed }),
                Some(Script::Delay(delay, content)) => {
                    tokio::time::sleep(delay).await;
                    Ok(Completion {
                        content,
                        usage: TokenUsage::new(100, 100),
                    })
                }
                None => Ok(Completion {
                    content: self.fallback.clone(),
                    usage: TokenUsage::new(100, 100),
                }),
            }
        }

        fn pricing(&self, _model: &str) -> Option<ModelPricing> {
            self.pricing
        }
    }
}
