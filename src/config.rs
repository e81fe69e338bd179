//! Layered configuration read from `.promptforge/promptforge.toml`.
//!
//! Values resolve in order: built-in defaults, the TOML file, `PROMPTFORGE_*`
//! environment variables (after loading `.env` files), then CLI flags applied
//! by the caller.
//!
//! # Configuration File Format
//!
//! ```toml
//! [gateway]
//! timeout_secs = 60
//! max_retries = 3
//!
//! [budget]
//! run_cap = 2.50
//! project_cap = 20.0
//!
//! [scheduler]
//! max_parallel = 4
//! human_input_timeout_secs = 3600
//!
//! [consensus]
//! quorum = 2
//! deadline_secs = 90
//!
//! [quality]
//! default_threshold = 70
//! scoring_providers = [
//!     { provider = "openai", model = "gpt-4o" },
//!     { provider = "local", model = "llama3" },
//! ]
//!
//! [quality.thresholds]
//! technical_analysis = 80
//!
//! [forge]
//! generation_provider = "openai"
//! generation_model = "gpt-4o"
//!
//! [[providers]]
//! name = "openai"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [[providers.models]]
//! name = "gpt-4o"
//! input_per_million = 2.5
//! output_per_million = 10.0
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusConfig;
use crate::engine::SchedulerSettings;
use crate::ledger::{Cost, CostLedger, ModelPricing};
use crate::pipeline::{PipelineSettings, Stage};
use crate::playbook::ModelTarget;
use crate::provider::{OpenAiCompatibleProvider, ProviderGateway, RetryPolicy};

/// Directory holding config, state and logs, relative to the project root.
pub const STATE_DIR: &str = ".promptforge";
pub const CONFIG_FILE: &str = "promptforge.toml";

/// Provider gateway timeouts and retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Spending caps in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_cap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input_timeout_secs: Option<u64>,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            human_input_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSection {
    /// Minimum successful responses; a strict majority when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_deadline_secs() -> u64 {
    90
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            quorum: None,
            deadline_secs: default_deadline_secs(),
        }
    }
}

/// Quality gate thresholds and the models that score artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySection {
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    /// Per-stage overrides keyed by stage name.
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub scoring_providers: Vec<ModelTarget>,
}

fn default_threshold() -> f64 {
    70.0
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            thresholds: BTreeMap::new(),
            scoring_providers: Vec::new(),
        }
    }
}

/// Models used by the stage pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForgeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
    #[serde(default)]
    pub analysis_models: Vec<ModelTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
}

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

/// One `[[providers]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

/// The complete promptforge.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub forge: ForgeSection,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse promptforge.toml")
    }

    /// Load `<state_dir>/promptforge.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the full layered configuration for a project directory.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        load_dotenv_files(project_dir);
        let mut config = Self::load_or_default(&project_dir.join(STATE_DIR))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize promptforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PROMPTFORGE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
            value
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|_| anyhow::anyhow!("Invalid value '{}' for {}", v, key))
                })
                .transpose()
        }

        if let Some(v) = parsed("PROMPTFORGE_TIMEOUT_SECS", lookup("PROMPTFORGE_TIMEOUT_SECS"))? {
            self.gateway.timeout_secs = v;
        }
        if let Some(v) = parsed("PROMPTFORGE_MAX_RETRIES", lookup("PROMPTFORGE_MAX_RETRIES"))? {
            self.gateway.max_retries = v;
        }
        if let Some(v) = parsed("PROMPTFORGE_MAX_PARALLEL", lookup("PROMPTFORGE_MAX_PARALLEL"))? {
            self.scheduler.max_parallel = v;
        }
        if let Some(v) = parsed("PROMPTFORGE_RUN_CAP", lookup("PROMPTFORGE_RUN_CAP"))? {
            self.budget.run_cap = Some(v);
        }
        if let Some(v) = parsed("PROMPTFORGE_PROJECT_CAP", lookup("PROMPTFORGE_PROJECT_CAP"))? {
            self.budget.project_cap = Some(v);
        }
        if let Some(v) = parsed("PROMPTFORGE_QUORUM", lookup("PROMPTFORGE_QUORUM"))? {
            self.consensus.quorum = Some(v);
        }
        if let Some(v) = lookup("PROMPTFORGE_GENERATION_PROVIDER") {
            self.forge.generation_provider = Some(v);
        }
        if let Some(v) = lookup("PROMPTFORGE_GENERATION_MODEL") {
            self.forge.generation_model = Some(v);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let in_range = |t: f64| (0.0..=100.0).contains(&t);

        if !in_range(self.quality.default_threshold) {
            warnings.push(format!(
                "quality.default_threshold {} is outside 0..=100",
                self.quality.default_threshold
            ));
        }
        for (stage, threshold) in &self.quality.thresholds {
            if stage.parse::<Stage>().is_err() {
                warnings.push(format!("quality.thresholds: unknown stage '{}'", stage));
            }
            if !in_range(*threshold) {
                warnings.push(format!(
                    "quality.thresholds.{} = {} is outside 0..=100",
                    stage, threshold
                ));
            }
        }

        if let Some(quorum) = self.consensus.quorum {
            let fan_out = self.quality.scoring_providers.len().max(self.providers.len());
            if quorum == 0 {
                warnings.push("consensus.quorum must be at least 1".to_string());
            } else if quorum > fan_out {
                warnings.push(format!(
                    "consensus.quorum {} exceeds the {} configured providers",
                    quorum, fan_out
                ));
            }
        }

        if self.scheduler.max_parallel == 0 {
            warnings.push("scheduler.max_parallel must be at least 1".to_string());
        }

        let references = self
            .quality
            .scoring_providers
            .iter()
            .chain(&self.forge.analysis_models)
            .map(|t| t.provider.as_str())
            .chain(self.forge.generation_provider.as_deref());
        for name in references {
            if !self.providers.iter().any(|p| p.name == name) {
                warnings.push(format!("unknown provider '{}' referenced", name));
            }
        }

        for provider in &self.providers {
            if let Some(var) = &provider.api_key_env
                && std::env::var(var).is_err()
            {
                warnings.push(format!(
                    "provider '{}': environment variable {} is not set",
                    provider.name, var
                ));
            }
        }

        warnings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.gateway.timeout_secs),
            max_retries: self.gateway.max_retries,
            initial_backoff: Duration::from_millis(self.gateway.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.gateway.max_backoff_ms),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_parallel: self.scheduler.max_parallel.max(1),
            human_input_timeout: self.scheduler.human_input_timeout_secs.map(Duration::from_secs),
            run_cap: self.budget.run_cap.map(Cost::from_dollars),
            ..SchedulerSettings::default()
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig::default()
            .with_quorum(self.consensus.quorum)
            .with_deadline(Duration::from_secs(self.consensus.deadline_secs))
    }

    /// Build a gateway with every configured provider registered.
    pub fn build_gateway(&self, ledger: Arc<CostLedger>) -> ProviderGateway {
        self.providers
            .iter()
            .fold(ProviderGateway::new(ledger, self.retry_policy()), |gateway, entry| {
                gateway.with_provider(Arc::new(build_provider(entry)))
            })
    }

    /// The model that generates stage artifacts, if one is configured.
    pub fn generation_target(&self) -> Option<ModelTarget> {
        let provider = self.forge.generation_provider.as_deref()?;
        let model = self.forge.generation_model.as_deref().unwrap_or_default();
        Some(ModelTarget::new(provider, model))
    }

    /// Models that score stage artifacts. Falls back to the generation model.
    pub fn scoring_targets(&self) -> Vec<ModelTarget> {
        if !self.quality.scoring_providers.is_empty() {
            return self.quality.scoring_providers.clone();
        }
        self.generation_target().into_iter().collect()
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let generation = self.generation_target().context(
            "No generation model configured. Set [forge] generation_provider in promptforge.toml",
        )?;
        let mut settings = PipelineSettings::new(generation);
        settings.default_threshold = self.quality.default_threshold;
        for (name, threshold) in &self.quality.thresholds {
            if let Ok(stage) = name.parse::<Stage>() {
                settings.thresholds.insert(stage, *threshold);
            }
        }
        settings.analysis_models = self.forge.analysis_models.clone();
        settings.max_tokens = self.forge.max_tokens;
        settings.project_cap = self.budget.project_cap.map(Cost::from_dollars);
        Ok(settings)
    }
}

fn build_provider(entry: &ProviderEntry) -> OpenAiCompatibleProvider {
    let api_key = entry
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    let provider = match entry.kind {
        ProviderKind::OpenaiCompatible => {
            OpenAiCompatibleProvider::new(&entry.name, &entry.base_url, api_key)
        }
    };
    entry.models.iter().fold(provider, |p, m| {
        p.with_pricing(
            &m.name,
            ModelPricing::new(m.input_per_million, m.output_per_million),
        )
    })
}

fn load_dotenv_files(project_dir: &Path) {
    for path in dotenv_paths(project_dir) {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

fn dotenv_paths(project_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![project_dir.join(".env"), project_dir.join(STATE_DIR).join(".env")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(STATE_DIR).join(".env"));
    }
    paths
}

/// Starter file written by `promptforge init`.
pub fn default_config_toml() -> &'static str {
    r#"# promptforge configuration

[gateway]
timeout_secs = 60
max_retries = 3

[budget]
# run_cap = 2.50
# project_cap = 20.0

[scheduler]
max_parallel = 4

[consensus]
deadline_secs = 90

[quality]
default_threshold = 70

[forge]
generation_provider = "openai"
generation_model = "gpt-4o-mini"

[[providers]]
name = "openai"
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"

[[providers.models]]
name = "gpt-4o-mini"
input_per_million = 0.15
output_per_million = 0.6
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.gateway.timeout_secs, 60);
        assert_eq!(config.scheduler.max_parallel, 4);
        assert_eq!(config.quality.default_threshold, 70.0);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_parse_full_file() {
        let config = EngineConfig::parse(
            r#"
            [budget]
            run_cap = 0.5

            [quality]
            default_threshold = 75
            scoring_providers = [{ provider = "openai", model = "gpt-4o" }]

            [quality.thresholds]
            technical_analysis = 85

            [forge]
            generation_provider = "openai"
            generation_model = "gpt-4o"

            [[providers]]
            name = "openai"
            base_url = "https://api.openai.com/v1"

            [[providers.models]]
            name = "gpt-4o"
            input_per_million = 2.5
            output_per_million = 10.0
            "#,
        )
        .unwrap();

        assert_eq!(config.providers[0].kind, ProviderKind::OpenaiCompatible);
        assert_eq!(config.scheduler_settings().run_cap, Some(Cost::from_micros(500_000)));
        let settings = config.pipeline_settings().unwrap();
        assert_eq!(settings.threshold(Stage::TechnicalAnalysis), 85.0);
        assert_eq!(settings.threshold(Stage::IdeaRefinement), 75.0);
        assert_eq!(settings.generation, ModelTarget::new("openai", "gpt-4o"));
        assert!(config.validate().is_empty());
        assert!(config.build_gateway(Arc::new(CostLedger::new())).has_provider("openai"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROMPTFORGE_MAX_PARALLEL", "8"),
            ("PROMPTFORGE_RUN_CAP", "1.25"),
            ("PROMPTFORGE_GENERATION_PROVIDER", "local"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scheduler.max_parallel, 8);
        assert_eq!(config.budget.run_cap, Some(1.25));
        assert_eq!(config.forge.generation_provider.as_deref(), Some("local"));

        let err = config
            .apply_env(|k| (k == "PROMPTFORGE_MAX_PARALLEL").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PROMPTFORGE_MAX_PARALLEL"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = EngineConfig::default();
        config.quality.default_threshold = 120.0;
        config.quality.thresholds.insert("design".into(), 50.0);
        config.consensus.quorum = Some(3);
        config.forge.generation_provider = Some("ghost".into());

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("default_threshold")));
        assert!(warnings.iter().any(|w| w.contains("unknown stage 'design'")));
        assert!(warnings.iter().any(|w| w.contains("quorum 3")));
        assert!(warnings.iter().any(|w| w.contains("unknown provider 'ghost'")));
    }

    #[test]
    fn test_pipeline_requires_generation_model() {
        assert!(EngineConfig::default().pipeline_settings().is_err());
    }

    #[test]
    fn test_starter_file_parses_and_round_trips() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::parse(default_config_toml()).unwrap();
        assert_eq!(config.providers.len(), 1);
        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
