//! CLI command implementations.
//!
//! | Module     | Commands handled        |
//! |------------|-------------------------|
//! | `init`     | `Init`                  |
//! | `playbook` | `Validate`, `Run`       |
//! | `config`   | `Config`                |
//! | `forge`    | `Forge`                 |

pub mod config;
pub mod forge;
pub mod init;
pub mod playbook;
pub mod ui;

pub use config::cmd_config;
pub use forge::cmd_forge;
pub use init::cmd_init;
pub use playbook::{RunArgs, cmd_run, cmd_validate};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use promptforge::config::{EngineConfig, STATE_DIR};
use promptforge::consensus::ConsensusAggregator;
use promptforge::engine::Engine;
use promptforge::gates::{ConsensusScorer, QualityGate};
use promptforge::ledger::CostLedger;
use promptforge::pipeline::StagePipeline;
use promptforge::provider::ProviderGateway;
use promptforge::service::ForgeService;
use promptforge::store::FileStore;

/// Resolved config, store and gateway for one CLI invocation.
pub struct Workspace {
    pub config: EngineConfig,
    pub store: FileStore,
    gateway: Arc<ProviderGateway>,
}

impl Workspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let config = EngineConfig::resolve(project_dir)?;
        for warning in config.validate() {
            tracing::warn!("{}", warning);
        }
        let store = FileStore::open(&project_dir.join(STATE_DIR).join("store"))?;
        let gateway = Arc::new(config.build_gateway(Arc::new(CostLedger::new())));
        Ok(Self {
            config,
            store,
            gateway,
        })
    }

    pub fn engine(&self) -> Engine {
        Engine::builder(self.gateway.clone())
            .settings(self.config.scheduler_settings())
            .consensus(self.config.consensus_config())
            .store(Arc::new(self.store.clone()))
            .build()
    }

    pub fn forge_service(&self) -> Result<ForgeService> {
        let settings = self.config.pipeline_settings()?;
        let aggregator =
            ConsensusAggregator::new(self.gateway.clone(), self.config.consensus_config());
        let scorer = ConsensusScorer::new(aggregator, self.config.scoring_targets())
            .with_quorum(self.config.consensus.quorum);
        let pipeline = StagePipeline::new(self.engine(), QualityGate::new(Arc::new(scorer)), settings);
        Ok(ForgeService::new(Arc::new(self.store.clone()), pipeline))
    }
}
