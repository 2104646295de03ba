//! One handle over the services that share a data root.

use std::sync::Arc;

use crate::adapters::{CommandAdapter, ImageAdapter};
use crate::automation::AutomationEngine;
use crate::backend::{ComfyClient, GenerationBackend};
use crate::breaker::BreakerEngine;
use crate::config::{Config, WorkerSettings};
use crate::engine::{
    AtlasPackProcessor, BgRemoveProcessor, ControlPlane, ExportProcessor, GenerateProcessor,
    GenerateSettings, ProcessorRegistry,
};
use crate::error::Result;
use crate::events::EventLog;
use crate::improvement::ImprovementService;
use crate::jobs::JobQueue;
use crate::model::job::JobType;
use crate::model::spec::AssetSpec;
use crate::model::automation::AutomationRun;
use crate::specs::{SpecDraft, SpecService};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub store: Store,
    pub events: EventLog,
    pub jobs: JobQueue,
    pub breakers: BreakerEngine,
    pub automation: AutomationEngine,
    pub specs: SpecService,
    pub improvement: ImprovementService,
}

impl Pipeline {
    pub fn new(store: Store) -> Self {
        let events = EventLog::new(store.clone());
        let jobs = JobQueue::new(store.clone(), events.clone());
        let breakers = BreakerEngine::new(store.clone(), events.clone());
        let automation =
            AutomationEngine::new(store.clone(), events.clone(), jobs.clone(), breakers.clone());
        Self {
            specs: SpecService::new(store.clone(), events.clone()),
            improvement: ImprovementService::new(store.clone(), events.clone()),
            store,
            events,
            jobs,
            breakers,
            automation,
        }
    }

    /// Create a spec; a ready spec's `spec_refined` event goes to automation.
    pub async fn create_spec(
        &self,
        project_id: &str,
        draft: SpecDraft,
    ) -> Result<(AssetSpec, Vec<AutomationRun>)> {
        let change = self.specs.create(project_id, draft).await?;
        let runs = match change.refined {
            Some(ref event) => self.automation.trigger_event(event).await?,
            None => Vec::new(),
        };
        Ok((change.spec, runs))
    }

    pub async fn update_spec(
        &self,
        project_id: &str,
        spec_id: &str,
        patch: SpecDraft,
    ) -> Result<(AssetSpec, Vec<AutomationRun>)> {
        let change = self.specs.update(project_id, spec_id, patch).await?;
        let runs = match change.refined {
            Some(ref event) => self.automation.trigger_event(event).await?,
            None => Vec::new(),
        };
        Ok((change.spec, runs))
    }

    /// Processors for every job type, sharing this pipeline's store and queue.
    pub fn registry(
        &self,
        settings: &WorkerSettings,
        backend: Arc<dyn GenerationBackend>,
        adapter: Arc<dyn ImageAdapter>,
    ) -> ProcessorRegistry {
        let generate = GenerateProcessor::new(
            self.store.clone(),
            self.jobs.clone(),
            backend,
            GenerateSettings {
                workflows_dir: settings.workflows_dir.clone(),
                poll_interval: settings.generate_poll(),
                timeout: settings.generate_timeout(),
            },
        );
        ProcessorRegistry::empty()
            .register(JobType::Generate, Arc::new(generate))
            .register(
                JobType::BgRemove,
                Arc::new(BgRemoveProcessor::new(self.store.clone(), adapter.clone())),
            )
            .register(
                JobType::AtlasPack,
                Arc::new(AtlasPackProcessor::new(self.store.clone(), adapter)),
            )
            .register(
                JobType::Export,
                Arc::new(ExportProcessor::new(self.store.clone())),
            )
    }

    pub fn worker(&self, settings: WorkerSettings, registry: ProcessorRegistry) -> ControlPlane {
        ControlPlane::new(
            self.store.clone(),
            self.events.clone(),
            self.jobs.clone(),
            self.automation.clone(),
            registry,
            settings,
        )
    }

    /// Worker wired to ComfyUI and the configured adapter commands.
    pub fn worker_from_config(&self, config: &Config, settings: WorkerSettings) -> ControlPlane {
        let backend = Arc::new(ComfyClient::new(
            &config.comfyui_url,
            config.comfyui_api_token.clone(),
        ));
        let adapter = Arc::new(CommandAdapter::new(
            settings.adapters.bg_remove_command.clone(),
            settings.adapters.atlas_pack_command.clone(),
        ));
        let registry = self.registry(&settings, backend, adapter);
        self.worker(settings, registry)
    }
}
