//! Engine facade: the launch API the CLI and reconciliation loops call.

use std::sync::Arc;

use aim_cache::{CacheManager, CacheStats, Fetcher, HubCliFetcher};
use aim_common::{Error, LaunchError, Result};
use aim_launcher::{
    DockerRuntime, HealthProbe, HttpHealthProbe, InstanceStatus, KubernetesPodRuntime,
    LaunchHandle, LaunchRequest, LocalProcessRuntime, Orchestrator, OrchestratorConfig, Runtime,
    RuntimeKind,
};
use aim_recipe::{
    HardwareDetector, HardwareProfile, RecipeCatalog, RecipeSelector, ResolvedConfiguration,
    SelectionConstraints, StaticDetector, SupportedConfiguration, SystemDetector,
};
use tracing::info;

use crate::config::EngineConfig;

/// Collaborators an engine is assembled from
pub struct EngineParts {
    /// Selector over the loaded catalog
    pub selector: RecipeSelector,
    /// Hardware source
    pub detector: Arc<dyn HardwareDetector>,
    /// Opened cache
    pub cache: CacheManager,
    /// Deployment target
    pub runtime: Arc<dyn Runtime>,
    /// Readiness check
    pub probe: Arc<dyn HealthProbe>,
    /// Lifecycle settings
    pub orchestrator: OrchestratorConfig,
}

/// One catalog, one cache, one orchestrator
#[derive(Clone)]
pub struct Engine {
    detector: Arc<dyn HardwareDetector>,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Build every component from configuration.
    ///
    /// Fails if the catalog does not load, the cache root cannot be opened,
    /// or the Kubernetes client cannot be created.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let catalog = RecipeCatalog::load_dir(&config.recipes_dir)?;
        let selector = RecipeSelector::new(Arc::new(catalog), config.selector.clone());

        let detector: Arc<dyn HardwareDetector> = match &config.hardware {
            Some(profile) => Arc::new(StaticDetector::new(profile.clone())),
            None => Arc::new(SystemDetector::default()),
        };

        let fetcher: Arc<dyn Fetcher> = Arc::new(HubCliFetcher::new(config.hub.clone())?);
        let cache = CacheManager::open(config.cache.clone(), fetcher).await?;

        let runtime: Arc<dyn Runtime> = match config.runtime {
            RuntimeKind::LocalProcess => Arc::new(LocalProcessRuntime::new()),
            RuntimeKind::Container => Arc::new(DockerRuntime::new(config.docker.clone())),
            RuntimeKind::KubernetesPod => {
                Arc::new(KubernetesPodRuntime::try_default(config.kubernetes.clone()).await?)
            }
        };
        info!(runtime = %config.runtime, "Selected runtime");

        let probe = HttpHealthProbe::new(
            config.orchestrator.health_path.clone(),
            config.orchestrator.health_timeout,
        )
        .map_err(Error::config)?;

        Ok(Self::from_parts(EngineParts {
            selector,
            detector,
            cache,
            runtime,
            probe: Arc::new(probe),
            orchestrator: config.orchestrator.clone(),
        }))
    }

    /// Assemble from already-built collaborators
    pub fn from_parts(parts: EngineParts) -> Self {
        let orchestrator = Orchestrator::new(
            parts.orchestrator,
            parts.selector,
            parts.detector.clone(),
            parts.cache,
            parts.runtime,
            parts.probe,
        );
        Self {
            detector: parts.detector,
            orchestrator,
        }
    }

    /// The loaded recipes
    pub fn catalog(&self) -> &RecipeCatalog {
        self.orchestrator.selector().catalog()
    }

    /// The artifact cache
    pub fn cache(&self) -> &CacheManager {
        self.orchestrator.cache()
    }

    /// Current hardware profile
    pub async fn hardware(&self) -> HardwareProfile {
        self.detector.detect().await
    }

    /// Resolve without launching. `hardware` overrides detection.
    pub async fn select(
        &self,
        model_id: &str,
        constraints: &SelectionConstraints,
        hardware: Option<HardwareProfile>,
    ) -> Result<ResolvedConfiguration> {
        let hardware = match hardware {
            Some(profile) => profile,
            None => self.detector.detect().await,
        };
        Ok(self.orchestrator.selector().select(model_id, &hardware, constraints)?)
    }

    /// Every enabled configuration of `model_id`
    pub fn supported_configurations(&self, model_id: &str) -> Vec<SupportedConfiguration> {
        self.catalog().supported_configurations(model_id)
    }

    /// Start serving a model; returns once the workload is starting
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchHandle> {
        if request.port == Some(0) {
            return Err(Error::validation("invalid port 0, expected 1-65535"));
        }
        self.orchestrator.launch(request).await
    }

    /// Stop an instance; succeeds if it is already stopped
    pub async fn stop(&self, instance_id: &str) -> Result<()> {
        Ok(self.orchestrator.stop(instance_id).await?)
    }

    /// Snapshot of one instance
    pub fn status(&self, instance_id: &str) -> std::result::Result<InstanceStatus, LaunchError> {
        self.orchestrator.status(instance_id)
    }

    /// Every instance this engine launched
    pub fn list(&self) -> Vec<InstanceStatus> {
        self.orchestrator.list()
    }

    /// Cache snapshot
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache().stats().await
    }

    /// Remove one artifact; fails while an instance uses it
    pub async fn cache_remove(&self, model_id: &str) -> Result<()> {
        Ok(self.cache().remove(model_id).await?)
    }

    /// Stop every instance still holding resources
    pub async fn shutdown(&self) {
        self.orchestrator.stop_all().await;
    }
}
