//! Pods in a Kubernetes cluster.
//!
//! One pod per instance, `restartPolicy: Never`, so a crash surfaces as a
//! terminal pod phase instead of a silent restart. The cache is either a
//! PVC or the node's cache directory via hostPath.

use std::collections::BTreeMap;

use aim_common::{LaunchError, INSTANCE_NAME_PREFIX};
use aim_recipe::GpuVendor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Runtime, RuntimeHandle, RuntimeKind};
use crate::spec::LaunchSpec;

const RUNTIME: &str = "kubernetes-pod";

/// Label carrying the instance name
pub const INSTANCE_LABEL: &str = "aim.dev/instance";

/// Pod placement settings
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Namespace pods are created in
    pub namespace: String,
    /// PVC holding the cache; hostPath of the cache root when None
    pub cache_pvc: Option<String>,
    /// Node selector for GPU nodes
    pub node_selector: BTreeMap<String, String>,
    /// Grace period passed to pod deletion on terminate
    pub termination_grace_seconds: i64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            cache_pvc: None,
            node_selector: BTreeMap::new(),
            termination_grace_seconds: 30,
        }
    }
}

/// Runs each instance as a bare pod.
#[derive(Clone)]
pub struct KubernetesPodRuntime {
    client: Client,
    config: KubernetesConfig,
}

impl KubernetesPodRuntime {
    /// Wrap an existing client
    pub fn new(client: Client, config: KubernetesConfig) -> Self {
        Self { client, config }
    }

    /// Connect with the ambient kubeconfig or in-cluster credentials
    pub async fn try_default(config: KubernetesConfig) -> Result<Self, LaunchError> {
        let client = Client::try_default()
            .await
            .map_err(|e| LaunchError::runtime(RUNTIME, "-", format!("failed to create client: {e}")))?;
        Ok(Self::new(client, config))
    }

    fn api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn delete(&self, handle: &RuntimeHandle, grace_seconds: i64) -> Result<(), LaunchError> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_seconds.max(0) as u32),
            ..Default::default()
        };
        match self.api().delete(&handle.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(kube_error(handle, "delete pod", e)),
        }
    }
}

fn kube_error(handle: &RuntimeHandle, what: &str, e: kube::Error) -> LaunchError {
    LaunchError::runtime(RUNTIME, &handle.name, format!("failed to {what}: {e}"))
}

fn quantities(values: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect()
}

/// Build the pod for a launch spec
pub fn build_pod(spec: &LaunchSpec, config: &KubernetesConfig) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        INSTANCE_NAME_PREFIX.to_string(),
    );
    labels.insert(INSTANCE_LABEL.to_string(), spec.name.clone());

    let mut requests = quantities(&spec.resources.requests);
    let mut limits = quantities(&spec.resources.limits);
    let gpu_resource = match spec.vendor {
        GpuVendor::Nvidia => Some("nvidia.com/gpu"),
        GpuVendor::Amd => Some("amd.com/gpu"),
        GpuVendor::Unknown => None,
    };
    if let Some(resource) = gpu_resource.filter(|_| spec.gpu_count > 0) {
        let count = Quantity(spec.gpu_count.to_string());
        limits.entry(resource.to_string()).or_insert_with(|| count.clone());
        requests.entry(resource.to_string()).or_insert(count);
    }

    let mut volumes = vec![Volume {
        name: "dshm".to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "dshm".to_string(),
        mount_path: "/dev/shm".to_string(),
        ..Default::default()
    }];
    for (i, volume) in spec.volumes.iter().enumerate() {
        let name = format!("model-cache-{i}");
        let source = match &config.cache_pvc {
            Some(claim) => Volume {
                name: name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
            None => Volume {
                name: name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: volume.host_path.display().to_string(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            },
        };
        volumes.push(source);
        mounts.push(VolumeMount {
            name,
            mount_path: volume.container_path.clone(),
            ..Default::default()
        });
    }

    let container = Container {
        name: "server".to_string(),
        image: Some(spec.image.clone()),
        command: Some(spec.command.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| EnvVar {
                    name: k.clone(),
                    value: Some(v.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: i32::from(spec.port),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            node_selector: (!config.node_selector.is_empty()).then(|| config.node_selector.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exit code from a pod's status: None while the pod is not terminal
pub fn pod_exit_code(pod: &Pod) -> Option<i32> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref() {
        Some("Succeeded") => Some(0),
        Some("Failed") => Some(
            status
                .container_statuses
                .iter()
                .flatten()
                .find_map(|c| c.state.as_ref()?.terminated.as_ref().map(|t| t.exit_code))
                .filter(|code| *code != 0)
                .unwrap_or(1),
        ),
        _ => None,
    }
}

#[async_trait]
impl Runtime for KubernetesPodRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::KubernetesPod
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError> {
        let pod = build_pod(spec, &self.config);
        let handle = RuntimeHandle {
            id: spec.name.clone(),
            name: spec.name.clone(),
        };
        info!(pod = %spec.name, namespace = %self.config.namespace, image = %spec.image, "Creating pod");
        self.api()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| kube_error(&handle, "create pod", e))?;
        Ok(handle)
    }

    async fn endpoint(&self, handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError> {
        let pod = self
            .api()
            .get_opt(&handle.name)
            .await
            .map_err(|e| kube_error(handle, "get pod", e))?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.pod_ip)
            .map(|ip| format!("http://{ip}:{port}")))
    }

    async fn exit_code(&self, handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError> {
        match self
            .api()
            .get_opt(&handle.name)
            .await
            .map_err(|e| kube_error(handle, "get pod", e))?
        {
            Some(pod) => Ok(pod_exit_code(&pod)),
            None => {
                debug!(pod = %handle.name, "Pod no longer exists");
                Ok(Some(-1))
            }
        }
    }

    async fn terminate(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.delete(handle, self.config.termination_grace_seconds).await
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.delete(handle, 0).await
    }

    async fn release(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.delete(handle, 0).await
    }
}
