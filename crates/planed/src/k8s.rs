//! Kubernetes orchestrator adapter
//!
//! Units are bare pods pinned to a node with `nodeName`. The full unit spec
//! travels as a pod annotation so it can be read back and replaced.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec as BatchJobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, HostPathVolumeSource, Node, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::core::ErrorResponse;
use kube::{Client, ResourceExt};
use plane_lib::orchestrator::{
    ClaimSpec, ExecOutput, JobKey, JobPhase, JobPod, JobSpec, JobStatus, Orchestrator, UnitPhase,
    UnitSpec, UnitStatus,
};
use plane_lib::{Error, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

const FIELD_MANAGER: &str = "planed";
const SPEC_ANNOTATION: &str = "dbplane/unit-spec";
const NETWORK_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
const DATA_DIR: &str = "/data";
const TERMINATE_POLL: Duration = Duration::from_secs(1);
const TERMINATE_ATTEMPTS: u32 = 60;

fn kube_error(kind: &'static str, name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => Error::not_found(kind, name),
        kube::Error::Api(ErrorResponse { code: 409, .. }) => {
            Error::Conflict(format!("{kind} '{name}'"))
        }
        e => Error::orchestrator(format!("{kind} '{name}': {e}")),
    }
}

fn meta(name: &str, namespace: Option<&str>, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn unit_labels(spec: &UnitSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("dbplane/app".to_string(), spec.app_id.clone()),
        ("dbplane/group".to_string(), spec.group.clone()),
        ("dbplane/unit".to_string(), spec.name.clone()),
        (
            "dbplane/service".to_string(),
            spec.service_type.as_str().to_string(),
        ),
    ])
}

fn claim_volume(volume: &str, claim: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

/// Host directory volume, created on first use
fn host_dir_volume(volume: &str, path: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

/// Last path segment, used to name a host directory inside a job
fn dir_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn mount(volume: &str, path: String) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path,
        ..Default::default()
    }
}

/// Pod manifest for a unit
pub fn unit_pod(spec: &UnitSpec, namespace: &str) -> Result<Pod> {
    let encoded = serde_json::to_string(spec)
        .map_err(|e| Error::Internal(format!("encoding unit spec: {e}")))?;
    let mut annotations = BTreeMap::from([(SPEC_ANNOTATION.to_string(), encoded)]);
    if let Some(network) = &spec.network {
        annotations.insert(NETWORK_ANNOTATION.to_string(), network.clone());
    }

    let quantities = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(format!("{}m", spec.resources.cpu_milli)),
        ),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", spec.resources.memory_mib)),
        ),
    ]);
    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    let data = match (&spec.claim, &spec.local_dir) {
        (Some(claim), _) => Some(claim_volume("data", claim)),
        (None, Some(dir)) => Some(host_dir_volume("data", dir)),
        (None, None) => None,
    };
    let mounts = match data {
        Some(_) => vec![mount("data", DATA_DIR.to_string())],
        None => Vec::new(),
    };
    let volumes: Vec<Volume> = data.into_iter().collect();

    let mut metadata = meta(&spec.name, Some(namespace), unit_labels(spec));
    metadata.annotations = Some(annotations);
    Ok(Pod {
        metadata,
        spec: Some(PodSpec {
            node_name: Some(spec.host.clone()),
            restart_policy: Some("Always".to_string()),
            containers: vec![Container {
                name: spec.service_type.as_str().to_string(),
                image: Some(spec.image.clone()),
                ports: Some(vec![ContainerPort {
                    container_port: i32::from(spec.port),
                    ..Default::default()
                }]),
                env: Some(env),
                resources: Some(ResourceRequirements {
                    limits: Some(quantities.clone()),
                    requests: Some(quantities),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Observed unit state from a pod
pub fn unit_status(pod: &Pod) -> UnitStatus {
    let status = pod.status.as_ref();
    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Pending") => UnitPhase::Pending,
        Some("Running") => UnitPhase::Running,
        Some("Succeeded") => UnitPhase::Succeeded,
        Some("Failed") => UnitPhase::Failed,
        _ => UnitPhase::Unknown,
    };
    let ready = pod.metadata.deletion_timestamp.is_none()
        && status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);
    UnitStatus {
        name: pod.name_any(),
        phase,
        ready,
        ip: status.and_then(|s| s.pod_ip.clone()),
        host: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
    }
}

/// Job manifest; claims and host directories are mounted under the data
/// directory by name
pub fn batch_job(spec: &JobSpec) -> Job {
    let mut volumes = Vec::with_capacity(spec.claims.len() + spec.local_dirs.len());
    let mut mounts = Vec::with_capacity(volumes.capacity());
    for (i, claim) in spec.claims.iter().enumerate() {
        let name = format!("claim-{i}");
        volumes.push(claim_volume(&name, claim));
        mounts.push(mount(&name, format!("{DATA_DIR}/{claim}")));
    }
    for (i, dir) in spec.local_dirs.iter().enumerate() {
        let name = format!("local-{i}");
        volumes.push(host_dir_volume(&name, dir));
        mounts.push(mount(&name, format!("{DATA_DIR}/{}", dir_name(dir))));
    }

    Job {
        metadata: meta(
            &spec.key.name,
            Some(spec.key.namespace.as_str()),
            spec.labels.clone(),
        ),
        spec: Some(BatchJobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: spec.host.clone(),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "job".to_string(),
                        image: Some(spec.image.clone()),
                        command: Some(spec.command.clone()),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Active;
    };
    let condition = |kind: &str| {
        status
            .conditions
            .as_ref()
            .map(|cs| cs.iter().any(|c| c.type_ == kind && c.status == "True"))
            .unwrap_or(false)
    };
    if status.succeeded.unwrap_or(0) > 0 || condition("Complete") {
        JobPhase::Complete
    } else if status.failed.unwrap_or(0) > 0 || condition("Failed") {
        JobPhase::Failed
    } else {
        JobPhase::Active
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut out).await?;
    }
    Ok(out)
}

pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
    pods: Api<Pod>,
    nodes: Api<Node>,
    config_maps: Api<ConfigMap>,
    claims: Api<PersistentVolumeClaim>,
    volumes: Api<PersistentVolume>,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            pods: Api::namespaced(client.clone(), &namespace),
            nodes: Api::all(client.clone()),
            config_maps: Api::namespaced(client.clone(), &namespace),
            claims: Api::namespaced(client.clone(), &namespace),
            volumes: Api::all(client.clone()),
            client,
            namespace,
        }
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs_in(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Poll until the named pod no longer exists
    async fn await_pod_gone(&self, name: &str) -> Result<()> {
        for _ in 0..TERMINATE_ATTEMPTS {
            let existing = self
                .pods
                .get_opt(name)
                .await
                .map_err(|e| kube_error("unit", name, e))?;
            if existing.is_none() {
                return Ok(());
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }
        Err(Error::Timeout {
            after: TERMINATE_POLL * TERMINATE_ATTEMPTS,
            what: format!("pod {name} to terminate"),
        })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<()> {
        let pod = unit_pod(spec, &self.namespace)?;
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| kube_error("unit", &spec.name, e))?;
        info!(unit = %spec.name, host = %spec.host, "Unit pod created");
        Ok(())
    }

    async fn get_unit_spec(&self, name: &str) -> Result<UnitSpec> {
        let pod = self
            .pods
            .get(name)
            .await
            .map_err(|e| kube_error("unit", name, e))?;
        let encoded = pod
            .annotations()
            .get(SPEC_ANNOTATION)
            .ok_or_else(|| Error::orchestrator(format!("pod {name} carries no unit spec")))?;
        serde_json::from_str(encoded)
            .map_err(|e| Error::orchestrator(format!("pod {name} unit spec: {e}")))
    }

    /// Pod resources are immutable, so the pod is deleted and created again
    async fn replace_unit(&self, spec: &UnitSpec) -> Result<()> {
        let pod = unit_pod(spec, &self.namespace)?;
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.pods
            .delete(&spec.name, &params)
            .await
            .map_err(|e| kube_error("unit", &spec.name, e))?;
        self.await_pod_gone(&spec.name).await?;
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| kube_error("unit", &spec.name, e))?;
        info!(unit = %spec.name, "Unit pod replaced");
        Ok(())
    }

    async fn get_unit(&self, name: &str) -> Result<UnitStatus> {
        let pod = self
            .pods
            .get(name)
            .await
            .map_err(|e| kube_error("unit", name, e))?;
        Ok(unit_status(&pod))
    }

    async fn delete_unit(&self, name: &str) -> Result<()> {
        self.pods
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("unit", name, e))?;
        Ok(())
    }

    async fn exec(&self, unit: &str, command: &[String]) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods
            .exec(unit, command.to_vec(), &params)
            .await
            .map_err(|e| kube_error("unit", unit, e))?;

        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let stdout = stdout.map_err(|e| Error::orchestrator(format!("exec {unit}: {e}")))?;
        let stderr = stderr.map_err(|e| Error::orchestrator(format!("exec {unit}: {e}")))?;

        let success = match status {
            Some(status) => status
                .await
                .and_then(|s| s.status)
                .map(|s| s == "Success")
                .unwrap_or(false),
            None => false,
        };
        debug!(unit = %unit, command = ?command, success, "Exec finished");
        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }

    async fn set_host_unschedulable(&self, host: &str, unschedulable: bool) -> Result<bool> {
        let node = self
            .nodes
            .get(host)
            .await
            .map_err(|e| kube_error("host", host, e))?;
        let previous = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if previous != unschedulable {
            let patch = json!({ "spec": { "unschedulable": unschedulable } });
            self.nodes
                .patch(host, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| kube_error("host", host, e))?;
        }
        Ok(previous)
    }

    async fn apply_config_map(&self, name: &str, data: BTreeMap<String, String>) -> Result<()> {
        let config_map = ConfigMap {
            metadata: meta(name, Some(self.namespace.as_str()), BTreeMap::new()),
            data: Some(data),
            ..Default::default()
        };
        self.config_maps
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&config_map),
            )
            .await
            .map_err(|e| kube_error("config map", name, e))?;
        Ok(())
    }

    async fn get_config_map(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let config_map = self
            .config_maps
            .get(name)
            .await
            .map_err(|e| kube_error("config map", name, e))?;
        Ok(config_map.data.unwrap_or_default())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.config_maps
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("config map", name, e))?;
        Ok(())
    }

    async fn create_claim(&self, spec: &ClaimSpec) -> Result<()> {
        let claim = PersistentVolumeClaim {
            metadata: meta(&spec.name, Some(self.namespace.as_str()), BTreeMap::new()),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: spec.storage_class.clone(),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(format!("{}Mi", spec.size_mib)),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.claims
            .create(&PostParams::default(), &claim)
            .await
            .map_err(|e| kube_error("claim", &spec.name, e))?;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim = claims
            .get(name)
            .await
            .map_err(|e| kube_error("claim", name, e))?;
        let volume = claim.spec.and_then(|s| s.volume_name);
        claims
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("claim", name, e))?;
        Ok(volume)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("volume", name, e))?;
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        let name = spec.key.to_string();
        self.jobs_in(&spec.key.namespace)
            .create(&PostParams::default(), &batch_job(spec))
            .await
            .map_err(|e| kube_error("job", &name, e))?;
        info!(job = %name, "Job created");
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<JobStatus> {
        let job = self
            .jobs_in(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| kube_error("job", &key.to_string(), e))?;
        Ok(JobStatus {
            key: key.clone(),
            phase: job_phase(&job),
        })
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.jobs_in(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| kube_error("job", &key.to_string(), e))?;
        Ok(())
    }

    async fn job_pods(&self, key: &JobKey) -> Result<Vec<JobPod>> {
        let params = ListParams::default().labels(&format!("job-name={}", key.name));
        let pods = self
            .pods_in(&key.namespace)
            .list(&params)
            .await
            .map_err(|e| kube_error("job", &key.to_string(), e))?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let claims = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.volumes.as_ref())
                    .map(|volumes| {
                        volumes
                            .iter()
                            .filter_map(|v| v.persistent_volume_claim.as_ref())
                            .map(|c| c.claim_name.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                JobPod {
                    name: pod.name_any(),
                    claims,
                }
            })
            .collect())
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        self.pods_in(namespace)
            .logs(pod, &LogParams::default())
            .await
            .map_err(|e| kube_error("pod", pod, e))
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        self.pods_in(namespace)
            .delete(pod, &DeleteParams::default())
            .await
            .map_err(|e| kube_error("pod", pod, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plane_lib::models::{ResourceRequest, ServiceType};

    fn spec() -> UnitSpec {
        UnitSpec {
            name: "orders-mysql-0".into(),
            app_id: "app-1".into(),
            group: "orders-mysql".into(),
            service_type: ServiceType::Mysql,
            image: "mysql:8.0".into(),
            host: "node-a".into(),
            network: Some("macvlan-1".into()),
            port: 3306,
            resources: ResourceRequest {
                service_type: ServiceType::Mysql,
                cpu_milli: 2000,
                memory_mib: 4096,
                storage_medium_mib: 0,
                storage_high_mib: 0,
                bandwidth: None,
            },
            claim: Some("orders-mysql-0-data".into()),
            local_dir: None,
            env: BTreeMap::from([("ROLE".to_string(), "source".to_string())]),
        }
    }

    #[test]
    fn test_unit_pod_round_trips_spec_annotation() {
        let pod = unit_pod(&spec(), "db").unwrap();
        assert_eq!(pod.metadata.namespace.as_deref(), Some("db"));
        let encoded = pod.annotations().get(SPEC_ANNOTATION).unwrap();
        let decoded: UnitSpec = serde_json::from_str(encoded).unwrap();
        assert_eq!(decoded, spec());

        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.node_name.as_deref(), Some("node-a"));
        let container = &pod_spec.containers[0];
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("2000m".into()));
        assert_eq!(limits["memory"], Quantity("4096Mi".into()));
        assert_eq!(
            pod_spec.volumes.unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "orders-mysql-0-data"
        );
    }

    #[test]
    fn test_unit_status_reads_ready_condition() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "orders-mysql-0" },
            "spec": { "nodeName": "node-a", "containers": [] },
            "status": {
                "phase": "Running",
                "podIP": "10.0.0.7",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .unwrap();
        let status = unit_status(&pod);
        assert!(status.is_ready());
        assert_eq!(status.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(status.host.as_deref(), Some("node-a"));

        let pending: Pod = serde_json::from_value(json!({
            "metadata": { "name": "orders-mysql-1" },
            "status": { "phase": "Pending" }
        }))
        .unwrap();
        assert_eq!(unit_status(&pending).phase, UnitPhase::Pending);
        assert!(!unit_status(&pending).ready);
    }

    #[test]
    fn test_job_phase() {
        let job = |status: serde_json::Value| -> Job {
            serde_json::from_value(json!({ "metadata": { "name": "j" }, "status": status }))
                .unwrap()
        };
        assert_eq!(job_phase(&job(json!({ "active": 1 }))), JobPhase::Active);
        assert_eq!(job_phase(&job(json!({ "succeeded": 1 }))), JobPhase::Complete);
        assert_eq!(
            job_phase(&job(json!({
                "conditions": [{ "type": "Failed", "status": "True" }]
            }))),
            JobPhase::Failed
        );
    }

    #[test]
    fn test_batch_job_mounts_claims() {
        let job = batch_job(&JobSpec {
            key: JobKey::new("db", "backup-u1-abcd"),
            image: "dbplane/backup:latest".into(),
            command: vec!["backup".into()],
            host: Some("node-a".into()),
            claims: vec!["backup-u1-abcd-data".into()],
            local_dirs: Vec::new(),
            labels: BTreeMap::from([("dbplane/kind".to_string(), "backup".to_string())]),
        });
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.containers[0].volume_mounts.as_ref().unwrap()[0].mount_path,
            "/data/backup-u1-abcd-data"
        );
    }

    #[test]
    fn test_host_storage_unit_mounts_its_host_directory() {
        let mut local = spec();
        local.claim = None;
        local.local_dir = Some("/var/lib/dbplane/high/orders-mysql-0".into());

        let pod_spec = unit_pod(&local, "db").unwrap().spec.unwrap();
        let volumes = pod_spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        let host_path = volumes[0].host_path.as_ref().unwrap();
        assert_eq!(host_path.path, "/var/lib/dbplane/high/orders-mysql-0");
        assert_eq!(host_path.type_.as_deref(), Some("DirectoryOrCreate"));
        assert!(volumes[0].persistent_volume_claim.is_none());

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, volumes[0].name);
        assert_eq!(mounts[0].mount_path, "/data");
    }

    #[test]
    fn test_unit_without_storage_has_no_volumes() {
        let mut bare = spec();
        bare.claim = None;
        let pod_spec = unit_pod(&bare, "db").unwrap().spec.unwrap();
        assert!(pod_spec.volumes.unwrap().is_empty());
        assert!(pod_spec.containers[0].volume_mounts.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_restore_job_mounts_host_directory_by_unit_name() {
        let job = batch_job(&JobSpec {
            key: JobKey::new("db", "restore-u1-abcd"),
            image: "dbplane/backup:latest".into(),
            command: vec!["restore".into()],
            host: Some("node-a".into()),
            claims: Vec::new(),
            local_dirs: vec!["/var/lib/dbplane/high/orders-mysql-0".into()],
            labels: BTreeMap::new(),
        });
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.host_path.as_ref().unwrap().path,
            "/var/lib/dbplane/high/orders-mysql-0"
        );
        assert_eq!(
            pod.containers[0].volume_mounts.as_ref().unwrap()[0].mount_path,
            "/data/orders-mysql-0"
        );
    }

    #[test]
    fn test_error_mapping() {
        let api = |code: u16| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "m".into(),
                reason: "r".into(),
                code,
            })
        };
        assert!(kube_error("unit", "u", api(404)).is_not_found());
        assert!(kube_error("unit", "u", api(409)).is_conflict());
        assert!(matches!(
            kube_error("unit", "u", api(500)),
            Error::Orchestrator(_)
        ));
    }
}
