use crate::backup::{BackupError, ImageBackupService};
use crate::image_reference::{matches_registry, rewrite_to_backup};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

/// Workload kinds whose pod template containers are subject to the backup policy.
pub trait Workload
where
    Self: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or_default()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    /// Main containers of the pod template, in declaration order.
    /// Init and ephemeral containers are not part of the policy.
    fn containers_mut(&mut self) -> &mut [Container] {
        self.pod_spec_mut()
            .map(|ps| ps.containers.as_mut_slice())
            .unwrap_or_default()
    }
}

impl Workload for Deployment {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl Workload for DaemonSet {
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

/// Applies the backup policy to every container of a workload.
///
/// Containers are handled one at a time in index order. The first failing
/// backup aborts the whole workload, so callers never see a partially
/// rewritten object.
pub struct WorkloadMutator {
    backup: Arc<ImageBackupService>,
}

impl WorkloadMutator {
    pub fn new(backup: Arc<ImageBackupService>) -> Self {
        Self { backup }
    }

    pub async fn mutate<K: Workload>(&self, mut workload: K) -> Result<K, BackupError> {
        let backup_registry = self.backup.policy().backup_registry.clone();
        let workload_name = workload.name_any();

        for container in workload.containers_mut().iter_mut() {
            let image = container.image.clone().unwrap_or_default();
            info!(
                "Testing if image {} of container {} in {} {} matches registry {}",
                image,
                container.name,
                K::kind_name(),
                workload_name,
                backup_registry
            );
            if matches_registry(&image, &backup_registry) {
                debug!("Image {} is already in the backup registry", image);
                continue;
            }

            info!(
                "Container {} uses image {} outside the backup registry, backing up the image",
                container.name, image
            );
            self.backup.backup(&image).await?;

            let backup_image = rewrite_to_backup(&image, &backup_registry);
            info!(
                "Mutating container {} image from {} to {}",
                container.name, image, backup_image
            );
            container.image = Some(backup_image);
        }

        Ok(workload)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::tests::{BACKUP_REGISTRY, FakeRegistry, service_with};
    use serde_json::{Value, json};

    pub(crate) const KINDS: [&str; 2] = ["Deployment", "DaemonSet"];

    /// Workload manifest of the given kind with one container per image.
    pub(crate) fn workload_fixture(kind: &str, images: &[&str]) -> Value {
        let containers: Vec<Value> = images
            .iter()
            .enumerate()
            .map(|(idx, image)| {
                json!({
                    "name": format!("container-{}", idx),
                    "image": image,
                    "command": ["sleep", "3600"],
                    "imagePullPolicy": "IfNotPresent",
                    "ports": [{"containerPort": 8080 + idx, "protocol": "TCP"}],
                })
            })
            .collect();

        let mut spec = json!({
            "selector": {"matchLabels": {"app": "busybox"}},
            "template": {
                "metadata": {"labels": {"app": "busybox"}},
                "spec": {
                    "initContainers": [{"name": "init", "image": "quay.io/busybox:init"}],
                    "containers": containers,
                },
            },
        });
        if kind == "Deployment" {
            spec["replicas"] = json!(2);
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": kind,
            "metadata": {
                "name": "busybox",
                "namespace": "default",
                "labels": {"app": "busybox"},
            },
            "spec": spec,
        })
    }

    /// Same manifest as the API server forwards it, including the fields a
    /// typed round trip drops or rewrites.
    pub(crate) fn api_server_fixture(kind: &str, images: &[&str]) -> Value {
        let mut object = workload_fixture(kind, images);
        object["metadata"]["uid"] = json!("2f1c7e4a-0c55-4d9b-a8b4-6c5f6f0d9e11");
        object["metadata"]["creationTimestamp"] = Value::Null;
        object["spec"]["template"]["metadata"]["creationTimestamp"] = Value::Null;
        for container in object["spec"]["template"]["spec"]["containers"]
            .as_array_mut()
            .unwrap()
        {
            container["resources"] = json!({});
            container["terminationMessagePath"] = json!("/dev/termination-log");
        }
        object["status"] = json!({});
        object
    }

    fn images<K: Workload>(workload: &mut K) -> Vec<String> {
        workload
            .containers_mut()
            .iter()
            .map(|c| c.image.clone().unwrap_or_default())
            .collect()
    }

    async fn mutate_kind(
        kind: &str,
        registry: Arc<FakeRegistry>,
        fixture: Value,
    ) -> Result<Vec<String>, BackupError> {
        let mutator = WorkloadMutator::new(Arc::new(service_with(registry)));
        match kind {
            "Deployment" => {
                let workload: Deployment = serde_json::from_value(fixture).unwrap();
                mutator.mutate(workload).await.map(|mut w| images(&mut w))
            }
            "DaemonSet" => {
                let workload: DaemonSet = serde_json::from_value(fixture).unwrap();
                mutator.mutate(workload).await.map(|mut w| images(&mut w))
            }
            other => panic!("unsupported kind {}", other),
        }
    }

    #[test]
    fn test_kind_name() {
        assert_eq!(Deployment::kind_name(), "Deployment");
        assert_eq!(DaemonSet::kind_name(), "DaemonSet");
    }

    #[test]
    fn test_workload_without_pod_spec_has_no_containers() {
        let mut deployment = Deployment::default();
        assert!(deployment.containers_mut().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_rewrites_untrusted_images() {
        for kind in KINDS {
            let registry = Arc::new(FakeRegistry::default());
            let fixture = workload_fixture(kind, &["quay.io/busybox:latest"]);

            let images = mutate_kind(kind, registry.clone(), fixture).await.unwrap();

            assert_eq!(images, vec!["docker.io/piotrkpcbackup/busybox:latest"], "{kind}");
            assert_eq!(
                registry.pushed_tags(),
                vec!["docker.io/piotrkpcbackup/quay.io/busybox:latest"],
                "{kind}"
            );
        }
    }

    #[tokio::test]
    async fn test_mutate_skips_trusted_images() {
        for kind in KINDS {
            let registry = Arc::new(FakeRegistry::default());
            let trusted = format!("{}/busybox:latest", BACKUP_REGISTRY);
            let fixture = workload_fixture(kind, &[&trusted]);

            let images = mutate_kind(kind, registry.clone(), fixture).await.unwrap();

            assert_eq!(images, vec![trusted], "{kind}");
            assert!(registry.pulled().is_empty(), "{kind}");
            assert!(registry.pushed_tags().is_empty(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_mutate_keeps_container_order() {
        for kind in KINDS {
            let registry = Arc::new(FakeRegistry::default());
            let trusted = format!("{}/envoy:v1", BACKUP_REGISTRY);
            let fixture =
                workload_fixture(kind, &["nginx:1.27", &trusted, "ghcr.io/org/redis:7"]);

            let images = mutate_kind(kind, registry.clone(), fixture).await.unwrap();

            assert_eq!(
                images,
                vec![
                    "docker.io/piotrkpcbackup/nginx:1.27".to_string(),
                    trusted,
                    "docker.io/piotrkpcbackup/redis:7".to_string(),
                ],
                "{kind}"
            );
            assert_eq!(
                registry.pulled(),
                vec!["docker.io/library/nginx:1.27", "ghcr.io/org/redis:7"],
                "{kind}"
            );
        }
    }

    #[tokio::test]
    async fn test_mutate_fails_fast() {
        for kind in KINDS {
            let registry = Arc::new(FakeRegistry {
                fail_pull: true,
                ..Default::default()
            });
            let fixture = workload_fixture(kind, &["quay.io/busybox:latest", "nginx:1.27"]);

            let err = mutate_kind(kind, registry.clone(), fixture)
                .await
                .unwrap_err();

            assert!(matches!(err, BackupError::PullFailed { .. }), "{kind}");
            assert_eq!(registry.pulled(), vec!["quay.io/busybox:latest"], "{kind}");
        }
    }

    #[tokio::test]
    async fn test_mutate_rejects_container_without_image() {
        let registry = Arc::new(FakeRegistry::default());
        let mut fixture = workload_fixture("Deployment", &["quay.io/busybox:latest"]);
        fixture["spec"]["template"]["spec"]["containers"][0]
            .as_object_mut()
            .unwrap()
            .remove("image");

        let err = mutate_kind("Deployment", registry.clone(), fixture)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::InvalidReference { .. }));
        assert!(registry.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_leaves_init_containers_alone() {
        let registry = Arc::new(FakeRegistry::default());
        let mutator = WorkloadMutator::new(Arc::new(service_with(registry)));
        let deployment: Deployment =
            serde_json::from_value(workload_fixture("Deployment", &["busybox:latest"])).unwrap();

        let mut mutated = mutator.mutate(deployment).await.unwrap();

        let init_containers = mutated
            .pod_spec_mut()
            .and_then(|ps| ps.init_containers.clone())
            .unwrap();
        assert_eq!(
            init_containers[0].image.as_deref(),
            Some("quay.io/busybox:init")
        );
    }
}
