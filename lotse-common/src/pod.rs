use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Volume, VolumeMount};
use kube::api::ObjectMeta;
use lotse_types::Runtime;
use std::collections::BTreeMap;

/// Label value every task pod is tagged with, so startup reconciliation can
/// list exactly the engine's own pods without touching unrelated workloads
/// sharing the namespace.
pub const CORE_LABEL: &str = "lotse-package";

/// Working directory volume mounted into every task pod's container.
pub const WORKDIR_VOLUME: &str = "workdir";
pub const WORKDIR_PATH: &str = "/app";

/// Venv/cache volume. The interpreted runtime preparer hydrates this from
/// the cached tarball before the task's command starts.
pub const VENV_VOLUME: &str = "venv";
pub const VENV_PATH: &str = "/app/venv";

/// A task's declared input/output volume, backed by a pre-existing PVC.
pub struct TaskVolume {
    pub name: String,
    pub mount_path: String,
    pub claim_name: String,
}

/// Builds the pod spec for one task. Mirrors the shape the task manager
/// constructs by hand: a workdir + venv emptyDir pair, any declared task
/// volumes mounted from their PVCs, and a placeholder `sleep infinity`
/// command for any runtime that isn't already container-native, so the
/// engine can exec the real workload in once the pod is Running.
pub fn task_pod(
    name: String,
    namespace: String,
    image: String,
    runtime: Runtime,
    env: Vec<EnvVar>,
    volumes: &[TaskVolume],
    empty_instance: bool,
) -> Pod {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert("app".to_owned(), CORE_LABEL.to_owned());

    let mut volume_mounts = vec![
        VolumeMount {
            name: WORKDIR_VOLUME.to_owned(),
            mount_path: WORKDIR_PATH.to_owned(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: VENV_VOLUME.to_owned(),
            mount_path: VENV_PATH.to_owned(),
            ..VolumeMount::default()
        },
    ];
    let mut pod_volumes = vec![
        Volume {
            name: WORKDIR_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
        Volume {
            name: VENV_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
    ];
    for v in volumes {
        volume_mounts.push(VolumeMount {
            name: v.name.clone(),
            mount_path: v.mount_path.clone(),
            ..VolumeMount::default()
        });
        pod_volumes.push(Volume {
            name: v.name.clone(),
            persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: v.claim_name.clone(),
                ..Default::default()
            }),
            ..Volume::default()
        });
    }

    let command = if runtime.needs_placeholder_command() || empty_instance {
        Some(vec!["sleep".to_owned(), "infinity".to_owned()])
    } else {
        None
    };

    let container = Container {
        name: name.clone(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        command,
        ..Container::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            // The engine owns this pod's entire lifecycle; Kubernetes
            // must never try to restart it out from under a task worker.
            restart_policy: Some("Never".to_owned()),
            containers: vec![container],
            volumes: Some(pod_volumes),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// `PROXY_PREFIX` + the standard outbound proxy passthrough env vars, built
/// the way pod creation assembles them before appending caller-supplied
/// arguments.
pub fn base_env(pod_name: &str, openapi_prefix_path: &str) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "PYTHONUNBUFFERED".to_owned(),
            value: Some("1".to_owned()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "PROXY_PREFIX".to_owned(),
            value: Some(format!("{}/proxy/{}/", openapi_prefix_path, pod_name)),
            ..EnvVar::default()
        },
    ];
    for var in ["http_proxy", "https_proxy", "no_proxy"] {
        if let Ok(value) = std::env::var(var) {
            env.push(EnvVar {
                name: var.to_owned(),
                value: Some(value),
                ..EnvVar::default()
            });
        }
    }
    env
}
