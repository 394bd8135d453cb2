use async_trait::async_trait;
use lotse_common::pod::base_env;
use lotse_common::Error;
use lotse_types::{Package, Runtime};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::OrchestratorClient;

/// How long a disposable builder pod is given to reach `Running` before
/// `prepare_cache` gives up.
const BUILDER_POD_TIMEOUT: Duration = Duration::from_secs(180);

/// Root directory under which cached, prepared environments are kept,
/// one per `(package, version, stage)`. Platform layout mirrors the
/// original's `config.HOME_PATH`: `%PROGRAMDATA%\Kubernetes\Lotse` on
/// Windows, `/var/Kubernetes/Lotse` on Linux, `~/Kubernetes/Lotse`
/// elsewhere.
pub fn cache_root() -> PathBuf {
    if cfg!(target_os = "windows") {
        let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
        PathBuf::from(base).join("Kubernetes").join("Lotse")
    } else if cfg!(target_os = "linux") {
        PathBuf::from("/var").join("Kubernetes").join("Lotse")
    } else {
        dirs_home().join("Kubernetes").join("Lotse")
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Path of the cached venv tarball for a given package/version/stage.
pub fn venv_cache_path(package_name: &str, version: &str, stage: &str) -> PathBuf {
    cache_root().join("venvs").join(sanitize_path_segment(package_name)).join(version).join(stage).join("venv.tar.gz")
}

/// Path of a deployed package's extracted source files, written by the
/// (out-of-scope) package-management component. Grounded on
/// `PathManager.get_package_path`.
pub fn package_cache_path(package_name: &str, version: &str, stage: &str) -> PathBuf {
    cache_root().join("packages").join(sanitize_path_segment(package_name)).join(version).join(stage)
}

fn sanitize_path_segment(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

fn exit_code_regex() -> Regex {
    Regex::new(r"^EXIT_CODE=(\d+)$").expect("valid regex")
}

/// Execs `command` in the pod wrapped so its exit status is echoed as a
/// literal trailing `EXIT_CODE=<n>` line, and returns that captured code
/// rather than the orchestrator's own exec status — the pod's primary
/// container keeps running (`sleep infinity`) long after this particular
/// command finishes, so there is no container exit code to read.
async fn run_to_exit_code(orchestrator: &OrchestratorClient, namespace: &str, pod_name: &str, shell: &str, command: &str) -> Result<i32, Error> {
    let re = exit_code_regex();
    let captured = std::cell::Cell::new(None::<i32>);
    let wrapped = format!("{}; echo \"EXIT_CODE=$?\"", command);
    orchestrator
        .run_command(namespace, pod_name, shell, &wrapped, |line| {
            if let Some(caps) = re.captures(line) {
                if let Some(code) = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok()) {
                    captured.set(Some(code));
                }
            }
            false
        })
        .await?;
    captured.get().ok_or_else(|| Error::PrepareFailed(format!("pod {} never produced an EXIT_CODE marker", pod_name)))
}

/// Prepares and hydrates a task pod's runtime environment. `prepare_cache`
/// builds the cached environment at most once per `(package, version,
/// stage)` triple; `hydrate_pod` copies that cache into a freshly created
/// pod. Dispatch between the three implementations is a plain `match` on
/// [`lotse_types::Runtime`] rather than a registry, since the set of
/// runtimes is closed and small.
#[async_trait]
pub trait RuntimePreparer: Send + Sync {
    /// Builds the cached environment if it doesn't already exist.
    /// No-op for runtimes with nothing to cache.
    async fn prepare_cache(&self, namespace: &str, package: &Package) -> Result<(), Error>;

    /// Copies the cached environment and the package's own files into the
    /// pod and returns the shell command (sans `cd /app` and arguments,
    /// which the engine appends) that starts the task's entrypoint.
    async fn hydrate_pod(&self, namespace: &str, pod_name: &str, package: &Package) -> Result<String, Error>;
}

/// Python (or other interpreted-language) packages: a venv is built once
/// per (package, version, stage) and cached as a tarball, then hydrated
/// into every pod that runs that triple. Grounded on `k8s_python.py`'s
/// `prepare_environment`/`setup_venv` pair.
pub struct InterpretedPreparer {
    orchestrator: Arc<OrchestratorClient>,
}

impl InterpretedPreparer {
    pub fn new(orchestrator: Arc<OrchestratorClient>) -> Self {
        InterpretedPreparer { orchestrator }
    }
}

#[async_trait]
impl RuntimePreparer for InterpretedPreparer {
    async fn prepare_cache(&self, namespace: &str, package: &Package) -> Result<(), Error> {
        let cache_path = venv_cache_path(&package.package_name, &package.version, &package.stage);
        if cache_path.exists() {
            return Ok(());
        }
        tokio::fs::create_dir_all(cache_path.parent().expect("cache path has a parent")).await?;

        let builder_name = lotse_common::name::generate_name(&format!("prep-{}", package.package_name));
        let pod = lotse_common::pod::task_pod(
            builder_name.clone(),
            namespace.to_owned(),
            package.image.clone(),
            Runtime::Interpreted,
            base_env(&builder_name, ""),
            &[],
            true,
        );
        self.orchestrator.create_pod(namespace, pod).await?;
        let result = self.build_venv(namespace, &builder_name, package).await;
        let _ = self.orchestrator.delete_pod(namespace, &builder_name).await;
        result
    }

    async fn hydrate_pod(&self, namespace: &str, pod_name: &str, package: &Package) -> Result<String, Error> {
        let package_dir = package_cache_path(&package.package_name, &package.version, &package.stage);
        self.orchestrator.copy_in(namespace, pod_name, path_str(&package_dir)?, "/app").await?;

        let cache_path = venv_cache_path(&package.package_name, &package.version, &package.stage);
        self.orchestrator.copy_in(namespace, pod_name, path_str(&cache_path)?, "/tmp/venv.tar.gz").await?;
        let shell = self.orchestrator.shell_probe(namespace, pod_name).await?;
        self.orchestrator.run_command(namespace, pod_name, shell, "tar xzf /tmp/venv.tar.gz -C /app", |_| false).await?;
        Ok(format!(". venv/bin/activate && python -u {}", package.entrypoint))
    }
}

impl InterpretedPreparer {
    async fn build_venv(&self, namespace: &str, builder_name: &str, package: &Package) -> Result<(), Error> {
        self.orchestrator.wait_for_running(namespace, builder_name, BUILDER_POD_TIMEOUT).await?;

        let package_dir = package_cache_path(&package.package_name, &package.version, &package.stage);
        self.orchestrator.copy_in(namespace, builder_name, path_str(&package_dir)?, "/app").await?;

        let shell = self.orchestrator.shell_probe(namespace, builder_name).await?;
        let exit_code = run_to_exit_code(
            &self.orchestrator,
            namespace,
            builder_name,
            shell,
            "python -m venv /app/venv && . /app/venv/bin/activate && pip install -r /app/requirements.txt",
        )
        .await?;
        if exit_code != 0 {
            return Err(Error::PrepareFailed(format!("venv setup exited with code {}", exit_code)));
        }

        run_to_exit_code(&self.orchestrator, namespace, builder_name, shell, "tar czf /tmp/venv.tar.gz -C /app venv").await?;

        let cache_path = venv_cache_path(&package.package_name, &package.version, &package.stage);
        self.orchestrator.copy_out(namespace, builder_name, "/tmp/venv.tar.gz", path_str(&cache_path)?).await?;
        Ok(())
    }
}

/// Precompiled native binaries: nothing to cache, the binary ships inside
/// the package's own artifact bundle, copied to `/app` at hydrate time.
pub struct NativeBinaryPreparer {
    orchestrator: Arc<OrchestratorClient>,
}

impl NativeBinaryPreparer {
    pub fn new(orchestrator: Arc<OrchestratorClient>) -> Self {
        NativeBinaryPreparer { orchestrator }
    }
}

#[async_trait]
impl RuntimePreparer for NativeBinaryPreparer {
    async fn prepare_cache(&self, _namespace: &str, _package: &Package) -> Result<(), Error> {
        Ok(())
    }

    async fn hydrate_pod(&self, namespace: &str, pod_name: &str, package: &Package) -> Result<String, Error> {
        let package_dir = package_cache_path(&package.package_name, &package.version, &package.stage);
        self.orchestrator.copy_in(namespace, pod_name, path_str(&package_dir)?, "/app").await?;
        Ok(format!("chmod +x {} && ./{}", package.entrypoint, package.entrypoint))
    }
}

/// Prebuilt container images: the image's own entrypoint is the workload,
/// so there's nothing to copy or exec to start it — the pod was never
/// given the `sleep infinity` placeholder command in the first place.
pub struct PrebuiltContainerPreparer;

#[async_trait]
impl RuntimePreparer for PrebuiltContainerPreparer {
    async fn prepare_cache(&self, _namespace: &str, _package: &Package) -> Result<(), Error> {
        Ok(())
    }

    async fn hydrate_pod(&self, _namespace: &str, _pod_name: &str, _package: &Package) -> Result<String, Error> {
        Ok(String::new())
    }
}

fn path_str(path: &std::path::Path) -> Result<&str, Error> {
    path.to_str().ok_or_else(|| Error::GenericError(format!("non-utf8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venv_cache_path_sanitizes_package_name() {
        let path = venv_cache_path("my/weird package", "1.0.0", "prod");
        assert!(path.to_str().unwrap().contains("my_weird_package"));
    }

    #[test]
    fn package_cache_path_sanitizes_package_name() {
        let path = package_cache_path("my/weird package", "1.0.0", "prod");
        assert!(path.to_str().unwrap().contains("my_weird_package"));
        assert!(path.to_str().unwrap().contains("packages"));
    }
}
