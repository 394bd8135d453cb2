use async_trait::async_trait;
use lotse_common::Error;
use lotse_types::Package;
use sqlx::PgPool;
use std::convert::TryFrom;

/// Read-only access to deployed packages. Package CRUD itself (create,
/// update, retire) lives outside this crate entirely; the execution
/// engine only ever needs to resolve `(name, version, stage)` to a
/// runnable artifact.
#[async_trait]
pub trait PackageLookup: Send + Sync {
    async fn resolve(&self, package_name: &str, version: Option<&str>, stage: &str) -> Result<Option<Package>, Error>;
}

pub struct PgPackageLookup {
    pool: PgPool,
}

impl PgPackageLookup {
    pub fn new(pool: PgPool) -> Self {
        PgPackageLookup { pool }
    }
}

#[async_trait]
impl PackageLookup for PgPackageLookup {
    async fn resolve(&self, package_name: &str, version: Option<&str>, stage: &str) -> Result<Option<Package>, Error> {
        let row = match version {
            Some(version) => {
                sqlx::query_as::<_, PackageRow>(
                    "select * from packages where package_name = $1 and version = $2 and stage = $3 and active and not deleted",
                )
                .bind(package_name)
                .bind(version)
                .bind(stage)
                .fetch_optional(&self.pool)
                .await?
            }
            // No version pinned: "default" resolves to the most recently
            // deployed active version for the stage.
            None => {
                sqlx::query_as::<_, PackageRow>(
                    "select * from packages where package_name = $1 and stage = $2 and active and not deleted
                     order by deployed_at desc limit 1",
                )
                .bind(package_name)
                .bind(stage)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(Package::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    deployment_id: String,
    package_name: String,
    version: String,
    python_version: Option<String>,
    stage: String,
    runtime: String,
    image: String,
    arguments: Option<serde_json::Value>,
    active: bool,
    entrypoint: String,
    timeout_seconds: Option<i64>,
}

impl TryFrom<PackageRow> for Package {
    type Error = Error;

    fn try_from(row: PackageRow) -> Result<Self, Error> {
        let runtime = match row.runtime.as_str() {
            "interpreted" => lotse_types::Runtime::Interpreted,
            "native_binary" => lotse_types::Runtime::NativeBinary,
            "prebuilt_container" => lotse_types::Runtime::PrebuiltContainer,
            other => return Err(Error::GenericError(format!("unknown runtime in database row: {}", other))),
        };
        Ok(Package {
            deployment_id: row.deployment_id,
            package_name: row.package_name,
            version: row.version,
            python_version: row.python_version,
            stage: row.stage,
            runtime,
            image: row.image,
            arguments: row.arguments.and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default(),
            active: row.active,
            entrypoint: row.entrypoint,
            timeout_seconds: row.timeout_seconds.map(|t| t.max(0) as u64),
        })
    }
}
