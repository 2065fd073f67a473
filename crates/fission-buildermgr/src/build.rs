//! Building one package revision.
//!
//! # Architecture
//!
//! [`PackageBuilder::build`] takes a `pending` package to `succeeded` or
//! `failed`:
//!
//! 1. mark it `running` and look up its environment
//! 2. wait for a ready builder pod of the environment's revision, and make
//!    sure the builder's service account may read packages in the
//!    package's namespace
//! 3. through the builder pod: fetch the source archive, run the build,
//!    upload the artifact to the storage service, then clean up
//! 4. point the package's deployment archive at the upload and move every
//!    function using the package to the new package revision
//!
//! Failures of steps 2 and 3 end in `failed` with the collected build logs.
//! Only catalog errors surface, so the work queue can retry them. A retry
//! finds the package still `running` with nothing building it and starts
//! over; once retries run out the package is marked `failed`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fission_client::{
    ArchiveUploadRequest, ArchiveUploadResponse, BuildRequest, BuilderClient, ClientError, FetchRequest, FetchType,
    FetcherClient,
};
use fission_core::labels::{self, BUILDER_SERVICE_ACCOUNT, PACKAGE_GETTER_ROLE, PACKAGE_GETTER_ROLE_BINDING};
use fission_core::{
    Archive, ArchiveType, BuildStatus, BuilderConfig, Cache, Environment, Function, ObjectMeta, Package, PackageRef,
    PackageStatus,
};
use fission_orchestrator::{Orchestrator, Pod, RoleBinding, Selector, Subject};
use fission_state::StateStore;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::envwatcher::{builder_name, builder_namespace};
use crate::error::{BuildError, BuildResult};

const MIN_READY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_READY_BACKOFF: Duration = Duration::from_secs(10);

pub struct PackageBuilder {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    config: BuilderConfig,
    /// Package revisions being built, keyed `{name}-{resourceVersion}`.
    in_flight: Cache<String, String>,
}

impl PackageBuilder {
    /// Must be called inside a tokio runtime.
    pub fn new(store: StateStore, orchestrator: Arc<dyn Orchestrator>, config: BuilderConfig) -> Self {
        Self {
            store,
            orchestrator,
            config,
            in_flight: Cache::new(None),
        }
    }

    /// Build `pkg`. Returns the package as last written, or `None` when the
    /// same revision is already being built.
    pub async fn build(&self, pkg: Package) -> BuildResult<Option<Package>> {
        let key = format!("{}-{}", pkg.metadata.name, pkg.metadata.resource_version);
        if self.in_flight.set(key.clone(), pkg.metadata.table_key()).await?.is_some() {
            debug!(%key, "package revision already building");
            return Ok(None);
        }
        let result = self.run(pkg).await;
        if let Err(e) = self.in_flight.delete(&key).await {
            warn!(%key, error = %e, "failed to release build slot");
        }
        result.map(Some)
    }

    async fn run(&self, pkg: Package) -> BuildResult<Package> {
        info!(
            package = %pkg.metadata.name,
            namespace = %pkg.metadata.namespace,
            resource_version = %pkg.metadata.resource_version,
            "starting build for package"
        );
        let pkg = self.set_status(pkg, BuildStatus::Running, String::new(), None)?;

        let env_ref = &pkg.spec.environment;
        let env_ns = if env_ref.namespace.is_empty() {
            pkg.metadata.namespace.clone()
        } else {
            env_ref.namespace.clone()
        };
        let Some(env) = self.store.get::<Environment>(&env_ns, &env_ref.name)? else {
            let err = BuildError::EnvironmentNotFound {
                namespace: env_ns,
                name: env_ref.name.clone(),
            };
            error!(package = %pkg.metadata.name, error = %err, "cannot build package");
            return self.set_status(pkg, BuildStatus::Failed, err.to_string(), None);
        };

        let builder_ns = builder_namespace(&self.config, &env.metadata.namespace);
        if let Err(err) = self.wait_for_builder(&env, &builder_ns, &pkg.metadata.namespace).await {
            error!(package = %pkg.metadata.name, environment = %env.metadata.name, error = %err, "builder unavailable");
            return self.set_status(pkg, BuildStatus::Failed, err.to_string(), None);
        }

        let mut logs = String::new();
        let upload = match self.build_package(&pkg, &env, &builder_ns, &mut logs).await {
            Ok(upload) => upload,
            Err(err) => {
                error!(package = %pkg.metadata.name, error = %err, "error building package");
                logs.push_str(&format!("{err}\n"));
                return self.set_status(pkg, BuildStatus::Failed, logs, None);
            }
        };

        let pkg = self.set_status(pkg, BuildStatus::Succeeded, logs, Some(&upload))?;
        let functions = self.update_functions(&pkg)?;
        info!(package = %pkg.metadata.name, functions, "completed package build request");
        Ok(pkg)
    }

    /// Whether some revision of `pkg` is being built right now.
    pub async fn is_building(&self, pkg: &Package) -> BuildResult<bool> {
        let key = pkg.metadata.table_key();
        Ok(self.in_flight.copy().await?.iter().any(|(_, building)| *building == key))
    }

    /// Stop retrying a package: if it is not in a terminal state it is
    /// marked `failed` with `reason` appended to its log.
    pub fn give_up(&self, namespace: &str, name: &str, reason: &str) -> BuildResult<()> {
        let Some(pkg) = self.store.get::<Package>(namespace, name)? else {
            return Ok(());
        };
        if pkg.status.build_status.is_some_and(BuildStatus::is_terminal) {
            return Ok(());
        }
        let mut logs = pkg.status.build_log.clone();
        logs.push_str(reason);
        logs.push('\n');
        warn!(package = %name, %namespace, %reason, "marking package failed");
        self.set_status(pkg, BuildStatus::Failed, logs, None)?;
        Ok(())
    }

    /// Write `status` with `logs`; an upload also becomes the package's
    /// deployment archive.
    pub fn set_status(
        &self,
        mut pkg: Package,
        status: BuildStatus,
        logs: String,
        upload: Option<&ArchiveUploadResponse>,
    ) -> BuildResult<Package> {
        pkg.status = PackageStatus {
            build_status: Some(status),
            build_log: logs,
            last_update_timestamp: unix_now(),
        };
        if let Some(upload) = upload {
            pkg.spec.deployment = Archive {
                kind: ArchiveType::Url,
                url: upload.archive_download_url.clone(),
                checksum: upload.checksum.clone(),
                ..Default::default()
            };
        }
        debug!(package = %pkg.metadata.name, %status, "updating package status");
        Ok(self.store.update(pkg)?)
    }

    // ── Builder readiness ──────────────────────────────────────────

    async fn wait_for_builder(&self, env: &Environment, builder_ns: &str, pkg_ns: &str) -> BuildResult<()> {
        let selector = Selector::from(labels::builder_labels(env));
        let deadline = Instant::now() + self.config.builder_ready_timeout;
        let mut delay = MIN_READY_BACKOFF;
        loop {
            let pods = self.orchestrator.list_pods(Some(builder_ns), &selector).await?;
            if pods.iter().any(Pod::is_ready) {
                match self.ensure_role_binding(pkg_ns, builder_ns).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(
                        role_binding = PACKAGE_GETTER_ROLE_BINDING,
                        namespace = %pkg_ns,
                        error = %e,
                        "error setting up role binding for package"
                    ),
                }
            } else if pods.is_empty() {
                info!(environment = %env.metadata.name, "builder pod does not exist for environment, will retry again later");
            } else {
                info!(environment = %env.metadata.name, "builder pod is not ready for environment, will retry again later");
            }

            if Instant::now() + delay > deadline {
                return Err(BuildError::BuilderNotReady);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_READY_BACKOFF);
        }
    }

    async fn ensure_role_binding(&self, pkg_ns: &str, builder_ns: &str) -> BuildResult<()> {
        let subject = Subject::service_account(builder_ns, BUILDER_SERVICE_ACCOUNT);
        let binding = match self.orchestrator.get_role_binding(pkg_ns, PACKAGE_GETTER_ROLE_BINDING).await? {
            Some(binding) if binding.subjects.contains(&subject) => return Ok(()),
            Some(mut binding) => {
                binding.subjects.push(subject);
                binding
            }
            None => RoleBinding {
                metadata: ObjectMeta::new(pkg_ns, PACKAGE_GETTER_ROLE_BINDING),
                role: PACKAGE_GETTER_ROLE.to_string(),
                subjects: vec![subject],
            },
        };
        self.orchestrator.apply_role_binding(binding).await?;
        info!(
            sa = %format!("{BUILDER_SERVICE_ACCOUNT}.{builder_ns}"),
            namespace = %pkg_ns,
            "setup rolebinding for sa package"
        );
        Ok(())
    }

    // ── Fetch, build, upload ───────────────────────────────────────

    async fn build_package(
        &self,
        pkg: &Package,
        env: &Environment,
        builder_ns: &str,
        logs: &mut String,
    ) -> BuildResult<ArchiveUploadResponse> {
        let name = builder_name(env);
        // Service addresses are hosts; the ports come from configuration.
        let host = match self.orchestrator.get_service(builder_ns, &name).await? {
            Some(svc) if !svc.address.is_empty() => svc.address,
            _ => format!("{name}.{builder_ns}"),
        };
        let fetcher = FetcherClient::new(&format!("http://{host}:{}", self.config.fetcher_port));
        let builder = BuilderClient::new(&format!("http://{host}:{}", self.config.builder_port));
        let src_pkg = format!("{}-{}", pkg.metadata.name, random_suffix(6));

        let result = self.fetch_build_upload(&fetcher, &builder, pkg, env, &src_pkg, logs).await;

        info!(source_package = %src_pkg, "cleaning src pkg from builder storage");
        if let Err(e) = builder.clean(&src_pkg).await {
            warn!(source_package = %src_pkg, error = %e, "error cleaning src pkg from builder storage");
        }
        result
    }

    async fn fetch_build_upload(
        &self,
        fetcher: &FetcherClient,
        builder: &BuilderClient,
        pkg: &Package,
        env: &Environment,
        src_pkg: &str,
        logs: &mut String,
    ) -> BuildResult<ArchiveUploadResponse> {
        let fetch = FetchRequest {
            fetch_type: FetchType::Source,
            package: PackageRef {
                namespace: pkg.metadata.namespace.clone(),
                name: pkg.metadata.name.clone(),
                resource_version: pkg.metadata.resource_version.clone(),
            },
            filename: src_pkg.to_string(),
            keep_archive: false,
            ..Default::default()
        };
        fetcher.fetch(&fetch).await.map_err(BuildError::Fetch)?;

        let command = if pkg.spec.build_command.is_empty() {
            env.spec.builder.command.clone()
        } else {
            pkg.spec.build_command.clone()
        };
        info!(source_package = %src_pkg, %command, "started building with source package");
        let request = BuildRequest {
            src_pkg_filename: src_pkg.to_string(),
            command,
        };
        let built = match builder.build(&request).await {
            Ok(built) => built,
            Err(ClientError::Status { status, body, .. }) => {
                logs.push_str(&body);
                if !body.is_empty() && !body.ends_with('\n') {
                    logs.push('\n');
                }
                return Err(BuildError::Build(format!("builder answered {status}")));
            }
            Err(e) => return Err(BuildError::Build(e.to_string())),
        };
        logs.push_str(&built.build_logs);
        info!(source_package = %src_pkg, deployment_package = %built.artifact_filename, "build succeed");

        let upload = ArchiveUploadRequest {
            filename: built.artifact_filename.clone(),
            storage_svc_url: self.config.storage_service_url.clone(),
            archive_package: !env.spec.keeparchive,
        };
        info!(deployment_package = %built.artifact_filename, "started uploading deployment package");
        fetcher.upload(&upload).await.map_err(BuildError::Upload)
    }

    // ── Dependent functions ────────────────────────────────────────

    /// Point every function using `pkg` at its current revision. Returns
    /// how many were updated.
    pub fn update_functions(&self, pkg: &Package) -> BuildResult<usize> {
        let meta = &pkg.metadata;
        let mut updated = 0;
        for mut function in self.store.list::<Function>()? {
            let stale = {
                let reference = &function.spec.package.package_ref;
                let ns = if reference.namespace.is_empty() {
                    &function.metadata.namespace
                } else {
                    &reference.namespace
                };
                reference.name == meta.name && *ns == meta.namespace && reference.resource_version != meta.resource_version
            };
            if !stale {
                continue;
            }
            function.spec.package.package_ref.resource_version = meta.resource_version.clone();
            debug!(function = %function.metadata.name, package = %meta.name, "moving function to new package revision");
            self.store.update(function)?;
            updated += 1;
        }
        Ok(updated)
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
