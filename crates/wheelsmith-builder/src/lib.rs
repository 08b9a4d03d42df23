//! The wheel build pipeline.
//!
//! Given a build row, materialize a wheel: run `pip wheel` in a container
//! with a scratch directory bound at `/wheelhouse`, require exactly one
//! output file, digest it, pull its metadata.json, store the blob and
//! persist the result row in one transaction. Scratch directories and
//! containers are removed on every path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use wheelsmith_catalog::{
    BuildDetail, BuildOutcome, CatalogError, CatalogStore, CompileTrack, CompiledRequirements,
    ExternalBuild, Platform, TrackUpdate,
};
use wheelsmith_storage::{ArtifactStore, StorageError, build_path, external_build_path};
use wheelsmith_types::CompilationStatus;

mod driver;
mod wheel;

pub use driver::{ContainerDriver, DockerDriver, DriverError, RunSpec};
pub use wheel::WheelError;

use driver::shell_quote;
use wheel::{extract_wheel_metadata, md5_hex};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wheel(#[from] wheel::WheelError),

    #[error("platform `{platform}` names no container image")]
    MissingImage { platform: String },

    /// The container exited without leaving exactly one file in the
    /// wheelhouse. The log is persisted on the build row.
    #[error("build produced {produced} output files instead of one")]
    BuildFailed { produced: usize },

    #[error("pip compilation failed")]
    CompilationFailed,

    #[error("environment capture printed no JSON document")]
    NoEnvironment,
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Parent of per-build scratch directories.
    pub temp_build_root: PathBuf,
    /// Persistent per-platform pip cache mounted into compile containers.
    pub compile_cache_root: PathBuf,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            temp_build_root: PathBuf::from("/tmp"),
            compile_cache_root: PathBuf::from("/cache"),
        }
    }
}

/// Executes build recipes against a [`ContainerDriver`].
pub struct WheelBuilder<D> {
    driver: D,
    catalog: CatalogStore,
    storage: Arc<dyn ArtifactStore>,
    options: BuilderOptions,
}

struct BuildTarget {
    build_id: i64,
    external: bool,
    source_url: String,
    setup_commands: String,
    /// Blob path for the produced file.
    blob_path: Box<dyn Fn(&str) -> String + Send>,
}

impl<D: ContainerDriver> WheelBuilder<D> {
    pub fn new(
        driver: D,
        catalog: CatalogStore,
        storage: Arc<dyn ArtifactStore>,
        options: BuilderOptions,
    ) -> Self {
        Self {
            driver,
            catalog,
            storage,
            options,
        }
    }

    /// Build a catalog release for its platform.
    pub async fn build(
        &self,
        detail: &BuildDetail,
        platform: &Platform,
    ) -> Result<BuildOutcome, BuildError> {
        let index_slug = detail.index_slug.clone();
        let platform_slug = detail.platform_slug.clone();
        let package_slug = detail.package_slug.clone();
        let version = detail.version.clone();
        self.run_recipe(
            platform,
            BuildTarget {
                build_id: detail.build.id,
                external: false,
                source_url: detail.release_url.clone(),
                setup_commands: detail.build.record.setup_commands.clone(),
                blob_path: Box::new(move |filename| {
                    build_path(&index_slug, &platform_slug, &package_slug, &version, filename)
                }),
            },
        )
        .await
    }

    /// Build a URL requirement's wheel.
    pub async fn build_external(
        &self,
        build: &ExternalBuild,
        platform: &Platform,
    ) -> Result<BuildOutcome, BuildError> {
        let platform_slug = platform.slug.clone();
        let external_url = build.external_url.clone();
        self.run_recipe(
            platform,
            BuildTarget {
                build_id: build.id,
                external: true,
                source_url: build.external_url.clone(),
                setup_commands: build.record.setup_commands.clone(),
                blob_path: Box::new(move |filename| {
                    external_build_path(&platform_slug, &external_url, filename)
                }),
            },
        )
        .await
    }

    async fn run_recipe(
        &self,
        platform: &Platform,
        target: BuildTarget,
    ) -> Result<BuildOutcome, BuildError> {
        let image = platform.image().ok_or_else(|| BuildError::MissingImage {
            platform: platform.slug.clone(),
        })?;

        let build_command = format!(
            "pip wheel --no-deps --no-clean --no-index --wheel-dir /wheelhouse {}",
            shell_quote(&target.source_url),
        );
        let command = target
            .setup_commands
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .chain(std::iter::once(build_command.as_str()))
            .collect::<Vec<_>>()
            .join(" && ");

        tokio::fs::create_dir_all(&self.options.temp_build_root).await?;
        let scratch = tempfile::tempdir_in(&self.options.temp_build_root)?;

        let mut log = String::new();
        log.push_str(&command);
        log.push('\n');

        self.driver.acquire_image(image, &mut log).await?;

        let timestamp = jiff::Timestamp::now().to_string();
        let started = Instant::now();
        let spec = RunSpec {
            image: image.to_string(),
            command,
            binds: vec![(scratch.path().to_path_buf(), "/wheelhouse".to_string())],
        };
        let run = self.driver.run(&spec, &mut log).await;
        let duration = started.elapsed().as_secs() as i64;

        let exit = match run {
            Ok(exit) => exit,
            Err(err) => {
                self.catalog
                    .record_build_failure(target.build_id, target.external, &log, &timestamp, duration)
                    .await?;
                return Err(err.into());
            }
        };
        debug!(build_id = target.build_id, exit, "build container finished");

        let mut produced = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            produced.push(entry.path());
        }

        if produced.len() != 1 {
            self.catalog
                .record_build_failure(target.build_id, target.external, &log, &timestamp, duration)
                .await?;
            return Err(BuildError::BuildFailed {
                produced: produced.len(),
            });
        }

        let wheel_path = &produced[0];
        let filename = wheel_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents = tokio::fs::read(wheel_path).await?;

        let outcome = BuildOutcome {
            artifact: (target.blob_path)(&filename),
            filesize: contents.len() as i64,
            md5_digest: md5_hex(&contents),
            metadata: extract_wheel_metadata(&contents)?,
            build_log: log,
            build_timestamp: timestamp,
            build_duration: duration,
        };
        self.storage.save(&outcome.artifact, &contents).await?;
        self.catalog
            .record_build_success(target.build_id, target.external, &outcome)
            .await?;
        info!(
            build_id = target.build_id,
            artifact = %outcome.artifact,
            "built wheel"
        );
        Ok(outcome)
    }

    /// Launch a short-lived container that prints the marker environment
    /// as JSON, and store the parsed document on the platform row.
    pub async fn capture_environment(
        &self,
        platform: &Platform,
    ) -> Result<serde_json::Value, BuildError> {
        let image = platform.image().ok_or_else(|| BuildError::MissingImage {
            platform: platform.slug.clone(),
        })?;

        let probe = "import sys, json; \
            from packaging.markers import default_environment; \
            json.dump(default_environment(), sys.stdout)";
        let command = format!("python -c {}", shell_quote(probe));

        let mut pull_log = String::new();
        self.driver.acquire_image(image, &mut pull_log).await?;

        let mut output = String::new();
        let spec = RunSpec {
            image: image.to_string(),
            command,
            binds: Vec::new(),
        };
        self.driver.run(&spec, &mut output).await?;

        // Interpreter noise may precede the document; take it from the
        // first brace.
        let document = output
            .find('{')
            .map(|start| &output[start..])
            .ok_or(BuildError::NoEnvironment)?;
        let environment: serde_json::Value =
            serde_json::from_str(document.trim()).map_err(|_| BuildError::NoEnvironment)?;
        self.catalog
            .set_platform_environment(platform.id, &environment)
            .await?;
        Ok(environment)
    }

    /// The pip compilation track: run pip-compile against this proxy's
    /// own index inside the platform sandbox, with a persistent pip cache
    /// per platform.
    pub async fn compile_with_pip(
        &self,
        compiled: &CompiledRequirements,
        platform: &Platform,
    ) -> Result<(), BuildError> {
        let image = platform.image().ok_or_else(|| BuildError::MissingImage {
            platform: platform.slug.clone(),
        })?;

        tokio::fs::create_dir_all(&self.options.temp_build_root).await?;
        let workspace = tempfile::tempdir_in(&self.options.temp_build_root)?;
        tokio::fs::write(workspace.path().join("requirements.in"), &compiled.requirements).await?;

        let cache_dir = self.options.compile_cache_root.join(&platform.slug);
        tokio::fs::create_dir_all(&cache_dir).await?;

        let command = format!(
            "pip-compile --verbose --no-index --index-url {} /workspace/requirements.in",
            shell_quote(&compiled.index_url),
        );

        let mut log = String::new();
        log.push_str(&command);
        log.push('\n');
        self.driver.acquire_image(image, &mut log).await?;

        let started = Instant::now();
        let spec = RunSpec {
            image: image.to_string(),
            command,
            binds: vec![
                (workspace.path().to_path_buf(), "/workspace".to_string()),
                (cache_dir, "/root/.cache".to_string()),
            ],
        };
        let run = self.driver.run(&spec, &mut log).await;
        let duration = started.elapsed().as_secs() as i64;

        if let Err(err) = run {
            self.catalog
                .finish_compile_track(compiled.id, CompileTrack::Pip, &TrackUpdate {
                    status: CompilationStatus::Failed,
                    output: String::new(),
                    log,
                    duration,
                })
                .await?;
            return Err(err.into());
        }

        match tokio::fs::read_to_string(workspace.path().join("requirements.txt")).await {
            Ok(output) => {
                self.catalog
                    .finish_compile_track(compiled.id, CompileTrack::Pip, &TrackUpdate {
                        status: CompilationStatus::Done,
                        output,
                        log,
                        duration,
                    })
                    .await?;
                Ok(())
            }
            Err(_) => {
                self.catalog
                    .finish_compile_track(compiled.id, CompileTrack::Pip, &TrackUpdate {
                        status: CompilationStatus::Failed,
                        output: String::new(),
                        log,
                        duration,
                    })
                    .await?;
                Err(BuildError::CompilationFailed)
            }
        }
    }
}
