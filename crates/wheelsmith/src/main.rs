//! The wheelsmith CLI: the HTTP front end plus the operator commands
//! that drive synchronization, builds and compilations.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use wheelsmith_catalog::CompileTrack;
use wheelsmith_client::ClientOptions;
use wheelsmith_dispatch::{BuildRef, run_internal_compile};
use wheelsmith_server::{AppState, Config};
use wheelsmith_sync::{SyncOptions, Synchronizer};
use wheelsmith_types::IndexBackend;

mod logging;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose output.
    #[arg(global = true, long, short)]
    verbose: bool,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args)]
struct BackendArgs {
    /// Catalog database DSN.
    #[arg(global = true, long, env = "CATALOG_DSN", default_value = "sqlite://wheelsmith.db")]
    catalog_dsn: String,

    /// Blob store DSN (`file:///path?url=/builds/`).
    #[arg(
        global = true,
        long,
        env = "BUILDS_STORAGE_DSN",
        default_value = "file:///var/lib/wheelsmith/builds?url=/builds/"
    )]
    builds_storage_dsn: String,

    /// Container driver DSN (`tcp://`, `https://`, or a socket path;
    /// empty means the local Docker defaults).
    #[arg(global = true, long, env = "BUILDS_DOCKER_DSN", default_value = "")]
    builds_docker_dsn: String,

    /// Parent directory for per-build scratch space.
    #[arg(global = true, long, env = "TEMP_BUILD_ROOT", default_value = "/tmp")]
    temp_build_root: PathBuf,

    /// Persistent per-platform pip cache for compile containers.
    #[arg(global = true, long, env = "COMPILE_CACHE_ROOT", default_value = "/cache")]
    compile_cache_root: PathBuf,

    /// Upstream change-log fetch retries.
    #[arg(global = true, long, env = "MAX_CACHE_BUSTING_RETRIES", default_value_t = 3)]
    max_cache_busting_retries: u32,

    /// Route built wheels through the redirect endpoint for telemetry.
    #[arg(global = true, long, env = "ALWAYS_REDIRECT_DOWNLOADS")]
    always_redirect_downloads: bool,

    /// Also serve blobs from this process.
    #[arg(global = true, long, env = "SERVE_BUILDS")]
    serve_builds: bool,
}

impl BackendArgs {
    fn config(&self, bind: Option<String>) -> Config {
        Config {
            bind: bind.unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            catalog_dsn: self.catalog_dsn.clone(),
            builds_storage_dsn: self.builds_storage_dsn.clone(),
            builds_docker_dsn: self.builds_docker_dsn.clone(),
            temp_build_root: self.temp_build_root.clone(),
            compile_cache_root: self.compile_cache_root.clone(),
            max_cache_busting_retries: self.max_cache_busting_retries,
            always_redirect_downloads: self.always_redirect_downloads,
            serve_builds: self.serve_builds,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP front end.
    Serve {
        /// Listen address.
        #[arg(long, env = "BIND", default_value = "0.0.0.0:8000")]
        bind: String,
    },
    /// Synchronize an index with its upstream.
    SyncIndex {
        /// Index slug.
        index: String,
        /// Perform the initial full sweep (implied when the index was
        /// never synced).
        #[arg(long)]
        initial: bool,
    },
    /// Force a refresh of one package.
    SyncPackage {
        /// Index slug.
        index: String,
        /// Package name (any form; normalized before lookup).
        package: String,
    },
    /// Compile a requirements.in file offline.
    CompileReqs {
        /// Index set, `+`-joined in preference order (e.g. `internal+pypi`).
        indexes: String,
        /// Platform slug.
        platform: String,
        /// Input requirements file.
        input: PathBuf,
        /// Output lock file.
        output: PathBuf,
    },
    /// Force a rebuild of one build row.
    Rebuild {
        build_id: i64,
        /// The id names an external (URL requirement) build.
        #[arg(long)]
        external: bool,
    },
    /// Re-run both compilation tracks of a compile job.
    Recompile { compiled_id: i64 },
    /// Capture a platform's marker environment from a sandbox run.
    CaptureEnv {
        /// Platform slug.
        platform: String,
    },
    /// Register a backing index.
    AddIndex {
        slug: String,
        url: String,
        #[arg(long, default_value = "pypi")]
        backend: String,
    },
    /// Register a build platform.
    AddPlatform {
        slug: String,
        /// Container image to build in.
        image: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::setup(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { bind } => {
            let config = cli.backend.config(Some(bind));
            wheelsmith_server::serve(config).await?;
        }
        Commands::SyncIndex { index, initial } => {
            let state = state(&cli.backend).await?;
            let row = state
                .catalog
                .index_by_slug(&index)
                .await?
                .with_context(|| format!("index `{index}` is not registered"))?;
            let report = synchronizer(&cli.backend, &state).sync_index(&row, initial).await?;
            println!(
                "{}: imported {}, ignored {}, deleted {}, failed {}, serial {}",
                index,
                report.imported,
                report.ignored,
                report.deleted,
                report.failed.len(),
                report.last_update_serial.unwrap_or_default(),
            );
            for (name, error) in &report.failed {
                eprintln!("failed to import {name}: {error}");
            }
        }
        Commands::SyncPackage { index, package } => {
            let state = state(&cli.backend).await?;
            let row = state
                .catalog
                .index_by_slug(&index)
                .await?
                .with_context(|| format!("index `{index}` is not registered"))?;
            let sync = synchronizer(&cli.backend, &state);
            let client = wheelsmith_client::IndexClient::new(
                row.backend,
                &row.url.parse().context("index URL is invalid")?,
                client_options(&cli.backend),
            )?;
            match sync.import_package(&row, &client, &package).await? {
                Some(_) => println!("imported {package} from {index}"),
                None => println!("{package} has no importable releases on {index}"),
            }
        }
        Commands::CompileReqs {
            indexes,
            platform,
            input,
            output,
        } => {
            let state = state(&cli.backend).await?;
            let platform_row = state
                .catalog
                .platform_by_slug(&platform)
                .await?
                .with_context(|| format!("platform `{platform}` is not registered"))?;
            let requirements = std::fs::read_to_string(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let slugs: Vec<String> = indexes.split('+').map(ToString::to_string).collect();
            let compiled = state
                .catalog
                .create_compiled_requirements(
                    platform_row.id,
                    &requirements,
                    &format!("/v1/{indexes}/{platform}/+simple/"),
                    &slugs,
                )
                .await?;
            let finished = run_internal_compile(
                &state.catalog,
                &state.scheduler,
                &state.storage,
                compiled.id,
            )
            .await?;
            if finished.internal.status == wheelsmith_types::CompilationStatus::Done {
                std::fs::write(&output, &finished.internal.output)
                    .with_context(|| format!("cannot write {}", output.display()))?;
                println!("wrote {}", output.display());
            } else {
                eprint!("{}", finished.internal.log);
                bail!("compilation failed");
            }
        }
        Commands::Rebuild { build_id, external } => {
            let state = state(&cli.backend).await?;
            let build = if external {
                BuildRef::External(build_id)
            } else {
                BuildRef::Internal(build_id)
            };
            state.scheduler.ensure_built(build, true).await?;
            println!("rebuilt {build_id}");
        }
        Commands::Recompile { compiled_id } => {
            let state = state(&cli.backend).await?;
            state
                .catalog
                .reset_compile_track(compiled_id, CompileTrack::Internal)
                .await?;
            state
                .catalog
                .reset_compile_track(compiled_id, CompileTrack::Pip)
                .await?;
            let finished = run_internal_compile(
                &state.catalog,
                &state.scheduler,
                &state.storage,
                compiled_id,
            )
            .await?;
            let compiled = state
                .catalog
                .compiled_requirements(compiled_id)
                .await?
                .context("compile job vanished")?;
            let platform = state
                .catalog
                .platform_by_id(compiled.platform_id)
                .await?
                .context("platform vanished")?;
            if let Err(err) = state.builder.compile_with_pip(&compiled, &platform).await {
                eprintln!("pip track failed: {err}");
            }
            println!("internal track: {}", finished.internal.status.as_str());
        }
        Commands::CaptureEnv { platform } => {
            let state = state(&cli.backend).await?;
            let row = state
                .catalog
                .platform_by_slug(&platform)
                .await?
                .with_context(|| format!("platform `{platform}` is not registered"))?;
            let environment = state.builder.capture_environment(&row).await?;
            println!("{}", serde_json::to_string_pretty(&environment)?);
        }
        Commands::AddIndex { slug, url, backend } => {
            let state = state(&cli.backend).await?;
            let backend: IndexBackend = backend.parse().map_err(anyhow::Error::msg)?;
            state.catalog.create_index(&slug, &url, backend).await?;
            println!("registered index {slug}");
        }
        Commands::AddPlatform { slug, image } => {
            let state = state(&cli.backend).await?;
            state
                .catalog
                .create_platform(&slug, "docker", &serde_json::json!({ "image": image }))
                .await?;
            println!("registered platform {slug}; run `wheelsmith capture-env {slug}` next");
        }
    }
    Ok(())
}

async fn state(backend: &BackendArgs) -> Result<AppState> {
    Ok(AppState::from_config(&backend.config(None)).await?)
}

fn client_options(backend: &BackendArgs) -> ClientOptions {
    ClientOptions {
        retries: backend.max_cache_busting_retries,
        ..ClientOptions::default()
    }
}

fn synchronizer(backend: &BackendArgs, state: &AppState) -> Synchronizer {
    Synchronizer::new(
        state.catalog.clone(),
        state.cache.clone(),
        Arc::clone(&state.storage),
        SyncOptions {
            client: client_options(backend),
            ..SyncOptions::default()
        },
    )
}
