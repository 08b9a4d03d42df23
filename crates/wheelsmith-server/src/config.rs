//! Runtime configuration, collected once at startup and passed through
//! constructors.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for `serve`.
    pub bind: String,
    /// SQLite DSN of the catalog.
    pub catalog_dsn: String,
    /// Blob store DSN (`file://...?url=/builds/`; `s3://` is an external
    /// driver).
    pub builds_storage_dsn: String,
    /// Container driver DSN (`tcp://`, `https://`, or a socket path).
    pub builds_docker_dsn: String,
    /// Parent of per-build scratch directories.
    pub temp_build_root: PathBuf,
    /// Persistent per-platform pip cache for compile containers.
    pub compile_cache_root: PathBuf,
    /// Change-log fetch retries.
    pub max_cache_busting_retries: u32,
    /// Route built wheels through the redirect endpoint even when the
    /// artifact URL is known, for download telemetry.
    pub always_redirect_downloads: bool,
    /// Serve `file://` blobs from this process as well.
    pub serve_builds: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            catalog_dsn: "sqlite://wheelsmith.db".to_string(),
            builds_storage_dsn: "file:///var/lib/wheelsmith/builds?url=/builds/".to_string(),
            builds_docker_dsn: String::new(),
            temp_build_root: PathBuf::from("/tmp"),
            compile_cache_root: PathBuf::from("/cache"),
            max_cache_busting_retries: 3,
            always_redirect_downloads: false,
            serve_builds: false,
        }
    }
}
