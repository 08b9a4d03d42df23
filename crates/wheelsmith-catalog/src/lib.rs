//! The catalog: a transactional relational store for indexes, packages,
//! releases, platforms, builds and compile jobs.
//!
//! Backed by sqlx over SQLite, DSN-configured. All multi-row mutations run
//! in a single transaction; readers observe pre- or post-transaction
//! snapshots, never partial writes. Mutations that change what a link page
//! would render return [`Invalidation`] values the caller applies to the
//! page cache after commit.

use std::cmp::Reverse;
use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use thiserror::Error;
use tracing::debug;

use wheelsmith_normalize::PackageSlug;
use wheelsmith_types::{CompilationStatus, IndexBackend, WheelMetadata};

mod entities;

pub use entities::{
    Build, BuildDetail, BuildRecord, CompileTrack, CompiledRequirements, ExternalBuild, Index,
    Invalidation, Package, Platform, Release, TrackState,
};

static SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("malformed JSON in catalog column: {0}")]
    Column(#[from] serde_json::Error),

    #[error("unknown backend stored for index `{index}`")]
    UnknownBackend { index: String },
}

/// The desired shape of one release during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRelease {
    /// Normalized PEP 440 version.
    pub version: String,
    pub url: String,
    pub md5_digest: String,
}

/// What `replace_releases` did, and what the caller now owes the cache
/// and the blob store.
#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub invalidation: Invalidation,
    pub changed: bool,
    /// Artifacts of builds that were cascade-deleted with their releases.
    pub removed_artifacts: Vec<String>,
}

/// A successful build's persistable result.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact: String,
    pub filesize: i64,
    pub md5_digest: String,
    /// `None` when the wheel carried no metadata.json.
    pub metadata: Option<WheelMetadata>,
    pub build_log: String,
    pub build_timestamp: String,
    pub build_duration: i64,
}

#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub status: CompilationStatus,
    pub output: String,
    pub log: String,
    pub duration: i64,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Open (and migrate) the catalog at the given SQLite DSN, e.g.
    /// `sqlite:///var/lib/wheelsmith/catalog.db`.
    pub async fn connect(dsn: &str) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// A throwaway in-memory catalog.
    pub async fn in_memory() -> Result<Self, CatalogError> {
        Self::connect("sqlite::memory:").await
    }

    // ------------------------------------------------------------------
    // Indexes

    pub async fn create_index(
        &self,
        slug: &str,
        url: &str,
        backend: IndexBackend,
    ) -> Result<Index, CatalogError> {
        sqlx::query("INSERT INTO indexes (slug, url, backend) VALUES (?, ?, ?)")
            .bind(slug)
            .bind(url)
            .bind(backend.as_str())
            .execute(&self.pool)
            .await?;
        Ok(self.index_by_slug(slug).await?.expect("just inserted"))
    }

    pub async fn index_by_slug(&self, slug: &str) -> Result<Option<Index>, CatalogError> {
        let row = sqlx::query("SELECT * FROM indexes WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(index_from_row).transpose()
    }

    /// Resolve a set of slugs preserving the declared order. `None` when
    /// any slug is unknown.
    pub async fn indexes_by_slugs(&self, slugs: &[String]) -> Result<Option<Vec<Index>>, CatalogError> {
        let mut indexes = Vec::with_capacity(slugs.len());
        for slug in slugs {
            match self.index_by_slug(slug).await? {
                Some(index) => indexes.push(index),
                None => return Ok(None),
            }
        }
        Ok(Some(indexes))
    }

    pub async fn list_indexes(&self) -> Result<Vec<Index>, CatalogError> {
        let rows = sqlx::query("SELECT * FROM indexes ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(index_from_row).collect()
    }

    /// Advance the change-log cursor. The cursor is strictly
    /// non-decreasing; a stale write is silently dropped.
    pub async fn set_last_update_serial(
        &self,
        index_id: i64,
        serial: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE indexes SET last_update_serial = ?
             WHERE id = ? AND (last_update_serial IS NULL OR last_update_serial <= ?)",
        )
        .bind(serial)
        .bind(index_id)
        .bind(serial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Packages

    /// Normalize `name` and return the matching package, creating it if
    /// absent. The display name is preserved from the first observation.
    pub async fn upsert_package(&self, index_id: i64, name: &str) -> Result<Package, CatalogError> {
        let slug = PackageSlug::new(name);
        sqlx::query(
            "INSERT INTO packages (index_id, name, slug) VALUES (?, ?, ?)
             ON CONFLICT (index_id, slug) DO NOTHING",
        )
        .bind(index_id)
        .bind(name)
        .bind(slug.as_str())
        .execute(&self.pool)
        .await?;
        Ok(self
            .package(index_id, &slug)
            .await?
            .expect("upserted package exists"))
    }

    pub async fn package(
        &self,
        index_id: i64,
        slug: &PackageSlug,
    ) -> Result<Option<Package>, CatalogError> {
        let row = sqlx::query("SELECT * FROM packages WHERE index_id = ? AND slug = ?")
            .bind(index_id)
            .bind(slug.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(package_from_row))
    }

    pub async fn package_ids(&self, index_id: i64) -> Result<Vec<i64>, CatalogError> {
        let rows = sqlx::query("SELECT id FROM packages WHERE index_id = ?")
            .bind(index_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Delete a package (releases and builds cascade). Returns the owed
    /// cache invalidation and the orphaned artifact paths, or `None` if
    /// the package was already gone.
    pub async fn delete_package(
        &self,
        package_id: i64,
    ) -> Result<Option<(Invalidation, Vec<String>)>, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            "SELECT p.slug AS package_slug, i.slug AS index_slug
             FROM packages p JOIN indexes i ON i.id = p.index_id
             WHERE p.id = ?",
        )
        .bind(package_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let invalidation = Invalidation {
            index_slug: row.get("index_slug"),
            package_slug: PackageSlug::new(row.get::<String, _>("package_slug").as_str()),
        };
        let artifacts = sqlx::query(
            "SELECT b.artifact FROM builds b
             JOIN releases r ON r.id = b.release_id
             WHERE r.package_id = ? AND b.artifact IS NOT NULL",
        )
        .bind(package_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get("artifact"))
        .collect();
        sqlx::query("DELETE FROM packages WHERE id = ?")
            .bind(package_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some((invalidation, artifacts)))
    }

    // ------------------------------------------------------------------
    // Releases

    /// Reconcile a package's releases against the desired set in one
    /// transaction: insert missing versions, update rows whose URL or
    /// digest drifted, delete everything else.
    pub async fn replace_releases(
        &self,
        package: &Package,
        desired: &[DesiredRelease],
    ) -> Result<ReplaceOutcome, CatalogError> {
        let now = jiff::Timestamp::now().to_string();
        let mut tx = self.pool.begin().await?;

        let index_slug: String = sqlx::query("SELECT slug FROM indexes WHERE id = ?")
            .bind(package.index_id)
            .fetch_one(&mut *tx)
            .await?
            .get("slug");

        let existing = sqlx::query("SELECT * FROM releases WHERE package_id = ?")
            .bind(package.id)
            .fetch_all(&mut *tx)
            .await?;
        let existing: Vec<Release> = existing.into_iter().map(release_from_row).collect();

        let mut changed = false;
        for want in desired {
            match existing.iter().find(|have| have.version == want.version) {
                None => {
                    sqlx::query(
                        "INSERT INTO releases (package_id, version, url, md5_digest, last_update)
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(package.id)
                    .bind(&want.version)
                    .bind(&want.url)
                    .bind(&want.md5_digest)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    changed = true;
                }
                Some(have) if have.url != want.url || have.md5_digest != want.md5_digest => {
                    sqlx::query(
                        "UPDATE releases SET url = ?, md5_digest = ?, last_update = ? WHERE id = ?",
                    )
                    .bind(&want.url)
                    .bind(&want.md5_digest)
                    .bind(&now)
                    .bind(have.id)
                    .execute(&mut *tx)
                    .await?;
                    changed = true;
                }
                Some(_) => {}
            }
        }

        let mut removed_artifacts = Vec::new();
        for have in &existing {
            if desired.iter().any(|want| want.version == have.version) {
                continue;
            }
            let artifacts = sqlx::query(
                "SELECT artifact FROM builds WHERE release_id = ? AND artifact IS NOT NULL",
            )
            .bind(have.id)
            .fetch_all(&mut *tx)
            .await?;
            removed_artifacts.extend(artifacts.into_iter().map(|row| row.get::<String, _>("artifact")));
            sqlx::query("DELETE FROM releases WHERE id = ?")
                .bind(have.id)
                .execute(&mut *tx)
                .await?;
            changed = true;
        }

        tx.commit().await?;
        debug!(
            package = %package.slug,
            index = %index_slug,
            changed,
            "reconciled releases"
        );
        Ok(ReplaceOutcome {
            invalidation: Invalidation {
                index_slug,
                package_slug: package.slug.clone(),
            },
            changed,
            removed_artifacts,
        })
    }

    /// All releases of a package, newest version first.
    pub async fn releases_desc(&self, package_id: i64) -> Result<Vec<Release>, CatalogError> {
        let rows = sqlx::query("SELECT * FROM releases WHERE package_id = ?")
            .bind(package_id)
            .fetch_all(&self.pool)
            .await?;
        let mut releases: Vec<Release> = rows.into_iter().map(release_from_row).collect();
        releases.sort_by_cached_key(|release| {
            Reverse((release.parsed_version(), release.version.clone()))
        });
        Ok(releases)
    }

    pub async fn release(
        &self,
        package_id: i64,
        version: &str,
    ) -> Result<Option<Release>, CatalogError> {
        let row = sqlx::query("SELECT * FROM releases WHERE package_id = ? AND version = ?")
            .bind(package_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(release_from_row))
    }

    /// Find a `(package, version)` release across an ordered index set;
    /// the earliest index that carries it wins.
    pub async fn release_for_indexes(
        &self,
        indexes: &[Index],
        slug: &PackageSlug,
        version: &str,
    ) -> Result<Option<Release>, CatalogError> {
        for index in indexes {
            if let Some(package) = self.package(index.id, slug).await? {
                if let Some(release) = self.release(package.id, version).await? {
                    return Ok(Some(release));
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Platforms

    pub async fn create_platform(
        &self,
        slug: &str,
        kind: &str,
        spec: &serde_json::Value,
    ) -> Result<Platform, CatalogError> {
        sqlx::query("INSERT INTO platforms (slug, kind, spec) VALUES (?, ?, ?)")
            .bind(slug)
            .bind(kind)
            .bind(spec.to_string())
            .execute(&self.pool)
            .await?;
        Ok(self.platform_by_slug(slug).await?.expect("just inserted"))
    }

    pub async fn platform_by_slug(&self, slug: &str) -> Result<Option<Platform>, CatalogError> {
        let row = sqlx::query("SELECT * FROM platforms WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(platform_from_row).transpose()
    }

    pub async fn platform_by_id(&self, id: i64) -> Result<Option<Platform>, CatalogError> {
        let row = sqlx::query("SELECT * FROM platforms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(platform_from_row).transpose()
    }

    /// Store the captured marker environment. Written once per capture;
    /// consumed by the resolver.
    pub async fn set_platform_environment(
        &self,
        platform_id: i64,
        environment: &serde_json::Value,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE platforms SET environment = ? WHERE id = ?")
            .bind(environment.to_string())
            .bind(platform_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Builds

    pub async fn get_or_create_build(
        &self,
        release_id: i64,
        platform_id: i64,
    ) -> Result<Build, CatalogError> {
        sqlx::query(
            "INSERT INTO builds (release_id, platform_id) VALUES (?, ?)
             ON CONFLICT (release_id, platform_id) DO NOTHING",
        )
        .bind(release_id)
        .bind(platform_id)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT * FROM builds WHERE release_id = ? AND platform_id = ?")
            .bind(release_id)
            .bind(platform_id)
            .fetch_one(&self.pool)
            .await?;
        build_from_row(row)
    }

    /// Make sure a build row exists for every release of the package on
    /// this platform, then return them newest version first.
    pub async fn ensure_builds(
        &self,
        package_id: i64,
        platform_id: i64,
    ) -> Result<Vec<BuildDetail>, CatalogError> {
        let releases = self.releases_desc(package_id).await?;
        let mut tx = self.pool.begin().await?;
        for release in &releases {
            sqlx::query(
                "INSERT INTO builds (release_id, platform_id) VALUES (?, ?)
                 ON CONFLICT (release_id, platform_id) DO NOTHING",
            )
            .bind(release.id)
            .bind(platform_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut details = Vec::with_capacity(releases.len());
        for release in &releases {
            let row = sqlx::query(
                "SELECT b.*, r.version, r.url AS release_url, r.md5_digest AS release_md5,
                        p.name AS package_name, p.slug AS package_slug,
                        i.slug AS index_slug, pl.slug AS platform_slug
                 FROM builds b
                 JOIN releases r ON r.id = b.release_id
                 JOIN packages p ON p.id = r.package_id
                 JOIN indexes i ON i.id = p.index_id
                 JOIN platforms pl ON pl.id = b.platform_id
                 WHERE b.release_id = ? AND b.platform_id = ?",
            )
            .bind(release.id)
            .bind(platform_id)
            .fetch_one(&self.pool)
            .await?;
            details.push(build_detail_from_row(row)?);
        }
        Ok(details)
    }

    pub async fn build_detail(&self, build_id: i64) -> Result<Option<BuildDetail>, CatalogError> {
        let row = sqlx::query(
            "SELECT b.*, r.version, r.url AS release_url, r.md5_digest AS release_md5,
                    p.name AS package_name, p.slug AS package_slug,
                    i.slug AS index_slug, pl.slug AS platform_slug
             FROM builds b
             JOIN releases r ON r.id = b.release_id
             JOIN packages p ON p.id = r.package_id
             JOIN indexes i ON i.id = p.index_id
             JOIN platforms pl ON pl.id = b.platform_id
             WHERE b.id = ?",
        )
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(build_detail_from_row).transpose()
    }

    /// Persist a successful build in one transaction.
    pub async fn record_build_success(
        &self,
        build_id: i64,
        external: bool,
        outcome: &BuildOutcome,
    ) -> Result<(), CatalogError> {
        let table = build_table(external);
        sqlx::query(&format!(
            "UPDATE {table}
             SET artifact = ?, filesize = ?, md5_digest = ?, metadata = ?,
                 build_log = ?, build_timestamp = ?, build_duration = ?
             WHERE id = ?"
        ))
        .bind(&outcome.artifact)
        .bind(outcome.filesize)
        .bind(&outcome.md5_digest)
        .bind(
            outcome
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&outcome.build_log)
        .bind(&outcome.build_timestamp)
        .bind(outcome.build_duration)
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the log of a failed build; the artifact column stays as it
    /// was, so a previously built wheel keeps serving.
    pub async fn record_build_failure(
        &self,
        build_id: i64,
        external: bool,
        build_log: &str,
        build_timestamp: &str,
        build_duration: i64,
    ) -> Result<(), CatalogError> {
        let table = build_table(external);
        sqlx::query(&format!(
            "UPDATE {table}
             SET build_log = ?, build_timestamp = ?, build_duration = ?
             WHERE id = ?"
        ))
        .bind(build_log)
        .bind(build_timestamp)
        .bind(build_duration)
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // External builds

    pub async fn get_or_create_external_build(
        &self,
        external_url: &str,
        platform_id: i64,
    ) -> Result<ExternalBuild, CatalogError> {
        sqlx::query(
            "INSERT INTO external_builds (external_url, platform_id) VALUES (?, ?)
             ON CONFLICT (external_url, platform_id) DO NOTHING",
        )
        .bind(external_url)
        .bind(platform_id)
        .execute(&self.pool)
        .await?;
        let row =
            sqlx::query("SELECT * FROM external_builds WHERE external_url = ? AND platform_id = ?")
                .bind(external_url)
                .bind(platform_id)
                .fetch_one(&self.pool)
                .await?;
        external_build_from_row(row)
    }

    pub async fn external_build(&self, id: i64) -> Result<Option<ExternalBuild>, CatalogError> {
        let row = sqlx::query("SELECT * FROM external_builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(external_build_from_row).transpose()
    }

    // ------------------------------------------------------------------
    // Compile jobs

    pub async fn create_compiled_requirements(
        &self,
        platform_id: i64,
        requirements: &str,
        index_url: &str,
        index_slugs: &[String],
    ) -> Result<CompiledRequirements, CatalogError> {
        let created_at = jiff::Timestamp::now().to_string();
        let result = sqlx::query(
            "INSERT INTO compiled_requirements
                 (platform_id, requirements, index_url, index_slugs, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(platform_id)
        .bind(requirements)
        .bind(index_url)
        .bind(serde_json::to_string(index_slugs)?)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;
        Ok(self
            .compiled_requirements(result.last_insert_rowid())
            .await?
            .expect("just inserted"))
    }

    pub async fn compiled_requirements(
        &self,
        id: i64,
    ) -> Result<Option<CompiledRequirements>, CatalogError> {
        let row = sqlx::query("SELECT * FROM compiled_requirements WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(compiled_from_row).transpose()
    }

    /// Finish a compilation track. The pending → done|failed transition is
    /// one-way: finishing an already-finished track is a no-op and
    /// returns `false`.
    pub async fn finish_compile_track(
        &self,
        id: i64,
        track: CompileTrack,
        update: &TrackUpdate,
    ) -> Result<bool, CatalogError> {
        let prefix = track.column_prefix();
        let timestamp = jiff::Timestamp::now().to_string();
        let result = sqlx::query(&format!(
            "UPDATE compiled_requirements
             SET {prefix}_status = ?, {prefix}_output = ?, {prefix}_log = ?,
                 {prefix}_timestamp = ?, {prefix}_duration = ?
             WHERE id = ? AND {prefix}_status = 'pending'"
        ))
        .bind(update.status.as_str())
        .bind(&update.output)
        .bind(&update.log)
        .bind(&timestamp)
        .bind(update.duration)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-open a track for a forced recompile.
    pub async fn reset_compile_track(
        &self,
        id: i64,
        track: CompileTrack,
    ) -> Result<(), CatalogError> {
        let prefix = track.column_prefix();
        sqlx::query(&format!(
            "UPDATE compiled_requirements
             SET {prefix}_status = 'pending', {prefix}_output = '', {prefix}_log = ''
             WHERE id = ?"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn build_table(external: bool) -> &'static str {
    if external { "external_builds" } else { "builds" }
}

// ----------------------------------------------------------------------
// Row mapping

fn index_from_row(row: SqliteRow) -> Result<Index, CatalogError> {
    let slug: String = row.get("slug");
    let backend: String = row.get("backend");
    let backend = backend
        .parse::<IndexBackend>()
        .map_err(|_| CatalogError::UnknownBackend { index: slug.clone() })?;
    Ok(Index {
        id: row.get("id"),
        slug,
        url: row.get("url"),
        backend,
        last_update_serial: row.get("last_update_serial"),
    })
}

fn package_from_row(row: SqliteRow) -> Package {
    Package {
        id: row.get("id"),
        index_id: row.get("index_id"),
        name: row.get("name"),
        slug: PackageSlug::new(row.get::<String, _>("slug").as_str()),
    }
}

fn release_from_row(row: SqliteRow) -> Release {
    Release {
        id: row.get("id"),
        package_id: row.get("package_id"),
        version: row.get("version"),
        url: row.get("url"),
        md5_digest: row.get("md5_digest"),
    }
}

fn platform_from_row(row: SqliteRow) -> Result<Platform, CatalogError> {
    let spec: String = row.get("spec");
    let environment: Option<String> = row.get("environment");
    Ok(Platform {
        id: row.get("id"),
        slug: row.get("slug"),
        kind: row.get("kind"),
        spec: serde_json::from_str(&spec)?,
        environment: environment
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<BuildRecord, CatalogError> {
    let metadata: Option<String> = row.get("metadata");
    Ok(BuildRecord {
        artifact: row.get("artifact"),
        filesize: row.get("filesize"),
        md5_digest: row.get("md5_digest"),
        metadata: metadata
            .map(|raw| serde_json::from_str::<WheelMetadata>(&raw))
            .transpose()?,
        build_timestamp: row.get("build_timestamp"),
        build_duration: row.get("build_duration"),
        build_log: row.get("build_log"),
        setup_commands: row.get("setup_commands"),
    })
}

fn build_from_row(row: SqliteRow) -> Result<Build, CatalogError> {
    Ok(Build {
        id: row.get("id"),
        release_id: row.get("release_id"),
        platform_id: row.get("platform_id"),
        record: record_from_row(&row)?,
    })
}

fn external_build_from_row(row: SqliteRow) -> Result<ExternalBuild, CatalogError> {
    Ok(ExternalBuild {
        id: row.get("id"),
        external_url: row.get("external_url"),
        platform_id: row.get("platform_id"),
        record: record_from_row(&row)?,
    })
}

fn build_detail_from_row(row: SqliteRow) -> Result<BuildDetail, CatalogError> {
    Ok(BuildDetail {
        build: Build {
            id: row.get("id"),
            release_id: row.get("release_id"),
            platform_id: row.get("platform_id"),
            record: record_from_row(&row)?,
        },
        version: row.get("version"),
        release_url: row.get("release_url"),
        release_md5: row.get("release_md5"),
        package_name: row.get("package_name"),
        package_slug: PackageSlug::new(row.get::<String, _>("package_slug").as_str()),
        index_slug: row.get("index_slug"),
        platform_slug: row.get("platform_slug"),
    })
}

fn track_from_row(row: &SqliteRow, prefix: &str) -> TrackState {
    let status: String = row.get(format!("{prefix}_status").as_str());
    TrackState {
        status: status.parse().unwrap_or(CompilationStatus::Pending),
        output: row.get(format!("{prefix}_output").as_str()),
        log: row.get(format!("{prefix}_log").as_str()),
        timestamp: row.get(format!("{prefix}_timestamp").as_str()),
        duration: row.get(format!("{prefix}_duration").as_str()),
    }
}

fn compiled_from_row(row: SqliteRow) -> Result<CompiledRequirements, CatalogError> {
    let slugs: String = row.get("index_slugs");
    Ok(CompiledRequirements {
        id: row.get("id"),
        platform_id: row.get("platform_id"),
        requirements: row.get("requirements"),
        index_url: row.get("index_url"),
        index_slugs: serde_json::from_str(&slugs)?,
        created_at: row.get("created_at"),
        internal: track_from_row(&row, "internal"),
        pip: track_from_row(&row, "pip"),
    })
}

#[cfg(test)]
mod tests;
