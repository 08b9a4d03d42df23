//! Request handlers. The router is thin: canonicalize path parameters,
//! resolve the index set and platform, delegate to the components.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use pep440_rs::Operator;
use pep508_rs::{Requirement, VersionOrUrl};
use tracing::instrument;

use wheelsmith_catalog::{BuildDetail, Index, Platform};
use wheelsmith_dispatch::{BuildRef, run_internal_compile};
use wheelsmith_normalize::PackageSlug;
use wheelsmith_resolver::split_requirement_lines;
use wheelsmith_types::CompilationStatus;

use crate::error::ServerError;
use crate::pages::{Link, build_href, render_links, render_root, trigger_path};
use crate::AppState;

/// Resolve the `a+b+c` index-set segment (order preserved) and the
/// platform slug, 404ing on any miss.
async fn resolve_scope(
    state: &AppState,
    indexes: &str,
    platform: &str,
) -> Result<(Vec<Index>, Platform), ServerError> {
    let slugs: Vec<String> = indexes.split('+').map(ToString::to_string).collect();
    let indexes = state
        .catalog
        .indexes_by_slugs(&slugs)
        .await?
        .ok_or(ServerError::NotFound { what: "index" })?;
    let platform = state
        .catalog
        .platform_by_slug(platform)
        .await?
        .ok_or(ServerError::NotFound { what: "platform" })?;
    Ok((indexes, platform))
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn redirect(status: StatusCode, location: &str) -> Response {
    (status, [(LOCATION, location.to_string())], "").into_response()
}

pub(crate) async fn index_root(
    Path((indexes, platform)): Path<(String, String)>,
) -> Html<String> {
    Html(render_root(&indexes, &platform))
}

/// `GET /v1/<indexes>/<plat>/+simple/<pkg>/`: the per-package link page.
#[instrument(skip(state, params))]
pub(crate) async fn package_links(
    State(state): State<AppState>,
    Path((indexes, platform, package)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let (index_list, platform_row) = resolve_scope(&state, &indexes, &platform).await?;
    let slug = PackageSlug::new(&package);

    // Non-canonical names and `?cache=off` bypass both read and write.
    let canonical = slug.as_str() == package;
    let use_cache = canonical && params.get("cache").map(String::as_str) != Some("off");

    let index_slugs: Vec<String> = index_list.iter().map(|index| index.slug.clone()).collect();
    let cache_key = state
        .cache
        .page_key(&index_slugs, &platform_row.slug, &slug)
        .await;
    if use_cache {
        if let Some(body) = state.cache.get(&cache_key).await {
            return Ok(html_response(body));
        }
    }

    // Ensure at least one index carries the package.
    let mut known = false;
    for index in &index_list {
        if state.catalog.package(index.id, &slug).await?.is_some() {
            known = true;
            break;
        }
    }
    if !known {
        return Err(ServerError::NotFound { what: "package" });
    }

    if !canonical {
        let location = format!("/v1/{indexes}/{platform}/+simple/{slug}/");
        return Ok(redirect(StatusCode::MOVED_PERMANENTLY, &location));
    }

    // One link per version; the earliest index wins.
    let mut seen_versions = std::collections::HashSet::new();
    let mut links = Vec::new();
    for index in &index_list {
        let Some(package_row) = state.catalog.package(index.id, &slug).await? else {
            continue;
        };
        let details = state
            .catalog
            .ensure_builds(package_row.id, platform_row.id)
            .await?;
        for detail in details {
            if !seen_versions.insert(detail.version.clone()) {
                continue;
            }
            links.push(link_for(&state, &detail));
        }
    }

    let body = render_links(&slug.to_string(), &links).into_bytes();
    if use_cache {
        state.cache.put(&cache_key, body.clone()).await;
    }
    Ok(html_response(body))
}

fn link_for(state: &AppState, detail: &BuildDetail) -> Link {
    let artifact_url = detail
        .build
        .record
        .artifact
        .as_deref()
        .and_then(|artifact| state.storage.url(artifact));
    Link {
        href: build_href(detail, artifact_url, state.always_redirect_downloads),
        filename: detail.filename().to_string(),
    }
}

fn html_response(body: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

/// `GET .../download/<build_id>/<filename>`: redirect to the built
/// artifact, or schedule the build and bounce to the upstream file.
#[instrument(skip(state))]
pub(crate) async fn download_build(
    State(state): State<AppState>,
    Path((_indexes, _platform, _package, _version, build_id, _filename)): Path<(
        String,
        String,
        String,
        String,
        i64,
        String,
    )>,
) -> Result<Response, ServerError> {
    let detail = state
        .catalog
        .build_detail(build_id)
        .await?
        .ok_or(ServerError::NotFound { what: "build" })?;

    // No digest fragment on this hop; only the link page and `+resolve/`
    // advertise digests.
    if detail.build.record.is_built() {
        if let Some(url) = detail
            .build
            .record
            .artifact
            .as_deref()
            .and_then(|artifact| state.storage.url(artifact))
        {
            return Ok(redirect(StatusCode::FOUND, &url));
        }
    }

    state.scheduler.schedule(BuildRef::Internal(build_id), false);
    Ok(redirect(StatusCode::FOUND, &detail.release_url))
}

/// `POST /v1/<indexes>/<plat>/+compile/`: compile a requirements.in
/// body into pinned requirements.
#[instrument(skip(state, headers, body))]
pub(crate) async fn compile_requirements(
    State(state): State<AppState>,
    Path((indexes, platform)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ServerError> {
    let (index_list, platform_row) = resolve_scope(&state, &indexes, &platform).await?;
    let index_slugs: Vec<String> = index_list.iter().map(|index| index.slug.clone()).collect();
    let index_url = format!("{}/v1/{indexes}/{platform}/+simple/", base_url(&headers));

    let compiled = state
        .catalog
        .create_compiled_requirements(platform_row.id, &body, &index_url, &index_slugs)
        .await?;

    // The pip track runs in the background on the same row; the internal
    // resolver answers the request.
    {
        let builder = state.builder.clone();
        let catalog = state.catalog.clone();
        let compiled_id = compiled.id;
        let platform_row = platform_row.clone();
        tokio::spawn(async move {
            if let Ok(Some(compiled)) = catalog.compiled_requirements(compiled_id).await {
                if let Err(err) = builder.compile_with_pip(&compiled, &platform_row).await {
                    tracing::warn!(compiled_id, "pip compile track failed: {err}");
                }
            }
        });
    }

    let finished =
        run_internal_compile(&state.catalog, &state.scheduler, &state.storage, compiled.id)
            .await?;
    if finished.internal.status == CompilationStatus::Done {
        Ok((
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            finished.internal.output,
        )
            .into_response())
    } else {
        Err(ServerError::BadRequest {
            body: finished.internal.log,
        })
    }
}

/// `POST /v1/<indexes>/<plat>/+resolve/`: turn pinned requirements into
/// direct artifact URLs, one per line.
#[instrument(skip(state, headers, body))]
pub(crate) async fn resolve_requirements(
    State(state): State<AppState>,
    Path((indexes, platform)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ServerError> {
    let (index_list, platform_row) = resolve_scope(&state, &indexes, &platform).await?;
    let base = base_url(&headers);

    let mut urls = Vec::new();
    for line in split_requirement_lines(&body) {
        if line.starts_with("http://") || line.starts_with("https://") {
            urls.push(resolve_url_line(&state, &platform_row, &line).await?);
            continue;
        }
        match Requirement::from_str(&line) {
            Ok(requirement) => {
                urls.push(
                    resolve_pinned(&state, &index_list, &platform_row, &base, &requirement, &line)
                        .await?,
                );
            }
            // Not a requirement and not a URL: pass through untouched.
            Err(_) => urls.push(line),
        }
    }

    let mut output = urls.join("\n");
    output.push('\n');
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], output).into_response())
}

async fn resolve_url_line(
    state: &AppState,
    platform: &Platform,
    line: &str,
) -> Result<String, ServerError> {
    let build = state
        .catalog
        .get_or_create_external_build(line, platform.id)
        .await?;
    if build.record.is_built() {
        if let Some(url) = build
            .record
            .artifact
            .as_deref()
            .and_then(|artifact| state.storage.url(artifact))
        {
            if build.record.md5_digest.is_empty() {
                return Ok(url);
            }
            return Ok(format!("{url}#md5={}", build.record.md5_digest));
        }
    }
    state.scheduler.schedule(BuildRef::External(build.id), false);
    Ok(line.to_string())
}

async fn resolve_pinned(
    state: &AppState,
    indexes: &[Index],
    platform: &Platform,
    base: &str,
    requirement: &Requirement,
    line: &str,
) -> Result<String, ServerError> {
    let pinned_version = match &requirement.version_or_url {
        Some(VersionOrUrl::VersionSpecifier(specifiers)) => {
            let mut iter = specifiers.iter();
            match (iter.next(), iter.next()) {
                (Some(specifier), None)
                    if matches!(specifier.operator(), Operator::Equal) =>
                {
                    Some(specifier.version().clone())
                }
                _ => None,
            }
        }
        _ => None,
    };
    let Some(version) = pinned_version else {
        return Err(ServerError::BadRequest {
            body: format!("`{line}` is not pinned with `==`\n"),
        });
    };

    let slug = PackageSlug::new(&requirement.name.to_string());
    let release = state
        .catalog
        .release_for_indexes(indexes, &slug, &version.to_string())
        .await?
        .ok_or(ServerError::BadRequest {
            body: format!("no release matching `{line}`\n"),
        })?;
    let build = state
        .catalog
        .get_or_create_build(release.id, platform.id)
        .await?;
    let detail = state
        .catalog
        .build_detail(build.id)
        .await?
        .ok_or(ServerError::NotFound { what: "build" })?;

    if detail.build.record.is_built() && !state.always_redirect_downloads {
        if let Some(url) = detail
            .build
            .record
            .artifact
            .as_deref()
            .and_then(|artifact| state.storage.url(artifact))
        {
            return Ok(format!("{base}{url}#md5={}", detail.digest()));
        }
    }
    Ok(format!("{base}{}", trigger_path(&detail)))
}

/// `GET /builds/<path>` when `SERVE_BUILDS` is on: hand the blob out of
/// the store directly.
pub(crate) async fn serve_build(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ServerError> {
    match state.storage.open(&path).await {
        Ok(contents) => Ok((
            [(CONTENT_TYPE, "application/octet-stream")],
            contents,
        )
            .into_response()),
        Err(_) => Err(ServerError::NotFound { what: "artifact" }),
    }
}
