//! The devpi-style backend: JSON change log, JSON detail endpoint.
//!
//! A devpi index URL names a stage (`/<user>/<index>`); the change log
//! lives at the server root under `+changelog/<serial>` and is consumed
//! here as one JSON document per serial.

use std::collections::BTreeSet;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use wheelsmith_types::{ReleaseKind, UpstreamRelease};

use crate::{ClientOptions, ReleaseMap, UpstreamError, http_client, pop_path_segments, push_path_segments};

type BoxedWalk<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), UpstreamError>> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct DevPIClient {
    url: Url,
    http: reqwest::Client,
    retries: u32,
}

#[derive(Debug, Deserialize)]
struct StageDocument {
    result: StageResult,
}

#[derive(Debug, Deserialize)]
struct StageResult {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    bases: Vec<String>,
    #[serde(default)]
    projects: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectDocument {
    result: std::collections::BTreeMap<String, VersionDocument>,
}

#[derive(Debug, Deserialize)]
struct VersionDocument {
    #[serde(rename = "+links", default)]
    links: Vec<LinkDocument>,
}

#[derive(Debug, Deserialize)]
struct LinkDocument {
    href: String,
    #[serde(default)]
    md5: String,
}

/// One serial's change-log document: event key → `[type, backserial,
/// payload]`.
#[derive(Debug, Deserialize)]
struct ChangelogDocument(
    std::collections::BTreeMap<String, (String, i64, Option<serde_json::Value>)>,
);

impl DevPIClient {
    pub fn new(url: Url, options: ClientOptions) -> Result<Self, UpstreamError> {
        Ok(Self {
            url,
            http: http_client(&options)?,
            retries: options.retries,
        })
    }

    async fn get_json(&self, url: Url) -> Result<reqwest::Response, UpstreamError> {
        Ok(self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?)
    }

    pub async fn last_serial(&self) -> Result<i64, UpstreamError> {
        let response = self.get_json(self.url.clone()).await?;
        let serial = response
            .headers()
            .get("x-devpi-serial")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| UpstreamError::Protocol {
                message: "missing x-devpi-serial header".to_string(),
            })?;
        Ok(serial - 1)
    }

    async fn master_uuid(&self) -> Result<Option<String>, UpstreamError> {
        let response = self.get_json(self.url.clone()).await?;
        Ok(response
            .headers()
            .get("x-devpi-master-uuid")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string))
    }

    pub async fn list_packages(&self) -> Result<Vec<String>, UpstreamError> {
        let mut projects = BTreeSet::new();
        self.walk_stage(self.url.clone(), &mut projects, 0).await?;
        Ok(projects.into_iter().collect())
    }

    /// Walk a stage and its bases, collecting project names. Mirror
    /// stages are skipped; they proxy an outside index we do not own.
    fn walk_stage<'a>(
        &'a self,
        stage_url: Url,
        projects: &'a mut BTreeSet<String>,
        depth: usize,
    ) -> BoxedWalk<'a> {
        Box::pin(async move {
            if depth > 8 {
                return Err(UpstreamError::Protocol {
                    message: "stage bases nest too deeply".to_string(),
                });
            }
            let response = self.get_json(stage_url.clone()).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(UpstreamError::IndexUnavailable {
                    message: format!("stage listing answered {status}"),
                });
            }
            let document: StageDocument =
                response.json().await.map_err(|err| UpstreamError::Protocol {
                    message: err.to_string(),
                })?;
            if document.result.kind == "mirror" {
                return Ok(());
            }
            let root = pop_path_segments(&stage_url, 2)?;
            for base in &document.result.bases {
                let base_url = push_path_segments(&root, &[base])?;
                self.walk_stage(base_url, projects, depth + 1).await?;
            }
            projects.extend(document.result.projects.iter().cloned());
            Ok(())
        })
    }

    pub async fn get_package_releases(&self, package: &str) -> Result<ReleaseMap, UpstreamError> {
        let url = push_path_segments(&self.url, &[package])?;
        let response = self.get_json(url.clone()).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UpstreamError::PackageNotFound {
                package: package.to_string(),
            });
        }
        if !status.is_success() {
            warn!(%url, %status, "unexpected response from index");
            return Err(UpstreamError::IndexUnavailable {
                message: format!("package detail answered {status}"),
            });
        }
        let document: ProjectDocument =
            response.json().await.map_err(|err| UpstreamError::Protocol {
                message: err.to_string(),
            })?;

        let mut releases = ReleaseMap::new();
        for (version, detail) in document.result {
            let cleaned: Vec<UpstreamRelease> = detail
                .links
                .into_iter()
                .map(|link| UpstreamRelease {
                    kind: ReleaseKind::guess_from_url(&link.href),
                    url: link.href,
                    md5_digest: link.md5,
                })
                .filter(|release| release.kind != ReleaseKind::Other)
                .collect();
            releases.insert(version, cleaned);
        }
        Ok(releases)
    }

    /// One change-log batch: every serial from `since + 1` up to the
    /// upstream's current serial, one HTTP fetch per serial.
    pub(crate) async fn changelog_batch(
        &self,
        since: i64,
    ) -> Result<Vec<(Option<String>, i64)>, UpstreamError> {
        let current = self.last_serial().await?;
        if since >= current {
            return Ok(Vec::new());
        }
        let uuid = self.master_uuid().await?;
        let changelog_root = push_path_segments(&pop_path_segments(&self.url, 2)?, &["+changelog"])?;

        let mut events = Vec::new();
        for serial in (since + 1)..=current {
            let url = push_path_segments(&changelog_root, &[&serial.to_string()])?;
            let document = self.fetch_changelog_entry(url, uuid.as_deref()).await?;
            let mut yielded = false;
            for (key, (event_type, _backserial, payload)) in &document.0 {
                yielded = true;
                events.push((event_package(key, event_type, payload.as_ref()), serial));
            }
            // An empty document still advances the cursor.
            if !yielded {
                events.push((None, serial));
            }
        }
        Ok(events)
    }

    async fn fetch_changelog_entry(
        &self,
        url: Url,
        master_uuid: Option<&str>,
    ) -> Result<ChangelogDocument, UpstreamError> {
        let mut attempts = 0;
        let response = loop {
            let mut request = self.http.get(url.clone()).header("Accept", "application/json");
            if let Some(uuid) = master_uuid {
                request = request.header("x-devpi-expected-master-id", uuid);
            }
            match request.send().await {
                Ok(response) => break response,
                Err(err) if attempts < self.retries => {
                    attempts += 1;
                    warn!(%url, attempt = attempts, "retrying change-log fetch: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::IndexUnavailable {
                message: format!("change-log entry answered {status}"),
            });
        }
        response.json().await.map_err(|err| UpstreamError::Protocol {
            message: err.to_string(),
        })
    }
}

/// Which package, if any, a change-log event touches.
///
/// Event keys look like `<user>/<index>/<project>[/...]`; only project
/// level events carry a name worth importing.
fn event_package(key: &str, event_type: &str, payload: Option<&serde_json::Value>) -> Option<String> {
    match event_type {
        "PROJVERSION" | "PROJVERSIONS" | "PROJSIMPLELINKS" => {
            key.split('/').nth(2).map(ToString::to_string)
        }
        "STAGEFILE" => payload
            .and_then(|value| value.get("projectname"))
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_events_carry_the_key_segment() {
        assert_eq!(
            event_package("root/dev/dist-a", "PROJVERSION", None),
            Some("dist-a".to_string())
        );
        assert_eq!(
            event_package("root/dev/dist-a/1.0", "PROJVERSIONS", None),
            Some("dist-a".to_string())
        );
        assert_eq!(event_package("root/dev", "USER", None), None);
    }

    #[test]
    fn stagefile_events_read_the_payload() {
        let payload = serde_json::json!({"projectname": "dist-b"});
        assert_eq!(
            event_package("root/dev/+f/abc", "STAGEFILE", Some(&payload)),
            Some("dist-b".to_string())
        );
        // A deleted file has no payload and names no package.
        assert_eq!(event_package("root/dev/+f/abc", "STAGEFILE", None), None);
    }
}
