//! The PyPI-style backend: XML-RPC change log, JSON detail endpoint.

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use wheelsmith_types::{ReleaseKind, UpstreamRelease};

use crate::xmlrpc::{self, Value};
use crate::{ClientOptions, ReleaseMap, UpstreamError, http_client, push_path_segments};

#[derive(Debug, Clone)]
pub struct PyPIClient {
    url: Url,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(default)]
    releases: std::collections::BTreeMap<String, Vec<FileDocument>>,
}

#[derive(Debug, Deserialize)]
struct FileDocument {
    url: String,
    #[serde(default)]
    md5_digest: String,
    #[serde(default)]
    packagetype: String,
}

impl PyPIClient {
    pub fn new(url: Url, options: ClientOptions) -> Result<Self, UpstreamError> {
        Ok(Self {
            url,
            http: http_client(&options)?,
        })
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, UpstreamError> {
        let body = xmlrpc::request(method, params);
        let response = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::IndexUnavailable {
                message: format!("{method} answered {status}"),
            });
        }
        let text = response.text().await?;
        Ok(xmlrpc::parse_response(&text)?)
    }

    pub async fn last_serial(&self) -> Result<i64, UpstreamError> {
        let value = self.call("changelog_last_serial", &[]).await?;
        value.as_i64().ok_or_else(|| UpstreamError::Protocol {
            message: "changelog_last_serial did not return an integer".to_string(),
        })
    }

    pub async fn list_packages(&self) -> Result<Vec<String>, UpstreamError> {
        let value = self.call("list_packages", &[]).await?;
        let entries = value.as_array().ok_or_else(|| UpstreamError::Protocol {
            message: "list_packages did not return an array".to_string(),
        })?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.as_str().map(ToString::to_string))
            .collect())
    }

    /// One change-log batch: `(package name, serial)` pairs after `since`.
    /// Change-log rows are `[name, version, timestamp, action, serial]`.
    pub(crate) async fn changelog_batch(
        &self,
        since: i64,
    ) -> Result<Vec<(Option<String>, i64)>, UpstreamError> {
        let value = self
            .call("changelog_since_serial", &[Value::Int(since)])
            .await?;
        let rows = value.as_array().ok_or_else(|| UpstreamError::Protocol {
            message: "changelog_since_serial did not return an array".to_string(),
        })?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let row = row.as_array().ok_or_else(|| UpstreamError::Protocol {
                message: "change-log row is not an array".to_string(),
            })?;
            let package = row.first().and_then(Value::as_str).map(ToString::to_string);
            let serial = row.get(4).and_then(Value::as_i64).ok_or_else(|| {
                UpstreamError::Protocol {
                    message: "change-log row carries no serial".to_string(),
                }
            })?;
            events.push((package, serial));
        }
        Ok(events)
    }

    pub async fn get_package_releases(&self, package: &str) -> Result<ReleaseMap, UpstreamError> {
        let url = push_path_segments(&self.url, &[package, "json"])?;
        let response = self.http.get(url.clone()).send().await?;
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
        let document: PackageDocument =
            response.json().await.map_err(|err| UpstreamError::Protocol {
                message: err.to_string(),
            })?;

        let mut releases = ReleaseMap::new();
        for (version, files) in document.releases {
            let cleaned: Vec<UpstreamRelease> = files
                .into_iter()
                .map(|file| UpstreamRelease {
                    kind: ReleaseKind::from_packagetype(&file.packagetype),
                    url: file.url,
                    md5_digest: file.md5_digest,
                })
                .filter(|release| release.kind != ReleaseKind::Other)
                .collect();
            releases.insert(version, cleaned);
        }
        Ok(releases)
    }
}
