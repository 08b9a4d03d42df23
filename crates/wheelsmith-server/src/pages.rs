//! HTML rendering for the simple-index views.

use wheelsmith_catalog::BuildDetail;

/// One anchor on a link page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Link {
    pub href: String,
    pub filename: String,
}

/// The href installers follow for one build: straight to the artifact
/// when it exists (unless downloads always redirect for telemetry), else
/// through the trigger endpoint, which schedules the build and bounces
/// to the upstream file in the meantime.
pub(crate) fn build_href(
    detail: &BuildDetail,
    artifact_url: Option<String>,
    always_redirect: bool,
) -> String {
    if detail.build.record.is_built() && !always_redirect {
        if let Some(url) = artifact_url {
            let digest = detail.digest();
            if digest.is_empty() {
                return url;
            }
            return format!("{url}#md5={digest}");
        }
    }
    trigger_path(detail)
}

pub(crate) fn trigger_path(detail: &BuildDetail) -> String {
    format!(
        "/v1/{}/{}/+simple/{}/{}/download/{}/{}",
        detail.index_slug,
        detail.platform_slug,
        detail.package_slug,
        detail.version,
        detail.build.id,
        detail.filename(),
    )
}

pub(crate) fn render_links(package_name: &str, links: &[Link]) -> String {
    let mut body = String::new();
    body.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    body.push_str(&format!(
        "<title>Links for {}</title>\n",
        html_escape::encode_text(package_name),
    ));
    body.push_str("</head>\n<body>\n");
    body.push_str(&format!(
        "<h1>Links for {}</h1>\n",
        html_escape::encode_text(package_name),
    ));
    for link in links {
        body.push_str(&format!(
            "<a href=\"{}\">{}</a><br/>\n",
            html_escape::encode_double_quoted_attribute(&link.href),
            html_escape::encode_text(&link.filename),
        ));
    }
    body.push_str("</body>\n</html>\n");
    body
}

pub(crate) fn render_root(indexes: &str, platform: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>wheelsmith</title>\n</head>\n<body>\n\
         <h1>wheelsmith</h1>\n\
         <p>Per-package link pages for index set <code>{}</code> on platform <code>{}</code> \
         live under this prefix.</p>\n\
         </body>\n</html>\n",
        html_escape::encode_text(indexes),
        html_escape::encode_text(platform),
    )
}
