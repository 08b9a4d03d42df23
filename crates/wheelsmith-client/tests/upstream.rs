//! Protocol tests for both upstream backends, against wiremock stand-ins.

use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wheelsmith_client::{ClientOptions, IndexClient, UpstreamError};
use wheelsmith_types::{IndexBackend, ReleaseKind};

fn pypi_client(server: &MockServer) -> IndexClient {
    let url = Url::parse(&format!("{}/pypi", server.uri())).unwrap();
    IndexClient::new(IndexBackend::Pypi, &url, ClientOptions::default()).unwrap()
}

fn devpi_client(server: &MockServer) -> IndexClient {
    let url = Url::parse(&format!("{}/root/dev", server.uri())).unwrap();
    IndexClient::new(IndexBackend::Devpi, &url, ClientOptions::default()).unwrap()
}

fn xml_response(inner: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(format!(
        "<?xml version=\"1.0\"?><methodResponse><params><param>{inner}</param></params></methodResponse>"
    ))
}

#[tokio::test]
async fn pypi_last_serial_speaks_xmlrpc() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pypi"))
        .and(body_string_contains("changelog_last_serial"))
        .respond_with(xml_response("<value><int>28071158</int></value>"))
        .mount(&server)
        .await;

    let client = pypi_client(&server);
    assert_eq!(client.last_serial().await.unwrap(), 28_071_158);
}

#[tokio::test]
async fn pypi_lists_packages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pypi"))
        .and(body_string_contains("list_packages"))
        .respond_with(xml_response(
            "<value><array><data>\
                <value><string>dist-a</string></value>\
                <value><string>dist-b</string></value>\
            </data></array></value>",
        ))
        .mount(&server)
        .await;

    let client = pypi_client(&server);
    assert_eq!(client.list_packages().await.unwrap(), vec!["dist-a", "dist-b"]);
}

#[tokio::test]
async fn pypi_change_log_deduplicates_within_a_traversal() {
    let server = MockServer::start().await;
    let row = |name: &str, serial: i64| {
        format!(
            "<value><array><data>\
                <value><string>{name}</string></value>\
                <value><nil/></value>\
                <value><int>0</int></value>\
                <value><string>update</string></value>\
                <value><int>{serial}</int></value>\
            </data></array></value>"
        )
    };
    Mock::given(method("POST"))
        .and(path("/pypi"))
        .and(body_string_contains("changelog_since_serial"))
        .and(body_string_contains("<int>0</int>"))
        .respond_with(xml_response(&format!(
            "<value><array><data>{}{}{}</data></array></value>",
            row("dist-a", 1),
            row("dist-b", 2),
            row("dist-a", 3),
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pypi"))
        .and(body_string_contains("changelog_since_serial"))
        .and(body_string_contains("<int>3</int>"))
        .respond_with(xml_response("<value><array><data></data></array></value>"))
        .mount(&server)
        .await;

    let client = pypi_client(&server);
    let mut stream = client.updates_since(0);

    let mut events = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        events.push((event.package, event.serial));
    }
    assert_eq!(
        events,
        vec![
            (Some("dist-a".to_string()), 1),
            (Some("dist-b".to_string()), 2),
            // Repeat within the traversal: name suppressed, serial kept.
            (None, 3),
        ]
    );
}

#[tokio::test]
async fn pypi_release_map_filters_unusable_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pypi/dist-a/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "releases": {
                "1.0": [
                    {"url": "https://files/dist-a-1.0.tar.gz", "md5_digest": "aa", "packagetype": "sdist"},
                    {"url": "https://files/dist-a-1.0.egg", "md5_digest": "bb", "packagetype": "bdist_egg"}
                ],
                "2.0": [
                    {"url": "https://files/dist-a-2.0-py2.py3-none-any.whl", "md5_digest": "cc", "packagetype": "bdist_wheel"}
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = pypi_client(&server);
    let releases = client.get_package_releases("dist-a").await.unwrap();
    assert_eq!(releases["1.0"].len(), 1);
    assert_eq!(releases["1.0"][0].kind, ReleaseKind::Sdist);
    assert_eq!(releases["2.0"][0].kind, ReleaseKind::Wheel);
}

#[tokio::test]
async fn pypi_404_is_package_not_found_and_500_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pypi/gone/json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pypi/broken/json"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = pypi_client(&server);
    assert!(matches!(
        client.get_package_releases("gone").await,
        Err(UpstreamError::PackageNotFound { .. })
    ));
    assert!(matches!(
        client.get_package_releases("broken").await,
        Err(UpstreamError::IndexUnavailable { .. })
    ));
}

#[tokio::test]
async fn devpi_serial_comes_from_the_response_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/root/dev"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-devpi-serial", "12")
                .set_body_json(serde_json::json!({"result": {"type": "stage", "projects": []}})),
        )
        .mount(&server)
        .await;

    let client = devpi_client(&server);
    assert_eq!(client.last_serial().await.unwrap(), 11);
}

#[tokio::test]
async fn devpi_walks_stage_bases_for_package_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/root/dev"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {"type": "stage", "bases": ["root/base"], "projects": ["dist-a"]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/root/base"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {"type": "stage", "projects": ["dist-b", "dist-a"]}
        })))
        .mount(&server)
        .await;

    let client = devpi_client(&server);
    assert_eq!(client.list_packages().await.unwrap(), vec!["dist-a", "dist-b"]);
}

#[tokio::test]
async fn devpi_change_log_reads_one_document_per_serial() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/root/dev"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-devpi-serial", "3")
                .set_body_json(serde_json::json!({"result": {"type": "stage", "projects": []}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/+changelog/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "root/dev/dist-a": ["PROJVERSION", 0, null]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/+changelog/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "root/dev/+f/abc": ["STAGEFILE", 0, {"projectname": "dist-b"}],
            "root/dev": ["USER", 0, null]
        })))
        .mount(&server)
        .await;

    let client = devpi_client(&server);
    let mut stream = client.updates_since(0);

    let mut events = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        events.push((event.package, event.serial));
    }
    assert_eq!(
        events,
        vec![
            (Some("dist-a".to_string()), 1),
            // The USER event names no package; entries arrive in key order.
            (None, 2),
            (Some("dist-b".to_string()), 2),
        ]
    );
}

#[tokio::test]
async fn devpi_release_map_guesses_kinds_from_links() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/root/dev/dist-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {
                "1.0": {"+links": [
                    {"href": "https://files/dist-a-1.0.tar.gz", "md5": "aa"},
                    {"href": "https://files/dist-a-1.0.exe", "md5": "bb"}
                ]}
            }
        })))
        .mount(&server)
        .await;

    let client = devpi_client(&server);
    let releases = client.get_package_releases("dist-a").await.unwrap();
    assert_eq!(releases["1.0"].len(), 1);
    assert_eq!(releases["1.0"][0].url, "https://files/dist-a-1.0.tar.gz");
}
