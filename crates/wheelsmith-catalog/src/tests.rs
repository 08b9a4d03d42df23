use super::*;

async fn store() -> CatalogStore {
    CatalogStore::in_memory().await.unwrap()
}

fn desired(version: &str, url: &str, md5: &str) -> DesiredRelease {
    DesiredRelease {
        version: version.to_string(),
        url: url.to_string(),
        md5_digest: md5.to_string(),
    }
}

#[tokio::test]
async fn upsert_package_preserves_first_display_name() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();

    let first = store.upsert_package(index.id, "Flask_SQLAlchemy").await.unwrap();
    assert_eq!(first.slug.as_str(), "flask-sqlalchemy");
    assert_eq!(first.name, "Flask_SQLAlchemy");

    let second = store.upsert_package(index.id, "flask.sqlalchemy").await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.name, "Flask_SQLAlchemy");
}

#[tokio::test]
async fn replace_releases_inserts_updates_and_deletes() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();
    let package = store.upsert_package(index.id, "dist-a").await.unwrap();

    let outcome = store
        .replace_releases(
            &package,
            &[
                desired("1.0", "https://files/dist-a-1.0.tar.gz", "aa"),
                desired("2.0", "https://files/dist-a-2.0.tar.gz", "bb"),
            ],
        )
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.invalidation.index_slug, "pypi");

    // 1.0 drops out, 2.0 changes digest, 3.0 appears.
    let outcome = store
        .replace_releases(
            &package,
            &[
                desired("2.0", "https://files/dist-a-2.0.tar.gz", "cc"),
                desired("3.0", "https://files/dist-a-3.0.tar.gz", "dd"),
            ],
        )
        .await
        .unwrap();
    assert!(outcome.changed);

    let releases = store.releases_desc(package.id).await.unwrap();
    let versions: Vec<&str> = releases.iter().map(|release| release.version.as_str()).collect();
    assert_eq!(versions, ["3.0", "2.0"]);
    assert_eq!(releases[1].md5_digest, "cc");

    // Re-applying the same desired set is a no-op.
    let outcome = store
        .replace_releases(
            &store.package(index.id, &package.slug).await.unwrap().unwrap(),
            &[
                desired("2.0", "https://files/dist-a-2.0.tar.gz", "cc"),
                desired("3.0", "https://files/dist-a-3.0.tar.gz", "dd"),
            ],
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
}

#[tokio::test]
async fn replace_releases_reports_orphaned_artifacts() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();
    let package = store.upsert_package(index.id, "dist-a").await.unwrap();
    let platform = store
        .create_platform("linux", "docker", &serde_json::json!({"image": "python:3.11"}))
        .await
        .unwrap();

    store
        .replace_releases(&package, &[desired("1.0", "https://files/a-1.0.tar.gz", "")])
        .await
        .unwrap();
    let release = store.release(package.id, "1.0").await.unwrap().unwrap();
    let build = store.get_or_create_build(release.id, platform.id).await.unwrap();
    store
        .record_build_success(
            build.id,
            false,
            &BuildOutcome {
                artifact: "pypi/linux/dist-a/1.0/dist_a-1.0-cp311-none-any.whl".to_string(),
                filesize: 10,
                md5_digest: "ff".to_string(),
                metadata: Some(WheelMetadata::default()),
                build_log: "ok".to_string(),
                build_timestamp: jiff::Timestamp::now().to_string(),
                build_duration: 1,
            },
        )
        .await
        .unwrap();

    let outcome = store.replace_releases(&package, &[]).await.unwrap();
    assert_eq!(
        outcome.removed_artifacts,
        vec!["pypi/linux/dist-a/1.0/dist_a-1.0-cp311-none-any.whl".to_string()]
    );
}

#[tokio::test]
async fn builds_are_unique_per_release_and_platform() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();
    let package = store.upsert_package(index.id, "dist-a").await.unwrap();
    store
        .replace_releases(&package, &[desired("1.0", "https://files/a-1.0.tar.gz", "")])
        .await
        .unwrap();
    let release = store.release(package.id, "1.0").await.unwrap().unwrap();
    let platform = store
        .create_platform("linux", "docker", &serde_json::json!({"image": "python:3.11"}))
        .await
        .unwrap();

    let first = store.get_or_create_build(release.id, platform.id).await.unwrap();
    let second = store.get_or_create_build(release.id, platform.id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(!first.record.is_built());
}

#[tokio::test]
async fn ensure_builds_covers_every_release_newest_first() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();
    let package = store.upsert_package(index.id, "dist-a").await.unwrap();
    store
        .replace_releases(
            &package,
            &[
                desired("1.0", "https://files/a-1.0.tar.gz", ""),
                desired("10.0", "https://files/a-10.0.tar.gz", ""),
                desired("2.0", "https://files/a-2.0.tar.gz", ""),
            ],
        )
        .await
        .unwrap();
    let platform = store
        .create_platform("linux", "docker", &serde_json::json!({"image": "python:3.11"}))
        .await
        .unwrap();

    let details = store.ensure_builds(package.id, platform.id).await.unwrap();
    let versions: Vec<&str> = details.iter().map(|detail| detail.version.as_str()).collect();
    // PEP 440 ordering, not lexicographic: 10.0 > 2.0 > 1.0.
    assert_eq!(versions, ["10.0", "2.0", "1.0"]);
    assert_eq!(details[0].filename(), "a-10.0.tar.gz");
}

#[tokio::test]
async fn last_update_serial_is_monotone() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();

    store.set_last_update_serial(index.id, 100).await.unwrap();
    store.set_last_update_serial(index.id, 50).await.unwrap();
    let index = store.index_by_slug("pypi").await.unwrap().unwrap();
    assert_eq!(index.last_update_serial, Some(100));

    store.set_last_update_serial(index.id, 150).await.unwrap();
    let index = store.index_by_slug("pypi").await.unwrap().unwrap();
    assert_eq!(index.last_update_serial, Some(150));
}

#[tokio::test]
async fn release_for_indexes_respects_declared_order() {
    let store = store().await;
    let first = store
        .create_index("i1", "https://one.example", IndexBackend::Pypi)
        .await
        .unwrap();
    let second = store
        .create_index("i2", "https://two.example", IndexBackend::Pypi)
        .await
        .unwrap();
    for index in [&first, &second] {
        let package = store.upsert_package(index.id, "dist-a").await.unwrap();
        store
            .replace_releases(
                &package,
                &[desired("1.0", &format!("https://{}/a-1.0.tar.gz", index.slug), "")],
            )
            .await
            .unwrap();
    }

    let slug = PackageSlug::new("dist-a");
    let release = store
        .release_for_indexes(&[first.clone(), second.clone()], &slug, "1.0")
        .await
        .unwrap()
        .unwrap();
    assert!(release.url.contains("i1"));

    let release = store
        .release_for_indexes(&[second, first], &slug, "1.0")
        .await
        .unwrap()
        .unwrap();
    assert!(release.url.contains("i2"));
}

#[tokio::test]
async fn compile_track_transitions_are_one_way() {
    let store = store().await;
    let platform = store
        .create_platform("linux", "docker", &serde_json::json!({"image": "python:3.11"}))
        .await
        .unwrap();
    let compiled = store
        .create_compiled_requirements(platform.id, "dist-a\n", "http://localhost/", &[
            "pypi".to_string(),
        ])
        .await
        .unwrap();
    assert_eq!(compiled.internal.status, CompilationStatus::Pending);

    let update = TrackUpdate {
        status: CompilationStatus::Done,
        output: "dist-a==1.0\n".to_string(),
        log: String::new(),
        duration: 1,
    };
    assert!(store
        .finish_compile_track(compiled.id, CompileTrack::Internal, &update)
        .await
        .unwrap());
    // Second finish is a no-op.
    assert!(!store
        .finish_compile_track(compiled.id, CompileTrack::Internal, &update)
        .await
        .unwrap());

    let reloaded = store.compiled_requirements(compiled.id).await.unwrap().unwrap();
    assert_eq!(reloaded.internal.status, CompilationStatus::Done);
    assert_eq!(reloaded.pip.status, CompilationStatus::Pending);
    assert_eq!(reloaded.index_slugs, vec!["pypi".to_string()]);

    store
        .reset_compile_track(compiled.id, CompileTrack::Internal)
        .await
        .unwrap();
    let reloaded = store.compiled_requirements(compiled.id).await.unwrap().unwrap();
    assert_eq!(reloaded.internal.status, CompilationStatus::Pending);
}

#[tokio::test]
async fn delete_package_returns_invalidation_and_artifacts() {
    let store = store().await;
    let index = store
        .create_index("pypi", "https://pypi.org/pypi", IndexBackend::Pypi)
        .await
        .unwrap();
    let package = store.upsert_package(index.id, "dist-a").await.unwrap();
    store
        .replace_releases(&package, &[desired("1.0", "https://files/a-1.0.tar.gz", "")])
        .await
        .unwrap();

    let (invalidation, artifacts) = store.delete_package(package.id).await.unwrap().unwrap();
    assert_eq!(invalidation.package_slug.as_str(), "dist-a");
    assert!(artifacts.is_empty());
    assert!(store.package(index.id, &package.slug).await.unwrap().is_none());
    assert!(store.delete_package(package.id).await.unwrap().is_none());
}
