mod common;

use common::{build_tarball, MockRegistry, Publish};
use pakfetch_core::{FetchError, Integrity, Options, Session};
use std::fs;
use tempfile::TempDir;

fn files(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_tarball_manifest() {
    let dir = TempDir::new().unwrap();
    let tarball = build_tarball(&files(&[(
        "package.json",
        r#"{"name":"local","version":"0.3.0","bin":"run.js"}"#,
    )]));
    fs::write(dir.path().join("local.tgz"), &tarball).unwrap();

    let opts = Options::default().without_cache().with_where(dir.path());
    let manifest = Session::new()
        .unwrap()
        .manifest("file:local.tgz", &opts)
        .await
        .unwrap();

    assert_eq!(manifest.name, "local");
    assert_eq!(manifest.version, "0.3.0");
    assert_eq!(manifest.bin["local"], "run.js");
    assert_eq!(manifest.has_shrinkwrap, Some(false));
    assert_eq!(
        manifest.integrity.as_deref(),
        Some(Integrity::compute(&tarball).to_string().as_str())
    );
    assert!(manifest.shasum.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_integrity_mismatch_names_spec_and_path() {
    let dir = TempDir::new().unwrap();
    let tarball = build_tarball(&files(&[("package.json", r#"{"name":"x","version":"1.0.0"}"#)]));
    let path = dir.path().join("pkg.tgz");
    fs::write(&path, &tarball).unwrap();

    let opts = Options::default()
        .without_cache()
        .with_where(dir.path())
        .with_integrity(Integrity::compute(b"something else").to_string());
    let err = Session::new()
        .unwrap()
        .tarball("file:pkg.tgz", &opts)
        .await
        .unwrap_err();

    match &err {
        FetchError::IntegrityMismatch { spec, path: at, .. } => {
            assert_eq!(spec.as_deref(), Some("file:pkg.tgz"));
            assert_eq!(at.as_deref(), Some(path.as_path()));
        }
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("file:pkg.tgz"));
    assert!(message.contains(&path.display().to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_file_is_streamed_and_verified() {
    let dir = TempDir::new().unwrap();
    let tarball = build_tarball(&files(&[
        ("package.json", r#"{"name":"big","version":"1.0.0"}"#),
        ("data.txt", &"x".repeat(64 * 1024)),
    ]));
    fs::write(dir.path().join("big.tgz"), &tarball).unwrap();
    let expected = Integrity::compute(&tarball).to_string();

    // A zero threshold forces the streaming path for any file.
    let opts = Options::default()
        .without_cache()
        .with_where(dir.path())
        .with_small_file_threshold(0)
        .with_integrity(expected.clone());
    let fetched = Session::new()
        .unwrap()
        .tarball("file:big.tgz", &opts)
        .await
        .unwrap();

    assert_eq!(fetched.data, tarball);
    assert_eq!(fetched.info.integrity.as_deref(), Some(expected.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolved_local_file_avoids_network() {
    let registry = MockRegistry::start().await;
    let published = registry.publish(Publish::new("nearby", "1.0.0"));
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("nearby-1.0.0.tgz");
    fs::write(&local, &published.tarball).unwrap();

    let opts = Options::default()
        .with_registry(&registry.url)
        .without_cache()
        .with_resolved(local.display().to_string())
        .with_integrity(published.integrity.clone());
    let session = Session::new().unwrap();

    let fetched = session.tarball("nearby@1.0.0", &opts).await.unwrap();
    assert_eq!(fetched.data, published.tarball);
    assert_eq!(registry.hits.packuments(), 0);
    assert_eq!(registry.hits.tarballs(), 0);

    // Gone from disk: fall through to the registry.
    fs::remove_file(&local).unwrap();
    let fetched = session.tarball("nearby@1.0.0", &opts).await.unwrap();
    assert_eq!(fetched.data, published.tarball);
    assert_eq!(registry.hits.tarballs(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_resolved_file_falls_back_to_cache() {
    let registry = MockRegistry::start().await;
    let published = registry.publish(Publish::new("nearby", "1.0.0"));
    let cache = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("nearby-1.0.0.tgz");
    fs::write(&local, &published.tarball).unwrap();

    let cached = Options::default()
        .with_registry(&registry.url)
        .with_cache(cache.path());
    let session = Session::new().unwrap();
    let warm = session.tarball("nearby@1.0.0", &cached).await.unwrap();
    assert_eq!(warm.data, published.tarball);
    assert_eq!(registry.hits.packuments(), 1);
    assert_eq!(registry.hits.tarballs(), 1);

    let pinned = cached
        .with_resolved(local.display().to_string())
        .with_integrity(published.integrity.clone());
    let from_disk = session.tarball("nearby@1.0.0", &pinned).await.unwrap();
    assert_eq!(from_disk.data, published.tarball);

    // Gone from disk: the cache serves it by digest.
    fs::remove_file(&local).unwrap();
    let from_cache = Session::new()
        .unwrap()
        .tarball("nearby@1.0.0", &pinned)
        .await
        .unwrap();
    assert_eq!(from_cache.data, published.tarball);
    assert_eq!(
        from_cache.info.integrity.as_deref(),
        Some(published.integrity.as_str())
    );
    assert_eq!(registry.hits.packuments(), 1);
    assert_eq!(registry.hits.tarballs(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tarball_to_file_writes_atomically() {
    let dir = TempDir::new().unwrap();
    let tarball = build_tarball(&files(&[("package.json", r#"{"name":"copy","version":"1.0.0"}"#)]));
    fs::write(dir.path().join("copy.tgz"), &tarball).unwrap();

    let opts = Options::default().without_cache().with_where(dir.path());
    let dest = dir.path().join("out").join("copy.tgz");
    let info = Session::new()
        .unwrap()
        .tarball_to_file("file:copy.tgz", &dest, &opts)
        .await
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), tarball.to_vec());
    assert_eq!(
        info.integrity.as_deref(),
        Some(Integrity::compute(&tarball).to_string().as_str())
    );
    let leftovers: Vec<_> = fs::read_dir(dest.parent().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name() != "copy.tgz")
        .collect();
    assert!(leftovers.is_empty());
}

fn write_project(root: &std::path::Path) {
    fs::create_dir_all(root.join("scripts")).unwrap();
    fs::write(
        root.join("package.json"),
        r#"{"name":"proj","version":"0.0.1","directories":{"bin":"scripts"}}"#,
    )
    .unwrap();
    fs::write(root.join("scripts").join("hello.js"), "console.log('hi')\n").unwrap();
    fs::write(root.join("index.js"), "module.exports = {};\n").unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_manifest() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("proj");
    write_project(&project);

    let opts = Options::default().without_cache().with_where(dir.path());
    let manifest = Session::new()
        .unwrap()
        .manifest("file:proj", &opts)
        .await
        .unwrap();

    assert_eq!(manifest.name, "proj");
    assert_eq!(manifest.version, "0.0.1");
    assert_eq!(manifest.bin["hello.js"], "scripts/hello.js");
    assert_eq!(manifest.has_shrinkwrap, Some(false));
    assert_eq!(
        manifest.resolved.as_deref(),
        Some(project.display().to_string().as_str())
    );
    assert!(manifest.integrity.as_deref().unwrap().starts_with("sha512-"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_without_package_json() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("empty")).unwrap();

    let opts = Options::default().without_cache().with_where(dir.path());
    let err = Session::new()
        .unwrap()
        .manifest("file:empty", &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NoPackageJson { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_extract_and_packument() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("proj");
    write_project(&project);
    let opts = Options::default().without_cache().with_where(dir.path());
    let session = Session::new().unwrap();

    let dest = dir.path().join("installed");
    session.extract("file:proj", &dest, &opts).await.unwrap();
    assert!(dest.join("package.json").is_file());
    assert!(dest.join("index.js").is_file());
    assert!(dest.join("scripts").join("hello.js").is_file());

    let packument = session.packument("file:proj", &opts).await.unwrap();
    assert_eq!(packument.name, "proj");
    assert_eq!(packument.dist_tags["latest"], "0.0.1");
    assert!(packument.versions.contains_key("0.0.1"));
}
