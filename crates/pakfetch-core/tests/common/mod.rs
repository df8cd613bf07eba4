//! In-process npm registry for integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use pakfetch_core::integrity::{Algorithm, IntegrityHasher};
use pakfetch_core::Integrity;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Request counters, shared with the server.
#[derive(Debug, Clone, Default)]
pub struct Hits {
    packuments: Arc<AtomicUsize>,
    tarballs: Arc<AtomicUsize>,
}

impl Hits {
    pub fn packuments(&self) -> usize {
        self.packuments.load(Ordering::SeqCst)
    }

    pub fn tarballs(&self) -> usize {
        self.tarballs.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct Version {
    doc: Value,
    file: String,
    served: Bytes,
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    packages: Arc<Mutex<BTreeMap<String, BTreeMap<String, Version>>>>,
    /// Dist-tags besides the computed `latest`.
    tags: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
    hits: Hits,
}

/// What to publish.
#[derive(Debug, Clone)]
pub struct Publish<'a> {
    pub name: &'a str,
    pub version: &'a str,
    /// Extra files under `package/`; package.json is generated unless given.
    pub files: Vec<(&'a str, String)>,
    pub package_json: Option<Value>,
    pub tarball_url: bool,
    /// Advertise `_hasShrinkwrap: false` so manifests need no introspection.
    pub no_shrinkwrap_flag: bool,
    /// Serve bytes that do not match the advertised integrity.
    pub corrupt: bool,
}

impl<'a> Publish<'a> {
    pub fn new(name: &'a str, version: &'a str) -> Self {
        Self {
            name,
            version,
            files: Vec::new(),
            package_json: None,
            tarball_url: true,
            no_shrinkwrap_flag: true,
            corrupt: false,
        }
    }
}

/// A published tarball and its digests.
#[derive(Debug, Clone)]
pub struct Published {
    pub tarball: Bytes,
    pub integrity: String,
    pub url: String,
}

pub struct MockRegistry {
    /// Base URL with a trailing slash.
    pub url: String,
    pub hits: Hits,
    state: RegistryState,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state = RegistryState::default();
        let app = Router::new()
            .route("/:name", get(packument))
            .route("/:name/-/:file", get(tarball))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/"),
            hits: state.hits.clone(),
            state,
        }
    }

    pub fn publish(&self, publish: Publish<'_>) -> Published {
        let package_json = publish
            .package_json
            .clone()
            .unwrap_or_else(|| json!({ "name": publish.name, "version": publish.version }));
        let mut files = vec![("package.json".to_string(), package_json.to_string())];
        files.extend(publish.files.iter().map(|(p, c)| ((*p).to_string(), c.clone())));
        let tarball = build_tarball(&files);

        let integrity = Integrity::compute(&tarball).to_string();
        let mut sha1 = IntegrityHasher::new(&[Algorithm::Sha1]);
        sha1.update(&tarball);
        let shasum = sha1.finish().sha1_hex().unwrap();

        let file = format!("{}-{}.tgz", publish.name, publish.version);
        let url = format!("{}{}/-/{file}", self.url, publish.name);

        let mut dist = Map::new();
        dist.insert("integrity".into(), json!(integrity));
        dist.insert("shasum".into(), json!(shasum));
        if publish.tarball_url {
            dist.insert("tarball".into(), json!(url));
        }
        let mut doc = package_json.as_object().cloned().unwrap_or_default();
        doc.insert("dist".into(), Value::Object(dist));
        if publish.no_shrinkwrap_flag {
            doc.insert("_hasShrinkwrap".into(), json!(false));
        }

        let served = if publish.corrupt {
            build_tarball(&[("package.json".to_string(), "{\"name\":\"tampered\"}".to_string())])
        } else {
            tarball.clone()
        };

        self.state
            .packages
            .lock()
            .unwrap()
            .entry(publish.name.to_string())
            .or_default()
            .insert(
                publish.version.to_string(),
                Version {
                    doc: Value::Object(doc),
                    file,
                    served,
                },
            );

        Published {
            tarball,
            integrity,
            url,
        }
    }

    /// Point dist-tag `tag` of `name` at `version`.
    pub fn tag(&self, name: &str, tag: &str, version: &str) {
        self.state
            .tags
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), version.to_string());
    }
}

async fn packument(State(state): State<RegistryState>, Path(name): Path<String>) -> Response {
    state.hits.packuments.fetch_add(1, Ordering::SeqCst);
    let packages = state.packages.lock().unwrap();
    let Some(versions) = packages.get(&name) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let mut dist_tags = Map::new();
    if let Some(latest) = versions
        .keys()
        .filter_map(|v| semver::Version::parse(v).ok())
        .filter(|v| v.pre.is_empty())
        .max()
    {
        dist_tags.insert("latest".into(), json!(latest.to_string()));
    }
    if let Some(tags) = state.tags.lock().unwrap().get(&name) {
        for (tag, version) in tags {
            dist_tags.insert(tag.clone(), json!(version));
        }
    }
    let body = json!({
        "name": name,
        "dist-tags": dist_tags,
        "versions": versions
            .iter()
            .map(|(v, published)| (v.clone(), published.doc.clone()))
            .collect::<Map<_, _>>(),
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn tarball(
    State(state): State<RegistryState>,
    Path((name, file)): Path<(String, String)>,
) -> Response {
    state.hits.tarballs.fetch_add(1, Ordering::SeqCst);
    let packages = state.packages.lock().unwrap();
    let found = packages
        .get(&name)
        .and_then(|versions| versions.values().find(|v| v.file == file));
    match found {
        Some(version) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from(version.served.clone()),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Gzipped tarball with every entry under `package/`.
pub fn build_tarball(files: &[(String, String)]) -> Bytes {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{path}"), contents.as_bytes())
            .unwrap();
    }
    let gz = builder.into_inner().unwrap();
    Bytes::from(gz.finish().unwrap())
}
