//! CDN fetching: manifest resolution, package downloads with fallback,
//! and coalescing of concurrent fetches.

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::error::{RegistryError, RegistryResult};
use super::manifest::{self, DependencySet, ManifestEntry, ManifestResponse};
use super::store::{PackageStore, PackagedFile};
use super::{DEFAULT_CONCURRENCY, DEFAULT_FETCH_RETRIES, FALLBACK_CDNS};

type SharedFetch = Shared<LocalBoxFuture<'static, RegistryResult<()>>>;

/// Payload of the packager's per-package endpoint: a compact map of
/// package-relative path to file.
#[derive(Debug, Deserialize)]
struct PackagePayload {
    #[serde(default)]
    files: FxHashMap<String, PackagedFile>,
}

/// Fetches dependency manifests and package contents, mounting the
/// results into the shared [`PackageStore`]. Concurrent fetches for the
/// same `name@version` are coalesced through an in-flight map. Clones
/// share all state, so a fetch job can carry the registry into its
/// future.
#[derive(Clone)]
pub struct PackageRegistry {
    client: Client,
    packager_url: Url,
    fallbacks: Vec<String>,
    store: Rc<PackageStore>,
    manifest: Rc<RefCell<Vec<ManifestEntry>>>,
    in_flight: Rc<RefCell<FxHashMap<String, SharedFetch>>>,
    retries: u32,
    retry_delay: Duration,
}

impl PackageRegistry {
    pub fn new(packager_url: Url, store: Rc<PackageStore>) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("terrarium/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            packager_url,
            fallbacks: FALLBACK_CDNS.iter().map(|s| s.to_string()).collect(),
            store,
            manifest: Rc::new(RefCell::new(Vec::new())),
            in_flight: Rc::new(RefCell::new(FxHashMap::default())),
            retries: DEFAULT_FETCH_RETRIES,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Adjust the bounded-retry policy for CDN fetches.
    pub fn with_retry_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    /// Replace the fallback CDN chain. Each entry is a URL template
    /// with `{name}` and `{version}` placeholders.
    pub fn with_fallback_cdns(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn store(&self) -> Rc<PackageStore> {
        Rc::clone(&self.store)
    }

    pub fn manifest(&self) -> Vec<ManifestEntry> {
        self.manifest.borrow().clone()
    }

    /// Drop the manifest and all mounted files. Used on bundler reset.
    pub fn reset(&self) {
        self.manifest.borrow_mut().clear();
        self.in_flight.borrow_mut().clear();
        self.store.clear();
    }

    /// Resolve the dependency set to a flattened manifest via the
    /// packager. On failure a trivial manifest listing only the direct
    /// dependencies is synthesized, with range operators stripped.
    pub async fn fetch_manifest(&self, dependencies: &DependencySet) -> Vec<ManifestEntry> {
        if dependencies.is_empty() {
            self.manifest.borrow_mut().clear();
            return Vec::new();
        }

        let url = format!("{}v1/manifest", self.packager_url);
        debug!(url, count = dependencies.len(), "fetching dependency manifest");

        let fetched = self
            .client
            .post(&url)
            .json(dependencies)
            .send()
            .await
            .map_err(|e| e.to_string())
            .and_then(|response| {
                if response.status().is_success() {
                    Ok(response)
                } else {
                    Err(format!("HTTP {}", response.status()))
                }
            });

        let entries = match fetched {
            Ok(response) => match response.json::<ManifestResponse>().await {
                Ok(body) => body.manifest,
                Err(e) => {
                    warn!(error = %e, "manifest response unreadable, synthesizing");
                    manifest::synthesize(dependencies)
                }
            },
            Err(message) => {
                warn!(%message, "manifest fetch failed, synthesizing");
                manifest::synthesize(dependencies)
            }
        };

        *self.manifest.borrow_mut() = entries.clone();
        entries
    }

    /// Fetch and mount every package in the manifest. Fails with the
    /// first package that exhausted all sources.
    pub async fn preload_modules(&self) -> RegistryResult<()> {
        let entries = self.manifest();
        let fetches = entries
            .iter()
            .map(|entry| self.ensure_package(&entry.name, &entry.version));

        let results: Vec<RegistryResult<()>> = stream::iter(fetches)
            .buffer_unordered(DEFAULT_CONCURRENCY)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Make sure the transitive dependencies of every mounted package
    /// are present as well: packages whose `package.json` names a
    /// dependency missing from the manifest are fetched at depth + 1.
    pub async fn load_module_dependencies(&self) -> RegistryResult<()> {
        loop {
            let mut discovered: Vec<ManifestEntry> = Vec::new();
            {
                let known = self.manifest.borrow();
                for entry in known.iter() {
                    let manifest_path = format!("/node_modules/{}/package.json", entry.name);
                    let Some(content) = self.store.read(&manifest_path) else {
                        continue;
                    };
                    let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) else {
                        continue;
                    };
                    let Some(deps) = json.get("dependencies").and_then(|d| d.as_object()) else {
                        continue;
                    };

                    for (name, range) in deps {
                        let seen = known.iter().any(|e| &e.name == name)
                            || discovered.iter().any(|e| &e.name == name);
                        if seen {
                            continue;
                        }
                        let range = range.as_str().unwrap_or("latest");
                        discovered.push(ManifestEntry {
                            name: name.clone(),
                            version: manifest::strip_range_operators(range),
                            depth: entry.depth + 1,
                        });
                    }
                }
            }

            if discovered.is_empty() {
                return Ok(());
            }

            debug!(count = discovered.len(), "fetching transitive dependencies");
            let fetches = discovered
                .iter()
                .map(|entry| self.ensure_package(&entry.name, &entry.version));
            let results: Vec<RegistryResult<()>> = stream::iter(fetches)
                .buffer_unordered(DEFAULT_CONCURRENCY)
                .collect()
                .await;
            results.into_iter().collect::<RegistryResult<()>>()?;

            self.manifest.borrow_mut().extend(discovered);
        }
    }

    /// Fetch and mount one package, coalescing concurrent requests for
    /// the same `name@version`.
    pub fn ensure_package(&self, name: &str, version: &str) -> SharedFetch {
        let key = format!("{name}@{version}");

        if self.store.is_mounted(name, version) {
            return futures::future::ready(Ok(())).boxed_local().shared();
        }
        if let Some(pending) = self.in_flight.borrow().get(&key) {
            return pending.clone();
        }

        let registry = self.clone();
        let name = name.to_string();
        let version = version.to_string();
        let job_key = key.clone();

        let job: SharedFetch = async move {
            let result = registry.fetch_package(&name, &version).await;
            registry.in_flight.borrow_mut().remove(&job_key);
            let files = result?;
            registry.store.mount(&name, &version, files);
            Ok(())
        }
        .boxed_local()
        .shared();

        self.in_flight.borrow_mut().insert(key, job.clone());
        job
    }

    async fn fetch_package(
        &self,
        name: &str,
        version: &str,
    ) -> RegistryResult<FxHashMap<String, PackagedFile>> {
        let url = format!("{}v2/package/{}/{}", self.packager_url, name, version);

        match self.get_with_retries(&url).await {
            Ok(body) => {
                let payload: PackagePayload =
                    serde_json::from_str(&body).map_err(|e| RegistryError::InvalidPayload {
                        name: name.to_string(),
                        version: version.to_string(),
                        message: e.to_string(),
                    })?;
                return Ok(payload.files);
            }
            Err(message) => {
                warn!(name, version, %message, "primary CDN failed, trying fallbacks");
            }
        }

        // Each fallback serves the package's main file as one
        // pre-transpiled blob; mount it as index.js with a synthetic
        // manifest so resolution keeps working.
        for template in &self.fallbacks {
            let url = template
                .replace("{name}", name)
                .replace("{version}", version);
            match self.get_with_retries(&url).await {
                Ok(body) => {
                    debug!(name, version, url, "package served by fallback CDN");
                    let mut files = FxHashMap::default();
                    files.insert("index.js".to_string(), PackagedFile::transpiled(body));
                    files.insert(
                        "package.json".to_string(),
                        PackagedFile::transpiled(
                            serde_json::json!({
                                "name": name,
                                "version": version,
                                "main": "index.js",
                            })
                            .to_string(),
                        ),
                    );
                    return Ok(files);
                }
                Err(message) => {
                    warn!(name, version, url, %message, "fallback CDN failed");
                }
            }
        }

        Err(RegistryError::PackageFetch {
            name: name.to_string(),
            version: version.to_string(),
            message: "all CDN sources exhausted".to_string(),
        })
    }

    async fn get_with_retries(&self, url: &str) -> Result<String, String> {
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response.text().await.map_err(|e| e.to_string());
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                    // Retrying a 404 will not change the answer.
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        break;
                    }
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Rc<PackageRegistry> {
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let registry = PackageRegistry::new(url, Rc::new(PackageStore::new()))
            .unwrap()
            .with_retry_policy(0, Duration::ZERO);
        Rc::new(registry)
    }

    #[tokio::test]
    async fn empty_dependency_set_skips_the_network() {
        let registry = registry();
        let manifest = registry.fetch_manifest(&DependencySet::new()).await;
        assert!(manifest.is_empty());
        assert!(registry.preload_modules().await.is_ok());
    }

    #[tokio::test]
    async fn mounted_packages_are_not_refetched() {
        let registry = registry();
        let mut files = FxHashMap::default();
        files.insert("index.js".to_string(), PackagedFile::transpiled("x".into()));
        registry.store.mount("pkg", "1.0.0", files);

        // The packager URL is unroutable, so this only passes because
        // the mounted check short-circuits before any fetch.
        assert!(registry.ensure_package("pkg", "1.0.0").await.is_ok());
    }

    /// Minimal one-shot HTTP server for exercising the fallback chain
    /// without leaving the loopback interface.
    async fn serve_once(listener: tokio::net::TcpListener, body: &'static str) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn fallback_cdn_serves_when_the_packager_is_down() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = PackageRegistry::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Rc::new(PackageStore::new()),
        )
        .unwrap()
        .with_retry_policy(0, Duration::ZERO)
        .with_fallback_cdns(vec![format!("http://{addr}/{{name}}@{{version}}")]);
        let registry = Rc::new(registry);

        let body = "module.exports = function pad() {};";
        let (fetched, _) = futures::join!(
            registry.ensure_package("left-pad", "1.3.0"),
            serve_once(listener, body)
        );
        fetched.unwrap();

        assert_eq!(
            registry.store.read("/node_modules/left-pad/index.js").as_deref(),
            Some(body)
        );
        let manifest = registry
            .store
            .read("/node_modules/left-pad/package.json")
            .unwrap();
        assert!(manifest.contains("\"main\":\"index.js\""));
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_in_flight_job() {
        let registry = registry();
        let first = registry.ensure_package("pkg", "1.0.0");
        assert_eq!(registry.in_flight.borrow().len(), 1);
        let second = registry.ensure_package("pkg", "1.0.0");
        assert_eq!(registry.in_flight.borrow().len(), 1);

        // Both resolve to the same (failed, offline) result.
        let (a, b) = futures::join!(first, second);
        assert_eq!(a, b);
        assert!(matches!(a, Err(RegistryError::PackageFetch { .. })));
        assert!(registry.in_flight.borrow().is_empty());
    }
}
