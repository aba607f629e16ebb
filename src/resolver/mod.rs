//! Node-style module resolution over the virtual file system.
//!
//! Maps a `(specifier, fromPath)` pair to an absolute path:
//! - relative and absolute specifiers probe the exact path, configured
//!   extensions, `index.<ext>` files and `package.json` entry fields;
//! - bare specifiers walk `node_modules` upward, honoring `exports`
//!   conditions, the `browser` field and tsconfig-style `paths`;
//! - `node:` specifiers and bare built-in names map onto the shims.
//!
//! Every probe result is memoized under `(fromDir, specifier)` for the
//! lifetime of one compile.

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

use crate::fs::{path as vpath, FileSystem};
use crate::shims;

/// Errors that can occur during module resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Cannot find module '{specifier}' (imported from {origin})")]
    ModuleNotFound { specifier: String, origin: String },
}

/// Result type for module resolution operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Default extension probe order. The preset may append a template
/// extension (e.g. `.vue`) at the end.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx"];

/// `exports` conditions honored, in order.
const EXPORT_CONDITIONS: &[&str] = &["browser", "import", "default"];

/// Aliases defined by the project's `browser` field and tsconfig
/// `paths`, loaded lazily once per resolver lifetime.
#[derive(Debug, Default)]
struct ProjectAliases {
    /// `browser` mapping: key (bare specifier or absolute path) to
    /// replacement; `None` means mapped to `false` (the empty module).
    browser: FxHashMap<String, Option<String>>,
    /// tsconfig `paths`: `(prefix, suffix)` pattern to target templates.
    paths: Vec<(String, String, Vec<String>)>,
    base_url: String,
}

/// Node-style resolver over the layered file system.
pub struct Resolver {
    fs: Rc<FileSystem>,
    extensions: Vec<String>,
    cache: RefCell<FxHashMap<(String, String), ResolveResult<String>>>,
    aliases: RefCell<Option<Rc<ProjectAliases>>>,
}

impl Resolver {
    pub fn new(fs: Rc<FileSystem>) -> Self {
        Self::with_extensions(fs, DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect())
    }

    /// Create a resolver with a caller-supplied extension probe order.
    pub fn with_extensions(fs: Rc<FileSystem>, extensions: Vec<String>) -> Self {
        Self {
            fs,
            extensions,
            cache: RefCell::new(FxHashMap::default()),
            aliases: RefCell::new(None),
        }
    }

    /// Resolve a specifier to an absolute path.
    ///
    /// `from_path` is the absolute path of the importing file, used for
    /// relative resolution and for the `node_modules` walk-up.
    pub async fn resolve(&self, specifier: &str, from_path: &str) -> ResolveResult<String> {
        if let Some(shim) = shims::builtin_path(specifier) {
            return Ok(shim);
        }

        let from_dir = vpath::dirname(from_path);
        let key = (from_dir.clone(), specifier.to_string());
        if let Some(cached) = self.cache.borrow().get(&key) {
            return cached.clone();
        }

        let result = self
            .resolve_inner(specifier, &from_dir, from_path, 0)
            .await;
        self.cache.borrow_mut().insert(key, result.clone());
        result
    }

    fn resolve_inner<'a>(
        &'a self,
        specifier: &'a str,
        from_dir: &'a str,
        origin: &'a str,
        depth: u8,
    ) -> LocalBoxFuture<'a, ResolveResult<String>> {
        async move {
            let not_found = || ResolveError::ModuleNotFound {
                specifier: specifier.to_string(),
                origin: origin.to_string(),
            };

            if specifier.is_empty() || depth > 8 {
                return Err(not_found());
            }

            if specifier.starts_with("./")
                || specifier.starts_with("../")
                || specifier.starts_with('/')
            {
                let target = vpath::join(from_dir, specifier);

                // The project's browser field may redirect individual
                // files (mapping-form keys are relative paths).
                if let Some(alias) = self.browser_alias(&target).await {
                    return match alias {
                        Some(replacement) => {
                            self.resolve_inner(&replacement, "/", origin, depth + 1).await
                        }
                        None => Ok(shims::builtin_path(shims::EMPTY_MODULE).unwrap()),
                    };
                }

                return self.resolve_as_path(&target).await.ok_or_else(not_found);
            }

            // tsconfig/jsconfig paths apply to bare specifiers only.
            for candidate in self.tsconfig_candidates(specifier).await {
                if let Some(found) = self.resolve_as_path(&candidate).await {
                    return Ok(found);
                }
            }

            if let Some(alias) = self.browser_alias(specifier).await {
                return match alias {
                    Some(replacement) => {
                        self.resolve_inner(&replacement, "/", origin, depth + 1).await
                    }
                    None => Ok(shims::builtin_path(shims::EMPTY_MODULE).unwrap()),
                };
            }

            self.resolve_package(specifier, from_dir)
                .await
                .ok_or_else(not_found)
        }
        .boxed_local()
    }

    /// Probe a concrete path: exact file, configured extensions,
    /// directory index files, then the directory's `package.json` entry
    /// fields. A file match always defeats a directory match.
    async fn resolve_as_path(&self, target: &str) -> Option<String> {
        if self.fs.exists(target).await {
            return Some(target.to_string());
        }

        for ext in &self.extensions {
            let candidate = format!("{target}{ext}");
            if self.fs.exists(&candidate).await {
                return Some(candidate);
            }
        }

        for ext in &self.extensions {
            let candidate = format!("{target}/index{ext}");
            if self.fs.exists(&candidate).await {
                return Some(candidate);
            }
        }

        self.resolve_directory_manifest(target).await
    }

    /// Honor `browser`/`module`/`main` of `<target>/package.json`.
    async fn resolve_directory_manifest(&self, target: &str) -> Option<String> {
        let manifest_path = format!("{target}/package.json");
        let manifest: Value = serde_json::from_str(&self.fs.read(&manifest_path).await.ok()?).ok()?;

        for field in ["browser", "module", "main"] {
            let Some(entry) = manifest.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            let candidate = vpath::join(target, entry);
            if self.fs.exists(&candidate).await {
                return Some(candidate);
            }
            for ext in &self.extensions {
                let with_ext = format!("{candidate}{ext}");
                if self.fs.exists(&with_ext).await {
                    return Some(with_ext);
                }
            }
            for ext in &self.extensions {
                let index = format!("{candidate}/index{ext}");
                if self.fs.exists(&index).await {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Walk `node_modules` upward from `from_dir` looking for the
    /// package, resolving the subpath (or entry point) at each hit.
    async fn resolve_package(&self, specifier: &str, from_dir: &str) -> Option<String> {
        let (name, subpath) = split_package_specifier(specifier)?;

        let mut dir = from_dir.to_string();
        loop {
            let root = format!(
                "{}/node_modules/{}",
                if dir == "/" { "" } else { dir.as_str() },
                name
            );

            if let Some(found) = self.resolve_in_package(&root, subpath).await {
                return Some(found);
            }

            if dir == "/" {
                return None;
            }
            dir = vpath::dirname(&dir);
        }
    }

    async fn resolve_in_package(&self, root: &str, subpath: &str) -> Option<String> {
        let manifest_path = format!("{root}/package.json");
        let manifest: Option<Value> = match self.fs.read(&manifest_path).await {
            Ok(content) => serde_json::from_str(&content).ok(),
            Err(_) => None,
        };

        if let Some(exports) = manifest.as_ref().and_then(|m| m.get("exports")) {
            let request = if subpath.is_empty() {
                ".".to_string()
            } else {
                format!("./{subpath}")
            };
            if let Some(rel) = resolve_exports(exports, &request) {
                let target = vpath::join(root, &rel);
                if let Some(found) = self.resolve_as_path(&target).await {
                    return Some(found);
                }
            }
        }

        if subpath.is_empty() {
            self.resolve_as_path(root).await
        } else {
            self.resolve_as_path(&format!("{root}/{subpath}")).await
        }
    }

    /// Look up a `browser`-field alias for a bare specifier or an
    /// absolute path. `Some(None)` means mapped to `false`.
    async fn browser_alias(&self, key: &str) -> Option<Option<String>> {
        let aliases = self.project_aliases().await;
        aliases.browser.get(key).cloned()
    }

    /// Candidate paths produced by tsconfig `paths` for a specifier.
    async fn tsconfig_candidates(&self, specifier: &str) -> Vec<String> {
        let aliases = self.project_aliases().await;
        let mut candidates = Vec::new();

        for (prefix, suffix, targets) in &aliases.paths {
            let matched = if prefix.is_empty() && suffix.is_empty() {
                None
            } else if let Some(rest) = specifier.strip_prefix(prefix.as_str()) {
                rest.strip_suffix(suffix.as_str())
            } else {
                None
            };
            let exact = prefix == specifier && suffix.is_empty() && !prefix.contains('*');

            if let Some(captured) = matched {
                for target in targets {
                    let rel = target.replace('*', captured);
                    candidates.push(vpath::join(&aliases.base_url, &rel));
                }
            } else if exact {
                for target in targets {
                    candidates.push(vpath::join(&aliases.base_url, target));
                }
            }
        }

        candidates
    }

    async fn project_aliases(&self) -> Rc<ProjectAliases> {
        if let Some(cached) = self.aliases.borrow().as_ref() {
            return Rc::clone(cached);
        }

        let loaded = Rc::new(self.load_project_aliases().await);
        *self.aliases.borrow_mut() = Some(Rc::clone(&loaded));
        loaded
    }

    async fn load_project_aliases(&self) -> ProjectAliases {
        let mut aliases = ProjectAliases {
            base_url: "/".to_string(),
            ..Default::default()
        };

        if let Ok(content) = self.fs.read("/package.json").await {
            if let Ok(manifest) = serde_json::from_str::<Value>(&content) {
                if let Some(map) = manifest.get("browser").and_then(|b| b.as_object()) {
                    for (key, value) in map {
                        let normalized_key = if key.starts_with("./") || key.starts_with('/') {
                            vpath::join("/", key)
                        } else {
                            key.clone()
                        };
                        let replacement = match value {
                            Value::Bool(false) => None,
                            Value::String(s) => Some(s.clone()),
                            _ => continue,
                        };
                        aliases.browser.insert(normalized_key, replacement);
                    }
                }
            }
        }

        for config in ["/tsconfig.json", "/jsconfig.json"] {
            let Ok(content) = self.fs.read(config).await else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&content) else {
                continue;
            };
            let options = parsed.get("compilerOptions");
            if let Some(base) = options
                .and_then(|o| o.get("baseUrl"))
                .and_then(|b| b.as_str())
            {
                aliases.base_url = vpath::join("/", base);
            }
            if let Some(paths) = options
                .and_then(|o| o.get("paths"))
                .and_then(|p| p.as_object())
            {
                for (pattern, targets) in paths {
                    let targets: Vec<String> = targets
                        .as_array()
                        .map(|list| {
                            list.iter()
                                .filter_map(|t| t.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    let (prefix, suffix) = match pattern.split_once('*') {
                        Some((pre, post)) => (pre.to_string(), post.to_string()),
                        None => (pattern.clone(), String::new()),
                    };
                    aliases.paths.push((prefix, suffix, targets));
                }
            }
            break;
        }

        aliases
    }

    /// Drop all memoized resolutions and project aliases.
    pub fn reset_cache(&self) {
        self.cache.borrow_mut().clear();
        *self.aliases.borrow_mut() = None;
    }
}

/// Split `pkg[/sub]` / `@scope/pkg[/sub]` into name and subpath.
fn split_package_specifier(specifier: &str) -> Option<(&str, &str)> {
    let mut segments = specifier.splitn(3, '/');
    if specifier.starts_with('@') {
        let scope = segments.next()?;
        let name_part = segments.next()?;
        let name_len = scope.len() + 1 + name_part.len();
        let rest = specifier.get(name_len + 1..).unwrap_or("");
        Some((&specifier[..name_len], rest))
    } else {
        let name = segments.next()?;
        if name.is_empty() {
            return None;
        }
        let rest = specifier.get(name.len() + 1..).unwrap_or("");
        Some((name, rest))
    }
}

/// Resolve an `exports` value against a `.`-prefixed subpath request.
/// Returns the package-relative target. Subpath keys win by longest
/// pattern prefix; condition objects are walked in `EXPORT_CONDITIONS`
/// order.
fn resolve_exports(exports: &Value, request: &str) -> Option<String> {
    match exports {
        Value::String(target) => (request == ".").then(|| target.clone()),
        Value::Array(entries) => entries
            .iter()
            .find_map(|entry| resolve_exports(entry, request)),
        Value::Object(map) => {
            if map.keys().any(|k| k.starts_with('.')) {
                // Subpath map. Exact match first.
                if let Some(value) = map.get(request) {
                    return resolve_target(value, "");
                }

                // Wildcard patterns, longest prefix wins.
                let mut best: Option<(usize, String)> = None;
                for (key, value) in map {
                    let Some((prefix, suffix)) = key.split_once('*') else {
                        continue;
                    };
                    let Some(rest) = request.strip_prefix(prefix) else {
                        continue;
                    };
                    let Some(captured) = rest.strip_suffix(suffix) else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |(len, _)| prefix.len() > *len) {
                        if let Some(target) = resolve_target(value, captured) {
                            best = Some((prefix.len(), target));
                        }
                    }
                }
                best.map(|(_, target)| target)
            } else {
                // Condition map used as sugar for the root subpath.
                (request == ".")
                    .then(|| resolve_target(exports, ""))
                    .flatten()
            }
        }
        _ => None,
    }
}

/// Resolve a single exports target, walking nested condition objects and
/// substituting a captured wildcard.
fn resolve_target(value: &Value, captured: &str) -> Option<String> {
    match value {
        Value::String(target) => Some(target.replace('*', captured)),
        Value::Array(entries) => entries
            .iter()
            .find_map(|entry| resolve_target(entry, captured)),
        Value::Object(map) => EXPORT_CONDITIONS
            .iter()
            .find_map(|condition| map.get(*condition))
            .and_then(|nested| resolve_target(nested, captured)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(files: &[(&str, &str)]) -> Resolver {
        let fs = FileSystem::new();
        for (path, content) in files {
            fs.write_sync(path, (*content).to_string());
        }
        Resolver::new(fs.into_shared())
    }

    #[tokio::test]
    async fn relative_extension_probing() {
        let resolver = fixture(&[("/index.ts", ""), ("/util.tsx", "")]);
        assert_eq!(
            resolver.resolve("./util", "/index.ts").await.as_deref(),
            Ok("/util.tsx")
        );
    }

    #[tokio::test]
    async fn file_match_defeats_directory_match() {
        let resolver = fixture(&[("/util.js", "file"), ("/util/index.js", "dir"), ("/index.js", "")]);
        assert_eq!(
            resolver.resolve("./util", "/index.js").await.as_deref(),
            Ok("/util.js")
        );
    }

    #[tokio::test]
    async fn directory_index_and_main_fields() {
        let resolver = fixture(&[
            ("/lib/index.js", ""),
            ("/pkgdir/package.json", r#"{"main": "entry.js"}"#),
            ("/pkgdir/entry.js", ""),
            ("/index.js", ""),
        ]);
        assert_eq!(
            resolver.resolve("./lib", "/index.js").await.as_deref(),
            Ok("/lib/index.js")
        );
        assert_eq!(
            resolver.resolve("./pkgdir", "/index.js").await.as_deref(),
            Ok("/pkgdir/entry.js")
        );
    }

    #[tokio::test]
    async fn package_walk_up_and_main() {
        let resolver = fixture(&[
            ("/node_modules/dep/package.json", r#"{"main": "./lib/dep.js"}"#),
            ("/node_modules/dep/lib/dep.js", ""),
            ("/src/nested/a.js", ""),
        ]);
        assert_eq!(
            resolver.resolve("dep", "/src/nested/a.js").await.as_deref(),
            Ok("/node_modules/dep/lib/dep.js")
        );
        assert_eq!(
            resolver
                .resolve("dep/lib/dep", "/src/nested/a.js")
                .await
                .as_deref(),
            Ok("/node_modules/dep/lib/dep.js")
        );
    }

    #[tokio::test]
    async fn scoped_package_subpath() {
        let resolver = fixture(&[
            ("/node_modules/@scope/pkg/index.js", ""),
            ("/node_modules/@scope/pkg/helper.js", ""),
            ("/index.js", ""),
        ]);
        assert_eq!(
            resolver.resolve("@scope/pkg", "/index.js").await.as_deref(),
            Ok("/node_modules/@scope/pkg/index.js")
        );
        assert_eq!(
            resolver
                .resolve("@scope/pkg/helper", "/index.js")
                .await
                .as_deref(),
            Ok("/node_modules/@scope/pkg/helper.js")
        );
    }

    #[tokio::test]
    async fn exports_conditions_and_subpaths() {
        let resolver = fixture(&[
            (
                "/node_modules/dep/package.json",
                r#"{
                    "main": "./wrong.js",
                    "exports": {
                        ".": { "browser": "./browser.js", "default": "./main.js" },
                        "./features/*": "./lib/features/*.js"
                    }
                }"#,
            ),
            ("/node_modules/dep/browser.js", ""),
            ("/node_modules/dep/main.js", ""),
            ("/node_modules/dep/lib/features/a.js", ""),
            ("/index.js", ""),
        ]);
        assert_eq!(
            resolver.resolve("dep", "/index.js").await.as_deref(),
            Ok("/node_modules/dep/browser.js")
        );
        assert_eq!(
            resolver
                .resolve("dep/features/a", "/index.js")
                .await
                .as_deref(),
            Ok("/node_modules/dep/lib/features/a.js")
        );
    }

    #[tokio::test]
    async fn browser_field_overrides() {
        let resolver = fixture(&[
            (
                "/package.json",
                r#"{"browser": {"./util.js": "./util-browser.js", "mod": false}}"#,
            ),
            ("/util.js", ""),
            ("/util-browser.js", ""),
            ("/index.js", ""),
        ]);
        assert_eq!(
            resolver.resolve("./util.js", "/index.js").await.as_deref(),
            Ok("/util-browser.js")
        );
        // Mapped to false: the empty shim answers.
        assert_eq!(
            resolver.resolve("mod", "/index.js").await.as_deref(),
            Ok("/node_modules/fs/index.js")
        );
    }

    #[tokio::test]
    async fn tsconfig_paths() {
        let resolver = fixture(&[
            (
                "/tsconfig.json",
                r#"{"compilerOptions": {"baseUrl": ".", "paths": {"~/*": ["src/*"]}}}"#,
            ),
            ("/src/components/app.ts", ""),
            ("/src/index.ts", ""),
        ]);
        assert_eq!(
            resolver
                .resolve("~/components/app", "/src/index.ts")
                .await
                .as_deref(),
            Ok("/src/components/app.ts")
        );
    }

    #[tokio::test]
    async fn builtins_resolve_to_shims() {
        let resolver = fixture(&[("/index.js", "")]);
        assert_eq!(
            resolver.resolve("stream", "/index.js").await.as_deref(),
            Ok("/node_modules/stream/index.js")
        );
        assert_eq!(
            resolver.resolve("node:stream", "/index.js").await.as_deref(),
            Ok("/node_modules/stream/index.js")
        );
    }

    #[tokio::test]
    async fn resolution_is_deterministic_and_cached() {
        let resolver = fixture(&[("/index.js", ""), ("/a.js", "")]);
        let first = resolver.resolve("./a", "/index.js").await;
        let second = resolver.resolve("./a", "/index.js").await;
        assert_eq!(first, second);
        assert_eq!(resolver.cache.borrow().len(), 1);

        let miss = resolver.resolve("./missing", "/index.js").await;
        assert!(matches!(miss, Err(ResolveError::ModuleNotFound { .. })));
        // Negative results are memoized too.
        assert_eq!(resolver.cache.borrow().len(), 2);
    }

    #[tokio::test]
    async fn missing_module_names_specifier_and_origin() {
        let resolver = fixture(&[("/index.js", "")]);
        let err = resolver
            .resolve("./does-not-exist", "/index.js")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot find module './does-not-exist' (imported from /index.js)"
        );
    }
}
