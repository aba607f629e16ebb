//! Built-in shim provider.
//!
//! Seeds the memory layer with minimal browser-safe substitutes for the
//! host environment's standard modules, each at
//! `/node_modules/<name>/index.js` plus a skeletal `package.json`. Both
//! `<name>` and `node:<name>` map onto the shim.

use crate::fs::FileSystem;

/// Built-ins with a real (if minimal) implementation.
pub const SHIMMED: &[(&str, &str)] = &[
    ("events", include_str!("js/events.js")),
    ("stream", include_str!("js/stream.js")),
    ("util", include_str!("js/util.js")),
    ("process", include_str!("js/process.js")),
    ("buffer", include_str!("js/buffer.js")),
    ("assert", include_str!("js/assert.js")),
    ("path", include_str!("js/path.js")),
    ("os", include_str!("js/os.js")),
    ("url", include_str!("js/url.js")),
    ("querystring", include_str!("js/querystring.js")),
    ("string_decoder", include_str!("js/string_decoder.js")),
    ("timers", include_str!("js/timers.js")),
    ("punycode", include_str!("js/punycode.js")),
    ("constants", include_str!("js/constants.js")),
    ("tty", include_str!("js/tty.js")),
];

/// Built-ins that only exist so imports do not explode; they export an
/// empty object.
pub const EMPTY: &[&str] = &[
    "fs", "net", "tls", "dgram", "dns", "http", "https", "http2", "child_process", "crypto",
    "zlib", "readline", "repl", "vm", "cluster", "domain", "module", "worker_threads", "inspector",
];

const EMPTY_SOURCE: &str = include_str!("js/empty.js");

/// Name of the empty placeholder used for `browser: false` mappings.
pub const EMPTY_MODULE: &str = "fs";

fn strip_node_prefix(specifier: &str) -> &str {
    specifier.strip_prefix("node:").unwrap_or(specifier)
}

/// Whether a specifier names a built-in shim.
pub fn is_builtin(specifier: &str) -> bool {
    builtin_path(specifier).is_some()
}

/// Map a built-in specifier (with or without the `node:` prefix) to its
/// shim path in the file system.
pub fn builtin_path(specifier: &str) -> Option<String> {
    let name = strip_node_prefix(specifier);
    let known = SHIMMED.iter().any(|(shim, _)| *shim == name)
        || EMPTY.iter().any(|empty| *empty == name);
    known.then(|| format!("/node_modules/{name}/index.js"))
}

/// Whether an absolute path points at a seeded shim.
pub fn is_shim_path(path: &str) -> bool {
    path.strip_prefix("/node_modules/")
        .and_then(|rest| rest.strip_suffix("/index.js"))
        .map(|name| {
            SHIMMED.iter().any(|(shim, _)| *shim == name)
                || EMPTY.iter().any(|empty| *empty == name)
        })
        .unwrap_or(false)
}

/// Write every shim into the file system's memory layer.
pub fn seed(fs: &FileSystem) {
    for (name, source) in SHIMMED {
        write_shim(fs, name, source);
    }
    for name in EMPTY {
        write_shim(fs, name, EMPTY_SOURCE);
    }
}

fn write_shim(fs: &FileSystem, name: &str, source: &str) {
    fs.write_sync(
        &format!("/node_modules/{name}/index.js"),
        source.to_string(),
    );
    fs.write_sync(
        &format!("/node_modules/{name}/package.json"),
        serde_json::json!({
            "name": name,
            "version": "0.0.0",
            "main": "index.js",
        })
        .to_string(),
    );
}
