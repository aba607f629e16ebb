//! Path helpers for the virtual file system.
//!
//! All paths inside the bundler are absolute, `/`-separated and free of
//! `.`/`..` segments. `std::path` is platform-dependent and therefore not
//! used for virtual paths.

/// Normalize a path to absolute `/`-separated form, collapsing `.` and
/// `..` segments. A relative input is treated as rooted at `/`.
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut out = String::with_capacity(path.len());
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }

    if out.is_empty() { "/".to_string() } else { out }
}

/// Directory portion of a normalized path. The dirname of `/` is `/`.
pub fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final segment of a normalized path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a base directory and a (possibly relative) segment, normalizing
/// the result.
pub fn join(base: &str, segment: &str) -> String {
    if segment.starts_with('/') {
        normalize(segment)
    } else {
        normalize(&format!("{base}/{segment}"))
    }
}

/// File extension including the leading dot, if any.
pub fn extension(path: &str) -> Option<&str> {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx..]),
    }
}
