//! Local-socket endpoint addressing.
//!
//! Endpoints are a single string path: a named-pipe name on Windows, a
//! filesystem socket path elsewhere. [`endpoint_path`] derives a stable,
//! collision-resistant path from a module name and worker id.

use std::hash::{Hash, Hasher};

/// Derive the endpoint path for `(module, worker)`.
///
/// Both components are sanitized to `[A-Za-z0-9-]`; a hash of the
/// unsanitized pair is appended so distinct inputs that sanitize to the same
/// text still get distinct endpoints. The result is stable across processes
/// and runs.
pub fn endpoint_path(module: &str, worker: &str) -> String {
    let tag = format!(
        "forkwire-{}-{}-{:08x}",
        sanitize(module),
        sanitize(worker),
        stable_hash(module, worker) as u32
    );

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{tag}")
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir()
            .join(format!("{tag}.sock"))
            .to_string_lossy()
            .into_owned()
    }
}

/// Remove a stale filesystem socket at `path`.
///
/// No-op on Windows, where the pipe namespace is in-kernel and vanishes
/// with its last handle. Missing files are not an error.
pub fn cleanup_endpoint(path: &str) -> std::io::Result<()> {
    #[cfg(windows)]
    {
        let _ = path;
        Ok(())
    }
    #[cfg(not(windows))]
    {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn sanitize(input: &str) -> String {
    let mut out: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if out.is_empty() {
        out.push('x');
    }
    out
}

// DefaultHasher with default keys is deterministic for a given input, which
// is what makes the derived path stable across runs.
fn stable_hash(module: &str, worker: &str) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    module.hash(&mut hasher);
    worker.hash(&mut hasher);
    hasher.finish()
}
