//! Worker identity strings.

use uuid::Uuid;

/// Builds a worker identity of the form `host-prefix:pid:short-uuid`, unique
/// per process and stable enough to show up meaningfully in `assigned_to`.
pub fn worker_id(prefix: &str) -> String {
    let pid = std::process::id();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}:{pid}:{}", &suffix[..8])
}
