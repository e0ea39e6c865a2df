use std::fmt;
use std::path::{Path, PathBuf};

use hoard_config::layout;

/// Persisted (non-journal) refcount scopes, in compaction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Backup,
    Host,
    Pool,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Backup, Scope::Host, Scope::Pool];

    /// Whether aggregate statistics are written next to the scope file.
    pub fn persists_statistics(self) -> bool {
        !matches!(self, Scope::Backup)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Backup => "backup",
            Scope::Host => "host",
            Scope::Pool => "pool",
        })
    }
}

/// The refcount files of one host backup against one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCount {
    pub journal: PathBuf,
    pub backup: PathBuf,
    pub host: PathBuf,
    pub pool: PathBuf,
}

impl ReferenceCount {
    pub fn new(hosts_root: &Path, host: &str, backup_number: u32, pool_root: &Path) -> Self {
        let backup_dir = layout::backup_dir(hosts_root, host, backup_number);
        Self {
            journal: backup_dir.join(layout::REFCNT_JOURNAL),
            backup: backup_dir.join(layout::REFCNT_BACKUP),
            host: layout::host_dir(hosts_root, host).join(layout::REFCNT_HOST),
            pool: pool_file(pool_root),
        }
    }

    pub fn scope(&self, scope: Scope) -> &Path {
        match scope {
            Scope::Backup => &self.backup,
            Scope::Host => &self.host,
            Scope::Pool => &self.pool,
        }
    }
}

/// Pool-wide scope file for `pool_root`.
pub fn pool_file(pool_root: &Path) -> PathBuf {
    layout::pool_refcnt_dir(pool_root).join(layout::REFCNT_POOL)
}

/// `<scope>.stats.json`
pub fn statistics_path(scope_path: &Path) -> PathBuf {
    let mut name = scope_path.as_os_str().to_os_string();
    name.push(".stats.json");
    PathBuf::from(name)
}
