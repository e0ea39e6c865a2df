//! On-disk layout of hosts, backups and pool-wide files.
//!
//! ```text
//! <hosts_root>/<host>/REFCNT.host
//! <hosts_root>/<host>/<number>/<mangled-share>.{filelist,journal,manifest,lock}
//! <hosts_root>/<host>/<number>/REFCNT{,.backup}
//! <pool_root>/REFCNT.pool
//! <pool_root>/<hh>/<hh>/<hh>/<hash>-sha256.zz
//! ```

use std::path::{Path, PathBuf};

pub const REFCNT_JOURNAL: &str = "REFCNT";
pub const REFCNT_BACKUP: &str = "REFCNT.backup";
pub const REFCNT_HOST: &str = "REFCNT.host";
pub const REFCNT_POOL: &str = "REFCNT.pool";

pub fn host_dir(hosts_root: &Path, host: &str) -> PathBuf {
    hosts_root.join(host)
}

pub fn backup_dir(hosts_root: &Path, host: &str, number: u32) -> PathBuf {
    host_dir(hosts_root, host).join(number.to_string())
}

/// Directory holding the pool-wide refcount scope.
pub fn pool_refcnt_dir(pool_root: &Path) -> PathBuf {
    pool_root.to_path_buf()
}
