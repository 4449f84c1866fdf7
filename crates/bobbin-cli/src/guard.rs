//! スケジューラの多重起動防止
//!
//! ストアの隣に lock ファイルを `create_new` で作り、中身は pid。
//! 既にあれば他のスケジューラが動いているとみなす。
//! Linux では `/proc/<pid>` が無ければ死んだプロセスの残骸として取り直す。

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug)]
pub struct SchedulerGuard {
    path: PathBuf,
}

impl SchedulerGuard {
    /// `Ok(None)` when another live scheduler holds the lock.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(path) {
                        return Ok(None);
                    }
                    warn!(path = %path.display(), "removing lock left by a dead scheduler");
                    std::fs::remove_file(path)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<u32>() else {
        return false;
    };
    let proc = Path::new("/proc");
    proc.is_dir() && !proc.join(pid.to_string()).exists()
}
