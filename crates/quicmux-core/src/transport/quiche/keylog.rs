//! TLS key-log export in NSS format.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

/// Key-log file name: `YYYYMMDD-HHMMSS-<cid hex>.keys` in local time.
pub fn keylog_file_name(cid: &[u8]) -> String {
    format!(
        "{}-{}.keys",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        hex::encode(cid)
    )
}

/// Create `dir` (mode 0700) if needed and open a key-log file for `cid`
/// in append mode.
pub fn open_keylog(dir: &Path, cid: &[u8]) -> Result<(File, PathBuf)> {
    create_private_dir(dir)?;
    let path = dir.join(keylog_file_name(cid));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Export the TLS secrets of `quic` into `dir`. Failures are logged and
/// the connection continues without a key log.
pub(crate) fn attach_keylog(quic: &mut quiche::Connection, dir: &Path, cid: &[u8]) {
    match open_keylog(dir, cid) {
        Ok((file, path)) => {
            quic.set_keylog(Box::new(file));
            debug!(path = %path.display(), "exporting TLS keys");
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "cannot open TLS key log"),
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_format() {
        let name = keylog_file_name(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(name.ends_with("-deadbeef.keys"));
        // YYYYMMDD-HHMMSS-
        assert_eq!(name.find('-'), Some(8));
        assert_eq!(&name[15..16], "-");
    }

    #[test]
    fn creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("keys");
        let (_file, path) = open_keylog(&dir, &[1, 2, 3]).unwrap();
        assert!(path.exists());
        assert!(path.starts_with(&dir));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
