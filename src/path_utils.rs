use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
};

/// Extension (compared case-insensitively) of files that are read through a gzip decoder
pub const COMPRESSED_EXTENSION: &str = "gz";

/// Suffix appended to the monitored path to get the default sidecar location
pub const DEFAULT_SIDECAR_SUFFIX: &str = "offset";

/// Ask the filesystem for metadata and return inode for fs object specified by `path`
pub fn get_inode_by_path(path: impl AsRef<Path>) -> io::Result<u64> {
    let metadata = std::fs::metadata(&path)?;
    Ok(metadata.ino())
}

/// Add extension to existing PathBuf
///
/// ## Example
///
/// ```rust
/// use std::path::PathBuf;
/// let original_path = "/var/log/mail.log".into();
/// let rotated_path = logtrack::path_utils::append_extension(original_path, "1");
/// assert_eq!(rotated_path, PathBuf::from("/var/log/mail.log.1"));
/// ```
pub fn append_extension(path: PathBuf, ext: impl AsRef<OsStr>) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(".");
    os_string.push(ext.as_ref());
    os_string.into()
}

/// Default sidecar path for a monitored file, `<path>.offset`
pub fn default_sidecar_path(path: impl AsRef<Path>) -> PathBuf {
    append_extension(path.as_ref().to_path_buf(), DEFAULT_SIDECAR_SUFFIX)
}

/// Whether `path` names a gzip-compressed file
///
/// ```rust
/// use logtrack::path_utils::is_compressed;
/// assert!(is_compressed("/var/log/syslog.2.GZ"));
/// assert!(!is_compressed("/var/log/syslog.1"));
/// ```
pub fn is_compressed(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(COMPRESSED_EXTENSION))
        .unwrap_or(false)
}

/// Directory holding rotated copies of `path`.
///
/// `olddir` may be absolute or relative to the log's own directory. When it is not given, does not exist, or is not
/// a directory, the log's own directory is used.
pub fn resolve_rotated_dir(path: impl AsRef<Path>, olddir: Option<&Path>) -> PathBuf {
    let logdir = match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    match olddir {
        Some(olddir) => {
            let candidate = logdir.join(olddir);
            if candidate.is_dir() {
                candidate
            } else {
                logdir
            }
        }
        None => logdir,
    }
}
