//! Finding where the previous content of a rotated log went.
//!
//! Candidates are searched in a fixed order and the first pattern with any match wins. Inside one pattern the
//! lexicographically greatest name is taken, which is the most recent one since all supported suffixes are zero-padded
//! and fixed-width.

use std::{
    fs, io,
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    path_utils::{append_extension, get_inode_by_path, resolve_rotated_dir},
    position::PersistedPosition,
    tailer::TailerError,
    warning::Warning,
};

/// Name suffixes of logrotate `.1` generations, tried before any dated scheme
const GENERATION_SUFFIXES: &[&str] = &[".1", ".1.[Gg][Zz]"];

/// Dated suffixes produced by logrotate `dateext` (with and without `delaycompress`) and by timed handlers
const DATED_SUFFIXES: &[&str] = &[
    // -%Y-%m-%d
    "-[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]",
    "-[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9].[Gg][Zz]",
    // -%Y%m%d
    "-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]",
    "-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9].[Gg][Zz]",
    // -%Y%m%d-%s
    "-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]",
    "-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9].[Gg][Zz]",
    // .%Y-%m-%d
    ".[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]",
];

/// Outcome of a rotation check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationDecision {
    /// `path` holds the content that was being read before rotation; continue there from the last offset
    Rotated(PathBuf),
    /// Previous content cannot be recovered, read the monitored file from the start
    Reset,
    /// File shrank in place and copytruncate is disabled; the offset is kept
    Shrunk { expected: u64, actual: u64 },
}

/// Decides whether a monitored file was rotated and where its previous content lives.
#[derive(Clone, Debug)]
pub struct RotationLocator {
    path: PathBuf,
    rotated_dir: PathBuf,
    extra_patterns: Vec<String>,
    copytruncate: bool,
}

impl RotationLocator {
    /// Create a locator for `path`.
    ///
    /// `olddir` overrides the directory searched for rotated copies, `extra_patterns` are glob suffixes appended to the
    /// file name after the built-in ones. Patterns are validated here so later searches cannot fail on them.
    pub fn new(
        path: impl AsRef<Path>,
        olddir: Option<&Path>,
        extra_patterns: Vec<String>,
        copytruncate: bool,
    ) -> Result<Self, TailerError> {
        for pattern in &extra_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| TailerError::InvalidPattern(format!("`{pattern}`: {e}")))?;
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            rotated_dir: resolve_rotated_dir(&path, olddir),
            extra_patterns,
            copytruncate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compare `last` with what is on disk now.
    ///
    /// Returns `None` when the monitored file still has the same inode and is at least `last.offset` bytes long.
    /// Warnings describing an anomalous decision are pushed to `warnings`. Fails if the monitored file cannot be
    /// stat'ed.
    pub fn check(
        &self,
        last: PersistedPosition,
        warnings: &mut Vec<Warning>,
    ) -> Result<Option<RotationDecision>, TailerError> {
        let metadata = fs::metadata(&self.path)?;
        let (inode, size) = (metadata.ino(), metadata.len());
        if inode == last.inode && size >= last.offset {
            return Ok(None);
        }
        debug!(
            path = %self.path.display(),
            last_inode = last.inode,
            last_offset = last.offset,
            inode,
            size,
            "suspecting rotation"
        );

        if let Some(candidate) = self.find_candidate()? {
            if get_inode_by_path(&candidate)? == last.inode {
                debug!(rotated = %candidate.display(), "found rotated file");
                return Ok(Some(RotationDecision::Rotated(candidate)));
            }
            if inode == last.inode && self.copytruncate {
                debug!(copy = %candidate.display(), "trusting copy of truncated file");
                return Ok(Some(RotationDecision::Rotated(candidate)));
            }
        }

        if inode == last.inode && !self.copytruncate {
            warnings.push(Warning::ShrankWithoutCopytruncate {
                path: self.path.clone(),
                expected: last.offset,
                actual: size,
            });
            return Ok(Some(RotationDecision::Shrunk {
                expected: last.offset,
                actual: size,
            }));
        }

        warnings.push(Warning::RotatedToUnknownLocation {
            path: self.path.clone(),
        });
        Ok(Some(RotationDecision::Reset))
    }

    /// Search for the file most likely holding the pre-rotation tail, without validating it.
    pub fn find_candidate(&self) -> Result<Option<PathBuf>, TailerError> {
        if let Some(candidate) = self.savelog_candidate()? {
            return Ok(Some(candidate));
        }

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", self.path.display()),
                )
            })?;
        let prefix = format!(
            "{}/{}",
            glob::Pattern::escape(&self.rotated_dir.to_string_lossy()),
            glob::Pattern::escape(&file_name)
        );

        let suffixes = GENERATION_SUFFIXES
            .iter()
            .chain(DATED_SUFFIXES)
            .copied()
            .chain(self.extra_patterns.iter().map(String::as_str));
        for suffix in suffixes {
            if let Some(candidate) = most_recent_match(&format!("{prefix}{suffix}"))? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// savelog(8) keeps the newest generation uncompressed as `.0` next to an older `.1.gz`
    fn savelog_candidate(&self) -> io::Result<Option<PathBuf>> {
        let newest = append_extension(self.path.clone(), "0");
        let older = append_extension(self.path.clone(), "1.gz");
        let (Some(newest_meta), Some(older_meta)) = (maybe_metadata(&newest)?, maybe_metadata(&older)?)
        else {
            return Ok(None);
        };
        if newest_meta.modified()? > older_meta.modified()? {
            Ok(Some(newest))
        } else {
            Ok(None)
        }
    }
}

fn maybe_metadata(path: &Path) -> io::Result<Option<fs::Metadata>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn most_recent_match(pattern: &str) -> Result<Option<PathBuf>, TailerError> {
    let matches = glob::glob(pattern)
        .map_err(|e| TailerError::InvalidPattern(format!("`{pattern}`: {e}")))?;
    Ok(matches.filter_map(Result::ok).filter(|path| path.is_file()).max())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use filetime::{set_file_mtime, FileTime};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    struct Logs {
        dir: TempDir,
        path: PathBuf,
    }

    impl Logs {
        fn file(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, name).unwrap();
            path
        }

        fn locator(&self, copytruncate: bool) -> RotationLocator {
            RotationLocator::new(&self.path, None, vec![], copytruncate).unwrap()
        }
    }

    #[fixture]
    fn logs() -> Logs {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "current\n").unwrap();
        Logs { dir, path }
    }

    fn position_of(path: &Path, offset: u64) -> PersistedPosition {
        PersistedPosition {
            inode: get_inode_by_path(path).unwrap(),
            offset,
        }
    }

    #[rstest]
    fn unchanged_file_is_not_rotated(logs: Logs) {
        let mut warnings = vec![];
        let decision = logs
            .locator(true)
            .check(position_of(&logs.path, 8), &mut warnings)
            .unwrap();
        assert_eq!(decision, None);
        assert!(warnings.is_empty());
    }

    #[rstest]
    #[case(&["app.log.1"], "app.log.1")]
    #[case(&["app.log.1.gz", "app.log-20240101"], "app.log.1.gz")]
    #[case(&["app.log.1.GZ"], "app.log.1.GZ")]
    #[case(&["app.log-2024-01-01", "app.log-2024-02-01.gz", "app.log-2024-01-31"], "app.log-2024-01-31")]
    #[case(&["app.log-20240101", "app.log-20240301"], "app.log-20240301")]
    #[case(&["app.log-20240101-1704067200.gz"], "app.log-20240101-1704067200.gz")]
    #[case(&["app.log.2024-03-01", "app.log.2024-02-01"], "app.log.2024-03-01")]
    fn candidate_follows_pattern_order(logs: Logs, #[case] names: &[&str], #[case] expected: &str) {
        for name in names {
            logs.file(name);
        }
        assert_eq!(
            logs.locator(true).find_candidate().unwrap(),
            Some(logs.dir.path().join(expected))
        );
    }

    #[rstest]
    fn no_candidate_without_rotated_files(logs: Logs) {
        logs.file("other.log.1");
        logs.file("app.log.bak");
        assert_eq!(logs.locator(true).find_candidate().unwrap(), None);
    }

    #[rstest]
    fn savelog_scheme_needs_newer_zero_generation(logs: Logs) {
        let newest = logs.file("app.log.0");
        let older = logs.file("app.log.1.gz");
        let now = SystemTime::now();
        set_file_mtime(&older, FileTime::from_system_time(now - Duration::from_secs(60))).unwrap();
        set_file_mtime(&newest, FileTime::from_system_time(now)).unwrap();
        assert_eq!(logs.locator(true).find_candidate().unwrap(), Some(newest.clone()));

        set_file_mtime(&newest, FileTime::from_system_time(now - Duration::from_secs(120))).unwrap();
        assert_eq!(logs.locator(true).find_candidate().unwrap(), Some(older));
    }

    #[rstest]
    fn extra_patterns_are_searched_last(logs: Logs) {
        let custom = logs.file("app.log.old");
        let locator =
            RotationLocator::new(&logs.path, None, vec![".old".to_string()], true).unwrap();
        assert_eq!(locator.find_candidate().unwrap(), Some(custom));
    }

    #[rstest]
    fn invalid_extra_pattern_is_rejected(logs: Logs) {
        let result = RotationLocator::new(&logs.path, None, vec!["[".to_string()], true);
        assert!(matches!(result, Err(TailerError::InvalidPattern(_))));
    }

    #[rstest]
    fn path_without_file_name_is_invalid_input(logs: Logs) {
        let locator = RotationLocator::new(logs.dir.path().join(".."), None, vec![], true).unwrap();
        assert!(matches!(
            locator.find_candidate(),
            Err(TailerError::IO(e)) if e.kind() == io::ErrorKind::InvalidInput
        ));
    }

    #[rstest]
    fn olddir_is_searched_instead_of_log_dir(logs: Logs) {
        fs::create_dir(logs.dir.path().join("old")).unwrap();
        logs.file("app.log.1");
        let rotated = logs.file("old/app.log.1");

        let locator =
            RotationLocator::new(&logs.path, Some(Path::new("old")), vec![], true).unwrap();
        assert_eq!(locator.find_candidate().unwrap(), Some(rotated));
    }

    #[rstest]
    fn renamed_file_is_found_by_inode(logs: Logs) {
        let last = position_of(&logs.path, 8);
        let rotated = logs.dir.path().join("app.log.1");
        fs::rename(&logs.path, &rotated).unwrap();
        fs::write(&logs.path, "").unwrap();

        let mut warnings = vec![];
        let decision = logs.locator(false).check(last, &mut warnings).unwrap();

        assert_eq!(decision, Some(RotationDecision::Rotated(rotated)));
        assert!(warnings.is_empty());
    }

    #[rstest]
    fn truncated_copy_is_trusted_with_copytruncate(logs: Logs) {
        let last = position_of(&logs.path, 8);
        let copy = logs.file("app.log.1");
        fs::write(&logs.path, "").unwrap();

        let mut warnings = vec![];
        let decision = logs.locator(true).check(last, &mut warnings).unwrap();

        assert_eq!(decision, Some(RotationDecision::Rotated(copy)));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn shrink_without_copytruncate_is_reported(logs: Logs, #[case] with_candidate: bool) {
        let last = position_of(&logs.path, 8);
        if with_candidate {
            logs.file("app.log.1");
        }
        fs::write(&logs.path, "x\n").unwrap();

        let mut warnings = vec![];
        let decision = logs.locator(false).check(last, &mut warnings).unwrap();

        assert_eq!(
            decision,
            Some(RotationDecision::Shrunk {
                expected: 8,
                actual: 2
            })
        );
        assert!(matches!(
            warnings.as_slice(),
            [Warning::ShrankWithoutCopytruncate { .. }]
        ));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn unknown_rotation_target_resets(logs: Logs, #[case] copytruncate: bool) {
        let last = position_of(&logs.path, 8);
        logs.file("app.log.1");
        let replacement = logs.file("app.log.new");
        fs::rename(replacement, &logs.path).unwrap();

        let mut warnings = vec![];
        let decision = logs.locator(copytruncate).check(last, &mut warnings).unwrap();

        assert_eq!(decision, Some(RotationDecision::Reset));
        assert_eq!(
            warnings,
            vec![Warning::RotatedToUnknownLocation {
                path: logs.path.clone()
            }]
        );
    }

    #[rstest]
    fn truncation_without_copy_resets_with_copytruncate(logs: Logs) {
        let last = position_of(&logs.path, 8);
        fs::write(&logs.path, "").unwrap();

        let mut warnings = vec![];
        let decision = logs.locator(true).check(last, &mut warnings).unwrap();

        assert_eq!(decision, Some(RotationDecision::Reset));
    }

    #[rstest]
    fn missing_monitored_file_is_an_error(logs: Logs) {
        let last = position_of(&logs.path, 8);
        fs::remove_file(&logs.path).unwrap();
        assert!(matches!(
            logs.locator(true).check(last, &mut vec![]),
            Err(TailerError::IO(_))
        ));
    }
}
