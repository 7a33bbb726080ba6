use std::{
    cmp::Ordering,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position inside a particular file incarnation that has been fully consumed.
///
/// This is the only value that survives across runs. Zero inode and zero offset mean "nothing recorded".
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedPosition {
    pub inode: u64,
    pub offset: u64,
}

impl PersistedPosition {
    /// Parse sidecar content: exactly two base 10 integers, one per line.
    pub fn parse(content: &str) -> Result<Self, PositionError> {
        let mut values = content.lines().map(str::trim).filter(|line| !line.is_empty());
        let mut next_value = |name: &str| -> Result<u64, PositionError> {
            let raw = values
                .next()
                .ok_or_else(|| PositionError::Malformed(format!("missing {name}")))?;
            raw.parse()
                .map_err(|_| PositionError::Malformed(format!("bad {name} `{raw}`")))
        };
        let inode = next_value("inode")?;
        let offset = next_value("offset")?;
        if values.next().is_some() {
            return Err(PositionError::Malformed(
                "unexpected trailing content".to_string(),
            ));
        }
        Ok(Self { inode, offset })
    }

    /// Sidecar representation, `"<inode>\n<offset>\n"`.
    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.inode, self.offset)
    }
}

/// In-memory marker of progress attached to every yielded line.
///
/// `generation` grows each time the tailer opens a file, so offsets compare by generation first and by byte offset
/// second. The inode is carried along so the value can be committed later, but it does not take part in comparison.
#[derive(Copy, Clone, Debug)]
pub struct Offset {
    pub generation: u64,
    pub inode: u64,
    pub offset: u64,
}

impl PartialEq for Offset {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.offset == other.offset
    }
}

impl Eq for Offset {}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then(self.offset.cmp(&other.offset))
    }
}

impl From<Offset> for PersistedPosition {
    fn from(value: Offset) -> Self {
        PersistedPosition {
            inode: value.inode,
            offset: value.offset,
        }
    }
}

/// Possible errors that could happen while working with the sidecar file
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("while working with sidecar file")]
    IO(#[from] io::Error),

    #[error("malformed sidecar content: {0}")]
    Malformed(String),

    #[error("update hook failed")]
    Hook(#[source] io::Error),
}

/// Callback invoked right before a position is written, e.g. to flush downstream output.
pub type UpdateHook = Box<dyn FnMut() -> io::Result<()> + Send>;

/// Durable storage of `PersistedPosition` in a small sidecar file.
pub struct PositionStore {
    path: PathBuf,
    on_update: Option<UpdateHook>,
}

impl PositionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            on_update: None,
        }
    }

    pub fn with_hook(mut self, hook: UpdateHook) -> Self {
        self.on_update = Some(hook);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load previously saved position.
    ///
    /// A missing or empty sidecar yields `Ok(None)`. Unreadable or malformed content is an error; the tailer treats
    /// it as "no prior position" after reporting a warning.
    pub fn load(&self) -> Result<Option<PersistedPosition>, PositionError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        PersistedPosition::parse(&content).map(Some)
    }

    /// Atomically replace sidecar content with `position`, running the update hook first.
    ///
    /// If the hook fails, nothing is written.
    pub fn save(&mut self, position: PersistedPosition) -> Result<(), PositionError> {
        if let Some(hook) = self.on_update.as_mut() {
            hook().map_err(PositionError::Hook)?;
        }

        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staging = tempfile::NamedTempFile::new_in(directory)?;
        staging.write_all(position.render().as_bytes())?;
        staging.as_file().sync_all()?;
        staging.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[rstest]
    #[case("12\n34\n", 12, 34)]
    #[case("12\n34", 12, 34)]
    #[case(" 7 \n 0 \n", 7, 0)]
    fn parses_sidecar_content(#[case] content: &str, #[case] inode: u64, #[case] offset: u64) {
        assert_eq!(
            PersistedPosition::parse(content).unwrap(),
            PersistedPosition { inode, offset }
        );
    }

    #[rstest]
    #[case("12\n")]
    #[case("a\n1\n")]
    #[case("1\n2\n3\n")]
    #[case("-1\n2\n")]
    fn rejects_malformed_content(#[case] content: &str) {
        assert!(matches!(
            PersistedPosition::parse(content),
            Err(PositionError::Malformed(_))
        ));
    }

    #[rstest]
    fn missing_or_empty_sidecar_means_no_position(dir: TempDir) {
        let store = PositionStore::new(dir.path().join("log.offset"));
        assert_eq!(store.load().unwrap(), None);

        fs::write(store.path(), "").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[rstest]
    fn save_writes_two_lines(dir: TempDir) {
        let mut store = PositionStore::new(dir.path().join("log.offset"));
        store
            .save(PersistedPosition {
                inode: 42,
                offset: 1024,
            })
            .unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "42\n1024\n");
    }

    #[rstest]
    fn saving_loaded_position_keeps_content(dir: TempDir) {
        let path = dir.path().join("log.offset");
        fs::write(&path, "918273\n55\n").unwrap();
        let mut store = PositionStore::new(&path);

        let loaded = store.load().unwrap().unwrap();
        store.save(loaded).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "918273\n55\n");
    }

    #[rstest]
    fn hook_runs_before_write(dir: TempDir) {
        let path = dir.path().join("log.offset");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook_path = path.clone();
        let mut store = PositionStore::new(&path).with_hook(Box::new(move || -> io::Result<()> {
            hook_seen.lock().unwrap().push(hook_path.exists());
            Ok(())
        }));

        store.save(PersistedPosition::default()).unwrap();
        store.save(PersistedPosition::default()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    }

    #[rstest]
    fn failing_hook_prevents_write(dir: TempDir) {
        let path = dir.path().join("log.offset");
        let mut store = PositionStore::new(&path)
            .with_hook(Box::new(|| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "sink closed"))
            }));

        let result = store.save(PersistedPosition {
            inode: 1,
            offset: 1,
        });

        assert!(matches!(result, Err(PositionError::Hook(_))));
        assert!(!path.exists());
    }

    #[rstest]
    fn unwritable_sidecar_is_an_error(dir: TempDir) {
        let mut store = PositionStore::new(dir.path().join("missing").join("log.offset"));
        assert!(matches!(
            store.save(PersistedPosition::default()),
            Err(PositionError::IO(_))
        ));
    }

    #[test]
    fn offsets_order_by_generation_then_offset() {
        let first = Offset {
            generation: 1,
            inode: 10,
            offset: 500,
        };
        let second = Offset {
            generation: 2,
            inode: 11,
            offset: 3,
        };
        let third = Offset {
            generation: 2,
            inode: 11,
            offset: 40,
        };
        assert!(first < second);
        assert!(second < third);
        assert_eq!(
            second,
            Offset {
                inode: 999,
                ..second
            }
        );
    }
}
