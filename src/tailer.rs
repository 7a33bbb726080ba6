use std::{
    fs, io,
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    path_utils::default_sidecar_path,
    position::{Offset, PersistedPosition, PositionError, PositionStore, UpdateHook},
    rotation::{RotationDecision, RotationLocator},
    source::{open_source, Encoding, LineSource, SourceOptions, StartAt},
    warning::{log_warning, Warning, WarningHandler},
};

/// Settings of a `Tailer`. Every field can be omitted when deserializing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TailerConfig {
    /// Sidecar file holding the position, `<path>.offset` when not set
    pub offset_file: Option<PathBuf>,
    /// Commit after every line
    pub paranoid: bool,
    /// Commit after every n-th line, 0 disables
    pub every_n: u64,
    /// Commit when no more data is available and when the tailer is torn down
    pub save_on_end: bool,
    /// Start at the end of the file when there is no persisted position
    pub read_from_end: bool,
    /// Only yield lines terminated by `\n`
    pub full_lines: bool,
    /// Support logs truncated in place after being copied
    pub copytruncate: bool,
    /// Directory with rotated copies, absolute or relative to the log's directory
    pub olddir: Option<PathBuf>,
    /// Additional glob suffixes naming rotated copies
    pub log_patterns: Vec<String>,
    pub encoding: Encoding,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            offset_file: None,
            paranoid: false,
            every_n: 0,
            save_on_end: true,
            read_from_end: false,
            full_lines: false,
            copytruncate: true,
            olddir: None,
            log_patterns: vec![],
            encoding: Encoding::default(),
        }
    }
}

/// Where the tailer currently takes lines from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TailState {
    /// Streaming the live monitored file
    ReadingCurrent,
    /// Streaming the remainder of the file the log was rotated to
    DrainingRotated,
    /// Last call found no more data; the next call reads the monitored file again
    Exhausted,
}

/// Possible errors that could happen while working with `Tailer`
#[derive(Error, Debug)]
pub enum TailerError {
    #[error("while working with underlying file")]
    IO(#[from] io::Error),
    #[error("while working with persistent position storage")]
    Persistence(#[from] PositionError),
    #[error("invalid rotated file pattern {0}")]
    InvalidPattern(String),
}

/// Configures and opens a `Tailer`.
///
/// ```rust no_run
/// # use std::io::Write;
/// # use logtrack::{TailerBuilder, TailerConfig, TailerError};
/// let mut output = std::io::BufWriter::new(std::fs::File::create("/tmp/mail.out")?);
/// let mut tailer = TailerBuilder::new("/var/log/mail.log")
///     .config(TailerConfig {
///         every_n: 100,
///         ..Default::default()
///     })
///     .on_warning(|warning| eprintln!("mail.log: {warning}"))
///     .open()?;
/// for line in &mut tailer {
///     output.write_all(line?.as_bytes())?;
/// }
/// # Ok::<(), TailerError>(())
/// ```
pub struct TailerBuilder {
    path: PathBuf,
    config: TailerConfig,
    on_update: Option<UpdateHook>,
    on_warning: Option<WarningHandler>,
}

impl TailerBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: TailerConfig::default(),
            on_update: None,
            on_warning: None,
        }
    }

    pub fn config(mut self, config: TailerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `hook` right before every commit. An error from the hook aborts the commit.
    pub fn on_update(mut self, hook: impl FnMut() -> io::Result<()> + Send + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    /// Receive warnings instead of having them logged through `tracing`
    pub fn on_warning(mut self, handler: impl FnMut(&Warning) + Send + 'static) -> Self {
        self.on_warning = Some(Box::new(handler));
        self
    }

    /// Load persisted position, resolve rotation that happened since the last run and open the file to read.
    pub fn open(self) -> Result<Tailer, TailerError> {
        let TailerBuilder {
            path,
            config,
            on_update,
            on_warning,
        } = self;

        let sidecar = config
            .offset_file
            .clone()
            .unwrap_or_else(|| default_sidecar_path(&path));
        let mut store = PositionStore::new(sidecar);
        if let Some(hook) = on_update {
            store = store.with_hook(hook);
        }
        let locator = RotationLocator::new(
            &path,
            config.olddir.as_deref(),
            config.log_patterns.clone(),
            config.copytruncate,
        )?;
        let mut on_warning = on_warning.unwrap_or_else(|| Box::new(log_warning));

        let stored = match store.load() {
            Ok(stored) => stored,
            Err(e) => {
                on_warning(&Warning::UnreadablePosition {
                    sidecar: store.path().to_path_buf(),
                    reason: e.to_string(),
                });
                None
            }
        };

        let mut warnings = vec![];
        let mut reset = false;
        let (source_path, start, state) = match stored {
            None if config.read_from_end => (path.clone(), StartAt::End, TailState::ReadingCurrent),
            None => (path.clone(), StartAt::Offset(0), TailState::ReadingCurrent),
            Some(last) => match locator.check(last, &mut warnings)? {
                None | Some(RotationDecision::Shrunk { .. }) => (
                    path.clone(),
                    StartAt::Offset(last.offset),
                    TailState::ReadingCurrent,
                ),
                Some(RotationDecision::Rotated(rotated)) => (
                    rotated,
                    StartAt::Offset(last.offset),
                    TailState::DrainingRotated,
                ),
                Some(RotationDecision::Reset) => {
                    reset = true;
                    (path.clone(), StartAt::Offset(0), TailState::ReadingCurrent)
                }
            },
        };
        warnings.iter().for_each(|warning| on_warning(warning));
        let shrink_reported = warnings
            .iter()
            .any(|warning| matches!(warning, Warning::ShrankWithoutCopytruncate { .. }));

        let options = SourceOptions {
            encoding: config.encoding,
            full_lines: config.full_lines,
        };
        let source = open_source(&source_path, start, options)?;
        debug!(
            path = %source_path.display(),
            offset = source.current_offset(),
            ?state,
            "opened log"
        );

        let mut tailer = Tailer {
            path,
            config,
            options,
            locator,
            store,
            on_warning,
            source,
            state,
            generation: 1,
            since_commit: 0,
            shrink_reported,
            pending: None,
            deferred: None,
            already_freed: false,
        };
        if reset {
            if let Err(e) = tailer.commit() {
                tailer.already_freed = true;
                return Err(e);
            }
        }
        Ok(tailer)
    }
}

/// Reads lines appended to a log since the previous run, following it through rotation.
///
/// ## Usage
///
/// ```rust no_run
/// # use logtrack::{Tailer, TailerError};
/// // running this will print lines appended to the log since the last execution
/// let mut tailer = Tailer::new("/var/log/mail.log")?;
/// for line in &mut tailer {
///     print!("{}", line?);
/// }
/// tailer.close()?;
/// # Ok::<(), TailerError>(())
/// ```
///
/// Lines are returned with their terminator. A call that finds no more data returns `None`; polling again later picks
/// up whatever was appended meanwhile.
///
/// ## Working principles
///
/// Inode and offset of the last consumed byte are kept in a sidecar file (see `PositionStore`). On start, if the log's
/// inode differs from the stored one or the log is now shorter than the stored offset, `RotationLocator` looks for the
/// file holding the old content. When found, its unread tail is drained first and reading continues with the new log
/// from the start. While running, a log replaced under an open handle is drained through that handle, and a log
/// truncated in place is handled the same way as on start.
///
/// ## Cleanup
///
/// As with any position tracking there are two ways to finish:
///
/// * **explicit** by calling `.close()`, which returns any error of the final commit
/// * **implicitly** by relying on `Drop`, which commits when `save_on_end` is set and only logs a failure
///
/// ## Limitations
///
/// Only one rotation between runs can be followed. Two tailers sharing a sidecar file are not coordinated and will
/// overwrite each other's position.
pub struct Tailer {
    path: PathBuf,
    config: TailerConfig,
    options: SourceOptions,
    locator: RotationLocator,
    store: PositionStore,
    on_warning: WarningHandler,
    source: Box<dyn LineSource>,
    state: TailState,
    generation: u64,
    since_commit: u64,
    shrink_reported: bool,
    /// Line whose commit failed, with the position preceding it
    pending: Option<(String, PersistedPosition)>,
    /// Error held back by `read_lines` so the lines before it are returned first
    deferred: Option<TailerError>,
    already_freed: bool,
}

impl Tailer {
    /// Open `path` with default settings and the sidecar at `<path>.offset`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, TailerError> {
        TailerBuilder::new(path).open()
    }

    pub fn with_config(path: impl AsRef<Path>, config: TailerConfig) -> Result<Self, TailerError> {
        TailerBuilder::new(path).config(config).open()
    }

    /// Next unread line, or `None` when nothing more is available right now.
    ///
    /// When the commit required by `paranoid` or `every_n` fails, the error is returned and the line is handed out
    /// again by the next call, after the commit is retried.
    pub fn next_line(&mut self) -> Result<Option<String>, TailerError> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let (line, before) = match self.pending.take() {
            Some(pending) => pending,
            None => {
                let before = self.persisted_position();
                match self.advance()? {
                    Some(line) => {
                        self.since_commit += 1;
                        (line, before)
                    }
                    None => {
                        if self.state == TailState::ReadingCurrent {
                            self.state = TailState::Exhausted;
                        }
                        if self.config.save_on_end {
                            self.commit()?;
                        }
                        return Ok(None);
                    }
                }
            }
        };

        let every_n_reached = self.config.every_n > 0 && self.since_commit >= self.config.every_n;
        if self.config.paranoid || every_n_reached {
            if let Err(e) = self.commit() {
                self.pending = Some((line, before));
                return Err(e);
            }
        }
        Ok(Some(line))
    }

    /// Iterate over lines paired with the `Offset` right after each of them
    pub fn with_offsets(&mut self) -> WithOffsets<'_> {
        WithOffsets { tailer: self }
    }

    /// All lines available right now.
    ///
    /// An error met after some lines were read is returned by the next call, so those lines are not lost.
    pub fn read_lines(&mut self) -> Result<Vec<String>, TailerError> {
        let mut lines = vec![];
        loop {
            match self.next_line() {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => return Ok(lines),
                Err(e) if lines.is_empty() => return Err(e),
                Err(e) => {
                    self.deferred = Some(e);
                    return Ok(lines);
                }
            }
        }
    }

    /// All lines available right now joined together, `None` if there were none
    pub fn read(&mut self) -> Result<Option<String>, TailerError> {
        let lines = self.read_lines()?;
        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(lines.concat()))
        }
    }

    /// Persist position of the active source
    pub fn commit(&mut self) -> Result<(), TailerError> {
        let position = self.persisted_position();
        self.store.save(position)?;
        self.since_commit = 0;
        debug!(
            inode = position.inode,
            offset = position.offset,
            "committed position"
        );
        Ok(())
    }

    /// Persist an `Offset` obtained earlier from `with_offsets`
    pub fn commit_offset(&mut self, offset: Offset) -> Result<(), TailerError> {
        self.store.save(offset.into())?;
        Ok(())
    }

    /// Explicitly finish reading, committing when `save_on_end` is set. Alternative to relying on `Drop`.
    pub fn close(mut self) -> Result<(), TailerError> {
        self.already_freed = true;
        if self.config.save_on_end {
            self.commit()?;
        }
        self.source.close();
        Ok(())
    }

    /// Position that would be committed now. A line not yet handed out because its commit failed is not counted.
    pub fn persisted_position(&self) -> PersistedPosition {
        if let Some((_, before)) = &self.pending {
            return *before;
        }
        PersistedPosition {
            inode: self.source.identity(),
            offset: self.source.current_offset(),
        }
    }

    pub fn offset(&self) -> Offset {
        Offset {
            generation: self.generation,
            inode: self.source.identity(),
            offset: self.source.current_offset(),
        }
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the active source was opened from
    pub fn source_path(&self) -> &Path {
        self.source.path()
    }

    pub fn sidecar_path(&self) -> &Path {
        self.store.path()
    }

    fn advance(&mut self) -> Result<Option<String>, TailerError> {
        if self.state == TailState::Exhausted {
            self.state = TailState::ReadingCurrent;
        }
        let mut rotation_checked = false;
        loop {
            if let Some(line) = self.source.next_line()? {
                return Ok(Some(line));
            }
            match self.state {
                TailState::DrainingRotated => {
                    let path = self.path.clone();
                    match self.reopen(&path, StartAt::Offset(0), TailState::ReadingCurrent) {
                        Ok(()) => rotation_checked = true,
                        // rotated away but not recreated yet
                        Err(TailerError::IO(e)) if e.kind() == io::ErrorKind::NotFound => {
                            return Ok(None)
                        }
                        Err(e) => return Err(e),
                    }
                }
                TailState::ReadingCurrent if !rotation_checked => {
                    rotation_checked = true;
                    if !self.follow_rotation()? {
                        return Ok(None);
                    }
                }
                _ => return Ok(None),
            }
        }
    }

    /// Check the monitored path after running out of data. Returns whether a different source should be read.
    fn follow_rotation(&mut self) -> Result<bool, TailerError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if metadata.ino() != self.source.identity() {
            // the open handle is the rotated file, finish it before switching
            debug!(path = %self.path.display(), "log was replaced, draining previous file");
            self.state = TailState::DrainingRotated;
            return Ok(true);
        }
        if metadata.len() >= self.source.current_offset() {
            return Ok(false);
        }

        let held = self.persisted_position();
        let mut warnings = vec![];
        let decision = self.locator.check(held, &mut warnings)?;
        match decision {
            None => Ok(false),
            Some(RotationDecision::Shrunk { .. }) if !self.shrink_reported => {
                self.shrink_reported = true;
                self.warn(warnings);
                Ok(false)
            }
            // still past the end after the warning, the held offset is meaningless
            Some(RotationDecision::Shrunk { .. }) => {
                let path = self.path.clone();
                self.reopen(&path, StartAt::Offset(0), TailState::ReadingCurrent)?;
                Ok(true)
            }
            Some(RotationDecision::Rotated(rotated)) => {
                self.warn(warnings);
                self.reopen(&rotated, StartAt::Offset(held.offset), TailState::DrainingRotated)?;
                Ok(true)
            }
            Some(RotationDecision::Reset) => {
                self.warn(warnings);
                let path = self.path.clone();
                self.reopen(&path, StartAt::Offset(0), TailState::ReadingCurrent)?;
                Ok(true)
            }
        }
    }

    fn reopen(&mut self, path: &Path, start: StartAt, state: TailState) -> Result<(), TailerError> {
        let source = open_source(path, start, self.options)?;
        self.source.close();
        self.source = source;
        self.generation += 1;
        self.state = state;
        self.shrink_reported = false;
        debug!(
            path = %path.display(),
            offset = self.source.current_offset(),
            generation = self.generation,
            ?state,
            "reopened log"
        );
        Ok(())
    }

    fn warn(&mut self, warnings: Vec<Warning>) {
        for warning in &warnings {
            (self.on_warning)(warning);
        }
    }
}

impl Iterator for Tailer {
    type Item = Result<String, TailerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

/// Iterator returned by `Tailer::with_offsets`
pub struct WithOffsets<'a> {
    tailer: &'a mut Tailer,
}

impl Iterator for WithOffsets<'_> {
    type Item = Result<(String, Offset), TailerError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.tailer.next_line() {
            Ok(Some(line)) => Some(Ok((line, self.tailer.offset()))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Executes destructor. If `.close()` was not called previously and `save_on_end` is set, commits position, logging
/// any error. If losing that error is not what you want, use `.close()` instead.
impl Drop for Tailer {
    fn drop(&mut self) {
        if !self.already_freed && self.config.save_on_end {
            if let Err(e) = self.commit() {
                error!(path = %self.path.display(), error = %e, "failed to commit position on drop");
            }
        }
        self.source.close();
    }
}
