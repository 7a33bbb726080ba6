//! # Logtrack
//!
//! Logtrack reads only the lines appended to a log file since the previous run, similar to `logtail` and `pygtail`.
//! The read position is kept in a small sidecar file and the log is followed through rotation by rename, copy-truncate
//! or compression, so that no line is lost or returned twice.
//!
//! * `Tailer` is the ready-to-use structure: open it, pull lines until it runs out, and it takes care of persisting
//! position.
//!
//! ```rust no_run
//! # use logtrack::{Tailer, TailerError};
//! // running this repeatedly prints each appended line exactly once
//! let mut tailer = Tailer::new("/var/log/mail.log")?;
//! while let Some(line) = tailer.next_line()? {
//!     print!("{line}");
//! }
//! # Ok::<(), TailerError>(())
//! ```
//!
//! * `Tailer::with_offsets` pairs every line with an `Offset`, which can later be committed explicitly once the line
//! was durably handled downstream.
//!
//! ```rust no_run
//! # use logtrack::{Tailer, TailerConfig, TailerError};
//! # fn deliver(_: &str) -> bool { true }
//! let config = TailerConfig {
//!     save_on_end: false,
//!     ..Default::default()
//! };
//! let mut tailer = Tailer::with_config("/var/log/mail.log", config)?;
//! let mut delivered = None;
//! for item in tailer.with_offsets() {
//!     let (line, offset) = item?;
//!     if !deliver(&line) {
//!         break;
//!     }
//!     delivered = Some(offset);
//! }
//! if let Some(offset) = delivered {
//!     tailer.commit_offset(offset)?;
//! }
//! # Ok::<(), TailerError>(())
//! ```
//!
//! * `RotationLocator`, `PositionStore` and `LineSource` are the building blocks `Tailer` is made of, exposed for
//! custom schemes.
//!

pub mod path_utils;
mod position;
mod rotation;
mod source;
mod tailer;
mod warning;

pub use position::{Offset, PersistedPosition, PositionError, PositionStore, UpdateHook};
pub use rotation::{RotationDecision, RotationLocator};
pub use source::{open_source, Encoding, GzipSource, LineSource, PlainSource, SourceOptions, StartAt};
pub use tailer::{TailState, Tailer, TailerBuilder, TailerConfig, TailerError, WithOffsets};
pub use warning::{Warning, WarningHandler};
