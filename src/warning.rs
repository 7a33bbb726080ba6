use std::{fmt, path::PathBuf};

/// Non-fatal anomaly noticed while following a log.
///
/// Warnings never stop reading. They are handed to the tailer's `WarningHandler`, which by default forwards them to
/// `tracing`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// Sidecar exists but could not be read or parsed; reading proceeds as if there was no prior position.
    UnreadablePosition { sidecar: PathBuf, reason: String },
    /// Log was rotated but the file holding its previous content could not be found, reading restarts from 0.
    RotatedToUnknownLocation { path: PathBuf },
    /// Log shrank in place while copytruncate support is disabled; offset is left as is.
    ShrankWithoutCopytruncate {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnreadablePosition { sidecar, reason } => write!(
                f,
                "ignoring unreadable offset file {}: {reason}",
                sidecar.display()
            ),
            Warning::RotatedToUnknownLocation { path } => write!(
                f,
                "log file {} was rotated to unknown location, resetting",
                path.display()
            ),
            Warning::ShrankWithoutCopytruncate {
                path,
                expected,
                actual,
            } => write!(
                f,
                "file size of {} shrank, and copytruncate support is disabled (expected at least {expected} bytes, was {actual} bytes)",
                path.display()
            ),
        }
    }
}

/// Receiver of warnings emitted by a tailer
pub type WarningHandler = Box<dyn FnMut(&Warning) + Send>;

pub(crate) fn log_warning(warning: &Warning) {
    tracing::warn!("{warning}");
}
