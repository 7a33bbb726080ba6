use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
};

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};

use crate::path_utils::is_compressed;

/// Text encoding of the monitored file
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Strict UTF-8, a line with invalid bytes is reported as `InvalidData`
    #[default]
    Utf8,
    /// UTF-8 with invalid sequences replaced by U+FFFD
    Utf8Lossy,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
}

impl Encoding {
    pub fn decode(self, bytes: Vec<u8>) -> io::Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Encoding::Utf8Lossy => Ok(match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
            Encoding::Latin1 => Ok(bytes.into_iter().map(char::from).collect()),
        }
    }
}

/// Where a freshly opened source is positioned
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartAt {
    Offset(u64),
    End,
}

/// How lines are produced from raw bytes
#[derive(Copy, Clone, Debug, Default)]
pub struct SourceOptions {
    pub encoding: Encoding,
    /// Only yield lines terminated by `\n`; a partial line stays unread until the writer completes it
    pub full_lines: bool,
}

/// Open, positioned byte stream producing one text line per call.
///
/// Offsets are counted in bytes of the (decompressed) stream, terminators included.
pub trait LineSource: Send {
    /// Next line including its terminator, or `None` when there is no more data right now.
    ///
    /// A line that fails to decode is consumed and reported as `InvalidData`.
    fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Bytes consumed so far
    fn current_offset(&self) -> u64;

    /// Inode of the file this source was opened on
    fn identity(&self) -> u64;

    fn path(&self) -> &Path;

    /// Release the underlying descriptor. Calling it again is a no-op and later reads yield no data.
    fn close(&mut self);
}

/// Open `path` as a `LineSource`, picking a gzip decoder for compressed names.
pub fn open_source(
    path: impl AsRef<Path>,
    start: StartAt,
    options: SourceOptions,
) -> io::Result<Box<dyn LineSource>> {
    if is_compressed(&path) {
        Ok(Box::new(GzipSource::open(path, start, options)?))
    } else {
        Ok(Box::new(PlainSource::open(path, start, options)?))
    }
}

/// Source over an uncompressed file; partial lines are handled by seeking back
pub struct PlainSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    inode: u64,
    offset: u64,
    options: SourceOptions,
}

impl PlainSource {
    pub fn open(path: impl AsRef<Path>, start: StartAt, options: SourceOptions) -> io::Result<Self> {
        let mut file = File::open(&path)?;
        let inode = file.metadata()?.ino();
        let offset = match start {
            StartAt::Offset(offset) => file.seek(SeekFrom::Start(offset))?,
            StartAt::End => file.seek(SeekFrom::End(0))?,
        };
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            reader: Some(BufReader::new(file)),
            inode,
            offset,
            options,
        })
    }
}

impl LineSource for PlainSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![];
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        if self.options.full_lines && !buf.ends_with(b"\n") {
            reader.seek(SeekFrom::Start(self.offset))?;
            return Ok(None);
        }
        self.offset += read as u64;
        self.options.encoding.decode(buf).map(Some)
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }

    fn identity(&self) -> u64 {
        self.inode
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Source over a gzip file.
///
/// The decoder cannot seek, so positioning is done by skipping decompressed bytes and a partial line is kept aside
/// until its terminator arrives.
pub struct GzipSource {
    path: PathBuf,
    reader: Option<BufReader<MultiGzDecoder<File>>>,
    inode: u64,
    offset: u64,
    pending: Vec<u8>,
    options: SourceOptions,
}

impl GzipSource {
    pub fn open(path: impl AsRef<Path>, start: StartAt, options: SourceOptions) -> io::Result<Self> {
        let file = File::open(&path)?;
        let inode = file.metadata()?.ino();
        let mut reader = BufReader::new(MultiGzDecoder::new(file));
        let offset = match start {
            StartAt::Offset(offset) => io::copy(&mut (&mut reader).take(offset), &mut io::sink())?,
            StartAt::End => io::copy(&mut reader, &mut io::sink())?,
        };
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            reader: Some(reader),
            inode,
            offset,
            pending: vec![],
            options,
        })
    }
}

impl LineSource for GzipSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        reader.read_until(b'\n', &mut self.pending)?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.options.full_lines && !self.pending.ends_with(b"\n") {
            return Ok(None);
        }
        let line = std::mem::take(&mut self.pending);
        self.offset += line.len() as u64;
        self.options.encoding.decode(line).map(Some)
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }

    fn identity(&self) -> u64 {
        self.inode
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) {
        self.reader = None;
        self.pending.clear();
    }
}
