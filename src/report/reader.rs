use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::read::ZipArchive;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Logcat buffer names; a section header naming one of these opens a
/// logcat-eligible section.
const LOGCAT_BUFFERS: [&str; 7] = [
    "SYSTEM", "MAIN", "EVENTS", "EVENT", "RADIO", "CRASH", "KERNEL",
];

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("bugreport not found: {0}")]
    NotFound(PathBuf),

    #[error("no bugreport entry in archive: {0}")]
    UnsupportedArchive(PathBuf),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One line of the logical bugreport text.
#[derive(Debug, Clone)]
pub struct RawLine {
    /// Byte offset of the line start in the decompressed text stream.
    pub offset: u64,
    /// Raw byte length including the line terminator.
    pub len: u64,
    /// Line content, lossy-decoded, without the trailing `\r\n`.
    pub text: String,
}

/// Line iterator over any byte source, tracking logical byte offsets.
/// Backed by a fixed-size buffered reader; the source is never
/// materialised in full.
pub struct LineReader<'a> {
    inner: BufReader<Box<dyn Read + 'a>>,
    offset: u64,
    buf: Vec<u8>,
}

impl<'a> LineReader<'a> {
    pub fn new(reader: Box<dyn Read + 'a>) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            offset: 0,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for LineReader<'_> {
    type Item = std::io::Result<RawLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        let bytes = match self.inner.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(n) => n,
            Err(err) => return Some(Err(err)),
        };

        let start = self.offset;
        self.offset += bytes as u64;

        let text = String::from_utf8_lossy(&self.buf);
        let text = text.trim_end_matches(['\n', '\r']).to_string();
        Some(Ok(RawLine {
            offset: start,
            len: bytes as u64,
            text,
        }))
    }
}

/// An opened bugreport input: either the flat text file itself or the
/// `bugreport*.txt` entry of a zip archive.
#[derive(Debug)]
pub enum BugreportFile {
    Flat {
        file: File,
        total_bytes: u64,
    },
    Archive {
        archive: ZipArchive<File>,
        entry_index: usize,
        total_bytes: u64,
    },
}

impl BugreportFile {
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        if !path.is_file() {
            return Err(ReaderError::NotFound(path.to_path_buf()));
        }

        if is_zip(path)? {
            let file = File::open(path)?;
            let mut archive = ZipArchive::new(file)?;
            let Some(entry_index) = find_bugreport_entry(&mut archive)? else {
                return Err(ReaderError::UnsupportedArchive(path.to_path_buf()));
            };
            let total_bytes = archive.by_index(entry_index)?.size();
            tracing::debug!(
                path = %path.display(),
                entry = entry_index,
                bytes = total_bytes,
                "streaming bugreport from archive"
            );
            Ok(Self::Archive {
                archive,
                entry_index,
                total_bytes,
            })
        } else {
            let file = File::open(path)?;
            let total_bytes = file.metadata()?.len();
            Ok(Self::Flat { file, total_bytes })
        }
    }

    /// Decompressed size of the logical text stream.
    pub fn total_bytes(&self) -> u64 {
        match self {
            Self::Flat { total_bytes, .. } | Self::Archive { total_bytes, .. } => *total_bytes,
        }
    }

    /// Runs `f` over the line stream. The closure form keeps archive
    /// entry lifetimes contained to a single scope.
    pub fn stream<T>(self, f: impl FnOnce(LineReader<'_>) -> T) -> Result<T, ReaderError> {
        match self {
            Self::Flat { file, .. } => Ok(f(LineReader::new(Box::new(file)))),
            Self::Archive {
                mut archive,
                entry_index,
                ..
            } => {
                let entry = archive.by_index(entry_index)?;
                Ok(f(LineReader::new(Box::new(entry))))
            }
        }
    }
}

fn is_zip(path: &Path) -> std::io::Result<bool> {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if by_extension {
        return Ok(true);
    }

    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == ZIP_MAGIC),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

/// First entry whose file name matches `bugreport*.txt`, case-insensitive.
fn find_bugreport_entry(archive: &mut ZipArchive<File>) -> Result<Option<usize>, ReaderError> {
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry
            .name()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if name.starts_with("bugreport") && name.ends_with(".txt") {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Tracks `------ SECTION NAME (...) ------` boundaries and decides which
/// lines belong to a logcat buffer.
///
/// Input that never declares a section (a raw logcat dump) is treated as
/// one implicit logcat section from the first byte.
pub struct SectionTracker {
    header_re: Regex,
    in_logcat: bool,
    seen_header: bool,
}

/// Result of feeding a section boundary line to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionChange {
    pub left_logcat: bool,
    pub entered_logcat: bool,
}

impl SectionTracker {
    pub fn new() -> Self {
        Self {
            header_re: Regex::new(r"^------ ([A-Z][A-Z0-9 ._'-]*?) \(.*\) ------\s*$")
                .expect("section header pattern"),
            in_logcat: false,
            seen_header: false,
        }
    }

    /// Returns `Some` when the line is a section boundary; the line
    /// itself is never content.
    pub fn observe(&mut self, line: &str) -> Option<SectionChange> {
        if !line.starts_with("------ ") || !line.trim_end().ends_with("------") {
            return None;
        }

        let was_logcat = self.is_logcat();
        let entering = match self.header_re.captures(line) {
            Some(caps) => is_logcat_section(&caps[1]),
            // Boundary without a recognisable header (e.g. a duration
            // trailer) closes the current section.
            None => false,
        };
        self.seen_header = true;
        self.in_logcat = entering;

        Some(SectionChange {
            left_logcat: was_logcat && !entering,
            entered_logcat: !was_logcat && entering,
        })
    }

    /// True while lines should be fed to the logcat line parser.
    pub fn is_logcat(&self) -> bool {
        // Before the first header everything is implicitly eligible so
        // that plain `logcat -d` dumps parse without section framing.
        !self.seen_header || self.in_logcat
    }

    /// True until the first section header; the device preamble lives
    /// here.
    pub fn in_preamble(&self) -> bool {
        !self.seen_header
    }
}

impl Default for SectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_logcat_section(name: &str) -> bool {
    name.split_whitespace()
        .any(|word| LOGCAT_BUFFERS.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use zip::write::SimpleFileOptions;

    #[test]
    fn flat_file_lines_carry_offsets() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "first\nsecond\r\nthird").unwrap();
        file.flush().unwrap();

        let source = BugreportFile::open(file.path()).unwrap();
        assert_eq!(source.total_bytes(), 19);

        let lines: Vec<RawLine> = source
            .stream(|reader| reader.collect::<std::io::Result<Vec<_>>>())
            .unwrap()
            .unwrap();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].offset, 0);
        assert_eq!(lines[0].text, "first");
        assert_eq!(lines[1].offset, 6);
        assert_eq!(lines[1].text, "second");
        assert_eq!(lines[2].offset, 14);
        assert_eq!(lines[2].text, "third");
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = BugreportFile::open(Path::new("/no/such/report.txt")).unwrap_err();
        assert!(matches!(err, ReaderError::NotFound(_)));
    }

    #[test]
    fn zip_entry_is_selected_by_name() {
        let mut file = NamedTempFile::with_suffix(".zip").unwrap();
        {
            let mut writer = zip::ZipWriter::new(file.as_file_mut());
            let options = SimpleFileOptions::default();
            writer.start_file("FS/version.txt", options).unwrap();
            writer.write_all(b"irrelevant").unwrap();
            writer
                .start_file("bugreport-panther-2024-01-15.txt", options)
                .unwrap();
            writer.write_all(b"alpha\nbeta\n").unwrap();
            writer.finish().unwrap();
        }
        file.flush().unwrap();

        let source = BugreportFile::open(file.path()).unwrap();
        assert_eq!(source.total_bytes(), 11);
        let lines: Vec<RawLine> = source
            .stream(|reader| reader.collect::<std::io::Result<Vec<_>>>())
            .unwrap()
            .unwrap();
        assert_eq!(lines[0].text, "alpha");
        assert_eq!(lines[1].text, "beta");
    }

    #[test]
    fn zip_without_bugreport_entry_is_unsupported() {
        let mut file = NamedTempFile::with_suffix(".zip").unwrap();
        {
            let mut writer = zip::ZipWriter::new(file.as_file_mut());
            writer
                .start_file("notes.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }
        file.flush().unwrap();

        let err = BugreportFile::open(file.path()).unwrap_err();
        assert!(matches!(err, ReaderError::UnsupportedArchive(_)));
    }

    #[test]
    fn tracker_gates_logcat_sections() {
        let mut tracker = SectionTracker::new();
        assert!(tracker.is_logcat());
        assert!(tracker.in_preamble());

        let change = tracker
            .observe("------ SYSTEM PROPERTIES (getprop) ------")
            .unwrap();
        assert!(change.left_logcat);
        assert!(!tracker.is_logcat());

        let change = tracker
            .observe("------ SYSTEM LOG (logcat -v threadtime -d *:v) ------")
            .unwrap();
        assert!(change.entered_logcat);
        assert!(tracker.is_logcat());

        // A duration trailer is a boundary but not a header.
        let change = tracker
            .observe("------ 0.351s was the duration of 'SYSTEM LOG' ------")
            .unwrap();
        assert!(change.left_logcat);
        assert!(!tracker.is_logcat());

        assert!(tracker
            .observe("------ EVENT LOG (logcat -b events -d *:v) ------")
            .unwrap()
            .entered_logcat);
    }

    #[test]
    fn non_boundary_lines_are_content() {
        let mut tracker = SectionTracker::new();
        assert!(tracker.observe("01-15 10:00:00.000  1 2 I Tag: msg").is_none());
        assert!(tracker.observe("plain text").is_none());
    }
}
