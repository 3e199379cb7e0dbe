pub mod identity;
pub mod preamble;
pub mod reader;

pub use identity::ReportId;
pub use preamble::{DeviceInfo, DeviceScanner};
pub use reader::{BugreportFile, LineReader, RawLine, ReaderError, SectionTracker};
