pub mod parser;
pub mod timestamp;

pub use parser::{LogLevel, LogRow, ThreadtimeParser, MAX_MSG_BYTES};
pub use timestamp::TimestampNormalizer;
