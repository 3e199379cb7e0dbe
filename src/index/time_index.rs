use super::{IndexError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const TIME_INDEX_FILE: &str = "time_index.bin";

/// Minute-granularity buckets.
pub const BUCKET_MS: i64 = 60_000;

const MAGIC: u32 = 0x4d_4c_54_49;

/// Collects `(bucket, first ordinal)` pairs during the ingest pass.
///
/// Bucket keys are only recorded on strictly increasing transitions.
/// Later logcat sections replay earlier time spans; skipping their
/// buckets keeps the table binary-searchable, and seeks anchored on the
/// first section to reach a bucket stay conservative (scans re-check
/// timestamps).
pub struct TimeIndexBuilder {
    entries: Vec<(i64, u64)>,
    last_bucket: Option<i64>,
}

impl TimeIndexBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_bucket: None,
        }
    }

    pub fn observe(&mut self, ts_epoch_ms: i64, ordinal: u64) {
        let bucket = ts_epoch_ms.div_euclid(BUCKET_MS);
        if self.last_bucket.map_or(true, |last| bucket > last) {
            self.entries.push((bucket, ordinal));
            self.last_bucket = Some(bucket);
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for (bucket, ordinal) in &self.entries {
            out.write_all(&bucket.to_le_bytes())?;
            out.write_all(&ordinal.to_le_bytes())?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    pub fn into_index(self) -> TimeIndex {
        TimeIndex {
            entries: self.entries,
        }
    }
}

impl Default for TimeIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory view of the bucket table; one entry per distinct minute,
/// small enough to load whole.
#[derive(Debug)]
pub struct TimeIndex {
    entries: Vec<(i64, u64)>,
}

impl TimeIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if u32::from_le_bytes(magic) != MAGIC {
            return Err(IndexError::Corrupt("time index magic mismatch".into()));
        }

        let mut count_buf = [0u8; 8];
        reader.read_exact(&mut count_buf)?;
        let count = u64::from_le_bytes(count_buf) as usize;

        let mut entries = Vec::with_capacity(count.min(1 << 20));
        let mut pair = [0u8; 16];
        for _ in 0..count {
            reader.read_exact(&mut pair).map_err(|_| {
                IndexError::Corrupt("time index truncated".into())
            })?;
            let bucket = i64::from_le_bytes(pair[0..8].try_into().expect("bucket slice"));
            let ordinal = u64::from_le_bytes(pair[8..16].try_into().expect("ordinal slice"));
            entries.push((bucket, ordinal));
        }

        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Conservative seek: ordinal of the first entry whose bucket holds
    /// or follows `target_ms`. Rows between that ordinal and the target
    /// instant still need a timestamp re-check.
    pub fn first_ordinal_at_or_after(&self, target_ms: i64) -> Option<u64> {
        let bucket = target_ms.div_euclid(BUCKET_MS);
        let idx = self.entries.partition_point(|(b, _)| *b < bucket);
        self.entries.get(idx).map(|(_, ordinal)| *ordinal)
    }
}
