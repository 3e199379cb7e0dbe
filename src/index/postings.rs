use super::{IndexError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const INV_TAG_FILE: &str = "inv_tag.bin";
pub const INV_PID_FILE: &str = "inv_pid.bin";

const MAGIC: u32 = 0x4d_4c_50_4f;

/// Key encoding for the pid index.
pub fn pid_key(pid: u32) -> [u8; 4] {
    pid.to_le_bytes()
}

#[derive(Default)]
struct PostingList {
    ordinals: Vec<u64>,
    seen: u64,
}

/// Inverted index builder: key bytes → ascending ordinals.
///
/// Exact while the total stored entries stay within budget. Pathological
/// reports carry over 10^5 distinct tags; past the budget the index
/// degrades to keeping every Nth ordinal per key and is flagged so
/// queries treat hits as candidates needing row-level re-verification.
pub struct PostingsBuilder {
    map: HashMap<Vec<u8>, PostingList>,
    stored: usize,
    budget: usize,
    sample_step: u64,
    sampled: bool,
}

impl PostingsBuilder {
    pub fn new(budget: usize, sample_step: usize) -> Self {
        Self {
            map: HashMap::new(),
            stored: 0,
            budget: budget.max(1),
            sample_step: sample_step.max(2) as u64,
            sampled: false,
        }
    }

    pub fn observe(&mut self, key: &[u8], ordinal: u64) {
        let list = self.map.entry(key.to_vec()).or_default();
        list.seen += 1;

        if self.sampled {
            if (list.seen - 1) % self.sample_step == 0 {
                list.ordinals.push(ordinal);
                self.stored += 1;
            }
            return;
        }

        list.ordinals.push(ordinal);
        self.stored += 1;
        if self.stored > self.budget {
            self.degrade();
        }
    }

    fn degrade(&mut self) {
        self.sampled = true;
        let step = self.sample_step as usize;
        let mut stored = 0;
        for list in self.map.values_mut() {
            list.ordinals = list.ordinals.iter().copied().step_by(step).collect();
            stored += list.ordinals.len();
        }
        self.stored = stored;
        tracing::info!(
            keys = self.map.len(),
            retained = stored,
            step = self.sample_step,
            "postings budget exceeded, degrading to sampled index"
        );
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&[self.sampled as u8])?;
        out.write_all(&(self.sample_step as u32).to_le_bytes())?;
        out.write_all(&(self.map.len() as u64).to_le_bytes())?;

        // Sorted keys keep the artifact deterministic for a given input.
        let mut keys: Vec<&Vec<u8>> = self.map.keys().collect();
        keys.sort();
        for key in keys {
            let list = &self.map[key];
            out.write_all(&(key.len() as u32).to_le_bytes())?;
            out.write_all(key)?;
            out.write_all(&(list.ordinals.len() as u64).to_le_bytes())?;
            for ordinal in &list.ordinals {
                out.write_all(&ordinal.to_le_bytes())?;
            }
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Loaded inverted index.
#[derive(Debug)]
pub struct Postings {
    map: HashMap<Vec<u8>, Vec<u64>>,
    sampled: bool,
}

impl Postings {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; 4 + 1 + 4 + 8];
        reader
            .read_exact(&mut header)
            .map_err(|_| IndexError::Corrupt("postings header truncated".into()))?;
        if u32::from_le_bytes(header[0..4].try_into().expect("magic slice")) != MAGIC {
            return Err(IndexError::Corrupt("postings magic mismatch".into()));
        }
        let sampled = header[4] != 0;
        let key_count = u64::from_le_bytes(header[9..17].try_into().expect("count slice"));

        let mut map = HashMap::with_capacity(key_count.min(1 << 20) as usize);
        for _ in 0..key_count {
            let mut len_buf = [0u8; 4];
            reader
                .read_exact(&mut len_buf)
                .map_err(|_| IndexError::Corrupt("postings truncated".into()))?;
            let key_len = u32::from_le_bytes(len_buf) as usize;
            let mut key = vec![0u8; key_len];
            reader
                .read_exact(&mut key)
                .map_err(|_| IndexError::Corrupt("postings truncated".into()))?;

            let mut count_buf = [0u8; 8];
            reader
                .read_exact(&mut count_buf)
                .map_err(|_| IndexError::Corrupt("postings truncated".into()))?;
            let count = u64::from_le_bytes(count_buf) as usize;

            let mut ordinals = Vec::with_capacity(count.min(1 << 20));
            let mut buf = [0u8; 8];
            for _ in 0..count {
                reader
                    .read_exact(&mut buf)
                    .map_err(|_| IndexError::Corrupt("postings truncated".into()))?;
                ordinals.push(u64::from_le_bytes(buf));
            }
            map.insert(key, ordinals);
        }

        Ok(Self { map, sampled })
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u64]> {
        self.map.get(key).map(Vec::as_slice)
    }

    /// Sampled postings are candidates only, never authoritative.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }
}
