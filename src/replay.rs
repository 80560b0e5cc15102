//! Handshake replay filter.
//!
//! A Bloom filter over every 64-byte handshake message seen by an endpoint.
//! A hit means "probably seen before" and the handshake is refused; false
//! positives cost a legitimate client one reconnect, false negatives are
//! impossible.
//!
//! The filter is shared by all handshakes on a listener through an
//! `Arc<ReplayFilter>` and can be persisted so that a restart does not
//! reopen the replay window.
//!
//! ## On-disk format
//!
//! ```text
//! ┌──────────────┬─────────────┬────────────┬───────────────┬──────────────────┐
//! │ "SHDWBLM1"(8)│ hashes u32  │ bits u64   │ inserted u64  │ words (u64 BE)*  │
//! └──────────────┴─────────────┴────────────┴───────────────┴──────────────────┘
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Expected number of handshakes the default filter is sized for.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Target false-positive rate at [`DEFAULT_CAPACITY`].
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.03;

const MAGIC: &[u8; 8] = b"SHDWBLM1";
const HEADER_SIZE: usize = 8 + 4 + 8 + 8;
const MAX_HASHES: u32 = 32;

/// Thread-safe probabilistic set of seen handshake messages.
pub struct ReplayFilter {
    bloom: RwLock<Bloom>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Bloom {
    words: Vec<u64>,
    hashes: u32,
    inserted: u64,
}

impl Bloom {
    fn with_capacity(expected: usize, false_positive_rate: f64) -> Self {
        let expected = expected.max(1) as f64;
        let rate = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let bits = (-expected * rate.ln() / (ln2 * ln2)).ceil().max(64.0) as usize;
        let words = bits.div_ceil(64);
        let hashes = ((words * 64) as f64 / expected * ln2).round().clamp(1.0, MAX_HASHES as f64);

        Self {
            words: vec![0; words],
            hashes: hashes as u32,
            inserted: 0,
        }
    }

    fn bit_count(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    /// Bit positions for `item` by double hashing over one SHA-256 digest.
    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let digest = Sha256::digest(item);
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_be_bytes(h1);
        let h2 = u64::from_be_bytes(h2) | 1;
        let bits = self.bit_count();

        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    fn contains(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Set every bit for `item`; returns whether all were already set.
    fn insert(&mut self, item: &[u8]) -> bool {
        let positions: Vec<u64> = self.positions(item).collect();
        let mut present = true;
        for bit in positions {
            let word = &mut self.words[(bit / 64) as usize];
            let mask = 1 << (bit % 64);
            if *word & mask == 0 {
                present = false;
                *word |= mask;
            }
        }
        if !present {
            self.inserted += 1;
        }
        present
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.words.len() * 8);
        buf.put_slice(MAGIC);
        buf.put_u32(self.hashes);
        buf.put_u64(self.bit_count());
        buf.put_u64(self.inserted);
        for word in &self.words {
            buf.put_u64(*word);
        }
        buf
    }

    fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::replay_filter(format!(
                "file too short: {} bytes",
                data.len()
            )));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(Error::replay_filter("bad magic"));
        }
        data.advance(MAGIC.len());

        let hashes = data.get_u32();
        let bits = data.get_u64();
        let inserted = data.get_u64();

        if hashes == 0 || hashes > MAX_HASHES {
            return Err(Error::replay_filter(format!("invalid hash count {}", hashes)));
        }
        if bits == 0 || bits % 64 != 0 {
            return Err(Error::replay_filter(format!("invalid bit count {}", bits)));
        }
        let words = (bits / 64) as usize;
        if data.remaining() != words * 8 {
            return Err(Error::replay_filter(format!(
                "expected {} bytes of bits, found {}",
                words * 8,
                data.remaining()
            )));
        }

        let words = (0..words).map(|_| data.get_u64()).collect();
        Ok(Self {
            words,
            hashes,
            inserted,
        })
    }
}

impl ReplayFilter {
    /// Create an empty filter sized for [`DEFAULT_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_FALSE_POSITIVE_RATE)
    }

    /// Create an empty filter for `expected` entries at the given
    /// false-positive rate.
    pub fn with_capacity(expected: usize, false_positive_rate: f64) -> Self {
        Self {
            bloom: RwLock::new(Bloom::with_capacity(expected, false_positive_rate)),
        }
    }

    /// Record `item` and report whether it was (probably) seen before.
    ///
    /// The check and the insert happen under one write lock, so two
    /// concurrent callers with the same item never both get `false`.
    pub fn check_and_insert(&self, item: &[u8]) -> bool {
        self.bloom.write().insert(item)
    }

    /// Check for `item` without recording it.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.bloom.read().contains(item)
    }

    /// Number of distinct items recorded.
    pub fn inserted(&self) -> u64 {
        self.bloom.read().inserted
    }

    /// Size of the bit array.
    pub fn bit_count(&self) -> u64 {
        self.bloom.read().bit_count()
    }

    /// Number of hash functions.
    pub fn hash_count(&self) -> u32 {
        self.bloom.read().hashes
    }

    /// Forget everything.
    pub fn clear(&self) {
        let mut bloom = self.bloom.write();
        bloom.words.iter_mut().for_each(|w| *w = 0);
        bloom.inserted = 0;
    }

    /// Serialize the filter.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bloom.read().encode().to_vec()
    }

    /// Restore a filter serialized with [`ReplayFilter::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            bloom: RwLock::new(Bloom::decode(data)?),
        })
    }

    /// Write the filter to `path`.
    ///
    /// The data goes to a sibling temp file first and is renamed into
    /// place, so a crash mid-save leaves the previous file intact.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.bloom.read().encode();
        let tmp = temp_path(path);

        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;

        tracing::info!(
            "Saved replay filter to {} ({} entries)",
            path.display(),
            self.inserted()
        );
        Ok(())
    }

    /// Read a filter previously written by [`ReplayFilter::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let filter = Self::from_bytes(&data)?;

        tracing::info!(
            "Loaded replay filter from {} ({} entries)",
            path.display(),
            filter.inserted()
        );
        Ok(filter)
    }

    /// Load `path` if it exists, otherwise start with an empty default filter.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No replay filter at {}, starting empty", path.display());
            Ok(Self::new())
        }
    }
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplayFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bloom = self.bloom.read();
        f.debug_struct("ReplayFilter")
            .field("bits", &bloom.bit_count())
            .field("hashes", &bloom.hashes)
            .field("inserted", &bloom.inserted)
            .finish()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message(seed: u8) -> [u8; 64] {
        let mut m = [0u8; 64];
        for (i, b) in m.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        m
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shadow-{}-{}.bloom", name, std::process::id()))
    }

    #[test]
    fn test_second_submission_is_replay() {
        let filter = ReplayFilter::new();
        let m = message(1);

        assert!(!filter.check_and_insert(&m));
        assert!(filter.check_and_insert(&m));
        assert!(filter.contains(&m));
        assert_eq!(filter.inserted(), 1);
    }

    #[test]
    fn test_distinct_messages_pass() {
        let filter = ReplayFilter::new();
        assert!(!filter.check_and_insert(&message(1)));
        assert!(!filter.check_and_insert(&message(2)));
        assert!(!filter.contains(&message(3)));
    }

    #[test]
    fn test_default_sizing() {
        let filter = ReplayFilter::new();
        // ~7.3 bits per entry and 5 hashes for 3% at 10k entries.
        assert!(filter.bit_count() >= 72_000 && filter.bit_count() <= 74_000);
        assert_eq!(filter.hash_count(), 5);
    }

    #[test]
    fn test_false_positive_rate_at_capacity() {
        let filter = ReplayFilter::new();
        for i in 0..DEFAULT_CAPACITY as u32 {
            filter.check_and_insert(&i.to_be_bytes());
        }

        let lookups = 10_000u32;
        let false_positives = (0..lookups)
            .filter(|i| filter.contains(&(i + 1_000_000).to_be_bytes()))
            .count();
        // 3% target, allow generous slack.
        assert!(false_positives < (lookups as usize) * 6 / 100);
    }

    #[test]
    fn test_concurrent_check_and_insert_admits_one() {
        let filter = Arc::new(ReplayFilter::new());
        let m = message(9);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || filter.check_and_insert(&m))
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|seen| !seen)
            .count();
        assert_eq!(fresh, 1);
    }

    #[test]
    fn test_clear() {
        let filter = ReplayFilter::new();
        filter.check_and_insert(&message(4));
        filter.clear();
        assert!(!filter.contains(&message(4)));
        assert_eq!(filter.inserted(), 0);
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("save-load");
        let filter = ReplayFilter::new();
        filter.check_and_insert(&message(5));
        filter.check_and_insert(&message(6));
        filter.save(&path).unwrap();

        let restored = ReplayFilter::load(&path).unwrap();
        assert!(restored.check_and_insert(&message(5)));
        assert!(restored.contains(&message(6)));
        assert!(!restored.contains(&message(7)));
        assert_eq!(restored.hash_count(), filter.hash_count());
        assert_eq!(restored.bit_count(), filter.bit_count());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_or_create_missing_file() {
        let path = scratch_path("missing");
        let _ = fs::remove_file(&path);

        let filter = ReplayFilter::open_or_create(&path).unwrap();
        assert_eq!(filter.inserted(), 0);
    }

    #[test]
    fn test_corrupt_data_rejected() {
        assert!(matches!(
            ReplayFilter::from_bytes(b"short"),
            Err(Error::ReplayFilter(_))
        ));

        let mut bytes = ReplayFilter::new().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ReplayFilter::from_bytes(&bytes),
            Err(Error::ReplayFilter(_))
        ));

        let mut bytes = ReplayFilter::new().to_bytes();
        bytes.pop();
        assert!(matches!(
            ReplayFilter::from_bytes(&bytes),
            Err(Error::ReplayFilter(_))
        ));
    }
}
