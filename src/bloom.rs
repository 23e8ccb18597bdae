//! Bloom filter sidecar — CRC32 double hashing, stable binary layout.
//!
//! # On-disk layout (`<csv>_<col>.bloom`, numeric fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   size        bit count, u64 BE (always a multiple of 8)
//!    8      8   hashCount   u64 BE, 1..=10
//!   16      8   count       inserted items, u64 BE
//!   24    var   bit array, size/8 bytes, LSB-first within each byte
//! ```
//!
//! # Parameters
//!
//! From expected element count `n` and false-positive rate `p`:
//! `m = ceil(-n·ln p / ln²2)` rounded up to a whole byte, minimum 1024 bits;
//! `k = round((m/n)·ln 2)` clamped to `[1, 10]`.
//!
//! # Hashing
//!
//! `h1 = crc32(key)`, `h2 = crc32(reverse(key) ‖ "salt")`, and position `i`
//! is `|h1 + i·h2| mod m` where the addition wraps as a signed 32-bit int
//! and the absolute value is taken afterwards.  The wrap-then-abs step is
//! load-bearing: existing filter files were produced this way and the layout
//! must stay bit-for-bit reproducible.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Fixed header size preceding the bit array.
pub const BLOOM_HEADER_LEN: usize = 24;
/// Smallest permitted filter, in bits.
pub const MIN_BITS: u64 = 1024;
/// Largest permitted hash count.
pub const MAX_HASHES: u64 = 10;

const HASH_SALT: &[u8] = b"salt";

// ── Hashing ──────────────────────────────────────────────────────────────────

fn hash_pair(key: &[u8]) -> (i32, i32) {
    let h1 = crc32fast::hash(key) as i32;
    let mut reversed: Vec<u8> = Vec::with_capacity(key.len() + HASH_SALT.len());
    reversed.extend(key.iter().rev());
    reversed.extend_from_slice(HASH_SALT);
    let h2 = crc32fast::hash(&reversed) as i32;
    (h1, h2)
}

#[inline]
fn position(h1: i32, h2: i32, i: u64, m_bits: u64) -> u64 {
    let combined = h1.wrapping_add((i as i32).wrapping_mul(h2));
    // Widen before abs: i32::MIN has no i32 absolute value.
    (combined as i64).unsigned_abs() % m_bits
}

#[inline]
fn bit_is_set(bits: &[u8], pos: u64) -> bool {
    bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
}

fn contains(bits: &[u8], m_bits: u64, k: u64, key: &[u8]) -> bool {
    let (h1, h2) = hash_pair(key);
    (0..k).all(|i| bit_is_set(bits, position(h1, h2, i, m_bits)))
}

// ── In-memory filter ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bloom {
    bits:   Vec<u8>,
    m_bits: u64,
    k:      u64,
    count:  u64,
}

impl Bloom {
    /// Size the filter for `n` expected elements at false-positive rate `p`.
    pub fn with_capacity(n: usize, p: f64) -> Self {
        let n = n.max(1) as f64;
        let p = p.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let raw_bits = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let m_bits = (raw_bits.div_ceil(8) * 8).max(MIN_BITS);
        let k = (((m_bits as f64 / n) * ln2).round() as u64).clamp(1, MAX_HASHES);

        Self {
            bits: vec![0u8; (m_bits / 8) as usize],
            m_bits,
            k,
            count: 0,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.k {
            let pos = position(h1, h2, i, self.m_bits);
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        self.count += 1;
    }

    /// False means the key was definitely never inserted.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        contains(&self.bits, self.m_bits, self.k, key)
    }

    pub fn size_bits(&self) -> u64 {
        self.m_bits
    }

    pub fn hash_count(&self) -> u64 {
        self.k
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    // ── Serialization ────────────────────────────────────────────────────────

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(&self.m_bits.to_be_bytes())?;
        w.write_all(&self.k.to_be_bytes())?;
        w.write_all(&self.count.to_be_bytes())?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> Result<Self> {
        let mut header = [0u8; BLOOM_HEADER_LEN];
        r.read_exact(&mut header)?;
        let (m_bits, k, count) = parse_header(&header)?;
        let mut bits = vec![0u8; (m_bits / 8) as usize];
        r.read_exact(&mut bits)?;
        Ok(Self { bits, m_bits, k, count })
    }
}

fn parse_header(header: &[u8; BLOOM_HEADER_LEN]) -> Result<(u64, u64, u64)> {
    let m_bits = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let k = u64::from_be_bytes(header[8..16].try_into().unwrap());
    let count = u64::from_be_bytes(header[16..24].try_into().unwrap());
    if m_bits == 0 || m_bits % 8 != 0 {
        return Err(Error::CorruptIndex(format!("bloom size {m_bits} is not a whole byte count")));
    }
    if k == 0 || k > MAX_HASHES {
        return Err(Error::CorruptIndex(format!("bloom hash count {k} out of range")));
    }
    Ok((m_bits, k, count))
}

// ── Memory-mapped filter ─────────────────────────────────────────────────────

/// Read-only bloom view aliasing a mapped file.
///
/// The bit array is the mapping itself; dropping the handle unmaps it.
pub struct BloomMap {
    map:    Mmap,
    m_bits: u64,
    k:      u64,
    count:  u64,
}

impl BloomMap {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < BLOOM_HEADER_LEN as u64 {
            return Err(Error::CorruptIndex(format!("bloom file is {len} bytes, no header")));
        }
        // Safety: the file is opened read-only and treated as immutable for
        // the lifetime of the map; a concurrent rewrite replaces the file via
        // rename, which keeps this mapping intact.
        let map = unsafe { Mmap::map(&file)? };
        let header: &[u8; BLOOM_HEADER_LEN] = map[..BLOOM_HEADER_LEN].try_into().unwrap();
        let (m_bits, k, count) = parse_header(header)?;
        if len < BLOOM_HEADER_LEN as u64 + m_bits / 8 {
            return Err(Error::CorruptIndex(format!(
                "bloom file is {len} bytes, header declares {} bit-array bytes",
                m_bits / 8
            )));
        }
        Ok(Self { map, m_bits, k, count })
    }

    pub fn might_contain(&self, key: &[u8]) -> bool {
        contains(&self.map[BLOOM_HEADER_LEN..], self.m_bits, self.k, key)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn parameters_follow_the_formula() {
        let b = Bloom::with_capacity(1000, 0.01);
        assert_eq!(b.size_bits(), 9592);
        assert_eq!(b.hash_count(), 7);

        // Tiny n still gets the floor.
        let small = Bloom::with_capacity(3, 0.01);
        assert_eq!(small.size_bits(), MIN_BITS);
    }

    #[test]
    fn no_false_negatives() {
        let mut b = Bloom::with_capacity(1000, 0.01);
        for i in 0..1000 {
            b.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..1000 {
            assert!(b.might_contain(format!("key-{i}").as_bytes()));
        }
        assert_eq!(b.count(), 1000);
    }

    #[test]
    fn false_positive_rate_near_target() {
        let mut b = Bloom::with_capacity(10_000, 0.01);
        for i in 0..10_000 {
            b.insert(format!("member-{i}").as_bytes());
        }
        let hits = (0..10_000)
            .filter(|i| b.might_contain(format!("absent-{i}").as_bytes()))
            .count();
        let observed = hits as f64 / 10_000.0;
        assert!(observed < 0.02, "observed fp rate {observed}");
    }

    #[test]
    fn serialization_round_trips_and_is_reproducible() {
        let build = || {
            let mut b = Bloom::with_capacity(500, 0.02);
            for i in 0..500 {
                b.insert(format!("row-{i}").as_bytes());
            }
            b
        };
        let a = build();
        let b = build();

        let mut bytes_a = Vec::new();
        a.write_to(&mut bytes_a).unwrap();
        let mut bytes_b = Vec::new();
        b.write_to(&mut bytes_b).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(bytes_a.len(), BLOOM_HEADER_LEN + (a.size_bits() / 8) as usize);

        let back = Bloom::read_from(&bytes_a[..]).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn mmap_view_agrees_with_memory() {
        let mut b = Bloom::with_capacity(200, 0.01);
        for i in 0..200 {
            b.insert(format!("v{i}").as_bytes());
        }
        let tmp = NamedTempFile::new().unwrap();
        b.write_to(tmp.as_file()).unwrap();

        let mapped = BloomMap::open(tmp.path()).unwrap();
        assert_eq!(mapped.count(), 200);
        for i in 0..200 {
            assert!(mapped.might_contain(format!("v{i}").as_bytes()));
        }
        for i in 0..200 {
            let probe = format!("w{i}");
            assert_eq!(
                mapped.might_contain(probe.as_bytes()),
                b.might_contain(probe.as_bytes())
            );
        }
    }

    #[test]
    fn header_garbage_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp.as_file(), &[0xFFu8; 64]).unwrap();
        assert!(matches!(BloomMap::open(tmp.path()), Err(Error::CorruptIndex(_))));
    }
}
