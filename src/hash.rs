use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use log::{debug, warn};

pub const DEFAULT_HASH_FILE: &str = "strings.txt";

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// The engine masks script hashes to 63 bits.
const MASK63: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Canonical 64-bit name hash: lowercased, `\` folded to `/`.
pub fn hash64(s: &str) -> u64 {
    let mut h = FNV64_OFFSET;
    for b in s.bytes() {
        let b = match b {
            b'A'..=b'Z' => b + 0x20,
            b'\\' => b'/',
            _ => b,
        };
        h ^= b as u64;
        h = h.wrapping_mul(FNV64_PRIME);
    }
    h & MASK63
}

/// Canonical 32-bit name hash (field, class and variable names).
pub fn hash32(s: &str) -> u32 {
    let mut h = FNV32_OFFSET;
    for b in s.bytes() {
        let b = match b {
            b'A'..=b'Z' => b + 0x20,
            _ => b,
        };
        h ^= b as u32;
        h = h.wrapping_mul(FNV32_PRIME);
    }
    h
}

#[derive(Default)]
struct Inner {
    map: HashMap<u64, String>,
    extracted: HashSet<u64>,
}

/// Dictionary from name hashes to known strings.
///
/// One instance is owned by the run and threaded by reference through the
/// engine; adds happen while link patching decrypts string literals, so the
/// inner tables sit behind a lock even though a single file is always
/// processed on one thread.
#[derive(Default)]
pub struct HashIndex {
    inner: RwLock<Inner>,
    save_extracted: bool,
}

impl HashIndex {
    pub fn new(save_extracted: bool) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            save_extracted,
        }
    }

    /// Load `strings.txt`-style files: one name per line, `#` comments.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read hash file {}", path.display()))?;
        let mut count = 0usize;
        let mut inner = self.inner.write().unwrap();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            inner.map.insert(hash64(line), line.to_string());
            inner.map.insert(hash32(line) as u64, line.to_string());
            count += 1;
        }
        debug!("loaded {} hash entries from {}", count, path.display());
        Ok(count)
    }

    /// Load the default file when present; missing is not an error.
    pub fn load_default(&self) {
        let p = Path::new(DEFAULT_HASH_FILE);
        if p.exists() {
            if let Err(err) = self.load_file(p) {
                warn!("can't load {}: {:#}", DEFAULT_HASH_FILE, err);
            }
        }
    }

    pub fn add(&self, value: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.map.insert(hash64(value), value.to_string());
        inner.map.insert(hash32(value) as u64, value.to_string());
    }

    pub fn add_precomputed(&self, hash: u64, value: &str) {
        self.inner.write().unwrap().map.insert(hash, value.to_string());
    }

    pub fn lookup(&self, hash: u64) -> Option<String> {
        self.inner.read().unwrap().map.get(&hash).cloned()
    }

    /// Resolve a hash to its known name, or a `type_<hex>` placeholder.
    /// Looked-up hashes are recorded for the `--hashmap` side log.
    pub fn extract(&self, kind: &str, hash: u64) -> String {
        if self.save_extracted {
            self.inner.write().unwrap().extracted.insert(hash);
        }
        match self.lookup(hash) {
            Some(s) => s,
            None => format!("{}_{:x}", kind, hash),
        }
    }

    /// Like [`extract`](Self::extract) with script path formatting applied.
    pub fn extract_script(&self, hash: u64) -> String {
        self.extract("script", hash).replace('/', "\\")
    }

    pub fn is_known(&self, hash: u64) -> bool {
        self.inner.read().unwrap().map.contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the extracted-hash log: `hash,name-or-empty` per line.
    pub fn write_extracted(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let mut out = fs::File::create(path)
            .with_context(|| format!("create hashmap output {}", path.display()))?;
        let mut hashes: Vec<u64> = inner.extracted.iter().copied().collect();
        hashes.sort_unstable();
        for hash in hashes {
            match inner.map.get(&hash) {
                Some(name) => writeln!(out, "{:x},{}", hash, name)?,
                None => writeln!(out, "{:x},", hash)?,
            }
        }
        Ok(())
    }
}
