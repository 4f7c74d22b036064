use crate::noso::error::MinerError;
use sha2::{Digest, Sha256};

/// Alphabet for the 4-character hash suffix.
pub const HASH_CHARS: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Hashes `seed + suffix` for a fixed seed, reusing its buffers between calls.
pub struct Hasher {
    buf: Vec<u8>,
    seed_len: usize,
    encoded: [u8; 64],
}

impl Hasher {
    pub fn new(seed: &str) -> Self {
        let mut buf = Vec::with_capacity(seed.len() + 8);
        buf.extend_from_slice(seed.as_bytes());
        Self {
            buf,
            seed_len: seed.len(),
            encoded: [0; 64],
        }
    }

    /// Returns the lowercase hex SHA-256 of `seed + suffix`.
    pub fn hash(&mut self, suffix: &[u8]) -> &[u8] {
        self.buf.truncate(self.seed_len);
        self.buf.extend_from_slice(suffix);
        let digest = Sha256::digest(&self.buf);
        // A 32-byte digest always fills the 64-byte buffer exactly.
        let _ = hex::encode_to_slice(digest, &mut self.encoded);
        &self.encoded
    }

    /// The most recent hash as a string, for logging.
    pub fn hex(&self) -> &str {
        std::str::from_utf8(&self.encoded).unwrap_or_default()
    }
}

/// Graduated target prefixes, shortest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    prefixes: Vec<Vec<u8>>,
}

impl Targets {
    /// Builds `target[..min + i]` for `i` in `0..=depth`, where
    /// `min = difficulty / 10 + 1 - depth` (never below 1).
    pub fn new(target: &str, difficulty: u32, depth: usize) -> Result<Self, MinerError> {
        let min = (difficulty as i64 / 10 + 1 - depth as i64).max(1) as usize;
        let target = target.to_ascii_lowercase();
        if target.len() < min + depth {
            return Err(MinerError::InvalidJob(format!(
                "target {} is shorter than {} chars",
                target,
                min + depth
            )));
        }

        let prefixes = (0..=depth)
            .map(|i| target.as_bytes()[..min + i].to_vec())
            .collect();
        Ok(Self { prefixes })
    }

    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase().into_bytes())
                .collect(),
        }
    }

    /// Length of the shortest target.
    pub fn min_len(&self) -> usize {
        self.prefixes.first().map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Returns the length of the longest graduated target contained in
    /// `hashed`, or `None` when even the shortest one is absent.
    pub fn best_match(&self, hashed: &[u8]) -> Option<usize> {
        let (first, rest) = self.prefixes.split_first()?;
        if !contains(hashed, first) {
            return None;
        }

        let mut best = first.len();
        for target in rest {
            if !contains(hashed, target) {
                break;
            }
            best = target.len();
        }
        Some(best)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// First two hex characters of `sha256(name)`, embedded in every job postfix.
pub fn version_tag(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..1])
}
