//! Streaming digest computation over executable images.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const READ_CHUNK: usize = 64 * 1024;

/// Which digests to compute, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashKinds {
    pub md5: bool,
    pub sha1: bool,
    pub sha256: bool,
}

impl Default for HashKinds {
    fn default() -> Self {
        Self {
            md5: false,
            sha1: false,
            sha256: true,
        }
    }
}

impl FromStr for HashKinds {
    type Err = String;

    /// Parse a comma separated selection, e.g. `sha256` or `md5,sha1,sha256`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kinds = Self {
            md5: false,
            sha1: false,
            sha256: false,
        };
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            match item {
                "md5" => kinds.md5 = true,
                "sha1" => kinds.sha1 = true,
                "sha256" => kinds.sha256 = true,
                other => return Err(format!("unknown hash {other}")),
            }
        }
        if kinds == (Self { md5: false, sha1: false, sha256: false }) {
            return Err("empty hash selection".to_string());
        }
        Ok(kinds)
    }
}

/// Digest set of one image acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Hashes {
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    pub sha256: Option<[u8; 32]>,
}

impl fmt::Display for Hashes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sha256 {
            Some(digest) => write!(f, "sha256:{}", hex(digest)),
            None => write!(f, "<no sha256>"),
        }
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stream a file from the start, computing the selected digests.
///
/// Returns the digests and the total number of bytes read, which the caller
/// compares against the stat size to detect a moving target.
pub fn hash_file<R: Read + Seek>(kinds: HashKinds, input: &mut R) -> io::Result<(u64, Hashes)> {
    input.seek(SeekFrom::Start(0))?;
    let mut md5 = kinds.md5.then(Md5::new);
    let mut sha1 = kinds.sha1.then(Sha1::new);
    let mut sha256 = kinds.sha256.then(Sha256::new);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if let Some(h) = md5.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = sha1.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = sha256.as_mut() {
            h.update(&buf[..n]);
        }
    }
    let hashes = Hashes {
        md5: md5.map(|h| h.finalize().into()),
        sha1: sha1.map(|h| h.finalize().into()),
        sha256: sha256.map(|h| h.finalize().into()),
    };
    Ok((total, hashes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sha256_of_known_input() {
        let mut input = Cursor::new(b"abc".to_vec());
        let kinds = HashKinds::from_str("sha256").unwrap();
        let (n, hashes) = hash_file(kinds, &mut input).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            hex(&hashes.sha256.unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(hashes.md5.is_none());
        assert!(hashes.sha1.is_none());
    }

    #[test]
    fn all_digests_selected() {
        let mut input = Cursor::new(b"hello".to_vec());
        let kinds = HashKinds::from_str("md5, sha1, sha256").unwrap();
        let (_, hashes) = hash_file(kinds, &mut input).unwrap();
        assert_eq!(hex(&hashes.md5.unwrap()), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            hex(&hashes.sha1.unwrap()),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert!(hashes.sha256.is_some());
    }

    #[test]
    fn rejects_unknown_or_empty_selection() {
        assert!(HashKinds::from_str("sha512").is_err());
        assert!(HashKinds::from_str("").is_err());
    }
}
