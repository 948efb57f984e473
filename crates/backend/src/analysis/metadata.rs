//! Metadata embedded by solc at the end of contract bytecode.
//!
//! The compiler appends a CBOR map followed by its length as a big-endian `u16`:
//! `a2 64 'ipfs' 58 22 <34 bytes> 64 'solc' 43 <3 bytes> 00 33`.

use std::fmt;

use alloy_primitives::Bytes;
use ciborium::Value as CborValue;
use serde::{Deserialize, Serialize};

/// Which content-addressing scheme produced a metadata hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashKind {
    Bzzr0,
    Bzzr1,
    Ipfs,
}

impl HashKind {
    /// CBOR text key plus the byte-string header of the hash that follows.
    const fn marker(self) -> &'static [u8] {
        match self {
            // "bzzr0", bytes(32)
            Self::Bzzr0 => &[0x65, 0x62, 0x7a, 0x7a, 0x72, 0x30, 0x58, 0x20],
            // "bzzr1", bytes(32)
            Self::Bzzr1 => &[0x65, 0x62, 0x7a, 0x7a, 0x72, 0x31, 0x58, 0x20],
            // "ipfs", bytes(34)
            Self::Ipfs => &[0x64, 0x69, 0x70, 0x66, 0x73, 0x58, 0x22],
        }
    }

    const fn hash_len(self) -> usize {
        match self {
            Self::Bzzr0 | Self::Bzzr1 => 32,
            Self::Ipfs => 34,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Bzzr0 => "bzzr0",
            Self::Bzzr1 => "bzzr1",
            Self::Ipfs => "ipfs",
        }
    }

    const ALL: [Self; 3] = [Self::Bzzr0, Self::Bzzr1, Self::Ipfs];
}

/// A metadata content hash, used as a contract fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataHash {
    pub kind: HashKind,
    pub hash: Bytes,
}

impl fmt::Display for MetadataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.key(), self.hash)
    }
}

/// The decoded metadata map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub hash: Option<MetadataHash>,
    /// `major.minor.patch`, or the full version string of prerelease compilers.
    pub solc: Option<String>,
    pub experimental: bool,
}

/// Scans `code` right to left for a metadata hash marker.
///
/// The result is only trusted when exactly one marker (of any kind) fits inside the code.
/// Factories embed the creation code of the contracts they deploy, so several markers show
/// up and the code is left to the template matcher.
pub fn scan_hash(code: &[u8]) -> Option<MetadataHash> {
    let mut found = None;
    let mut candidates = 0usize;

    for pos in (0..code.len()).rev() {
        for kind in HashKind::ALL {
            let marker = kind.marker();
            let hash_start = pos + marker.len();
            let hash_end = hash_start + kind.hash_len();
            if hash_end > code.len() || !code[pos..].starts_with(marker) {
                continue;
            }

            candidates += 1;
            if candidates > 1 {
                trace!(candidates, "ambiguous metadata markers");
                return None;
            }
            found = Some(MetadataHash {
                kind,
                hash: Bytes::copy_from_slice(&code[hash_start..hash_end]),
            });
        }
    }

    found
}

/// Decodes the length-anchored CBOR map at the end of deployed code.
///
/// Any decoding failure means "no metadata".
pub fn decode(code: &[u8]) -> Option<Metadata> {
    let (rest, len_bytes) = code.split_last_chunk::<2>()?;
    let len = u16::from_be_bytes(*len_bytes) as usize;
    if len == 0 || len > rest.len() {
        return None;
    }
    let cbor = &rest[rest.len() - len..];

    let value: CborValue = ciborium::from_reader(cbor).ok()?;
    let CborValue::Map(entries) = value else { return None };

    let mut metadata = Metadata::default();
    for (key, value) in entries {
        let Some(key) = key.as_text() else { continue };
        match (key, value) {
            ("solc", CborValue::Bytes(version)) if version.len() == 3 => {
                metadata.solc = Some(format!("{}.{}.{}", version[0], version[1], version[2]));
            }
            ("solc", CborValue::Text(version)) => metadata.solc = Some(version),
            ("experimental", CborValue::Bool(flag)) => metadata.experimental = flag,
            (key, CborValue::Bytes(hash)) => {
                let Some(kind) = HashKind::ALL.into_iter().find(|kind| kind.key() == key) else {
                    continue;
                };
                if hash.len() == kind.hash_len() {
                    metadata.hash = Some(MetadataHash { kind, hash: hash.into() });
                }
            }
            _ => {}
        }
    }

    Some(metadata)
}

/// Fingerprint of a code blob: the unique embedded hash.
///
/// Deployed code must additionally carry a decodable, length-anchored metadata map; creation
/// code has constructor arguments appended, so only the marker scan applies to it.
pub fn fingerprint(code: &[u8], is_creation: bool) -> Option<MetadataHash> {
    let hash = scan_hash(code)?;
    if is_creation {
        return Some(hash);
    }

    let metadata = decode(code)?;
    match metadata.hash {
        Some(decoded) if decoded != hash => {
            warn!(scanned = %hash, %decoded, "metadata marker does not match the decoded map");
            None
        }
        _ => Some(hash),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `a2 64 ipfs 58 22 <hash> 64 solc 43 00 08 13 00 33`
    pub(crate) fn ipfs_metadata(hash_byte: u8) -> Vec<u8> {
        let mut out = vec![0xa2];
        out.extend_from_slice(HashKind::Ipfs.marker());
        out.extend_from_slice(&[hash_byte; 34]);
        out.extend_from_slice(&[0x64, b's', b'o', b'l', b'c', 0x43, 0x00, 0x08, 0x13]);
        out.extend_from_slice(&[0x00, 0x33]);
        out
    }

    #[test]
    fn test_decode_ipfs_metadata() {
        let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52, 0x00, 0xfe];
        code.extend(ipfs_metadata(0x11));

        let metadata = decode(&code).unwrap();
        assert_eq!(metadata.solc.as_deref(), Some("0.8.19"));
        assert!(!metadata.experimental);
        let hash = metadata.hash.unwrap();
        assert_eq!(hash.kind, HashKind::Ipfs);
        assert_eq!(hash.hash.as_ref(), &[0x11; 34]);

        assert_eq!(fingerprint(&code, false), Some(hash.clone()));
        assert_eq!(scan_hash(&code), Some(hash));
    }

    #[test]
    fn test_truncated_metadata_is_absent() {
        let mut code = vec![0x00];
        let mut metadata = ipfs_metadata(0x22);
        // claim a longer section than present
        let len = metadata.len();
        metadata[len - 1] = 0xff;
        code.extend(metadata);
        assert_eq!(decode(&code), None);
        assert_eq!(fingerprint(&code, false), None);
        // the marker is still there for creation code
        assert!(fingerprint(&code, true).is_some());
    }

    #[test]
    fn test_ambiguous_markers() {
        let mut code = ipfs_metadata(0x01);
        code.extend(ipfs_metadata(0x02));
        assert_eq!(scan_hash(&code), None);
    }

    #[test]
    fn test_marker_out_of_bounds() {
        let mut code = vec![0x00; 4];
        code.extend_from_slice(HashKind::Bzzr0.marker());
        code.extend_from_slice(&[0xaa; 31]);
        assert_eq!(scan_hash(&code), None);
        code.push(0xaa);
        assert_eq!(scan_hash(&code).map(|h| h.kind), Some(HashKind::Bzzr0));
    }
}
