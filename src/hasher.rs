use std::fs::File;
use std::hash::Hasher as _;
use std::io::{self, Read};
use std::path::Path;
use twox_hash::XxHash64;

/// Content hashes use XxHash64 with a fixed zero seed so stamps stay
/// comparable across runs and hosts.
const HASH_SEED: u64 = 0;

pub fn hash_data(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(data);
    hasher.finish()
}

pub fn hash_file(path: &Path) -> io::Result<u64> {
    let mut f = File::open(path)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;
    Ok(hash_data(&buffer))
}

/// Stored form of a content hash: 8 little-endian bytes.
pub fn hash_to_blob(hash: u64) -> Vec<u8> {
    hash.to_le_bytes().to_vec()
}

pub fn blob_to_hash(blob: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = blob.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_data(b"fn main() {}"), hash_data(b"fn main() {}"));
        assert_ne!(hash_data(b"fn main() {}"), hash_data(b"fn main() { }"));
    }

    #[test]
    fn test_blob_round_trip() {
        let hash = hash_data(b"some content");
        let blob = hash_to_blob(hash);
        assert_eq!(blob.len(), 8);
        assert_eq!(blob_to_hash(&blob), Some(hash));
        assert_eq!(blob_to_hash(&[1, 2, 3]), None);
    }
}
