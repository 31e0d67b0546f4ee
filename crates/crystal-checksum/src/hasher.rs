/// Domain-separated BLAKE3 hasher producing 64-bit digests.
///
/// The first eight bytes of the BLAKE3 output are read little-endian. A
/// snapshot and a journal book with identical bytes hash differently because
/// each carries its own domain tag.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for crystal snapshot files.
    pub const SNAPSHOT: Self = Self {
        domain: "crystal-snapshot-v1",
    };
    /// Hasher for journal books.
    pub const BOOK: Self = Self {
        domain: "crystal-book-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash bytes with domain separation.
    pub fn hash64(&self, data: &[u8]) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    /// Hash several buffers as if they were one contiguous buffer.
    pub fn hash64_parts<'a>(&self, parts: impl IntoIterator<Item = &'a [u8]>) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    /// Verify that data produces the expected digest.
    pub fn verify(&self, data: &[u8], expected: u64) -> bool {
        self.hash64(data) == expected
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = ContentHasher::SNAPSHOT.hash64(b"crystal");
        let b = ContentHasher::SNAPSHOT.hash64(b"crystal");
        assert_eq!(a, b);
    }

    #[test]
    fn domains_separate() {
        let data = b"same bytes";
        assert_ne!(
            ContentHasher::SNAPSHOT.hash64(data),
            ContentHasher::BOOK.hash64(data)
        );
    }

    #[test]
    fn parts_equal_whole() {
        let whole = ContentHasher::BOOK.hash64(b"hello world");
        let parts = ContentHasher::BOOK.hash64_parts([&b"hello "[..], &b"world"[..]]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn verify_detects_single_byte_flip() {
        let mut data = b"payload to verify".to_vec();
        let digest = ContentHasher::SNAPSHOT.hash64(&data);
        assert!(ContentHasher::SNAPSHOT.verify(&data, digest));
        data[3] ^= 0x01;
        assert!(!ContentHasher::SNAPSHOT.verify(&data, digest));
    }

    proptest::proptest! {
        #[test]
        fn any_flipped_byte_changes_digest(
            data in proptest::collection::vec(proptest::num::u8::ANY, 1..256),
            index in proptest::num::usize::ANY,
        ) {
            let digest = ContentHasher::SNAPSHOT.hash64(&data);
            let mut flipped = data.clone();
            let i = index % flipped.len();
            flipped[i] ^= 0xff;
            proptest::prop_assert!(!ContentHasher::SNAPSHOT.verify(&flipped, digest));
        }
    }
}
