use std::num::NonZeroUsize;

use sha1::{Digest, Sha1};

/// The identity a queue is hashed by: vhost immediately followed by the queue name.
/// Policies already installed on clusters depend on this exact concatenation.
pub fn queue_key(vhost: &str, queue: &str) -> String {
    format!("{}{}", vhost, queue)
}

/// Map a key to one of `size` buckets.
///
/// The SHA-1 digest of the key, read as a 160-bit big-endian unsigned integer, reduced modulo
/// `size`. Stable across processes and platforms. The reduction is done byte by byte so no
/// big integer type is needed.
pub fn bucket(key: &str, size: NonZeroUsize) -> usize {
    let digest = Sha1::digest(key.as_bytes());
    let size = size.get() as u128;

    let remainder = digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % size);

    remainder as usize
}
