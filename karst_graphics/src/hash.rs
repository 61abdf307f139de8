//! Byte-key construction and hashing for the content-addressed caches.
//!
//! Every cached Vulkan object is looked up by a normalized byte key: the
//! fields of its creation descriptor pushed in a fixed order, with opaque
//! handles replaced by stable numeric ids. Two structurally identical
//! descriptors therefore always produce byte-identical keys, no matter where
//! they were built.

use std::hash::{BuildHasherDefault, Hasher};

/// Fixed seed so hashes (and the persisted pipeline-cache blob) are stable
/// across runs and machines.
const MURMUR_SEED: u64 = 0;

/// A finalized lookup key: one allocation holding the payload bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct HashKey {
    bytes: Box<[u8]>,
}

impl HashKey {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Key consisting of the first `len` bytes of `self`. Used by the
    /// descriptor pool to re-key recycled sets by their layout id alone,
    /// which is always the leading field of a set key.
    pub fn prefix(&self, len: usize) -> HashKey {
        HashKey {
            bytes: self.bytes[..len.min(self.bytes.len())].into(),
        }
    }

    pub fn hash(&self) -> u64 {
        murmur3_64(&self.bytes, MURMUR_SEED)
    }
}

impl std::hash::Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.bytes);
    }
}

impl std::fmt::Debug for HashKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashKey({} bytes, {:#018x})", self.len(), self.hash())
    }
}

/// Accumulates bytes into a growing buffer and yields a [`HashKey`].
///
/// Fields are pushed tightly packed, in declaration order of the descriptor
/// they normalize. Optional sub-structures are prefixed with a `present`
/// byte, arrays with their length.
#[derive(Default)]
pub struct HashBuilder {
    bytes: Vec<u8>,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn push_u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.push_u8(v as u8)
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.push_bytes(&v.to_bits().to_le_bytes())
    }

    /// Array length prefix.
    pub fn push_len(&mut self, len: usize) -> &mut Self {
        self.push_u32(len as u32)
    }

    /// Stable id standing in for an opaque handle (set layout, shader
    /// module, pipeline layout, render pass, immutable sampler).
    pub fn push_handle(&mut self, id: u64) -> &mut Self {
        self.push_u64(id)
    }

    /// Reserve `len` zeroed bytes and return their offset, for fields that
    /// are patched after the fact (blob size/hash).
    pub fn push_zeroed(&mut self, len: usize) -> usize {
        let at = self.bytes.len();
        self.bytes.resize(at + len, 0);
        at
    }

    pub fn patch(&mut self, at: usize, data: &[u8]) {
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn finish(self) -> HashKey {
        HashKey {
            bytes: self.bytes.into_boxed_slice(),
        }
    }
}

/// First 64 bits of MurmurHash3 x64/128.
///
/// Part of the persisted pipeline-cache blob format; do not change.
pub fn murmur3_64(data: &[u8], seed: u64) -> u64 {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1 = seed;
    let mut h2 = seed;

    let nblocks = data.len() / 16;
    for i in 0..nblocks {
        let b = &data[i * 16..];
        let mut k1 = u64::from_le_bytes(b[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(b[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dce729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x38495ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    for (i, &byte) in tail.iter().enumerate().rev() {
        if i >= 8 {
            k2 ^= (byte as u64) << ((i - 8) * 8);
        } else {
            k1 ^= (byte as u64) << (i * 8);
        }
    }

    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h1
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Hasher plugging [`murmur3_64`] into `std` hash maps, so the cache and
/// pool tables hash keys the same way the persisted blob does.
#[derive(Default)]
pub struct MurmurHasher {
    bytes: Vec<u8>,
}

impl Hasher for MurmurHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        murmur3_64(&self.bytes, MURMUR_SEED)
    }
}

pub type MurmurBuildHasher = BuildHasherDefault<MurmurHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_packs_tightly() {
        let mut b = HashBuilder::new();
        b.push_u32(1).push_u8(2).push_bool(true).push_u64(3);
        let key = b.finish();
        assert_eq!(key.len(), 4 + 1 + 1 + 8);
        assert_eq!(&key.bytes()[..4], &[1, 0, 0, 0]);
        assert_eq!(key.bytes()[4], 2);
        assert_eq!(key.bytes()[5], 1);
    }

    #[test]
    fn identical_pushes_yield_identical_keys() {
        let build = || {
            let mut b = HashBuilder::new();
            b.push_u32(42).push_handle(7).push_f32(0.5);
            b.finish()
        };
        let (a, b) = (build(), build());
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn differing_payloads_differ() {
        let mut a = HashBuilder::new();
        a.push_u32(1);
        let mut b = HashBuilder::new();
        b.push_u32(2);
        let (a, b) = (a.finish(), b.finish());
        assert_ne!(a, b);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_covers_tail_bytes() {
        // Inputs shorter than one 16-byte block exercise the tail path.
        for len in 0..=17usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let h = murmur3_64(&data, 0);
            let mut tweaked = data.clone();
            if let Some(last) = tweaked.last_mut() {
                *last ^= 0x80;
                assert_ne!(h, murmur3_64(&tweaked, 0), "len {len}");
            }
        }
    }

    #[test]
    fn seed_changes_hash() {
        assert_ne!(murmur3_64(b"karst", 0), murmur3_64(b"karst", 1));
    }

    #[test]
    fn prefix_is_leading_bytes() {
        let mut b = HashBuilder::new();
        b.push_handle(0xdead_beef).push_u32(9);
        let key = b.finish();
        let pre = key.prefix(8);
        assert_eq!(pre.bytes(), &0xdead_beefu64.to_le_bytes());
    }

    #[test]
    fn patching_reserved_bytes() {
        let mut b = HashBuilder::new();
        b.push_u32(0xa);
        let at = b.push_zeroed(8);
        b.push_u32(0xb);
        b.patch(at, &0x1122_3344_5566_7788u64.to_le_bytes());
        let key = b.finish();
        assert_eq!(
            &key.bytes()[at..at + 8],
            &0x1122_3344_5566_7788u64.to_le_bytes()
        );
    }
}
