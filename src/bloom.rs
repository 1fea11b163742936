//! BIP37 bloom filters, sent to the remote in a `filterload` message.
//!
//! See <https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki>.

use std::f64::consts::LN_2;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::MessageError;
use crate::message::{read_var_int, write_var_int, Message};

/// Largest filter a remote will accept, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Largest number of hash functions a remote will accept.
pub const MAX_HASH_FUNCS: u32 = 50;

const SEED_MULTIPLIER: u32 = 0xfba4_c795;

/// How the remote updates the filter when a transaction matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomUpdate {
    None = 0,
    All = 1,
    P2PubKeyOnly = 2,
}

impl TryFrom<u8> for BloomUpdate {
    type Error = MessageError;

    fn try_from(flags: u8) -> Result<Self, Self::Error> {
        match flags {
            0 => Ok(Self::None),
            1 => Ok(Self::All),
            2 => Ok(Self::P2PubKeyOnly),
            other => Err(MessageError::Malformed {
                command: "filterload".to_owned(),
                reason: format!("unknown update flags {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    update: BloomUpdate,
}

impl BloomFilter {
    /// Sizes a filter for `elements` insertions at the given false positive
    /// rate, clamped to the protocol limits.
    pub fn new(elements: usize, false_positive_rate: f64, tweak: u32, update: BloomUpdate) -> Self {
        let elements = elements.max(1) as f64;
        let bits = -1.0 / (LN_2 * LN_2) * elements * false_positive_rate.ln();
        let size = ((bits / 8.0) as usize).clamp(1, MAX_BLOOM_FILTER_SIZE);
        let hash_funcs =
            ((size as f64 * 8.0 / elements * LN_2) as u32).clamp(1, MAX_HASH_FUNCS);

        Self {
            data: vec![0; size],
            hash_funcs,
            tweak,
            update,
        }
    }

    /// A filter matching nothing, with a random tweak.
    pub fn empty() -> Self {
        Self::new(1, 0.0005, rand::random(), BloomUpdate::P2PubKeyOnly)
    }

    pub fn insert(&mut self, element: &[u8]) {
        for i in 0..self.hash_funcs {
            let bit = self.bit_index(i, element);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    /// May return false positives, never false negatives.
    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let bit = self.bit_index(i, element);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn update(&self) -> BloomUpdate {
        self.update
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn bit_index(&self, i: u32, element: &[u8]) -> usize {
        let seed = i.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, element) as usize % (self.data.len() * 8)
    }

    /// Parses a `filterload` payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let malformed = |reason: String| MessageError::Malformed {
            command: "filterload".to_owned(),
            reason,
        };
        let mut cursor = Cursor::new(payload);

        let size = read_var_int(&mut cursor)? as usize;
        if size == 0 || size > MAX_BLOOM_FILTER_SIZE {
            return Err(malformed(format!("filter size {size} out of range")));
        }
        let mut data = vec![0u8; size];
        cursor.read_exact(&mut data)?;

        let hash_funcs = cursor.read_u32::<LittleEndian>()?;
        if hash_funcs == 0 || hash_funcs > MAX_HASH_FUNCS {
            return Err(malformed(format!("{hash_funcs} hash functions out of range")));
        }
        let tweak = cursor.read_u32::<LittleEndian>()?;
        let update = BloomUpdate::try_from(cursor.read_u8()?)?;

        Ok(Self {
            data,
            hash_funcs,
            tweak,
            update,
        })
    }
}

impl Message for BloomFilter {
    fn name(&self) -> &str {
        "filterload"
    }

    fn payload(&self) -> Result<Option<Vec<u8>>, MessageError> {
        let mut payload = Vec::with_capacity(self.data.len() + 18);
        write_var_int(&mut payload, self.data.len() as u64)?;
        payload.extend_from_slice(&self.data);
        payload.write_u32::<LittleEndian>(self.hash_funcs)?;
        payload.write_u32::<LittleEndian>(self.tweak)?;
        payload.write_u8(self.update as u8)?;
        Ok(Some(payload))
    }
}

/// 32-bit MurmurHash3 (x86 variant), as BIP37 specifies.
fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        h1 ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_reference_vectors() {
        // From bitcoin core's hash_tests.
        assert_eq!(murmur3(0x0000_0000, &[]), 0x0000_0000);
        assert_eq!(murmur3(0xfba4_c795, &[]), 0x6a39_6f08);
        assert_eq!(murmur3(0xffff_ffff, &[]), 0x81f1_6f39);
        assert_eq!(murmur3(0x0000_0000, &[0x00]), 0x514e_28b7);
        assert_eq!(murmur3(0xfba4_c795, &[0x00]), 0xea3f_0b17);
        assert_eq!(murmur3(0x0000_0000, &[0xff]), 0xfd6c_f10d);
    }

    #[test]
    fn inserted_elements_are_found() {
        let mut filter = BloomFilter::new(3, 0.01, 0, BloomUpdate::All);
        let elements: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];
        for element in elements {
            filter.insert(element);
        }
        for element in elements {
            assert!(filter.contains(element));
        }
    }

    #[test]
    fn sizing_respects_protocol_limits() {
        let filter = BloomFilter::new(10_000_000, 0.000_001, 0, BloomUpdate::None);
        assert_eq!(filter.size(), MAX_BLOOM_FILTER_SIZE);
        assert!(filter.hash_funcs() <= MAX_HASH_FUNCS);

        let tiny = BloomFilter::new(1, 0.0005, 7, BloomUpdate::P2PubKeyOnly);
        assert!(tiny.size() >= 1);
        assert!(tiny.hash_funcs() >= 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut payload = Vec::new();
        write_var_int(&mut payload, (MAX_BLOOM_FILTER_SIZE + 1) as u64).unwrap();
        assert!(matches!(
            BloomFilter::from_payload(&payload),
            Err(MessageError::Malformed { .. })
        ));
    }

    #[test]
    fn payload_parses_back() {
        let mut filter = BloomFilter::new(2, 0.001, 42, BloomUpdate::P2PubKeyOnly);
        filter.insert(b"wallet key");
        let payload = filter.payload().unwrap().unwrap();
        assert_eq!(BloomFilter::from_payload(&payload).unwrap(), filter);
    }
}
