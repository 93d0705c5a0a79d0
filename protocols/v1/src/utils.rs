use crate::error::Error;
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use serde_json::Value;
use std::{convert::TryFrom, mem::size_of, ops::BitAnd};

/// Byte vector represented as a hex string in JSON.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HexBytes(Vec<u8>);

impl HexBytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// fix for odd-length hex sequences
fn hex_decode(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        Ok(hex::decode(format!("0{s}"))?)
    } else {
        Ok(hex::decode(s)?)
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(value: Vec<u8>) -> Self {
        HexBytes(value)
    }
}

impl From<HexBytes> for Vec<u8> {
    fn from(v: HexBytes) -> Self {
        v.0
    }
}

impl TryFrom<&str> for HexBytes {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        Ok(HexBytes(hex_decode(value)?))
    }
}

impl From<HexBytes> for String {
    fn from(bytes: HexBytes) -> String {
        hex::encode(bytes.0)
    }
}

impl From<&HexBytes> for String {
    fn from(bytes: &HexBytes) -> String {
        hex::encode(&bytes.0)
    }
}

impl From<HexBytes> for Value {
    fn from(eb: HexBytes) -> Self {
        Into::<String>::into(eb).into()
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Big-endian u32 represented as an 8 character hex string in JSON
/// (block version, nbits, ntime, nonce, version masks).
#[derive(Clone, Debug, PartialEq, Eq, Copy)]
pub struct HexU32Be(pub u32);

impl HexU32Be {
    /// True when every bit set in `self` is inside `mask`.
    pub fn check_mask(&self, mask: &HexU32Be) -> bool {
        ((!mask.0) & self.0) == 0
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl BitAnd<u32> for HexU32Be {
    type Output = u32;

    fn bitand(self, rhs: u32) -> Self::Output {
        self.0 & rhs
    }
}

impl TryFrom<&str> for HexU32Be {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        if value.len() > 8 {
            return Err(Error::BadHexU32(value.to_string()));
        }
        let parsed = u32::from_str_radix(value, 16)
            .map_err(|_| Error::BadHexU32(value.to_string()))?;
        Ok(HexU32Be(parsed))
    }
}

impl From<HexU32Be> for String {
    fn from(v: HexU32Be) -> Self {
        hex::encode(v.0.to_be_bytes())
    }
}

impl From<u32> for HexU32Be {
    fn from(a: u32) -> Self {
        HexU32Be(a)
    }
}

impl From<HexU32Be> for Value {
    fn from(eu: HexU32Be) -> Self {
        Into::<String>::into(eu).into()
    }
}

/// PrevHash in Stratum v1 swaps the bytes of every u32 word into big endian,
/// so it needs its own conversion instead of plain hex decoding. The inner
/// array is kept in the internal (little endian) block header order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrevHash(pub [u8; 32]);

impl TryFrom<&str> for PrevHash {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        let stratum_order = hex_decode(value)?;
        if stratum_order.len() != 32 {
            return Err(Error::BadPrevHashLen(stratum_order.len()));
        }

        let mut prev_hash = [0_u8; 32];
        for (chunk, mut out) in stratum_order
            .chunks(size_of::<u32>())
            .zip(prev_hash.chunks_mut(size_of::<u32>()))
        {
            let word = BigEndian::read_u32(chunk);
            out.write_u32::<LittleEndian>(word)
                .expect("chunk len is checked above");
        }
        Ok(PrevHash(prev_hash))
    }
}

impl From<&PrevHash> for String {
    fn from(v: &PrevHash) -> Self {
        let mut cursor = std::io::Cursor::new(Vec::with_capacity(32));
        for chunk in v.0.chunks(size_of::<u32>()) {
            let word = LittleEndian::read_u32(chunk);
            cursor
                .write_u32::<BigEndian>(word)
                .expect("writes to a vec cannot fail");
        }
        hex::encode(cursor.into_inner())
    }
}

impl From<PrevHash> for String {
    fn from(v: PrevHash) -> Self {
        (&v).into()
    }
}

impl From<PrevHash> for Value {
    fn from(ph: PrevHash) -> Self {
        Into::<String>::into(ph).into()
    }
}

impl AsRef<[u8]> for PrevHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[quickcheck_macros::quickcheck]
    fn prev_hash_swaps_every_word(mut bytes: Vec<u8>) -> bool {
        bytes.resize(32, 0);
        let be_hex = hex::encode(&bytes);
        let me = PrevHash::try_from(be_hex.as_str()).unwrap();
        let back: String = (&me).into();

        let chunk_size = size_of::<u32>();
        for (be_chunk, le_chunk) in bytes.chunks(chunk_size).zip(me.0.chunks(chunk_size)) {
            let le = u32::from_le_bytes(le_chunk.try_into().unwrap());
            let be = u32::from_be_bytes(be_chunk.try_into().unwrap());
            if le != be {
                return false;
            }
        }
        be_hex == back
    }

    #[test]
    fn hex_u32_mask_check() {
        let bits = HexU32Be::try_from("1fffe000").unwrap();
        let mask = HexU32Be::try_from("1fffe000").unwrap();
        assert!(bits.check_mask(&mask));

        let outside = HexU32Be::try_from("20000000").unwrap();
        assert!(!outside.check_mask(&mask));
    }

    #[test]
    fn odd_length_hex_is_left_padded() {
        let b = HexBytes::try_from("abc").unwrap();
        assert_eq!(b.as_bytes(), &[0x0a, 0xbc]);
    }
}
