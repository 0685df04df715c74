use bytes::{BufMut, Bytes};
use ethereum_types::{H128, H256, H512, H520};

use super::constants::{RLP_EMPTY_LIST, RLP_NULL};

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

// Unsigned integers encode as their big-endian bytes with leading
// zeros stripped; zero itself is the empty string.
macro_rules! impl_uint_encode {
    ($($t:ty),*) => {
        $(impl RLPEncode for $t {
            fn encode(&self, buf: &mut dyn BufMut) {
                match *self {
                    0 => buf.put_u8(RLP_NULL),
                    n @ 1..=0x7f => buf.put_u8(n as u8),
                    n => {
                        let bytes = n.to_be_bytes();
                        let start = bytes.iter().position(|&b| b != 0).unwrap_or_default();
                        buf.put_u8(RLP_NULL + (bytes.len() - start) as u8);
                        buf.put_slice(&bytes[start..]);
                    }
                }
            }
        })*
    };
}

impl_uint_encode!(u8, u16, u32, u64, usize);

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.len() == 1 && self[0] < RLP_NULL {
            buf.put_u8(self[0]);
        } else {
            if self.len() < 56 {
                buf.put_u8(RLP_NULL + self.len() as u8);
            } else {
                let len_bytes = self.len().to_be_bytes();
                let start = len_bytes.iter().position(|&b| b != 0).unwrap_or_default();
                buf.put_u8(0xb7 + (len_bytes.len() - start) as u8);
                buf.put_slice(&len_bytes[start..]);
            }
            buf.put_slice(self);
        }
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for &str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl RLPEncode for H128 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H512 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H520 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

// A Vec<T> is a homogeneous list. Byte strings go through
// the slice/array/Bytes impls instead.
impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.is_empty() {
            buf.put_u8(RLP_EMPTY_LIST);
        } else {
            let total_len: usize = self.iter().map(|item| item.length()).sum();
            encode_length(total_len, buf);
            for item in self {
                item.encode(buf);
            }
        }
    }
}

impl<S: RLPEncode, T: RLPEncode> RLPEncode for (S, T) {
    fn encode(&self, buf: &mut dyn BufMut) {
        let total_len = self.0.length() + self.1.length();
        encode_length(total_len, buf);
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<S: RLPEncode, T: RLPEncode, U: RLPEncode> RLPEncode for (S, T, U) {
    fn encode(&self, buf: &mut dyn BufMut) {
        let total_len = self.0.length() + self.1.length() + self.2.length();
        encode_length(total_len, buf);
        self.0.encode(buf);
        self.1.encode(buf);
        self.2.encode(buf);
    }
}

pub(crate) fn encode_length(total_len: usize, buf: &mut dyn BufMut) {
    if total_len < 56 {
        buf.put_u8(RLP_EMPTY_LIST + total_len as u8);
    } else {
        let len_bytes = total_len.to_be_bytes();
        let start = len_bytes.iter().position(|&b| b != 0).unwrap_or_default();
        buf.put_u8(0xf7 + (len_bytes.len() - start) as u8);
        buf.put_slice(&len_bytes[start..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_uints() {
        assert_eq!(0u8.encode_to_vec(), vec![RLP_NULL]);
        assert_eq!(1u8.encode_to_vec(), vec![0x01]);
        assert_eq!(0x7fu8.encode_to_vec(), vec![0x7f]);
        assert_eq!(0x80u8.encode_to_vec(), vec![0x81, 0x80]);
        assert_eq!(0x0400u16.encode_to_vec(), vec![0x82, 0x04, 0x00]);
        assert_eq!(0x010203u64.encode_to_vec(), vec![0x83, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn encode_bytes() {
        assert_eq!([0x00u8].encode_to_vec(), vec![0x00]);
        assert_eq!([0x7fu8].encode_to_vec(), vec![0x7f]);
        assert_eq!([0x80u8].encode_to_vec(), vec![0x81, 0x80]);
        assert_eq!([0x04u8, 0x00].encode_to_vec(), vec![0x82, 0x04, 0x00]);

        let long = [0xaau8; 60];
        let encoded = long.encode_to_vec();
        assert_eq!(&encoded[..2], &[0xb8, 60]);
        assert_eq!(&encoded[2..], &long);
    }

    #[test]
    fn encode_strings() {
        assert_eq!("dog".encode_to_vec(), vec![0x83, b'd', b'o', b'g']);
        assert_eq!("".encode_to_vec(), vec![RLP_NULL]);
    }

    #[test]
    fn encode_lists() {
        let cat_dog = vec!["cat", "dog"];
        assert_eq!(
            cat_dog.encode_to_vec(),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );

        let empty: Vec<&str> = vec![];
        assert_eq!(empty.encode_to_vec(), vec![RLP_EMPTY_LIST]);

        // [0] is the canonical frame header-data
        assert_eq!(vec![0u8].encode_to_vec(), vec![0xc1, RLP_NULL]);
    }

    #[test]
    fn encode_hashes() {
        let hash = H256(hex!(
            "7c9b917788989470b0e330cc6e4fb383c0340ed85fab836ec9fb8a49672712ae"
        ));
        let mut expected = vec![0xa0];
        expected.extend_from_slice(hash.as_bytes());
        assert_eq!(hash.encode_to_vec(), expected);
    }

    #[test]
    fn encode_tuples() {
        let pair: (u8, u8) = (0x01, 0x02);
        assert_eq!(pair.encode_to_vec(), vec![0xc2, 0x01, 0x02]);
    }
}
