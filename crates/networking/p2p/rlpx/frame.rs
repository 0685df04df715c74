use aes::{
    cipher::{BlockEncrypt as _, KeyInit as _, StreamCipher as _},
    Aes256Enc,
};
use bytes::{Buf, BytesMut};
use ethereum_types::{H128, H256};
use ethwire_rlp::encode::RLPEncode as _;
use sha3::{Digest as _, Keccak256};

use super::error::RLPxError;

pub(crate) type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

/// Cipher and MAC state for one direction of an established session.
///
/// The AES-CTR keystream and the keccak MAC chain are continuous across
/// frames; neither is ever reset while the connection lives.
pub(crate) struct FrameState {
    mac_cipher: Aes256Enc,
    aes: Aes256Ctr64BE,
    mac: Keccak256,
    // body size from a verified header whose body has not fully arrived yet
    pending_body: Option<usize>,
}

impl FrameState {
    pub(crate) fn new(mac_key: H256, aes: Aes256Ctr64BE, mac: Keccak256) -> Self {
        Self {
            mac_cipher: Aes256Enc::new(&mac_key.0.into()),
            aes,
            mac,
            pending_body: None,
        }
    }

    /// Encodes one frame: `header-ct || header-mac || body-ct || body-mac`.
    pub(crate) fn encode(&mut self, mut frame_data: Vec<u8>) -> Vec<u8> {
        debug_assert!(frame_data.len() < 1 << 24);
        let mut frame = Vec::with_capacity(frame_data.len() + 48);

        // header = frame-size || header-data || header-padding
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&(frame_data.len() as u64).to_be_bytes()[5..8]);
        vec![0_u8].encode(&mut header);
        header.resize(16, 0);
        self.aes.apply_keystream(&mut header);

        let header_array: [u8; 16] = header.as_slice().try_into().unwrap();
        let header_mac = self.update_header_mac(&header_array);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&header_mac);

        // pad to the cipher block size
        frame_data.resize(frame_data.len().next_multiple_of(16), 0);
        self.aes.apply_keystream(&mut frame_data);
        self.mac.update(&frame_data);
        let frame_mac = self.update_body_mac();
        frame.extend_from_slice(&frame_data);
        frame.extend_from_slice(&frame_mac);

        frame
    }

    /// Decodes one frame out of `buffer`, consuming its bytes.
    ///
    /// Returns [`RLPxError::ShortFrame`] while the frame is still partial;
    /// callers keep the buffer and retry once more bytes arrive. A verified
    /// header is consumed eagerly so the MAC chain advances exactly once
    /// per frame regardless of how the bytes were chunked.
    pub(crate) fn try_decode(&mut self, buffer: &mut BytesMut) -> Result<Vec<u8>, RLPxError> {
        let frame_size = match self.pending_body {
            Some(size) => size,
            None => {
                if buffer.len() < 32 {
                    return Err(RLPxError::ShortFrame);
                }
                let mut header: [u8; 16] = buffer[..16].try_into().unwrap();
                let expected_mac = self.update_header_mac(&header);
                if expected_mac != buffer[16..32] {
                    return Err(RLPxError::MACMismatch);
                }

                self.aes.apply_keystream(&mut header);
                // bytes 3.. hold the header-data list, which carries nothing
                let size = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
                buffer.advance(32);
                self.pending_body = Some(size);
                size
            }
        };

        let padded_size = frame_size.next_multiple_of(16);
        if buffer.len() < padded_size + 16 {
            return Err(RLPxError::ShortFrame);
        }

        self.mac.update(&buffer[..padded_size]);
        let expected_mac = self.update_body_mac();
        if expected_mac != buffer[padded_size..padded_size + 16] {
            return Err(RLPxError::MACMismatch);
        }

        let mut frame_data = buffer[..padded_size].to_vec();
        self.aes.apply_keystream(&mut frame_data);
        buffer.advance(padded_size + 16);
        self.pending_body = None;

        frame_data.truncate(frame_size);
        Ok(frame_data)
    }

    // header-mac-seed = aes(mac-secret, keccak.digest(mac)[..16]) ^ header-ciphertext
    fn update_header_mac(&mut self, header_ciphertext: &[u8; 16]) -> [u8; 16] {
        let mac_digest: [u8; 16] = self.mac.clone().finalize()[..16].try_into().unwrap();
        let mut seed = mac_digest.into();
        self.mac_cipher.encrypt_block(&mut seed);
        let seed = H128(seed.into()) ^ H128(*header_ciphertext);
        self.mac.update(seed);
        self.mac.clone().finalize()[..16].try_into().unwrap()
    }

    // frame-mac-seed = aes(mac-secret, keccak.digest(mac)[..16]) ^ keccak.digest(mac)[..16],
    // computed after the body ciphertext has been fed into the chain
    fn update_body_mac(&mut self) -> [u8; 16] {
        let mac_digest: [u8; 16] = self.mac.clone().finalize()[..16].try_into().unwrap();
        let mut seed = mac_digest.into();
        self.mac_cipher.encrypt_block(&mut seed);
        let seed = H128(seed.into()) ^ H128(mac_digest);
        self.mac.update(seed);
        self.mac.clone().finalize()[..16].try_into().unwrap()
    }
}
