use aes::cipher::{KeyIvInit, StreamCipher};
use ethereum_types::{H128, H256, H512, H520};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use k256::{
    ecdsa::{self, RecoveryId, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use rand::Rng;
use sha3::{Digest, Keccak256};

use super::{
    error::RLPxError,
    utils::{ecdh_xchng, id2pubkey, kdf, pubkey2id, sha256, sha256_hmac},
};

type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;

/// Handshake protocol version; emitted in auth and auth-ack. Higher peer
/// versions are accepted for forward compatibility.
pub(crate) const HANDSHAKE_VSN: u8 = 4;

/// Exact ciphertext length of a pre-EIP-8 auth message:
/// ecies overhead (65 + 16 + 32) plus the fixed 194-byte plaintext.
pub(crate) const PLAIN_AUTH_SIZE: usize = 307;
/// Exact ciphertext length of a pre-EIP-8 auth-ack (97-byte plaintext).
pub(crate) const PLAIN_ACK_SIZE: usize = 210;

const SIGNATURE_SIZE: usize = 65;
const IV_SIZE: usize = 16;
const MAC_FOOTER_SIZE: usize = 32;

/// Encodes an EIP-8 auth message, starting a handshake. The returned bytes
/// include the two-byte size prefix and are what goes on the wire.
pub(crate) fn encode_auth_message(
    static_key: &SecretKey,
    local_nonce: H256,
    remote_static_pubkey: &PublicKey,
    local_ephemeral_key: &SecretKey,
) -> Result<Vec<u8>, RLPxError> {
    let node_id = pubkey2id(&static_key.public_key());

    // Derive a shared secret from the static keys.
    let static_shared_secret = ecdh_xchng(static_key, remote_static_pubkey);

    // Create the signature included in the message.
    let signature = sign_shared_secret(
        static_shared_secret.into(),
        local_nonce,
        local_ephemeral_key,
    )?;

    let auth = AuthMessage::new(signature, node_id, local_nonce);
    encrypt_message(remote_static_pubkey, auth.encode_to_vec())
}

/// Decodes an incoming EIP-8 auth message and recovers the initiator's
/// ephemeral public key from its signature.
pub(crate) fn decode_auth_message(
    static_key: &SecretKey,
    msg: &[u8],
    size_data: &[u8],
) -> Result<(AuthMessage, PublicKey), RLPxError> {
    let payload = decrypt_message(static_key, msg, size_data)?;
    let (auth, _padding) = AuthMessage::decode_unfinished(&payload)?;
    if auth.version < HANDSHAKE_VSN {
        return Err(RLPxError::UnsupportedVersion(auth.version));
    }

    let remote_ephemeral_key = recover_ephemeral_key(static_key, &auth)?;
    Ok((auth, remote_ephemeral_key))
}

/// Decodes a pre-EIP-8 auth message: a fixed 194-byte plaintext of
/// `signature || keccak(ephemeral-pubkey) || pubkey || nonce || 0x00`,
/// encrypted with no size data in the MAC.
pub(crate) fn decode_plain_auth_message(
    static_key: &SecretKey,
    msg: &[u8],
) -> Result<(AuthMessage, PublicKey), RLPxError> {
    let payload = decrypt_message(static_key, msg, &[])?;
    if payload.len() < 194 {
        return Err(RLPxError::InvalidAuth("truncated auth body".to_string()));
    }

    let signature = H520::from_slice(&payload[..65]);
    let ephemeral_key_hash = H256::from_slice(&payload[65..97]);
    let node_id = H512::from_slice(&payload[97..161]);
    let nonce = H256::from_slice(&payload[161..193]);
    let auth = AuthMessage {
        signature,
        node_id,
        nonce,
        version: HANDSHAKE_VSN,
    };

    let remote_ephemeral_key = recover_ephemeral_key(static_key, &auth)?;
    // the plaintext commits to the ephemeral key; the signature must recover it
    let recovered_hash = Keccak256::digest(pubkey2id(&remote_ephemeral_key).as_bytes());
    if recovered_hash.as_slice() != ephemeral_key_hash.as_bytes() {
        return Err(RLPxError::InvalidAuth(
            "signature does not recover the committed ephemeral key".to_string(),
        ));
    }
    Ok((auth, remote_ephemeral_key))
}

/// Encodes an EIP-8 auth-ack, completing a handshake.
pub(crate) fn encode_ack_message(
    local_ephemeral_key: &SecretKey,
    local_nonce: H256,
    remote_static_pubkey: &PublicKey,
) -> Result<Vec<u8>, RLPxError> {
    let ack = AckMessage::new(pubkey2id(&local_ephemeral_key.public_key()), local_nonce);
    encrypt_message(remote_static_pubkey, ack.encode_to_vec())
}

/// Decodes an incoming EIP-8 auth-ack.
pub(crate) fn decode_ack_message(
    static_key: &SecretKey,
    msg: &[u8],
    size_data: &[u8],
) -> Result<AckMessage, RLPxError> {
    let payload = decrypt_message(static_key, msg, size_data)?;
    let (ack, _padding) = AckMessage::decode_unfinished(&payload)?;
    if ack.version < HANDSHAKE_VSN {
        return Err(RLPxError::UnsupportedVersion(ack.version));
    }
    Ok(ack)
}

/// Decodes a pre-EIP-8 auth-ack: `ephemeral-pubkey || nonce || 0x00`.
pub(crate) fn decode_plain_ack_message(
    static_key: &SecretKey,
    msg: &[u8],
) -> Result<AckMessage, RLPxError> {
    let payload = decrypt_message(static_key, msg, &[])?;
    if payload.len() < 97 {
        return Err(RLPxError::InvalidAuth("truncated ack body".to_string()));
    }
    Ok(AckMessage {
        ephemeral_pubkey: H512::from_slice(&payload[..64]),
        nonce: H256::from_slice(&payload[64..96]),
        version: HANDSHAKE_VSN,
    })
}

fn recover_ephemeral_key(
    static_key: &SecretKey,
    auth: &AuthMessage,
) -> Result<PublicKey, RLPxError> {
    let peer_pk = id2pubkey(auth.node_id).ok_or(RLPxError::InvalidPeerId)?;
    let static_shared_secret = ecdh_xchng(static_key, &peer_pk);
    retrieve_remote_ephemeral_key(static_shared_secret.into(), auth.nonce, auth.signature)
}

fn decrypt_message(
    static_key: &SecretKey,
    msg: &[u8],
    size_data: &[u8],
) -> Result<Vec<u8>, RLPxError> {
    // Message layout: public-key (65) || iv (16) || ciphertext || mac (32)
    if msg.len() < SIGNATURE_SIZE + IV_SIZE + MAC_FOOTER_SIZE {
        return Err(RLPxError::InvalidAuth("ciphertext too short".to_string()));
    }
    let (pk, rest) = msg.split_at(SIGNATURE_SIZE);
    let (iv, rest) = rest.split_at(IV_SIZE);
    let (c, d) = rest.split_at(rest.len() - MAC_FOOTER_SIZE);

    // Derive the message shared secret, then the AES and MAC keys from it.
    let shared_secret = ecdh_xchng(static_key, &PublicKey::from_sec1_bytes(pk)?);
    let mut buf = [0; 32];
    kdf(&shared_secret, &mut buf);
    let aes_key = &buf[..16];
    let mac_key = sha256(&buf[16..]);

    let expected_d = sha256_hmac(&mac_key, &[iv, c], size_data);
    if d != expected_d {
        return Err(RLPxError::InvalidAuth("handshake MAC mismatch".to_string()));
    }

    let mut stream_cipher = Aes128Ctr64BE::new_from_slices(aes_key, iv)?;
    let mut decoded = c.to_vec();
    stream_cipher.try_apply_keystream(&mut decoded)?;
    Ok(decoded)
}

fn encrypt_message(
    remote_static_pubkey: &PublicKey,
    mut encoded_msg: Vec<u8>,
) -> Result<Vec<u8>, RLPxError> {
    let mut rng = rand::thread_rng();

    // Pad with a random amount of data; at least 100 bytes to make the
    // message distinguishable from pre-EIP-8 handshakes.
    let padding_length = rng.gen_range(100..=300);
    encoded_msg.resize(encoded_msg.len() + padding_length, 0);

    // Precompute the size of the message, needed for computing the MAC.
    let ecies_overhead = SIGNATURE_SIZE + IV_SIZE + MAC_FOOTER_SIZE;
    let auth_size: u16 = (encoded_msg.len() + ecies_overhead)
        .try_into()
        .map_err(|_| RLPxError::CryptographyError("invalid message length".to_string()))?;
    let auth_size_bytes = auth_size.to_be_bytes();

    // Generate a keypair just for this message.
    let message_secret_key = SecretKey::random(&mut rng);

    // Derive a shared secret for this message, then the AES and MAC keys.
    let message_secret = ecdh_xchng(&message_secret_key, remote_static_pubkey);
    let mut secret_keys = [0; 32];
    kdf(&message_secret, &mut secret_keys);
    let aes_key = &secret_keys[..16];
    let mac_key = sha256(&secret_keys[16..]);

    // Use the AES secret to encrypt the message.
    let iv = H128(rng.gen());
    let mut aes_cipher = Aes128Ctr64BE::new_from_slices(aes_key, &iv.0)?;
    aes_cipher.try_apply_keystream(&mut encoded_msg)?;
    let encrypted_msg = encoded_msg;

    // Use the MAC secret to authenticate iv and ciphertext.
    let r_public_key = message_secret_key.public_key().to_encoded_point(false);
    let mac_footer = sha256_hmac(&mac_key, &[&iv.0, &encrypted_msg], &auth_size_bytes);

    Ok([
        &auth_size_bytes,
        r_public_key.as_bytes(),
        &iv.0,
        &encrypted_msg,
        &mac_footer,
    ]
    .concat())
}

fn retrieve_remote_ephemeral_key(
    shared_secret: H256,
    remote_nonce: H256,
    signature: H520,
) -> Result<PublicKey, RLPxError> {
    let signature_prehash = shared_secret ^ remote_nonce;
    let sign = ecdsa::Signature::from_slice(&signature.as_bytes()[..64])?;
    let rid = RecoveryId::from_byte(signature.as_bytes()[64]).ok_or_else(|| {
        RLPxError::InvalidAuth("invalid signature recovery id".to_string())
    })?;
    let ephemeral_key =
        VerifyingKey::recover_from_prehash(signature_prehash.as_bytes(), &sign, rid)?;
    Ok(ephemeral_key.into())
}

fn sign_shared_secret(
    shared_secret: H256,
    local_nonce: H256,
    local_ephemeral_key: &SecretKey,
) -> Result<H520, RLPxError> {
    let signature_prehash = shared_secret ^ local_nonce;
    let (signature, rid) =
        SigningKey::from(local_ephemeral_key).sign_prehash_recoverable(&signature_prehash.0)?;
    let mut signature_bytes = [0; 65];
    signature_bytes[..64].copy_from_slice(signature.to_bytes().as_slice());
    signature_bytes[64] = rid.to_byte();
    Ok(H520(signature_bytes))
}

#[derive(Debug)]
pub(crate) struct AuthMessage {
    /// Signature over `static-shared-secret ^ initiator-nonce` made with the
    /// initiator's ephemeral key.
    pub signature: H520,
    /// The node id of the initiator.
    pub node_id: H512,
    /// The nonce generated by the initiator.
    pub nonce: H256,
    pub version: u8,
}

impl AuthMessage {
    pub fn new(signature: H520, node_id: H512, nonce: H256) -> Self {
        Self {
            signature,
            node_id,
            nonce,
            version: HANDSHAKE_VSN,
        }
    }
}

impl RLPEncode for AuthMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.node_id)
            .encode_field(&self.nonce)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for AuthMessage {
    // NOTE: discards any extra data in the list after the known fields.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (node_id, decoder) = decoder.decode_field("node_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (version, decoder) = decoder.decode_field("version")?;

        let rest = decoder.finish_unchecked();
        let this = Self {
            signature,
            node_id,
            nonce,
            version,
        };
        Ok((this, rest))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AckMessage {
    /// The recipient's ephemeral public key.
    pub ephemeral_pubkey: H512,
    /// The nonce generated by the recipient.
    pub nonce: H256,
    pub version: u8,
}

impl AckMessage {
    pub fn new(ephemeral_pubkey: H512, nonce: H256) -> Self {
        Self {
            ephemeral_pubkey,
            nonce,
            version: HANDSHAKE_VSN,
        }
    }

    pub fn get_ephemeral_pubkey(&self) -> Option<PublicKey> {
        id2pubkey(self.ephemeral_pubkey)
    }
}

impl RLPEncode for AckMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ephemeral_pubkey)
            .encode_field(&self.nonce)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for AckMessage {
    // NOTE: discards any extra data in the list after the known fields.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ephemeral_pubkey, decoder) = decoder.decode_field("ephemeral_pubkey")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (version, decoder) = decoder.decode_field("version")?;

        let rest = decoder.finish_unchecked();
        let this = Self {
            ephemeral_pubkey,
            nonce,
            version,
        };
        Ok((this, rest))
    }
}
