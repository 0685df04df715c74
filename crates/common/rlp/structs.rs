use bytes::BufMut;

use super::{
    decode::{decode_rlp_item, RLPDecode},
    encode::{encode_length, RLPEncode},
    error::RLPDecodeError,
};

/// Field-by-field decoder for RLP list items.
///
/// Consumes itself on each field so misuse (reading past the list) is a
/// compile error rather than a runtime surprise:
///
/// ```ignore
/// let decoder = Decoder::new(rlp)?;
/// let (name, decoder) = decoder.decode_field("name")?;
/// let (version, decoder) = decoder.decode_field("version")?;
/// let rest = decoder.finish()?;
/// ```
#[derive(Debug)]
pub struct Decoder<'a> {
    payload: &'a [u8],
    remaining: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RLPDecodeError> {
        match decode_rlp_item(buf)? {
            (true, payload, remaining) => Ok(Self { payload, remaining }),
            (false, _, _) => Err(RLPDecodeError::UnexpectedString),
        }
    }

    pub fn decode_field<T: RLPDecode>(self, name: &str) -> Result<(T, Self), RLPDecodeError> {
        let (field, payload) = T::decode_unfinished(self.payload)
            .map_err(|err| RLPDecodeError::Custom(format!("field '{name}': {err}")))?;
        Ok((field, Self { payload, ..self }))
    }

    /// Decodes the next field if one is present and decodable as `T`.
    pub fn decode_optional_field<T: RLPDecode>(self) -> (Option<T>, Self) {
        match T::decode_unfinished(self.payload) {
            Ok((field, payload)) => (Some(field), Self { payload, ..self }),
            Err(_) => (None, self),
        }
    }

    pub fn is_done(&self) -> bool {
        self.payload.is_empty()
    }

    /// Finishes decoding the list, requiring it to be fully consumed.
    pub fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if !self.payload.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(self.remaining)
    }

    /// Finishes decoding the list, discarding any unread trailing fields.
    pub fn finish_unchecked(self) -> &'a [u8] {
        self.remaining
    }
}

/// Field-by-field encoder producing one RLP list item.
///
/// Fields are buffered so the list length prefix can be written first; the
/// list reaches `buf` on [`finish`](Encoder::finish).
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    fields: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            fields: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode>(mut self, value: &T) -> Self {
        value.encode(&mut self.fields);
        self
    }

    pub fn finish(self) {
        encode_length(self.fields.len(), self.buf);
        self.buf.put_slice(&self.fields);
    }
}
