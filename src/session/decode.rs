/// Incremental UTF-8 decoding of a byte stream read in arbitrary chunks
///
/// A multi-byte sequence split across two reads is held back until the rest
/// arrives. Bytes that can never be valid become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());
        let mut input = &self.pending[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    text.push_str(valid);
                    input = &[];
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        text.push_str(valid);
                    }
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        // truncated sequence at the end, wait for more
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }
        let carry = input.to_vec();
        self.pending = carry;
        text
    }

    /// Flush whatever is still held back, at end of stream
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
