//! Streaming inference support
//!
//! Tokens come out of llama.cpp as raw bytes. A single character may be split
//! across several tokens, so bytes are reassembled here before anything is
//! handed to the host as a string.

use crate::inference::engine::EngineError;

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated piece of text
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed; the stream ends here
    Error(EngineError),
}

impl StreamToken {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Byte buffer that only releases complete UTF-8 text.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends token bytes and returns the longest decodable prefix, if any.
    ///
    /// An incomplete multi-byte sequence at the end stays buffered. Bytes that
    /// can never become valid UTF-8 are replaced with U+FFFD so one bad token
    /// cannot stall the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete tail, wait for the next token
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Flushes whatever is still buffered.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_token_accessors() {
        let token = StreamToken::Token("hola".to_string());
        assert_eq!(token.as_token(), Some("hola"));
        assert!(!token.is_done());

        assert!(StreamToken::Done.is_done());

        let error = StreamToken::Error(EngineError::NoModelLoaded);
        assert_eq!(error.as_token(), None);
        assert!(!error.is_done());
    }

    #[test]
    fn test_ascii_passes_straight_through() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"Hello"), Some("Hello".to_string()));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_character_split_across_tokens() {
        // "ñ" is 0xC3 0xB1
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"espa\xC3"), Some("espa".to_string()));
        assert_eq!(assembler.push(b"\xB1ol"), Some("ñol".to_string()));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_emoji_in_four_pieces() {
        let bytes = "🦙".as_bytes();
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&bytes[..1]), None);
        assert_eq!(assembler.push(&bytes[1..2]), None);
        assert_eq!(assembler.push(&bytes[2..3]), None);
        assert_eq!(assembler.push(&bytes[3..]), Some("🦙".to_string()));
    }

    #[test]
    fn test_invalid_byte_does_not_stall() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"a\xFFb"), Some("a\u{FFFD}b".to_string()));
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_finish_flushes_incomplete_tail() {
        let mut assembler = Utf8Assembler::new();
        assembler.push(b"ok\xE2\x82");
        assert_eq!(assembler.finish(), Some("\u{FFFD}".to_string()));
        assert_eq!(assembler.finish(), None);
    }
}
