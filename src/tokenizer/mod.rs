//! Tokenization and chat prompt rendering

use anyhow::{anyhow, Result};

use crate::chat::ChatMessage;

/// Trait for tokenizers used by genrec
pub trait TokenizerTrait: Send + Sync {
    /// Encode text to token IDs
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs to text
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Check if a token is the EOS token
    fn is_eos(&self, token_id: u32) -> bool;

    /// Get vocabulary size
    fn vocab_size(&self) -> usize;

    /// Get EOS token ID
    fn eos_token_id(&self) -> u32;
}

/// Boxed tokenizer type for use in model handles
pub type BoxedTokenizer = Box<dyn TokenizerTrait>;

/// Number of plain byte tokens
pub const BYTE_VOCAB: usize = 256;

/// Byte-level tokenizer
///
/// Ids `0..256` are raw UTF-8 bytes; special tokens live above them.
/// Any byte string round-trips, so prompts never fail to encode.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    bos_token_id: Option<u32>,
    eos_token_id: u32,
    vocab_size: usize,
}

impl ByteTokenizer {
    pub fn new(vocab_size: usize, bos_token_id: Option<u32>, eos_token_id: u32) -> Result<Self> {
        if vocab_size < BYTE_VOCAB {
            return Err(anyhow!(
                "byte tokenizer needs a vocabulary of at least {} tokens, model has {}",
                BYTE_VOCAB,
                vocab_size
            ));
        }
        for special in bos_token_id.iter().chain(std::iter::once(&eos_token_id)) {
            if (*special as usize) < BYTE_VOCAB || *special as usize >= vocab_size {
                return Err(anyhow!(
                    "special token {} must lie in {}..{}",
                    special,
                    BYTE_VOCAB,
                    vocab_size
                ));
            }
        }
        Ok(Self {
            bos_token_id,
            eos_token_id,
            vocab_size,
        })
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }
}

impl TokenizerTrait for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if let Some(bos) = self.bos_token_id {
            tokens.push(bos);
        }
        tokens.extend(text.bytes().map(u32::from));
        Ok(tokens)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        // Special tokens carry no text
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_eos(&self, token_id: u32) -> bool {
        token_id == self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// Role assigned to generated messages
pub const ASSISTANT_ROLE: &str = "assistant";

/// Render a conversation into the prompt text the model continues.
///
/// Each turn is `<|role|>\ncontent\n`; the prompt ends with an open
/// assistant turn. Rendering an earlier conversation plus the reply it
/// produced yields a prefix of the next turn's prompt, which is what lets
/// the generation cache skip recomputation.
pub fn render_chat(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|");
        prompt.push_str(&message.role);
        prompt.push_str("|>\n");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("<|");
    prompt.push_str(ASSISTANT_ROLE);
    prompt.push_str("|>\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> ByteTokenizer {
        ByteTokenizer::new(258, Some(256), 257).unwrap()
    }

    #[test]
    fn test_encode_prepends_bos() {
        let tok = tokenizer();
        assert_eq!(tok.encode("hi").unwrap(), vec![256, b'h' as u32, b'i' as u32]);
    }

    #[test]
    fn test_decode_skips_specials() {
        let tok = tokenizer();
        let ids = tok.encode("héllo").unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), "héllo");
        assert_eq!(tok.decode(&[257, b'a' as u32]).unwrap(), "a");
        assert!(tok.is_eos(257));
    }

    #[test]
    fn test_rejects_bad_specials() {
        assert!(ByteTokenizer::new(100, None, 50).is_err());
        assert!(ByteTokenizer::new(258, None, 10).is_err());
        assert!(ByteTokenizer::new(258, Some(300), 257).is_err());
    }

    #[test]
    fn test_render_chat_extends_previous_turn() {
        let first = vec![ChatMessage::user("items?")];
        let reply = "a,b";
        let second = vec![
            ChatMessage::user("items?"),
            ChatMessage::assistant(reply),
            ChatMessage::user("more"),
        ];

        let first_prompt = render_chat(&first);
        assert_eq!(first_prompt, "<|user|>\nitems?\n<|assistant|>\n");

        let continued = format!("{}{}", first_prompt, reply);
        assert!(render_chat(&second).starts_with(&continued));
    }
}
