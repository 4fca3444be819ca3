use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Reserved padding id shared by every tokenizer. Never a real vocabulary entry.
pub const PAD_ID: i64 = 0;

/// The contract the Transformer needs from a tokenizer.
pub trait TextTokenizer: Send + Sync {
    /// Number of ids in the vocabulary; valid ids are `0..vocab_size`.
    fn vocab_size(&self) -> i64;
    /// Maximum sequence length used for padding and as the decode-loop bound.
    fn maxlen(&self) -> usize;
    /// Start-of-sequence id.
    fn sos(&self) -> i64;
    /// End-of-sequence id.
    fn eos(&self) -> i64;
    fn encode(&self, text: &str) -> Result<Vec<i64>>;
    fn decode(&self, ids: &[i64]) -> Result<String>;
}

const PAD_TK: char = '¶';
const UNK_TK: char = '¤';
const SOS_TK: char = '«';
const EOS_TK: char = '»';

const UNK_ID: i64 = 1;
const SOS_ID: i64 = 2;
const EOS_ID: i64 = 3;

/// Character-level tokenizer over a fixed charset.
///
/// Ids 0..=3 are PAD, UNK, SOS and EOS; the charset follows in order.
#[derive(Debug, Clone)]
pub struct CharsetTokenizer {
    chars: Vec<char>,
    index: HashMap<char, i64>,
    maxlen: usize,
}

impl CharsetTokenizer {
    pub fn new(charset: &str, max_text_length: usize) -> Self {
        let mut chars = vec![PAD_TK, UNK_TK, SOS_TK, EOS_TK];
        for c in charset.chars() {
            if !chars.contains(&c) {
                chars.push(c);
            }
        }
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as i64))
            .collect();

        // Room for the SOS/EOS markers around a full-length sentence.
        Self {
            chars,
            index,
            maxlen: max_text_length + 2,
        }
    }
}

impl TextTokenizer for CharsetTokenizer {
    fn vocab_size(&self) -> i64 {
        self.chars.len() as i64
    }

    fn maxlen(&self) -> usize {
        self.maxlen
    }

    fn sos(&self) -> i64 {
        SOS_ID
    }

    fn eos(&self) -> i64 {
        EOS_ID
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(text
            .chars()
            .map(|c| self.index.get(&c).copied().unwrap_or(UNK_ID))
            .collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut text = String::with_capacity(ids.len());
        for &id in ids {
            match id {
                PAD_ID | UNK_ID | SOS_ID | EOS_ID => {}
                _ => {
                    let c = usize::try_from(id)
                        .ok()
                        .and_then(|i| self.chars.get(i))
                        .ok_or_else(|| Error::Tokenizer(format!("id {} is outside the vocabulary", id)))?;
                    text.push(*c);
                }
            }
        }
        Ok(text)
    }
}

/// Adapter exposing a Hugging Face `tokenizers::Tokenizer` as a [`TextTokenizer`].
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    maxlen: usize,
    sos: i64,
    eos: i64,
}

impl HfTokenizer {
    /// Wraps a tokenizer, resolving the special tokens by their string form.
    /// The pad token must map to id 0.
    pub fn new(
        inner: tokenizers::Tokenizer,
        pad_token: &str,
        sos_token: &str,
        eos_token: &str,
        maxlen: usize,
    ) -> Result<Self> {
        let lookup = |token: &str| {
            inner
                .token_to_id(token)
                .map(i64::from)
                .ok_or_else(|| Error::Tokenizer(format!("special token `{}` is not in the vocabulary", token)))
        };

        let pad = lookup(pad_token)?;
        if pad != PAD_ID {
            return Err(Error::Tokenizer(format!(
                "pad token `{}` has id {}, expected {}",
                pad_token, pad, PAD_ID
            )));
        }
        let sos = lookup(sos_token)?;
        let eos = lookup(eos_token)?;

        Ok(Self { inner, maxlen, sos, eos })
    }

    pub fn from_file<P: AsRef<Path>>(
        path: P,
        pad_token: &str,
        sos_token: &str,
        eos_token: &str,
        maxlen: usize,
    ) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e: tokenizers::Error| Error::Tokenizer(e.to_string()))?;
        Self::new(inner, pad_token, sos_token, eos_token, maxlen)
    }
}

impl TextTokenizer for HfTokenizer {
    fn vocab_size(&self) -> i64 {
        self.inner.get_vocab_size(true) as i64
    }

    fn maxlen(&self) -> usize {
        self.maxlen
    }

    fn sos(&self) -> i64 {
        self.sos
    }

    fn eos(&self) -> i64 {
        self.eos
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e: tokenizers::Error| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| u32::try_from(id).map_err(|_| Error::Tokenizer(format!("negative token id {}", id))))
            .collect::<Result<Vec<u32>>>()?;
        self.inner
            .decode(&ids, true)
            .map_err(|e: tokenizers::Error| Error::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHARSET;

    #[test]
    fn test_charset_round_trip() -> Result<()> {
        let tokenizer = CharsetTokenizer::new(DEFAULT_CHARSET, 32);
        let text = "Hello, World!";
        let ids = tokenizer.encode(text)?;
        assert_eq!(ids.len(), text.len());
        assert!(ids.iter().all(|&id| id > EOS_ID));
        assert_eq!(tokenizer.decode(&ids)?, text);
        Ok(())
    }

    #[test]
    fn test_charset_special_tokens() -> Result<()> {
        let tokenizer = CharsetTokenizer::new("abc", 10);
        assert_eq!(tokenizer.vocab_size(), 7);
        assert_eq!(tokenizer.maxlen(), 12);

        let mut ids = vec![tokenizer.sos()];
        ids.extend(tokenizer.encode("cab")?);
        ids.push(tokenizer.eos());
        ids.extend([PAD_ID, PAD_ID]);
        assert_eq!(tokenizer.decode(&ids)?, "cab");
        Ok(())
    }

    #[test]
    fn test_charset_unknown_and_invalid() -> Result<()> {
        let tokenizer = CharsetTokenizer::new("ab", 10);
        assert_eq!(tokenizer.encode("az")?, vec![4, UNK_ID]);
        assert!(tokenizer.decode(&[42]).is_err());
        assert!(tokenizer.decode(&[-1]).is_err());
        Ok(())
    }

    #[test]
    fn test_hf_tokenizer_special_ids() -> Result<()> {
        use tokenizers::models::wordlevel::WordLevel;

        let vocab: HashMap<String, u32> = [("[PAD]", 0), ("[UNK]", 1), ("[SOS]", 2), ("[EOS]", 3), ("hello", 4), ("world", 5)]
            .into_iter()
            .map(|(token, id)| (token.to_string(), id))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();

        let tokenizer = HfTokenizer::new(tokenizers::Tokenizer::new(model), "[PAD]", "[SOS]", "[EOS]", 16)?;
        assert_eq!(tokenizer.vocab_size(), 6);
        assert_eq!(tokenizer.sos(), 2);
        assert_eq!(tokenizer.eos(), 3);
        assert_eq!(tokenizer.decode(&[4, 5])?, "hello world");

        let model = WordLevel::builder()
            .vocab([("a".to_string(), 0), ("[PAD]".to_string(), 1)].into_iter().collect())
            .unk_token("a".to_string())
            .build()
            .unwrap();
        assert!(HfTokenizer::new(tokenizers::Tokenizer::new(model), "[PAD]", "a", "a", 4).is_err());
        Ok(())
    }
}
