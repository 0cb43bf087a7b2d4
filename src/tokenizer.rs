//! Byte-Level BPE Tokenizer
//!
//! Byte Pair Encoding over raw UTF-8 bytes. The vocabulary always starts with
//! the 256 single-byte tokens, so every string is encodable without an
//! unknown token.
//!
//! Text is NFKC-normalized before training and encoding, so compatibility
//! variants (ligatures, full-width forms, circled digits) share tokens with
//! their plain forms. `decode(encode(s)) == s` therefore holds for
//! NFKC-normal input; other input decodes to its normal form.
//!
//! ## Training
//!
//! 1. NFKC-normalize each text and split it into words. A word starts at the
//!    first whitespace character after non-whitespace, so `"to be"` becomes
//!    `["to", " be"]`.
//! 2. Count word frequencies, reading the corpus `batch_size` texts at a time.
//! 3. Repeatedly merge the most frequent adjacent token pair (weighted by
//!    word frequency) into a new token, until the vocabulary reaches the
//!    target size or no pair occurs at least twice.
//!
//! Ties are broken by the smallest `(left, right)` id pair, so training is
//! deterministic regardless of hash-map iteration order.
//!
//! ## Encoding
//!
//! Each word is encoded independently by applying merges in the order they
//! were learned (lowest rank first). Large inputs are encoded word-parallel.
//!
//! ## Serialization
//!
//! Only the merge list is stored (as JSON); the byte pieces of every token are
//! rebuilt from it on load.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use unicode_normalization::{is_nfkc_quick, IsNormalized, UnicodeNormalization};

use crate::error::{LumiereError, Result};

/// Number of single-byte base tokens
pub const BYTE_TOKENS: usize = 256;

/// Pairs seen fewer times than this are never merged
const MIN_PAIR_FREQUENCY: usize = 2;

/// Inputs longer than this (in bytes) are encoded in parallel
const PARALLEL_ENCODE_BYTES: usize = 100_000;

/// A trained (or untrained, byte-only) BPE tokenizer
#[derive(Clone, Debug)]
pub struct BpeTokenizer {
    /// Merge rules in the order they were learned; merge `i` creates token `256 + i`
    merges: Vec<(u32, u32)>,
    /// Byte content of every token id
    pieces: Vec<Vec<u8>>,
    /// `(left, right) -> (rank, merged id)`
    ranks: HashMap<(u32, u32), (usize, u32)>,
}

/// On-disk representation
#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    merges: Vec<(u32, u32)>,
}

impl Default for BpeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BpeTokenizer {
    /// Byte-only tokenizer with no merges (vocabulary size 256)
    pub fn new() -> Self {
        Self {
            merges: Vec::new(),
            pieces: (0..=255u8).map(|b| vec![b]).collect(),
            ranks: HashMap::new(),
        }
    }

    /// Rebuild a tokenizer from a merge list
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a merge refers to a token that does not exist yet.
    pub fn from_merges(merges: Vec<(u32, u32)>) -> Result<Self> {
        let mut tokenizer = Self::new();
        for (left, right) in merges {
            let known = tokenizer.pieces.len() as u32;
            if left >= known || right >= known {
                return Err(LumiereError::InvalidArgument(format!(
                    "merge ({}, {}) refers to an unknown token (vocabulary has {})",
                    left, right, known
                )));
            }
            tokenizer.push_merge((left, right));
        }
        Ok(tokenizer)
    }

    /// Train a tokenizer on a corpus
    ///
    /// # Arguments
    ///
    /// * `texts` - Corpus, one string per record
    /// * `batch_size` - Number of records counted per chunk
    /// * `vocab_size` - Target vocabulary size (values `<= 256` learn nothing)
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `batch_size` is zero.
    pub fn train<I, S>(texts: I, batch_size: usize, vocab_size: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str> + Sync,
    {
        if batch_size == 0 {
            return Err(LumiereError::InvalidArgument(
                "tokenizer batch_size must be positive".to_string(),
            ));
        }

        let mut word_counts: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut chunk: Vec<S> = Vec::with_capacity(batch_size);
        for text in texts {
            chunk.push(text);
            if chunk.len() == batch_size {
                count_words(&chunk, &mut word_counts);
                chunk.clear();
            }
        }
        count_words(&chunk, &mut word_counts);

        log::info!(
            "Training BPE tokenizer: {} distinct words, target vocab {}",
            word_counts.len(),
            vocab_size
        );

        let mut words: Vec<(Vec<u32>, usize)> = word_counts
            .into_iter()
            .map(|(bytes, count)| (bytes.into_iter().map(u32::from).collect(), count))
            .collect();

        let mut tokenizer = Self::new();
        let num_merges = vocab_size.saturating_sub(BYTE_TOKENS);

        for merge_idx in 0..num_merges {
            let pair_counts = words
                .par_iter()
                .fold(HashMap::new, |mut counts: HashMap<(u32, u32), usize>, (word, freq)| {
                    for pair in word.windows(2) {
                        *counts.entry((pair[0], pair[1])).or_insert(0) += freq;
                    }
                    counts
                })
                .reduce(HashMap::new, |mut a, b| {
                    for (pair, count) in b {
                        *a.entry(pair).or_insert(0) += count;
                    }
                    a
                });

            // Highest count, then smallest pair
            let best = pair_counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            let (pair, count) = match best {
                Some(best) if best.1 >= MIN_PAIR_FREQUENCY => best,
                _ => break,
            };

            let new_id = tokenizer.push_merge(pair);
            words
                .par_iter_mut()
                .for_each(|(word, _)| merge_pair(word, pair, new_id));

            if merge_idx % 50 == 0 {
                log::debug!(
                    "Merge {}/{}: {:?} (count: {}) -> vocab size {}",
                    merge_idx + 1,
                    num_merges,
                    pair,
                    count,
                    tokenizer.vocab_size()
                );
            }
        }

        log::info!(
            "Tokenizer trained: {} merges, vocab size {}",
            tokenizer.merges.len(),
            tokenizer.vocab_size()
        );
        Ok(tokenizer)
    }

    fn push_merge(&mut self, pair: (u32, u32)) -> u32 {
        let new_id = self.pieces.len() as u32;
        let mut piece = self.pieces[pair.0 as usize].clone();
        piece.extend_from_slice(&self.pieces[pair.1 as usize]);
        self.pieces.push(piece);
        self.ranks.insert(pair, (self.merges.len(), new_id));
        self.merges.push(pair);
        new_id
    }

    /// Number of tokens (256 + number of merges)
    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    /// Byte content of a token, if the id exists
    pub fn token_bytes(&self, id: u32) -> Option<&[u8]> {
        self.pieces.get(id as usize).map(Vec::as_slice)
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let text = normalize(text);
        let words = split_words(&text);
        let encoded: Vec<Vec<u32>> = if text.len() > PARALLEL_ENCODE_BYTES {
            words.par_iter().map(|w| self.encode_word(w)).collect()
        } else {
            words.iter().map(|w| self.encode_word(w)).collect()
        };
        encoded.into_iter().flatten().map(i64::from).collect()
    }

    fn encode_word(&self, word: &str) -> Vec<u32> {
        let mut tokens: Vec<u32> = word.bytes().map(u32::from).collect();
        loop {
            let next = tokens
                .windows(2)
                .filter_map(|p| self.ranks.get(&(p[0], p[1])).map(|&r| ((p[0], p[1]), r)))
                .min_by_key(|(_, (rank, _))| *rank);
            match next {
                Some((pair, (_, new_id))) => merge_pair(&mut tokens, pair, new_id),
                None => return tokens,
            }
        }
    }

    /// Decode token ids back to text
    ///
    /// Invalid UTF-8 (only possible for id sequences that no text encodes to)
    /// is replaced with U+FFFD.
    ///
    /// # Errors
    ///
    /// `TokenOutOfRange` for an id outside the vocabulary.
    pub fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len() * 2);
        for &id in ids {
            let piece = usize::try_from(id)
                .ok()
                .and_then(|i| self.pieces.get(i))
                .ok_or(LumiereError::TokenOutOfRange {
                    token: id,
                    vocab_size: self.vocab_size(),
                })?;
            bytes.extend_from_slice(piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Save the merge list as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = TokenizerFile {
            merges: self.merges.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Parse a tokenizer from its JSON form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_slice(bytes)?;
        Self::from_merges(file.merges)
    }
}

/// NFKC form of `text`, borrowed when it is already normal
fn normalize(text: &str) -> Cow<'_, str> {
    match is_nfkc_quick(text.chars()) {
        IsNormalized::Yes => Cow::Borrowed(text),
        _ => Cow::Owned(text.nfkc().collect()),
    }
}

/// Split text into words that each carry their leading whitespace
fn split_words(text: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;
    let mut prev_whitespace = true;
    for (i, ch) in text.char_indices() {
        let whitespace = ch.is_whitespace();
        if whitespace && !prev_whitespace && i > start {
            words.push(&text[start..i]);
            start = i;
        }
        prev_whitespace = whitespace;
    }
    if start < text.len() {
        words.push(&text[start..]);
    }
    words
}

fn count_words<S: AsRef<str> + Sync>(texts: &[S], counts: &mut HashMap<Vec<u8>, usize>) {
    let chunk_counts = texts
        .par_iter()
        .fold(HashMap::new, |mut local: HashMap<Vec<u8>, usize>, text| {
            let text = normalize(text.as_ref());
            for word in split_words(&text) {
                *local.entry(word.as_bytes().to_vec()).or_insert(0) += 1;
            }
            local
        })
        .reduce(HashMap::new, |mut a, b| {
            for (word, count) in b {
                *a.entry(word).or_insert(0) += count;
            }
            a
        });
    for (word, count) in chunk_counts {
        *counts.entry(word).or_insert(0) += count;
    }
}

/// Replace every non-overlapping occurrence of `pair` (left to right)
fn merge_pair(word: &mut Vec<u32>, pair: (u32, u32), new_id: u32) {
    if word.len() < 2 {
        return;
    }
    let mut merged = Vec::with_capacity(word.len());
    let mut i = 0;
    while i < word.len() {
        if i + 1 < word.len() && word[i] == pair.0 && word[i + 1] == pair.1 {
            merged.push(new_id);
            i += 2;
        } else {
            merged.push(word[i]);
            i += 1;
        }
    }
    *word = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_byte_roundtrip() {
        let tokenizer = BpeTokenizer::new();
        for text in [
            "hello",
            "Hello, world!",
            "newline\nand\ttab",
            "UTF-8: café, naïve, 日本語",
            "",
        ] {
            let ids = tokenizer.encode(text);
            assert_eq!(ids.len(), text.len());
            assert_eq!(tokenizer.decode(&ids).unwrap(), text);
        }
    }

    #[test]
    fn test_compatibility_forms_are_normalized() {
        let tokenizer = BpeTokenizer::train(["fine fine fine"], 1, 260).unwrap();
        // U+FB01 ligature, full-width letters, decomposed e + combining acute
        assert_eq!(tokenizer.encode("\u{FB01}ne"), tokenizer.encode("fine"));
        assert_eq!(tokenizer.encode("\u{FF21}\u{FF22}"), tokenizer.encode("AB"));
        assert_eq!(tokenizer.encode("cafe\u{301}"), tokenizer.encode("caf\u{E9}"));
        assert_eq!(tokenizer.decode(&tokenizer.encode("\u{2460}\u{FB01}")).unwrap(), "1fi");

        // Normal input is unchanged
        let text = "caf\u{E9} fine";
        assert_eq!(tokenizer.decode(&tokenizer.encode(text)).unwrap(), text);
    }

    #[test]
    fn test_split_words_keeps_leading_space() {
        assert_eq!(split_words("to be  or"), vec!["to", " be", "  or"]);
        assert_eq!(split_words("  lead"), vec!["  lead"]);
        assert_eq!(split_words("a\nb").concat(), "a\nb");
    }

    #[test]
    fn test_train_learns_expected_merges() {
        let tokenizer = BpeTokenizer::train(["aaab aaab"], 1, 258).unwrap();
        assert_eq!(tokenizer.vocab_size(), 258);
        assert_eq!(tokenizer.token_bytes(256), Some(&b"aa"[..]));
        // (a, b) and (aa, a) both occur twice; the smaller pair wins
        assert_eq!(tokenizer.token_bytes(257), Some(&b"ab"[..]));
        assert_eq!(tokenizer.encode("aaab"), vec![256, 257]);
    }

    #[test]
    fn test_train_roundtrip_and_determinism() {
        let corpus = vec![
            "to be or not to be",
            "that is the question",
            "whether tis nobler in the mind to suffer",
        ];
        let a = BpeTokenizer::train(corpus.clone(), 2, 300).unwrap();
        let b = BpeTokenizer::train(corpus, 1, 300).unwrap();
        assert_eq!(a.merges, b.merges);
        assert!(a.vocab_size() > BYTE_TOKENS && a.vocab_size() <= 300);

        let text = "to be, or not to be: the question";
        let ids = a.encode(text);
        assert!(ids.len() < text.len());
        assert_eq!(a.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_rare_pairs_are_not_merged() {
        let tokenizer = BpeTokenizer::train(["abcdefg"], 4, 1000).unwrap();
        assert_eq!(tokenizer.vocab_size(), BYTE_TOKENS);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = BpeTokenizer::train(["text"], 0, 300);
        assert!(matches!(result, Err(LumiereError::InvalidArgument(_))));
    }

    #[test]
    fn test_decode_out_of_range() {
        let tokenizer = BpeTokenizer::new();
        assert!(matches!(
            tokenizer.decode(&[104, 256]),
            Err(LumiereError::TokenOutOfRange { token: 256, .. })
        ));
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_save_load() {
        let tokenizer = BpeTokenizer::train(["hello hello world world hello"], 8, 270).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        tokenizer.save(&path).unwrap();

        let loaded = BpeTokenizer::load(&path).unwrap();
        assert_eq!(loaded.vocab_size(), tokenizer.vocab_size());
        assert_eq!(loaded.encode("hello world"), tokenizer.encode("hello world"));
    }

    #[test]
    fn test_from_bytes_rejects_forward_references() {
        assert!(BpeTokenizer::from_bytes(br#"{"merges": [[104, 105]]}"#).is_ok());
        assert!(BpeTokenizer::from_bytes(br#"{"merges": [[104, 300]]}"#).is_err());
        assert!(BpeTokenizer::from_bytes(b"not json").is_err());
    }
}
