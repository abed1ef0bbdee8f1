//! Text to token ids, following the vocabulary in a model config.

use super::config::{CharactersConfig, TtsConfig};
use super::espeak::EspeakPhonemizer;
use super::SynthError;
use crate::text::clean_for_model;
use std::collections::HashMap;

pub struct TtsTokenizer {
    vocab: HashMap<String, i64>,
    use_phonemes: bool,
    phoneme_language: String,
    cleaner: Option<String>,
    add_blank: bool,
    blank_id: Option<i64>,
    bos_eos: Option<(i64, i64)>,
    phonemizer: EspeakPhonemizer,
}

fn non_empty(token: &Option<String>) -> Option<&str> {
    token.as_deref().filter(|t| !t.is_empty())
}

/// Blank symbol VITS vocabularies always end with.
pub const VITS_BLANK: &str = "<BLNK>";

fn is_vits(chars: &CharactersConfig) -> bool {
    chars
        .characters_class
        .as_deref()
        .is_some_and(|c| c.ends_with("VitsCharacters"))
}

/// Symbol list in id order.
///
/// VITS vocabularies are `pad, punctuations, characters + phonemes, <BLNK>`
/// in config order, never sorted, whatever `use_phonemes` says. The default
/// layout prefixes the special tokens to the (optionally sorted) alphabet
/// and appends punctuation.
pub fn build_vocab(chars: &CharactersConfig, use_phonemes: bool) -> Vec<String> {
    let punctuations = chars.punctuations.chars().map(String::from);

    if is_vits(chars) {
        let letters = chars
            .characters
            .chars()
            .chain(chars.phonemes.as_deref().unwrap_or("").chars())
            .map(String::from);
        let mut vocab = Vec::new();
        vocab.extend(non_empty(&chars.pad).map(String::from));
        vocab.extend(punctuations);
        vocab.extend(letters);
        vocab.push(VITS_BLANK.to_string());
        return vocab;
    }

    let alphabet = if use_phonemes {
        chars.phonemes.as_deref().unwrap_or(&chars.characters)
    } else {
        &chars.characters
    };
    let mut symbols: Vec<char> = alphabet.chars().collect();
    if chars.is_unique {
        let mut seen = std::collections::HashSet::new();
        symbols.retain(|c| seen.insert(*c));
    }
    if chars.is_sorted {
        symbols.sort_unstable();
    }

    let mut vocab = Vec::new();
    vocab.extend(non_empty(&chars.pad).map(String::from));
    vocab.extend(non_empty(&chars.eos).map(String::from));
    vocab.extend(non_empty(&chars.bos).map(String::from));
    vocab.extend(non_empty(&chars.blank).map(String::from));
    vocab.extend(symbols.into_iter().map(String::from));
    vocab.extend(punctuations);
    vocab
}

impl TtsTokenizer {
    pub fn from_config(config: &TtsConfig, phonemizer: EspeakPhonemizer) -> Self {
        let chars = config.characters.clone().unwrap_or_default();
        let vocab: HashMap<String, i64> = build_vocab(&chars, config.use_phonemes)
            .into_iter()
            .enumerate()
            .map(|(i, s)| (s, i as i64))
            .collect();

        let lookup = |token: &Option<String>| non_empty(token).and_then(|t| vocab.get(t).copied());
        let blank_id = if is_vits(&chars) {
            vocab.get(VITS_BLANK).copied()
        } else {
            lookup(&chars.blank).or_else(|| lookup(&chars.pad))
        };
        let bos_eos = if config.enable_eos_bos_chars {
            lookup(&chars.bos).zip(lookup(&chars.eos))
        } else {
            None
        };

        Self {
            use_phonemes: config.use_phonemes,
            phoneme_language: config
                .phoneme_language
                .clone()
                .unwrap_or_else(|| "en-us".to_string()),
            cleaner: config.text_cleaner.clone(),
            add_blank: config.add_blank,
            blank_id,
            bos_eos,
            vocab,
            phonemizer,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Cleans, optionally phonemises, and maps text to ids. `language`
    /// overrides the config's phoneme language for multi-lingual models.
    pub fn text_to_ids(&self, text: &str, language: Option<&str>) -> Result<Vec<i64>, SynthError> {
        let cleaned = clean_for_model(text, self.cleaner.as_deref());
        let symbols = if self.use_phonemes {
            self.phonemizer
                .phonemize(&cleaned, language.unwrap_or(&self.phoneme_language))?
        } else {
            cleaned
        };
        Ok(self.encode(&symbols))
    }

    /// Maps characters to ids, dropping characters outside the vocabulary.
    pub fn encode(&self, symbols: &str) -> Vec<i64> {
        let mut ids = Vec::with_capacity(symbols.len());
        let mut dropped = Vec::new();
        for c in symbols.chars() {
            let mut buf = [0u8; 4];
            match self.vocab.get(&*c.encode_utf8(&mut buf)) {
                Some(&id) => ids.push(id),
                None => dropped.push(c),
            }
        }
        if !dropped.is_empty() {
            tracing::warn!("Characters not in vocabulary were discarded: {:?}", dropped);
        }

        let mut ids = match (self.add_blank, self.blank_id) {
            (true, Some(blank)) => intersperse(&ids, blank),
            _ => ids,
        };
        if let Some((bos, eos)) = self.bos_eos {
            ids.insert(0, bos);
            ids.push(eos);
        }
        ids
    }
}

/// `[b, x1, b, x2, b, ..., xn, b]`
fn intersperse(ids: &[i64], blank: i64) -> Vec<i64> {
    let mut out = vec![blank; ids.len() * 2 + 1];
    for (i, &id) in ids.iter().enumerate() {
        out[i * 2 + 1] = id;
    }
    out
}
