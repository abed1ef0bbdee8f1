//! Text normalisation ahead of synthesis: cleanup, word rewrites,
//! sentence segmentation and the model-side cleaners named in model configs.

use deunicode::deunicode;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref UNSUPPORTED: Regex = Regex::new(r#"[^\p{L}\p{N}\s.,!?;:'"()\-]"#).unwrap();
    static ref AUX_SYMBOLS: Regex = Regex::new(r#"[<>()\[\]"]+"#).unwrap();
    static ref ABBREVIATIONS: Vec<(Regex, &'static str)> = [
        ("mrs", "misess"),
        ("mr", "mister"),
        ("dr", "doctor"),
        ("st", "saint"),
        ("co", "company"),
        ("jr", "junior"),
        ("maj", "major"),
        ("gen", "general"),
        ("drs", "doctors"),
        ("rev", "reverend"),
        ("lt", "lieutenant"),
        ("hon", "honorable"),
        ("sgt", "sergeant"),
        ("capt", "captain"),
        ("esq", "esquire"),
        ("ltd", "limited"),
        ("col", "colonel"),
        ("ft", "fort"),
    ]
    .iter()
    .map(|(abbr, full)| (Regex::new(&format!(r"(?i)\b{}\.", abbr)).unwrap(), *full))
    .collect();
}

/// Words that end in a period without ending the sentence.
const NON_TERMINAL: &[&str] = &[
    "mr", "mrs", "ms", "dr", "st", "jr", "sr", "prof", "vs", "etc", "e.g", "i.e", "no", "co",
    "ltd", "inc", "mt", "capt", "col", "gen", "lt", "sgt", "rev", "hon",
];

/// General cleanup applied when a caller asks for `clean_text`.
///
/// Typographic quotes and dashes are folded to their ASCII forms, characters
/// outside letters, digits and basic punctuation are dropped and whitespace
/// is collapsed. Non-ASCII letters survive so multilingual input is kept.
pub fn cleanup_text_for_tts(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => '"',
            '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
            '\u{2026}' => '.',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let stripped = UNSUPPORTED.replace_all(&folded, " ");
    collapse_whitespace(&stripped)
}

/// Applies `rewrites` in order, each as a plain substring replacement.
pub fn rewrite_words(text: &str, rewrites: &[(String, String)]) -> String {
    rewrites
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Splits text into sentences on `.`, `!`, `?` and `…` followed by
/// whitespace. Abbreviations and single-letter initials do not end a
/// sentence. Terminal punctuation stays attached to its sentence.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if !matches!(c, '.' | '!' | '?' | '…') {
            continue;
        }
        // Swallow runs like "?!" or "..." and closing quotes.
        while let Some(&next) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '…' | '"' | '\'' | ')') {
                current.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let at_boundary = chars.peek().map_or(true, |n| n.is_whitespace());
        if at_boundary && !(c == '.' && ends_with_abbreviation(&current)) {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let sentence = collapse_whitespace(raw);
    if !sentence.is_empty() {
        sentences.push(sentence);
    }
}

fn ends_with_abbreviation(current: &str) -> bool {
    let last_word = current
        .trim_end_matches('.')
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    let lower = last_word.to_lowercase();
    if NON_TERMINAL.contains(&lower.as_str()) {
        return true;
    }
    // Single initials such as "J." in "J. Chaim Reus".
    let mut letters = last_word.chars();
    matches!((letters.next(), letters.next()), (Some(l), None) if l.is_uppercase())
}

/// Runs the cleaner pipeline named by a model config's `text_cleaner`.
/// Unknown names fall back to `basic_cleaners`.
pub fn clean_for_model(text: &str, cleaner: Option<&str>) -> String {
    match cleaner.unwrap_or("basic_cleaners") {
        "english_cleaners" => {
            let text = deunicode(text).to_lowercase();
            let text = expand_abbreviations(&text);
            collapse_whitespace(&text)
        }
        "phoneme_cleaners" => {
            let text = expand_abbreviations(text);
            let text = replace_symbols(&text);
            let text = AUX_SYMBOLS.replace_all(&text, "");
            collapse_whitespace(&text)
        }
        "multilingual_cleaners" => {
            let text = replace_symbols(&text.to_lowercase());
            let text = AUX_SYMBOLS.replace_all(&text, "");
            collapse_whitespace(&text)
        }
        "basic_cleaners" => collapse_whitespace(&text.to_lowercase()),
        other => {
            tracing::debug!("Unknown text cleaner '{}', using basic_cleaners", other);
            collapse_whitespace(&text.to_lowercase())
        }
    }
}

fn expand_abbreviations(text: &str) -> String {
    ABBREVIATIONS
        .iter()
        .fold(text.to_string(), |acc, (re, full)| {
            re.replace_all(&acc, *full).into_owned()
        })
}

fn replace_symbols(text: &str) -> String {
    text.replace(';', ",")
        .replace('-', " ")
        .replace(':', ",")
        .replace('&', " and ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_basic_sentences() {
        let s = split_into_sentences("Hello there. How are you? I am fine!");
        assert_eq!(s, vec!["Hello there.", "How are you?", "I am fine!"]);
    }

    #[test]
    fn test_split_keeps_abbreviations_and_initials() {
        let s = split_into_sentences("Dr. Smith met J. Chaim Reus. They talked.");
        assert_eq!(s, vec!["Dr. Smith met J. Chaim Reus.", "They talked."]);
    }

    #[test]
    fn test_split_without_terminal_punctuation() {
        let s = split_into_sentences("  no punctuation here  ");
        assert_eq!(s, vec!["no punctuation here"]);
        assert!(split_into_sentences("   ").is_empty());
    }

    #[test]
    fn test_split_decimal_is_not_boundary() {
        let s = split_into_sentences("It costs 3.50 today. Cheap?!");
        assert_eq!(s, vec!["It costs 3.50 today.", "Cheap?!"]);
    }

    #[test]
    fn test_cleanup_folds_typography() {
        let cleaned = cleanup_text_for_tts("\u{201C}Hi\u{201D} \u{2014} it\u{2019}s   me\u{2026} #1");
        assert_eq!(cleaned, "\"Hi\" - it's me. 1");
    }

    #[test]
    fn test_cleanup_keeps_non_ascii_letters() {
        assert_eq!(cleanup_text_for_tts("Grüße   aus Köln"), "Grüße aus Köln");
    }

    #[test]
    fn test_rewrite_words_in_order() {
        let rewrites = vec![
            ("Shibboleth".to_string(), "Shibbo-leth".to_string()),
            ("leth".to_string(), "lett".to_string()),
        ];
        assert_eq!(rewrite_words("A Shibboleth", &rewrites), "A Shibbo-lett");
    }

    #[test]
    fn test_english_cleaners() {
        assert_eq!(
            clean_for_model("Mr. Müller   and Dr. Who", Some("english_cleaners")),
            "mister muller and doctor who"
        );
    }

    #[test]
    fn test_phoneme_cleaners_replace_symbols() {
        assert_eq!(
            clean_for_model("Rock & roll; (loud)", Some("phoneme_cleaners")),
            "Rock and roll, loud"
        );
    }
}
