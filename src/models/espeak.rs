use super::SynthError;
use lazy_static::lazy_static;
use regex::Regex;
use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Marks espeak would swallow; they are cut out before phonemisation and
/// put back between the phonemised segments.
const PUNCTUATIONS: &str = ";:,.!?¡¿—…\"«»“”";

lazy_static! {
    static ref PUNCTUATION_RUN: Regex =
        Regex::new(&format!(r"(\s*[{}]+\s*)+", regex::escape(PUNCTUATIONS)))
            .unwrap();
}

/// Text-to-IPA conversion through the `espeak-ng` executable.
#[derive(Debug, Clone)]
pub struct EspeakPhonemizer {
    binary: String,
    timeout: Duration,
}

impl Default for EspeakPhonemizer {
    fn default() -> Self {
        Self::new("espeak-ng", Duration::from_secs(5))
    }
}

impl EspeakPhonemizer {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    /// Phonemises each stretch of text between punctuation marks and
    /// rejoins the pieces with the original marks.
    pub fn phonemize(&self, text: &str, language: &str) -> Result<String, SynthError> {
        phonemize_segments(text, |segment| self.run(segment, language))
    }

    fn run(&self, text: &str, language: &str) -> Result<String, SynthError> {
        let mut child = Command::new(&self.binary)
            .arg("-q")
            .arg("-b")
            .arg("1")
            .arg("-v")
            .arg(language)
            .arg("--ipa=1")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SynthError::Phonemizer(format!(
                    "{} not found. Install espeak-ng or set espeak_binary",
                    self.binary
                )),
                _ => SynthError::Io(e),
            })?;

        // Drain both pipes while waiting so a long output cannot fill them.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SynthError::Phonemizer(format!(
                    "espeak timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if status.success() {
            Ok(postprocess_ipa(&String::from_utf8_lossy(&stdout)))
        } else {
            Err(SynthError::Phonemizer(format!(
                "espeak error: {}",
                String::from_utf8_lossy(&stderr)
            )))
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Splits `text` on punctuation runs, converts every non-blank segment with
/// `convert` and puts each run back verbatim between the results.
fn phonemize_segments(
    text: &str,
    mut convert: impl FnMut(&str) -> Result<String, SynthError>,
) -> Result<String, SynthError> {
    let mut out = String::with_capacity(text.len() * 2);
    let mut last = 0;
    for mark in PUNCTUATION_RUN.find_iter(text) {
        push_segment(&mut out, &text[last..mark.start()], &mut convert)?;
        out.push_str(mark.as_str());
        last = mark.end();
    }
    push_segment(&mut out, &text[last..], &mut convert)?;
    Ok(out.trim().to_string())
}

fn push_segment(
    out: &mut String,
    segment: &str,
    convert: &mut impl FnMut(&str) -> Result<String, SynthError>,
) -> Result<(), SynthError> {
    let segment = segment.trim();
    if !segment.is_empty() {
        out.push_str(&convert(segment)?);
    }
    Ok(())
}

/// espeak marks ties with `_` and may split a clause over several lines.
fn postprocess_ipa(raw: &str) -> String {
    raw.lines()
        .map(|l| l.trim().replace('_', ""))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shout(segment: &str) -> Result<String, SynthError> {
        Ok(segment.to_uppercase())
    }

    #[test]
    fn test_postprocess_strips_ties_and_joins_lines() {
        assert_eq!(postprocess_ipa(" həlˈoʊ_ wˈɜːld\n"), "həlˈoʊ wˈɜːld");
        assert_eq!(postprocess_ipa("a\n\nb\n"), "a b");
    }

    #[test]
    fn test_every_punctuation_mark_is_kept() {
        assert_eq!(
            phonemize_segments("Hello, world. Bye", shout).unwrap(),
            "HELLO, WORLD. BYE"
        );
        assert_eq!(
            phonemize_segments("¿Qué tal? Bien; gracias!", shout).unwrap(),
            "¿QUÉ TAL? BIEN; GRACIAS!"
        );
    }

    #[test]
    fn test_segments_are_converted_separately() {
        let mut seen = Vec::new();
        phonemize_segments("one, two... three", |s| {
            seen.push(s.to_string());
            Ok(s.to_string())
        })
        .unwrap();
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_punctuation_only_text() {
        let out = phonemize_segments("...", |_| panic!("nothing to convert")).unwrap();
        assert_eq!(out, "...");
    }

    #[cfg(unix)]
    #[test]
    fn test_output_larger_than_pipe_buffer() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-espeak");
        std::fs::write(&script, "#!/bin/sh\nhead -c 200000 /dev/zero | tr '\\0' 'a'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let p = EspeakPhonemizer::new(script.to_str().unwrap(), Duration::from_secs(10));
        let ipa = p.phonemize("hello", "en-us").unwrap();
        assert_eq!(ipa.len(), 200000);
    }

    #[test]
    fn test_missing_binary_is_phonemizer_error() {
        let p = EspeakPhonemizer::new("definitely-not-espeak-xyz", Duration::from_secs(1));
        match p.phonemize("hello", "en-us") {
            Err(SynthError::Phonemizer(msg)) => assert!(msg.contains("not found")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
