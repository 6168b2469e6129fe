//! Domain word and pattern lists applied to recognized text
//!
//! Tesseract reads `user_words_file` / `user_patterns_file` only while it
//! loads its dictionaries during init, which leptess does not expose. The
//! lists are applied here instead, as a correction pass over each
//! alphanumeric token of the engine output.

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use strsim::levenshtein;
use tracing::{debug, warn};

/// Shortest token eligible for dictionary snapping
const MIN_WORD_LEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct Lexicon {
    /// Lowercased dictionary entries
    words: HashSet<String>,
    patterns: Vec<Regex>,
}

impl Lexicon {
    pub fn new<I, S>(words: I, patterns: &[&str]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                let compiled = pattern_to_regex(p);
                if compiled.is_none() {
                    warn!("Skipping unreadable OCR pattern {:?}", p);
                }
                compiled
            })
            .collect();
        Self { words, patterns }
    }

    /// Load the word list and pattern list, one entry per line
    ///
    /// Unreadable files are logged and contribute nothing.
    pub fn load(words: Option<&Path>, patterns: Option<&Path>) -> Self {
        let read_lines = |path: Option<&Path>| -> Vec<String> {
            let Some(path) = path else {
                return Vec::new();
            };
            match std::fs::read_to_string(path) {
                Ok(content) => content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    Vec::new()
                }
            }
        };

        let pattern_lines = read_lines(patterns);
        let pattern_refs: Vec<&str> = pattern_lines.iter().map(String::as_str).collect();
        Self::new(read_lines(words), &pattern_refs)
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.patterns.is_empty()
    }

    /// Correct every alphanumeric token; separators are kept as-is
    pub fn correct_text(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len());
        let mut token = String::new();
        for ch in text.chars() {
            if ch.is_ascii_alphanumeric() {
                token.push(ch);
                continue;
            }
            if !token.is_empty() {
                result.push_str(self.correct_token(&token).as_deref().unwrap_or(&token));
                token.clear();
            }
            result.push(ch);
        }
        if !token.is_empty() {
            result.push_str(self.correct_token(&token).as_deref().unwrap_or(&token));
        }
        result
    }

    /// Replacement for `token`, or None when it should stay
    pub fn correct_token(&self, token: &str) -> Option<String> {
        if self.words.contains(&token.to_lowercase()) || self.matches_pattern(token) {
            return None;
        }

        // Letter/digit confusions inside quantities, e.g. "5OOmg" -> "500mg"
        let fixed = fix_digit_confusions(token);
        if fixed != token && self.matches_pattern(&fixed) {
            debug!("OCR pattern correction: {} -> {}", token, fixed);
            return Some(fixed);
        }

        if token.len() < MIN_WORD_LEN || !token.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }

        let lower = token.to_lowercase();
        let mut candidates = self
            .words
            .iter()
            .filter(|w| w.len().abs_diff(lower.len()) <= 1 && levenshtein(w, &lower) == 1);
        let word = candidates.next()?;
        if candidates.next().is_some() {
            return None;
        }

        let corrected = match_case(token, word);
        debug!("OCR word correction: {} -> {}", token, corrected);
        Some(corrected)
    }

    fn matches_pattern(&self, token: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(token))
    }
}

/// Translate a Tesseract user pattern into an anchored regex
///
/// `\c` letter, `\d` digit, `\n` alphanumeric, `\p` punctuation, `\a` lower,
/// `\A` upper, `\*` zero or more of the previous element, `[..]` a class;
/// anything else is literal.
pub fn pattern_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'c' => out.push_str("[A-Za-z]"),
                'd' => out.push_str("[0-9]"),
                'n' => out.push_str("[A-Za-z0-9]"),
                'p' => out.push_str("[[:punct:]]"),
                'a' => out.push_str("[a-z]"),
                'A' => out.push_str("[A-Z]"),
                '*' => out.push('*'),
                other => out.push_str(&regex::escape(&other.to_string())),
            },
            '[' => {
                let mut class = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        ch => class.push(ch),
                    }
                }
                if class.is_empty() {
                    return None;
                }
                out.push('[');
                for ch in class.chars() {
                    if matches!(ch, '\\' | '[' | ']' | '^' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');

    Regex::new(&out).ok()
}

fn digit_for(c: char) -> Option<char> {
    match c {
        'O' | 'o' | 'Q' => Some('0'),
        'l' | 'I' => Some('1'),
        'Z' | 'z' => Some('2'),
        'S' | 's' => Some('5'),
        'B' => Some('8'),
        _ => None,
    }
}

/// Replace look-alike letters that touch a digit, spreading along runs
fn fix_digit_confusions(token: &str) -> String {
    let mut chars: Vec<char> = token.chars().collect();
    loop {
        let mut changed = false;
        for i in 0..chars.len() {
            let Some(digit) = digit_for(chars[i]) else {
                continue;
            };
            let before = i > 0 && chars[i - 1].is_ascii_digit();
            let after = i + 1 < chars.len() && chars[i + 1].is_ascii_digit();
            if before || after {
                chars[i] = digit;
                changed = true;
            }
        }
        if !changed {
            return chars.into_iter().collect();
        }
    }
}

fn match_case(original: &str, word: &str) -> String {
    if original.chars().all(|c| c.is_ascii_uppercase()) {
        word.to_uppercase()
    } else if original.starts_with(|c: char| c.is_ascii_uppercase()) {
        let mut chars = word.chars();
        chars
            .next()
            .map(|first| first.to_ascii_uppercase().to_string() + chars.as_str())
            .unwrap_or_default()
    } else {
        word.to_string()
    }
}
