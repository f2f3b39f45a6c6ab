//! # Full-Text Engine
//!
//! Two index variants share one contract: feed document text per field,
//! `commit` to (re)build internal structures, then `search` a parsed DSL
//! query for `(id, proc)` matches ranked best-first.
//!
//! - [`fast`]: inverted index over stemmed, normalized tokens with
//!   BM25-derived scoring, positional boosts and bounded typo tolerance.
//! - [`fuzzy`]: trigram matcher; tolerant of arbitrary misspellings,
//!   no positions.
//!
//! ## Query DSL
//!
//! ```text
//! quick +brown -slow "exact phrase" pre* @title:term term^2.5
//! ```
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `term` | optional term, contributes to score |
//! | `+term` | required |
//! | `-term` | forbidden |
//! | `"a b"` | phrase: terms must be adjacent in order |
//! | `term*` | prefix match |
//! | `@field:term` | restrict to one field |
//! | `term^boost` | multiply the term's score contribution |

pub mod fast;
pub mod fuzzy;

use crate::error::{Error, Result};
use crate::types::IdType;

/// One ranked full-text match. `proc` is a 0..=100 relevancy percentage;
/// the aux per-id proc map downstream ranking consumes is exactly this
/// vector keyed by id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FtMatch {
    pub id: IdType,
    pub proc: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DslTerm {
    pub pattern: String,
    pub required: bool,
    pub forbidden: bool,
    pub prefix: bool,
    pub boost: f64,
    pub field: Option<String>,
    /// Position inside a phrase group, if any.
    pub phrase: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FtDsl {
    pub terms: Vec<DslTerm>,
    /// Number of phrase groups; terms reference groups by index.
    pub phrases: usize,
}

impl FtDsl {
    /// Parse the search DSL. `extra_symbols` are characters treated as part
    /// of a word in addition to alphanumerics.
    pub fn parse(input: &str, extra_symbols: &str) -> Result<FtDsl> {
        let mut dsl = FtDsl::default();
        let mut chars = input.char_indices().peekable();

        while let Some(&(start, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }
            let (required, forbidden) = match c {
                '+' => {
                    chars.next();
                    (true, false)
                }
                '-' => {
                    chars.next();
                    (false, true)
                }
                _ => (false, false),
            };
            let field = if chars.peek().is_some_and(|&(_, c)| c == '@') {
                chars.next();
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c == ':' {
                        chars.next();
                        break;
                    }
                    if c.is_whitespace() {
                        return Err(Error::parse(format!(
                            "missing ':' after field restriction at byte {start}"
                        )));
                    }
                    name.push(c);
                    chars.next();
                }
                Some(name)
            } else {
                None
            };

            if chars.peek().is_some_and(|&(_, c)| c == '"') {
                chars.next();
                let phrase_id = dsl.phrases;
                dsl.phrases += 1;
                let mut closed = false;
                let mut word = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    if c.is_whitespace() {
                        push_word(&mut dsl, &mut word, required, forbidden, &field, Some(phrase_id), extra_symbols);
                    } else {
                        word.push(c);
                    }
                }
                if !closed {
                    return Err(Error::parse(format!("unterminated phrase at byte {start}")));
                }
                push_word(&mut dsl, &mut word, required, forbidden, &field, Some(phrase_id), extra_symbols);
                continue;
            }

            let mut word = String::new();
            let mut prefix = false;
            let mut boost = 1.0f64;
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '*' {
                    prefix = true;
                } else if c == '^' {
                    let mut num = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_ascii_digit() || c == '.' {
                            num.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    boost = num
                        .parse()
                        .map_err(|_| Error::parse(format!("bad boost value '{num}'")))?;
                } else {
                    word.push(c);
                }
            }
            let word = normalize_word(&word, extra_symbols);
            if !word.is_empty() {
                dsl.terms.push(DslTerm {
                    pattern: word,
                    required,
                    forbidden,
                    prefix,
                    boost,
                    field,
                    phrase: None,
                });
            }
        }

        if dsl.terms.is_empty() {
            return Err(Error::parse("empty full-text query"));
        }
        if dsl.terms.iter().all(|t| t.forbidden) {
            return Err(Error::parse("full-text query has only forbidden terms"));
        }
        Ok(dsl)
    }
}

fn push_word(
    dsl: &mut FtDsl,
    word: &mut String,
    required: bool,
    forbidden: bool,
    field: &Option<String>,
    phrase: Option<usize>,
    extra_symbols: &str,
) {
    let normalized = normalize_word(word, extra_symbols);
    word.clear();
    if normalized.is_empty() {
        return;
    }
    dsl.terms.push(DslTerm {
        pattern: normalized,
        required,
        forbidden,
        prefix: false,
        boost: 1.0,
        field: field.clone(),
        phrase,
    });
}

fn normalize_word(word: &str, extra_symbols: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric() || extra_symbols.contains(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split field text into `(token, position)` pairs. Word characters are
/// alphanumerics plus `extra_symbols`; tokens are lowercased.
pub fn tokenize(text: &str, extra_symbols: &str) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut pos = 0u32;
    for c in text.chars() {
        if c.is_alphanumeric() || extra_symbols.contains(c) {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            out.push((std::mem::take(&mut word), pos));
            pos += 1;
        }
    }
    if !word.is_empty() {
        out.push((word, pos));
    }
    out
}

/// Bounded Damerau-Levenshtein distance for typo tolerance. Returns
/// `None` when the distance exceeds `max`.
pub fn edit_distance_within(a: &str, b: &str, max: u32) -> Option<u32> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max as usize {
        return None;
    }
    let mut prev_prev: Vec<u32> = Vec::new();
    let mut prev: Vec<u32> = (0..=b.len() as u32).collect();
    for i in 1..=a.len() {
        let mut cur = vec![i as u32; b.len() + 1];
        for j in 1..=b.len() {
            let cost = u32::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1)
                .min(cur[j - 1] + 1)
                .min(prev[j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                cur[j] = cur[j].min(prev_prev[j - 2] + 1);
            }
        }
        prev_prev = std::mem::replace(&mut prev, cur);
    }
    let d = prev[b.len()];
    (d <= max).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifiers() {
        let dsl = FtDsl::parse("quick +brown -slow", "").unwrap();
        assert_eq!(dsl.terms.len(), 3);
        assert!(dsl.terms[1].required);
        assert!(dsl.terms[2].forbidden);
        assert!(!dsl.terms[0].required && !dsl.terms[0].forbidden);
    }

    #[test]
    fn parses_phrase_prefix_boost_field() {
        let dsl = FtDsl::parse("\"hello world\" pre* @title:dune^2.5", "").unwrap();
        assert_eq!(dsl.phrases, 1);
        assert_eq!(dsl.terms[0].phrase, Some(0));
        assert_eq!(dsl.terms[1].phrase, Some(0));
        assert!(dsl.terms[2].prefix);
        let t = &dsl.terms[3];
        assert_eq!(t.field.as_deref(), Some("title"));
        assert!((t.boost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_empty_and_all_forbidden() {
        assert!(FtDsl::parse("   ", "").is_err());
        assert!(FtDsl::parse("-a -b", "").is_err());
    }

    #[test]
    fn tokenizer_honors_extra_symbols() {
        let toks = tokenize("C++ rocks, really-rocks", "+-");
        assert_eq!(toks[0].0, "c++");
        assert_eq!(toks[2].0, "really-rocks");
        let toks = tokenize("C++ rocks", "");
        assert_eq!(toks[0].0, "c");
    }

    #[test]
    fn edit_distance_counts_transpositions() {
        assert_eq!(edit_distance_within("teh", "the", 1), Some(1));
        assert_eq!(edit_distance_within("brwon", "brown", 1), Some(1));
        assert_eq!(edit_distance_within("cat", "dog", 2), None);
        assert_eq!(edit_distance_within("same", "same", 0), Some(0));
    }
}
