//! # Fuzzy Full-Text Index
//!
//! Trigram matcher: every token expands into overlapping 3-grams (with
//! boundary padding), and a query scores a document by the fraction of its
//! trigrams found there. No stemming, no positions; arbitrarily misspelled
//! input still lands near the right documents. Scores are scaled so the
//! best observed match maps to proc 100 and entries below `min_ok_proc`
//! are dropped.

use hashbrown::HashMap;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::FtFuzzyConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::index::fulltext::{FtDsl, FtMatch};
use crate::types::value::{Variant, VariantArray};
use crate::types::IdType;

#[derive(Default)]
struct Built {
    /// trigram -> (doc, occurrences), docs ascending.
    grams: HashMap<String, Vec<(IdType, u32)>>,
    doc_grams: HashMap<IdType, u32>,
}

pub struct FuzzyFtIndex {
    cfg: FtFuzzyConfig,
    docs: HashMap<IdType, Vec<(u32, String)>>,
    built: Option<Built>,
    dirty: bool,
}

impl FuzzyFtIndex {
    pub fn new(cfg: FtFuzzyConfig) -> Self {
        Self {
            cfg,
            docs: HashMap::new(),
            built: None,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.built.is_none()
    }

    pub fn vocab_len(&self) -> usize {
        self.built.as_ref().map_or(0, |b| b.grams.len())
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn upsert(&mut self, keys: &VariantArray, id: IdType) -> Result<VariantArray> {
        let mut fields = Vec::with_capacity(keys.len());
        for (field, key) in keys.iter().enumerate() {
            if let Variant::String(text) = key {
                fields.push((field as u32, text.to_string()));
            }
        }
        self.docs.insert(id, fields);
        self.dirty = true;
        Ok(keys.clone())
    }

    pub fn delete(&mut self, _keys: &VariantArray, id: IdType) -> Result<()> {
        if self.docs.remove(&id).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn commit(&mut self, ctx: &Context) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let mut built = Built::default();
        let mut ids: Vec<IdType> = self.docs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            ctx.check()?;
            let mut total = 0u32;
            for (_, text) in &self.docs[&id] {
                for gram in trigrams(text) {
                    let list = built.grams.entry(gram).or_default();
                    match list.last_mut() {
                        Some(last) if last.0 == id => last.1 += 1,
                        _ => list.push((id, 1)),
                    }
                    total += 1;
                }
            }
            built.doc_grams.insert(id, total);
        }
        self.built = Some(built);
        self.dirty = false;
        Ok(())
    }

    pub fn search(&self, dsl: &FtDsl, ctx: &Context) -> Result<Vec<FtMatch>> {
        let built = self
            .built
            .as_ref()
            .ok_or_else(|| Error::logic("full-text index is not committed"))?;
        ctx.check()?;

        let mut query_grams: Vec<String> = Vec::new();
        for term in dsl.terms.iter().filter(|t| !t.forbidden) {
            query_grams.extend(trigrams(&term.pattern));
        }
        if query_grams.is_empty() {
            return Ok(Vec::new());
        }

        let mut matched: HashMap<IdType, u32> = HashMap::new();
        for gram in &query_grams {
            if let Some(list) = built.grams.get(gram) {
                for &(id, _) in list {
                    *matched.entry(id).or_default() += 1;
                }
            }
        }

        let total = query_grams.len() as f64;
        let mut scored: Vec<(f64, IdType)> = matched
            .into_iter()
            .map(|(id, hits)| (hits as f64 / total, id))
            .collect();
        let best = scored
            .iter()
            .map(|&(s, _)| s)
            .fold(f64::MIN, f64::max)
            .max(f64::MIN_POSITIVE);
        let mut out: Vec<FtMatch> = scored
            .drain(..)
            .map(|(s, id)| FtMatch {
                id,
                proc: ((s / best) * 100.0).round() as i32,
            })
            .filter(|m| m.proc as f64 >= self.cfg.min_ok_proc)
            .collect();
        out.sort_by(|a, b| b.proc.cmp(&a.proc).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

/// Boundary-padded 3-grams of every word: "fox" -> "  f", " fo", "fox",
/// "ox ".
fn trigrams(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.unicode_words() {
        let padded: Vec<char> = std::iter::repeat(' ')
            .take(2)
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(std::iter::once(' '))
            .collect();
        for w in padded.windows(3) {
            out.push(w.iter().collect());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(docs: &[(IdType, &str)]) -> FuzzyFtIndex {
        let mut idx = FuzzyFtIndex::new(FtFuzzyConfig::default());
        for &(id, text) in docs {
            idx.upsert(&VariantArray::from_iter([Variant::string(text)]), id)
                .unwrap();
        }
        idx.commit(&Context::new()).unwrap();
        idx
    }

    #[test]
    fn best_match_scales_to_100() {
        let idx = index_with(&[(1, "terminator"), (2, "terminal"), (3, "unrelated")]);
        let dsl = FtDsl::parse("terminator", "").unwrap();
        let matches = idx.search(&dsl, &Context::new()).unwrap();
        assert_eq!(matches[0].id, 1);
        assert_eq!(matches[0].proc, 100);
        assert!(matches.iter().all(|m| m.proc as f64 >= 10.0));
    }

    #[test]
    fn misspelled_query_still_matches() {
        let idx = index_with(&[(1, "quick brown fox"), (2, "lazy dog")]);
        let dsl = FtDsl::parse("qiuck", "").unwrap();
        let matches = idx.search(&dsl, &Context::new()).unwrap();
        assert_eq!(matches.first().map(|m| m.id), Some(1));
    }

    #[test]
    fn low_scores_are_dropped() {
        let idx = index_with(&[(1, "abcdefgh"), (2, "abzzzzzz")]);
        let dsl = FtDsl::parse("abcdefgh", "").unwrap();
        let matches = idx.search(&dsl, &Context::new()).unwrap();
        assert_eq!(matches[0].id, 1);
        // doc 2 shares only the leading boundary grams.
        assert!(matches.len() == 1 || matches[1].proc < 40);
    }
}
