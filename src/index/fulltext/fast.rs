//! # Fast Full-Text Index
//!
//! Inverted index over stemmed, normalized tokens. Text is stored raw at
//! upsert time; `commit` (re)builds the inverted structures in bounded
//! steps with a cancellation check between steps, so a huge rebuild can be
//! aborted and resumed by the background task without blocking writers for
//! long.
//!
//! ## Scoring
//!
//! Per matched term: `idf * saturation(freq) * boost * relevancy`, where
//! `saturation` is the BM25 term-frequency curve (`freq*(k1+1)/(freq+k1)`)
//! and `relevancy` is 100 for an exact match, decreased for prefix and typo
//! variants by `partial_match_decrease * unmatched / matched`.
//!
//! The per-document sum is then shaped by:
//!
//! - a document-context bonus `(1-b) + b*dl/avgdl` (short-field document
//!   search rewards richer documents rather than penalizing length),
//! - a distance factor `1 + distance_weight/(1+gap)` over the closest
//!   positions of consecutive query terms,
//! - a position factor `1 + position_weight/(1+first_pos)`,
//! - `full_match_boost` when the query covers every word of the document.
//!
//! Scores scale so the best document maps to proc 100; entries below
//! `min_relevancy` are dropped.

use hashbrown::HashMap;
use rust_stemmers::{Algorithm, Stemmer};
use smallvec::SmallVec;

use crate::config::FtFastConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::index::fulltext::{edit_distance_within, tokenize, FtDsl, FtMatch};
use crate::types::value::{Variant, VariantArray};
use crate::types::IdType;

#[derive(Debug, Clone)]
struct Posting {
    id: IdType,
    field: u32,
    positions: SmallVec<[u32; 4]>,
}

#[derive(Debug, Default)]
struct Built {
    vocab: HashMap<String, u32>,
    /// Sorted mirror of `vocab` keys for prefix and typo scans.
    vocab_list: Vec<String>,
    postings: Vec<Vec<Posting>>,
    doc_len: HashMap<IdType, u32>,
    total_len: u64,
}

impl Built {
    fn avg_doc_len(&self) -> f64 {
        if self.doc_len.is_empty() {
            return 1.0;
        }
        self.total_len as f64 / self.doc_len.len() as f64
    }
}

#[derive(Default)]
struct BuildState {
    doc_order: Vec<IdType>,
    cursor: usize,
    partial: Built,
}

pub struct FastFtIndex {
    cfg: FtFastConfig,
    stemmer: Stemmer,
    field_names: Vec<String>,
    docs: HashMap<IdType, Vec<(u32, String)>>,
    built: Option<Built>,
    build: BuildState,
    dirty: bool,
}

impl FastFtIndex {
    pub fn new(cfg: FtFastConfig) -> Self {
        Self {
            cfg,
            stemmer: Stemmer::create(Algorithm::English),
            field_names: Vec::new(),
            docs: HashMap::new(),
            built: None,
            build: BuildState::default(),
            dirty: false,
        }
    }

    pub fn set_field_names(&mut self, names: Vec<String>) {
        self.field_names = names;
    }

    pub fn config(&self) -> &FtFastConfig {
        &self.cfg
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.built.is_none()
    }

    pub fn vocab_len(&self) -> usize {
        self.built.as_ref().map_or(0, |b| b.vocab.len())
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Store raw field text for a row; the inverted index is rebuilt on the
    /// next commit. `keys[i]` is the text of the i-th indexed field.
    pub fn upsert(&mut self, keys: &VariantArray, id: IdType) -> Result<VariantArray> {
        let mut fields = Vec::with_capacity(keys.len());
        for (field, key) in keys.iter().enumerate() {
            if let Variant::String(text) = key {
                fields.push((field as u32, text.to_string()));
            }
        }
        self.docs.insert(id, fields);
        self.mark_dirty();
        Ok(keys.clone())
    }

    pub fn delete(&mut self, _keys: &VariantArray, id: IdType) -> Result<()> {
        if self.docs.remove(&id).is_some() {
            self.mark_dirty();
        }
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.build = BuildState::default();
    }

    fn add_doc(&mut self, id: IdType) {
        let Some(fields) = self.docs.get(&id) else {
            return;
        };
        let built = &mut self.build.partial;
        let mut words = 0u32;
        for (field, text) in fields {
            for (token, pos) in tokenize(text, &self.cfg.extra_word_symbols) {
                let stemmed = self.stemmer.stem(&token).to_string();
                let term_id = match built.vocab.get(&stemmed) {
                    Some(&t) => t,
                    None => {
                        let t = built.postings.len() as u32;
                        built.vocab.insert(stemmed, t);
                        built.postings.push(Vec::new());
                        t
                    }
                };
                let list = &mut built.postings[term_id as usize];
                match list.last_mut() {
                    Some(p) if p.id == id && p.field == *field => p.positions.push(pos),
                    _ => list.push(Posting {
                        id,
                        field: *field,
                        positions: SmallVec::from_iter([pos]),
                    }),
                }
                words += 1;
            }
        }
        built.doc_len.insert(id, words);
        built.total_len += words as u64;
    }

    /// Rebuild the inverted structures, at most `max_rebuild_steps` chunks
    /// of `max_step_size` documents per call. A cancellation between steps
    /// keeps the partial state, so the next call resumes where it stopped.
    /// Returns `true` once the index is fully built.
    pub fn commit(&mut self, ctx: &Context) -> Result<()> {
        self.commit_steps(ctx).map(|_| ())
    }

    pub fn commit_steps(&mut self, ctx: &Context) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(true);
        }
        if self.build.doc_order.is_empty() && self.build.cursor == 0 {
            let mut order: Vec<IdType> = self.docs.keys().copied().collect();
            order.sort_unstable();
            self.build.doc_order = order;
            self.build.partial = Built::default();
        }
        let step_size = self.cfg.max_step_size.max(1) as usize;
        for _ in 0..self.cfg.max_rebuild_steps.max(1) {
            ctx.check()?;
            if self.build.cursor >= self.build.doc_order.len() {
                break;
            }
            let end = (self.build.cursor + step_size).min(self.build.doc_order.len());
            let chunk: Vec<IdType> = self.build.doc_order[self.build.cursor..end].to_vec();
            for id in chunk {
                self.add_doc(id);
            }
            self.build.cursor = end;
        }
        if self.build.cursor < self.build.doc_order.len() {
            return Ok(false);
        }

        let mut done = std::mem::take(&mut self.build.partial);
        for list in &mut done.postings {
            list.sort_by_key(|p| (p.id, p.field));
        }
        done.vocab_list = done.vocab.keys().cloned().collect();
        done.vocab_list.sort_unstable();
        self.built = Some(done);
        self.build = BuildState::default();
        self.dirty = false;
        Ok(true)
    }

    /// Resolve one DSL pattern into `(term_id, relevancy)` variants.
    fn resolve_term(
        &self,
        built: &Built,
        pattern: &str,
        prefix: bool,
    ) -> Vec<(u32, f64)> {
        let mut out = Vec::new();
        let stemmed = self.stemmer.stem(pattern).to_string();
        if let Some(&tid) = built.vocab.get(&stemmed) {
            out.push((tid, 100.0));
        }
        if prefix {
            let start = built.vocab_list.partition_point(|w| w.as_str() < pattern);
            for word in &built.vocab_list[start..] {
                if !word.starts_with(pattern) {
                    break;
                }
                if word == &stemmed {
                    continue;
                }
                let matched = pattern.chars().count().max(1);
                let unmatched = word.chars().count().saturating_sub(matched);
                let rel = 100.0
                    - self.cfg.partial_match_decrease as f64 * unmatched as f64 / matched as f64;
                if rel > 0.0 {
                    if let Some(&tid) = built.vocab.get(word) {
                        out.push((tid, rel));
                    }
                }
            }
        } else if self.cfg.max_typos_in_word > 0
            && pattern.chars().count() <= self.cfg.max_typo_len as usize
            && out.is_empty()
        {
            for word in &built.vocab_list {
                if let Some(d) =
                    edit_distance_within(&stemmed, word, self.cfg.max_typos_in_word as u32)
                {
                    if d == 0 {
                        continue;
                    }
                    let matched = (pattern.chars().count() as i64 - d as i64).max(1);
                    let rel =
                        100.0 - self.cfg.partial_match_decrease as f64 * d as f64 / matched as f64;
                    if rel > 0.0 {
                        if let Some(&tid) = built.vocab.get(word) {
                            out.push((tid, rel));
                        }
                    }
                }
            }
        }
        out
    }

    fn field_index(&self, name: &str) -> Option<u32> {
        self.field_names
            .iter()
            .position(|f| f == name)
            .map(|p| p as u32)
    }

    pub fn search(&self, dsl: &FtDsl, ctx: &Context) -> Result<Vec<FtMatch>> {
        let built = self
            .built
            .as_ref()
            .ok_or_else(|| Error::logic("full-text index is not committed"))?;
        ctx.check()?;

        let mut acc: HashMap<IdType, Vec<TermHit>> = HashMap::new();
        let mut forbidden: Vec<IdType> = Vec::new();
        let positive_terms: Vec<&super::DslTerm> =
            dsl.terms.iter().filter(|t| !t.forbidden).collect();

        for (ordinal, term) in dsl.terms.iter().enumerate() {
            ctx.check()?;
            let field = match &term.field {
                Some(name) => Some(self.field_index(name).ok_or_else(|| {
                    Error::params(format!("unknown full-text field '{name}'"))
                })?),
                None => None,
            };
            let variants = self.resolve_term(built, &term.pattern, term.prefix);
            if term.required && variants.is_empty() {
                return Ok(Vec::new());
            }
            for (tid, relevancy) in variants {
                for posting in &built.postings[tid as usize] {
                    if field.is_some_and(|f| f != posting.field) {
                        continue;
                    }
                    if term.forbidden {
                        forbidden.push(posting.id);
                        continue;
                    }
                    acc.entry(posting.id).or_default().push(TermHit {
                        ordinal,
                        boost: term.boost,
                        relevancy,
                        freq: posting.positions.len() as u32,
                        positions: posting.positions.clone(),
                    });
                }
            }
        }
        forbidden.sort_unstable();
        forbidden.dedup();

        let idf = |ordinal: usize| -> f64 {
            let df = acc
                .values()
                .filter(|hits| hits.iter().any(|h| h.ordinal == ordinal))
                .count()
                .max(1) as f64;
            let n = built.doc_len.len().max(1) as f64;
            (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
        };
        let idfs: Vec<f64> = (0..dsl.terms.len()).map(idf).collect();

        let avgdl = built.avg_doc_len();
        let k1 = self.cfg.bm25_k1;
        let b = self.cfg.bm25_b;
        let mut scored: Vec<(f64, IdType)> = Vec::new();

        'doc: for (&id, hits) in &acc {
            if forbidden.binary_search(&id).is_ok() {
                continue;
            }
            // Required terms and phrase groups must all be present.
            for (ordinal, term) in dsl.terms.iter().enumerate() {
                if term.required
                    && !term.forbidden
                    && !hits.iter().any(|h| h.ordinal == ordinal)
                {
                    continue 'doc;
                }
            }
            for group in 0..dsl.phrases {
                if !phrase_matches(dsl, hits.as_slice(), group) {
                    continue 'doc;
                }
            }

            let dl = *built.doc_len.get(&id).unwrap_or(&1) as f64;
            let mut base = 0.0;
            let mut matched_positions = 0u32;
            let mut first_pos = u32::MAX;
            for hit in hits.iter() {
                let sat = hit.freq as f64 * (k1 + 1.0) / (hit.freq as f64 + k1);
                base += idfs[hit.ordinal] * sat * hit.boost * (hit.relevancy / 100.0);
                matched_positions += hit.freq;
                first_pos = first_pos.min(hit.positions.first().copied().unwrap_or(0));
            }

            let context_bonus = (1.0 - b) + b * dl / avgdl;
            let gap = min_term_gap(hits.as_slice());
            let distance_factor = 1.0 + self.cfg.distance_weight / (1.0 + gap as f64);
            let position_factor =
                1.0 + self.cfg.position_weight / (1.0 + first_pos.min(1024) as f64);
            let len_factor = 1.0
                + self.cfg.term_len_weight
                    * (positive_terms
                        .iter()
                        .map(|t| t.pattern.chars().count())
                        .sum::<usize>() as f64
                        / (16.0 * positive_terms.len().max(1) as f64))
                        .min(1.0);
            let full_match = if matched_positions as f64 >= dl {
                self.cfg.full_match_boost
            } else {
                1.0
            };

            let score = base * context_bonus * distance_factor * position_factor * len_factor
                * full_match;
            scored.push((score, id));
        }

        let best = scored
            .iter()
            .map(|&(s, _)| s)
            .fold(f64::MIN, f64::max)
            .max(f64::MIN_POSITIVE);
        let mut out: Vec<FtMatch> = scored
            .into_iter()
            .filter(|&(s, _)| s / best >= self.cfg.min_relevancy)
            .map(|(s, id)| FtMatch {
                id,
                proc: ((s / best) * 100.0).round() as i32,
            })
            .collect();
        out.sort_by(|a, b| b.proc.cmp(&a.proc).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

/// One matched query term inside one document.
struct TermHit {
    /// Query term ordinal, for distance and phrase computation.
    ordinal: usize,
    boost: f64,
    relevancy: f64,
    freq: u32,
    positions: SmallVec<[u32; 4]>,
}

fn positions_of(hits: &[TermHit], ordinal: usize) -> Vec<u32> {
    hits.iter()
        .filter(|h| h.ordinal == ordinal)
        .flat_map(|h| h.positions.iter().copied())
        .collect()
}

/// Total gap between closest positions of consecutive matched query terms;
/// 0 when terms are adjacent or only one term matched.
fn min_term_gap(hits: &[TermHit]) -> u32 {
    let mut ordinals: Vec<usize> = hits.iter().map(|h| h.ordinal).collect();
    ordinals.sort_unstable();
    ordinals.dedup();
    if ordinals.len() < 2 {
        return 0;
    }
    let mut total = 0u32;
    for pair in ordinals.windows(2) {
        let a = positions_of(hits, pair[0]);
        let b = positions_of(hits, pair[1]);
        let mut best = u32::MAX;
        for &pa in &a {
            for &pb in &b {
                best = best.min(pa.abs_diff(pb));
            }
        }
        if best != u32::MAX {
            total += best.saturating_sub(1).min(64);
        }
    }
    total
}

/// Phrase group check: every member term present, with some position chain
/// where each next term sits exactly one position after the previous.
fn phrase_matches(dsl: &FtDsl, hits: &[TermHit], group: usize) -> bool {
    let members: Vec<usize> = dsl
        .terms
        .iter()
        .enumerate()
        .filter(|(_, t)| t.phrase == Some(group))
        .map(|(i, _)| i)
        .collect();
    if members.len() <= 1 {
        return members
            .first()
            .map(|&m| hits.iter().any(|h| h.ordinal == m))
            .unwrap_or(true);
    }
    let mut starts = positions_of(hits, members[0]);
    for &next in &members[1..] {
        let next_positions = positions_of(hits, next);
        starts.retain(|&p| next_positions.contains(&(p + 1)));
        starts = starts.iter().map(|&p| p + 1).collect();
        if starts.is_empty() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(docs: &[(IdType, &str)]) -> FastFtIndex {
        let mut idx = FastFtIndex::new(FtFastConfig::default());
        idx.set_field_names(vec!["body".to_string()]);
        for &(id, text) in docs {
            idx.upsert(&VariantArray::from_iter([Variant::string(text)]), id)
                .unwrap();
        }
        idx.commit(&Context::new()).unwrap();
        idx
    }

    fn search(idx: &FastFtIndex, q: &str) -> Vec<IdType> {
        let dsl = FtDsl::parse(q, "").unwrap();
        idx.search(&dsl, &Context::new())
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[test]
    fn required_and_forbidden_terms() {
        let idx = index_with(&[
            (1, "the quick brown fox"),
            (2, "quick brown"),
            (3, "slow fox"),
        ]);
        let ids = search(&idx, "quick +brown -slow");
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn longer_context_outranks_with_default_config() {
        let idx = index_with(&[
            (1, "the quick brown fox"),
            (2, "quick brown"),
            (3, "slow fox"),
        ]);
        let dsl = FtDsl::parse("quick +brown -slow", "").unwrap();
        let matches = idx.search(&dsl, &Context::new()).unwrap();
        assert_eq!(matches[0].id, 1);
        assert!(matches[0].proc > matches[1].proc);
    }

    #[test]
    fn prefix_matches_with_penalty() {
        let idx = index_with(&[(1, "terminator"), (2, "term")]);
        let dsl = FtDsl::parse("term*", "").unwrap();
        let matches = idx.search(&dsl, &Context::new()).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, 2);
    }

    #[test]
    fn typo_tolerance_is_bounded() {
        let idx = index_with(&[(1, "brown bear")]);
        assert_eq!(search(&idx, "brwon"), vec![1]);
        assert!(search(&idx, "xrxwn").is_empty());
    }

    #[test]
    fn phrase_requires_adjacency() {
        let idx = index_with(&[(1, "big brown fox"), (2, "brown big fox")]);
        assert_eq!(search(&idx, "\"big brown\""), vec![1]);
    }

    #[test]
    fn stepped_commit_resumes_after_cancel() {
        let mut idx = FastFtIndex::new(FtFastConfig {
            max_step_size: 1,
            max_rebuild_steps: 1,
            ..Default::default()
        });
        idx.set_field_names(vec!["body".to_string()]);
        for id in 0..5 {
            idx.upsert(
                &VariantArray::from_iter([Variant::string("hello world")]),
                id,
            )
            .unwrap();
        }
        // One step per call: five calls to finish.
        let ctx = Context::new();
        let mut done = false;
        for _ in 0..5 {
            done = idx.commit_steps(&ctx).unwrap();
        }
        assert!(done);
        assert_eq!(search(&idx, "hello").len(), 5);
    }
}
