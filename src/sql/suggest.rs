//! # SQL Suggestions
//!
//! Completion candidates for an interactive SQL console. The suggester
//! tokenizes the query prefix up to the cursor, classifies the grammatical
//! position from the last significant tokens, and returns matching
//! keywords, namespace names, field names or operators.

use crate::sql::lexer::{Keyword, Lexer, Token, TokenKind};

/// Name sources the suggester draws from; implemented by the database.
pub trait SuggestionContext {
    fn namespace_names(&self) -> Vec<String>;
    fn field_names(&self, namespace: &str) -> Vec<String>;
}

const VERBS: &[&str] = &["SELECT", "UPDATE", "DELETE", "TRUNCATE", "EXPLAIN"];
const SELECT_EXTRAS: &[&str] = &[
    "*", "COUNT", "SUM", "AVG", "MIN", "MAX", "FACET", "DISTINCT",
];
const OPERATORS: &[&str] = &[
    "=", "<", "<=", ">", ">=", "<>", "IN", "ALLSET", "RANGE", "LIKE", "IS",
];
const AFTER_CONDITION: &[&str] = &["AND", "OR", "ORDER BY", "LIMIT", "OFFSET"];

pub fn suggest(input: &str, pos: usize, ctx: &dyn SuggestionContext) -> Vec<String> {
    let pos = pos.min(input.len());
    let prefix_input = &input[..pos];
    let Ok(tokens) = Lexer::new(prefix_input).tokenize() else {
        return Vec::new();
    };
    // Drop the Eof sentinel.
    let tokens = &tokens[..tokens.len() - 1];

    // The word being typed, if the cursor touches its tail.
    let (partial, complete): (&str, &[Token<'_>]) = match tokens.last() {
        Some(t)
            if matches!(t.kind, TokenKind::Ident(_) | TokenKind::Keyword(_))
                && !prefix_input[t.offset..].contains(char::is_whitespace) =>
        {
            (&prefix_input[t.offset..], &tokens[..tokens.len() - 1])
        }
        _ => ("", tokens),
    };

    let namespace = namespace_of(complete);
    let candidates: Vec<String> = match complete.last().map(|t| &t.kind) {
        None => VERBS.iter().map(|s| s.to_string()).collect(),
        Some(TokenKind::Keyword(
            Keyword::From | Keyword::Update | Keyword::Truncate | Keyword::Join,
        )) => ctx.namespace_names(),
        Some(TokenKind::Keyword(Keyword::Select)) => {
            SELECT_EXTRAS.iter().map(|s| s.to_string()).collect()
        }
        Some(TokenKind::Keyword(
            Keyword::Where | Keyword::And | Keyword::Or | Keyword::Not | Keyword::By
            | Keyword::Set | Keyword::On,
        )) => match &namespace {
            Some(ns) => ctx.field_names(ns),
            None => Vec::new(),
        },
        Some(TokenKind::Keyword(Keyword::Order)) => vec!["BY".to_string()],
        Some(TokenKind::Ident(_)) => {
            // After a field inside WHERE: operators; after the namespace in
            // FROM: clause keywords.
            if last_clause(complete) == Some(Keyword::Where) {
                OPERATORS.iter().map(|s| s.to_string()).collect()
            } else {
                let mut out: Vec<String> =
                    AFTER_CONDITION.iter().map(|s| s.to_string()).collect();
                out.insert(0, "WHERE".to_string());
                out
            }
        }
        Some(TokenKind::Str(_) | TokenKind::Int(_) | TokenKind::Float(_)) => {
            AFTER_CONDITION.iter().map(|s| s.to_string()).collect()
        }
        _ => Vec::new(),
    };

    let needle = partial.to_ascii_lowercase();
    candidates
        .into_iter()
        .filter(|c| needle.is_empty() || c.to_ascii_lowercase().starts_with(&needle))
        .collect()
}

/// Namespace mentioned after FROM/UPDATE, if already typed.
fn namespace_of(tokens: &[Token<'_>]) -> Option<String> {
    let mut prev_was_source = false;
    for t in tokens {
        if prev_was_source {
            if let TokenKind::Ident(name) = &t.kind {
                return Some(name.to_string());
            }
        }
        prev_was_source = matches!(
            t.kind,
            TokenKind::Keyword(Keyword::From | Keyword::Update)
        );
    }
    None
}

fn last_clause(tokens: &[Token<'_>]) -> Option<Keyword> {
    tokens.iter().rev().find_map(|t| match t.kind {
        TokenKind::Keyword(
            kw @ (Keyword::Select
            | Keyword::From
            | Keyword::Where
            | Keyword::Order
            | Keyword::Set
            | Keyword::On),
        ) => Some(kw),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx;

    impl SuggestionContext for Ctx {
        fn namespace_names(&self) -> Vec<String> {
            vec!["books".to_string(), "orders".to_string()]
        }

        fn field_names(&self, ns: &str) -> Vec<String> {
            match ns {
                "books" => vec!["id".to_string(), "title".to_string()],
                _ => Vec::new(),
            }
        }
    }

    #[test]
    fn empty_input_suggests_verbs() {
        let s = suggest("", 0, &Ctx);
        assert!(s.contains(&"SELECT".to_string()));
    }

    #[test]
    fn after_from_suggests_namespaces() {
        let input = "SELECT * FROM ";
        let s = suggest(input, input.len(), &Ctx);
        assert_eq!(s, vec!["books", "orders"]);
    }

    #[test]
    fn partial_namespace_filters() {
        let input = "SELECT * FROM bo";
        let s = suggest(input, input.len(), &Ctx);
        assert_eq!(s, vec!["books"]);
    }

    #[test]
    fn after_where_suggests_fields() {
        let input = "SELECT * FROM books WHERE ti";
        let s = suggest(input, input.len(), &Ctx);
        assert_eq!(s, vec!["title"]);
    }

    #[test]
    fn after_field_in_where_suggests_operators() {
        let input = "SELECT * FROM books WHERE title ";
        let s = suggest(input, input.len(), &Ctx);
        assert!(s.contains(&"=".to_string()));
        assert!(s.contains(&"IN".to_string()));
    }

    #[test]
    fn cursor_mid_query_probes_that_point() {
        let input = "SELECT * FROM books WHERE id = 1";
        let s = suggest(input, "SELECT * FROM bo".len(), &Ctx);
        assert_eq!(s, vec!["books"]);
    }
}
