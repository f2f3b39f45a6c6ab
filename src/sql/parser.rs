//! # SQL Parser
//!
//! Recursive-descent parser lowering the SQL dialect into the engine's
//! [`Query`] tree. The grammar is deliberately flat: a statement verb, a
//! namespace, an optional filter tree with brackets, and trailing sort /
//! limit clauses. Every error message names the offending token and its
//! line/column.
//!
//! Forced sort order uses the `FIELD()` form:
//!
//! ```text
//! SELECT * FROM books ORDER BY FIELD(year, 2007, 2003) DESC
//! ```

use crate::error::{Error, Result};
use crate::index::CondType;
use crate::query::{
    AggSortEntry, AggType, AggregateEntry, Filter, FilterNode, JoinEntry, JoinType, OpType,
    Query, SortEntry, UpdateEntry,
};
use crate::sql::lexer::{Keyword, Lexer, Token, TokenKind};
use crate::types::value::{Variant, VariantArray};

/// A parsed SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Select(Query),
    Update(Query),
    Delete(Query),
    Truncate(String),
}

impl SqlStatement {
    pub fn into_query(self) -> Query {
        match self {
            SqlStatement::Select(q) | SqlStatement::Update(q) | SqlStatement::Delete(q) => q,
            SqlStatement::Truncate(ns) => Query::new(ns),
        }
    }
}

pub fn parse_sql(input: &str) -> Result<SqlStatement> {
    let tokens = Lexer::new(input).tokenize()?;
    Parser { tokens, pos: 0 }.parse()
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token<'a> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token<'a> {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.peek().is_keyword(kw) {
            self.advance();
            return true;
        }
        false
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_punct(p) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<()> {
        if !self.eat_keyword(kw) {
            return Err(self.unexpected(&format!("expected {kw:?}")));
        }
        Ok(())
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if !self.eat_punct(p) {
            return Err(self.unexpected(&format!("expected '{p}'")));
        }
        Ok(())
    }

    fn unexpected(&self, what: &str) -> Error {
        let t = self.peek();
        Error::parse(format!(
            "{}, got {} at line {}, column {}",
            what,
            t.describe(),
            t.line,
            t.col
        ))
    }

    fn ident(&mut self) -> Result<String> {
        match &self.peek().kind {
            TokenKind::Ident(s) => {
                let s = s.to_string();
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    fn parse(mut self) -> Result<SqlStatement> {
        let explain = self.eat_keyword(Keyword::Explain);
        let stmt = match &self.peek().kind {
            TokenKind::Keyword(Keyword::Select) => {
                let mut q = self.parse_select()?;
                q.explain = explain;
                SqlStatement::Select(q)
            }
            TokenKind::Keyword(Keyword::Update) => SqlStatement::Update(self.parse_update()?),
            TokenKind::Keyword(Keyword::Delete) => SqlStatement::Delete(self.parse_delete()?),
            TokenKind::Keyword(Keyword::Truncate) => {
                self.advance();
                SqlStatement::Truncate(self.ident()?)
            }
            _ => return Err(self.unexpected("expected SELECT, UPDATE, DELETE or TRUNCATE")),
        };
        self.eat_punct(";");
        if self.peek().kind != TokenKind::Eof {
            return Err(self.unexpected("unexpected trailing input"));
        }
        Ok(stmt)
    }

    fn parse_select(&mut self) -> Result<Query> {
        self.expect_keyword(Keyword::Select)?;
        let mut query = Query::new(String::new());

        loop {
            match self.peek().kind.clone() {
                TokenKind::Punct("*") => {
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Count) => {
                    self.advance();
                    self.expect_punct("(")?;
                    self.expect_punct("*")?;
                    self.expect_punct(")")?;
                    query.req_total = true;
                }
                TokenKind::Keyword(kw @ (Keyword::Sum | Keyword::Avg | Keyword::Min
                | Keyword::Max | Keyword::Distinct | Keyword::Facet)) => {
                    self.advance();
                    query.aggregations.push(self.parse_aggregate(kw)?);
                }
                TokenKind::Ident(_) => {
                    let field = self.ident()?;
                    query.select_filter.push(field);
                }
                _ => return Err(self.unexpected("expected field, aggregate or '*'")),
            }
            if !self.eat_punct(",") {
                break;
            }
        }

        self.expect_keyword(Keyword::From)?;
        query.namespace = self.ident()?;
        self.parse_tail(&mut query)?;
        Ok(query)
    }

    fn parse_aggregate(&mut self, kw: Keyword) -> Result<AggregateEntry> {
        let agg_type = match kw {
            Keyword::Sum => AggType::Sum,
            Keyword::Avg => AggType::Avg,
            Keyword::Min => AggType::Min,
            Keyword::Max => AggType::Max,
            Keyword::Distinct => AggType::Distinct,
            Keyword::Facet => AggType::Facet,
            _ => return Err(self.unexpected("expected aggregate function")),
        };
        self.expect_punct("(")?;
        let mut entry = AggregateEntry::new(agg_type, vec![self.ident()?]);
        while self.eat_punct(",") {
            entry.fields.push(self.ident()?);
        }
        if agg_type == AggType::Facet {
            loop {
                if self.eat_keyword(Keyword::Order) {
                    self.expect_keyword(Keyword::By)?;
                    loop {
                        // `count` is a keyword but a legal facet sort field.
                        let field = if self.eat_keyword(Keyword::Count) {
                            "count".to_string()
                        } else {
                            self.ident()?
                        };
                        let desc = self.parse_direction();
                        entry.sort.push(AggSortEntry { field, desc });
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                } else if self.eat_keyword(Keyword::Limit) {
                    entry.limit = Some(self.parse_usize()?);
                } else if self.eat_keyword(Keyword::Offset) {
                    entry.offset = self.parse_usize()?;
                } else {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        Ok(entry)
    }

    fn parse_update(&mut self) -> Result<Query> {
        self.expect_keyword(Keyword::Update)?;
        let mut query = Query::new(self.ident()?);
        self.expect_keyword(Keyword::Set)?;
        loop {
            let field = self.ident()?;
            self.expect_punct("=")?;
            let value = self.parse_scalar()?;
            query.update_fields.push(UpdateEntry { field, value });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.parse_tail(&mut query)?;
        Ok(query)
    }

    fn parse_delete(&mut self) -> Result<Query> {
        self.expect_keyword(Keyword::Delete)?;
        self.expect_keyword(Keyword::From)?;
        let mut query = Query::new(self.ident()?);
        self.parse_tail(&mut query)?;
        Ok(query)
    }

    /// Joins, WHERE, ORDER BY, LIMIT, OFFSET.
    fn parse_tail(&mut self, query: &mut Query) -> Result<()> {
        loop {
            let join_type = if self.eat_keyword(Keyword::Inner) {
                Some(JoinType::Inner)
            } else if self.eat_keyword(Keyword::Left) {
                Some(JoinType::Left)
            } else if self.peek().is_keyword(Keyword::Join) {
                Some(JoinType::Inner)
            } else {
                None
            };
            let Some(join_type) = join_type else { break };
            self.expect_keyword(Keyword::Join)?;
            let right_ns = self.ident()?;
            self.expect_keyword(Keyword::On)?;
            let mut on = Vec::new();
            loop {
                let left = self.ident()?;
                self.expect_punct("=")?;
                let right = self.ident()?;
                on.push(JoinEntry {
                    left_field: strip_ns_prefix(&left, &query.namespace),
                    right_field: strip_ns_prefix(&right, &right_ns),
                    cond: CondType::Eq,
                });
                if !self.eat_keyword(Keyword::And) {
                    break;
                }
            }
            query.join_queries.push(crate::query::JoinedQuery {
                join_type,
                on,
                query: Query::new(right_ns),
            });
        }

        if self.eat_keyword(Keyword::Where) {
            query.filters = self.parse_filters()?;
        }

        if self.eat_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                query.sort.push(self.parse_sort_entry()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }

        if self.eat_keyword(Keyword::Limit) {
            query.limit = Some(self.parse_usize()?);
        }
        if self.eat_keyword(Keyword::Offset) {
            query.offset = self.parse_usize()?;
        }
        Ok(())
    }

    fn parse_sort_entry(&mut self) -> Result<SortEntry> {
        if self.eat_keyword(Keyword::Field) {
            self.expect_punct("(")?;
            let field = self.ident()?;
            let mut forced = Vec::new();
            while self.eat_punct(",") {
                forced.push(self.parse_scalar()?);
            }
            self.expect_punct(")")?;
            let desc = self.parse_direction();
            return Ok(SortEntry {
                field,
                desc,
                forced,
            });
        }
        let field = self.ident()?;
        let desc = self.parse_direction();
        Ok(SortEntry {
            field,
            desc,
            forced: Vec::new(),
        })
    }

    fn parse_direction(&mut self) -> bool {
        if self.eat_keyword(Keyword::Desc) {
            return true;
        }
        self.eat_keyword(Keyword::Asc);
        false
    }

    fn parse_usize(&mut self) -> Result<usize> {
        match self.peek().kind {
            TokenKind::Int(v) if v >= 0 => {
                self.advance();
                Ok(v as usize)
            }
            _ => Err(self.unexpected("expected non-negative number")),
        }
    }

    fn parse_filters(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        loop {
            let op = if filters.is_empty() {
                if self.eat_keyword(Keyword::Not) {
                    OpType::Not
                } else {
                    OpType::And
                }
            } else if self.eat_keyword(Keyword::Or) {
                OpType::Or
            } else if self.eat_keyword(Keyword::And) {
                if self.eat_keyword(Keyword::Not) {
                    OpType::Not
                } else {
                    OpType::And
                }
            } else {
                break;
            };

            if self.eat_punct("(") {
                let inner = self.parse_filters()?;
                self.expect_punct(")")?;
                filters.push(Filter {
                    op,
                    node: FilterNode::Bracket(inner),
                });
                continue;
            }
            filters.push(Filter {
                op,
                node: self.parse_condition()?,
            });
        }
        if filters.is_empty() {
            return Err(self.unexpected("expected condition"));
        }
        Ok(filters)
    }

    fn parse_condition(&mut self) -> Result<FilterNode> {
        if self.eat_keyword(Keyword::Dwithin) {
            self.expect_punct("(")?;
            let field = self.ident()?;
            self.expect_punct(",")?;
            let point = self.parse_point()?;
            self.expect_punct(",")?;
            let radius = self.parse_scalar()?;
            self.expect_punct(")")?;
            return Ok(FilterNode::Cond {
                field,
                cond: CondType::DWithin,
                values: VariantArray::from_iter([point, radius]),
            });
        }

        let field = self.ident()?;

        if self.eat_keyword(Keyword::In) {
            return Ok(FilterNode::Cond {
                field,
                cond: CondType::Set,
                values: self.parse_value_list()?,
            });
        }
        if self.eat_keyword(Keyword::Allset) {
            return Ok(FilterNode::Cond {
                field,
                cond: CondType::AllSet,
                values: self.parse_value_list()?,
            });
        }
        if self.eat_keyword(Keyword::Range) {
            let values = self.parse_value_list()?;
            if values.len() != 2 {
                return Err(self.unexpected("RANGE requires exactly two values"));
            }
            return Ok(FilterNode::Cond {
                field,
                cond: CondType::Range,
                values,
            });
        }
        if self.eat_keyword(Keyword::Like) {
            let pattern = self.parse_scalar()?;
            return Ok(FilterNode::Cond {
                field,
                cond: CondType::Like,
                values: VariantArray::from_iter([pattern]),
            });
        }
        if self.eat_keyword(Keyword::Is) {
            let negated = self.eat_keyword(Keyword::Not);
            if self.eat_keyword(Keyword::Null) || self.eat_keyword(Keyword::Empty) {
                return Ok(FilterNode::Cond {
                    field,
                    cond: if negated { CondType::Any } else { CondType::Empty },
                    values: VariantArray::new(),
                });
            }
            return Err(self.unexpected("expected NULL or EMPTY"));
        }

        let cond = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "=" | "==" => CondType::Eq,
                "<" => CondType::Lt,
                "<=" => CondType::Le,
                ">" => CondType::Gt,
                ">=" => CondType::Ge,
                "<>" | "!=" => CondType::Eq,
                _ => return Err(self.unexpected("expected comparison operator")),
            },
            _ => return Err(self.unexpected("expected comparison operator")),
        };
        let negated = matches!(&self.peek().kind, TokenKind::Punct("<>" | "!="));
        self.advance();
        let value = self.parse_scalar()?;
        let node = FilterNode::Cond {
            field,
            cond,
            values: VariantArray::from_iter([value]),
        };
        if negated {
            // `a <> v` is sugar for `NOT a = v`.
            return Ok(FilterNode::Bracket(vec![Filter {
                op: OpType::Not,
                node,
            }]));
        }
        Ok(node)
    }

    fn parse_value_list(&mut self) -> Result<VariantArray> {
        self.expect_punct("(")?;
        let mut values = VariantArray::new();
        loop {
            values.push(self.parse_scalar()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(values)
    }

    fn parse_point(&mut self) -> Result<Variant> {
        self.expect_keyword(Keyword::Point)?;
        self.expect_punct("(")?;
        let x = self.parse_number()?;
        self.eat_punct(",");
        let y = self.parse_number()?;
        self.expect_punct(")")?;
        Ok(Variant::Point { x, y })
    }

    fn parse_number(&mut self) -> Result<f64> {
        match self.peek().kind {
            TokenKind::Int(v) => {
                self.advance();
                Ok(v as f64)
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(v)
            }
            _ => Err(self.unexpected("expected number")),
        }
    }

    fn parse_scalar(&mut self) -> Result<Variant> {
        let v = match self.peek().kind.clone() {
            TokenKind::Int(v) => {
                if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                    Variant::Int(v as i32)
                } else {
                    Variant::Int64(v)
                }
            }
            TokenKind::Float(v) => Variant::Double(v),
            TokenKind::Str(s) => Variant::string(s),
            TokenKind::Keyword(Keyword::True) => Variant::Bool(true),
            TokenKind::Keyword(Keyword::False) => Variant::Bool(false),
            TokenKind::Keyword(Keyword::Null) => Variant::Null,
            TokenKind::Keyword(Keyword::Point) => return self.parse_point(),
            _ => return Err(self.unexpected("expected literal value")),
        };
        self.advance();
        Ok(v)
    }
}

fn strip_ns_prefix(field: &str, ns: &str) -> String {
    field
        .strip_prefix(ns)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(field)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(sql: &str) -> Query {
        match parse_sql(sql).unwrap() {
            SqlStatement::Select(q) => q,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn simple_select_with_sort() {
        let q = select("SELECT * FROM books WHERE title = 'A' ORDER BY id DESC");
        assert_eq!(q.namespace, "books");
        assert_eq!(q.filters.len(), 1);
        assert!(q.sort[0].desc);
        assert_eq!(q.sort[0].field, "id");
    }

    #[test]
    fn range_and_count() {
        let q = select("SELECT COUNT(*) FROM books WHERE price >= 2.5 AND price < 10.0");
        assert!(q.req_total);
        assert_eq!(q.filters.len(), 2);
        match &q.filters[1].node {
            FilterNode::Cond { cond, .. } => assert_eq!(*cond, CondType::Lt),
            _ => panic!("expected condition"),
        }
    }

    #[test]
    fn brackets_and_not() {
        let q = select("SELECT * FROM t WHERE a = 1 AND (b > 2 OR c < 3) AND NOT d = 4");
        assert_eq!(q.filters.len(), 3);
        assert!(matches!(q.filters[1].node, FilterNode::Bracket(_)));
        assert_eq!(q.filters[2].op, OpType::Not);
    }

    #[test]
    fn in_set_and_like() {
        let q = select("SELECT * FROM t WHERE id IN (1, 2, 3) OR name LIKE 'a%'");
        match &q.filters[0].node {
            FilterNode::Cond { cond, values, .. } => {
                assert_eq!(*cond, CondType::Set);
                assert_eq!(values.len(), 3);
            }
            _ => panic!(),
        }
        assert_eq!(q.filters[1].op, OpType::Or);
    }

    #[test]
    fn forced_sort_order() {
        let q = select("SELECT * FROM t ORDER BY FIELD(year, 2007, 2003) DESC");
        assert_eq!(q.sort[0].forced.len(), 2);
        assert!(q.sort[0].desc);
    }

    #[test]
    fn aggregates_and_facet() {
        let q = select("SELECT SUM(price), FACET(author ORDER BY count DESC LIMIT 5) FROM t");
        assert_eq!(q.aggregations.len(), 2);
        assert_eq!(q.aggregations[1].agg_type, AggType::Facet);
        assert_eq!(q.aggregations[1].limit, Some(5));
        assert!(q.aggregations[1].sort[0].desc);
    }

    #[test]
    fn update_and_delete() {
        let u = parse_sql("UPDATE books SET price = 3.5 WHERE id = 1").unwrap();
        match u {
            SqlStatement::Update(q) => {
                assert_eq!(q.update_fields.len(), 1);
                assert_eq!(q.filters.len(), 1);
            }
            _ => panic!(),
        }
        assert!(matches!(
            parse_sql("DELETE FROM books WHERE id = 2").unwrap(),
            SqlStatement::Delete(_)
        ));
        assert!(matches!(
            parse_sql("TRUNCATE books").unwrap(),
            SqlStatement::Truncate(ns) if ns == "books"
        ));
    }

    #[test]
    fn join_clause() {
        let q = select("SELECT * FROM orders INNER JOIN books ON orders.book_id = books.id");
        assert_eq!(q.join_queries.len(), 1);
        let j = &q.join_queries[0];
        assert_eq!(j.join_type, JoinType::Inner);
        assert_eq!(j.on[0].left_field, "book_id");
        assert_eq!(j.on[0].right_field, "id");
    }

    #[test]
    fn dwithin_condition() {
        let q = select("SELECT * FROM places WHERE DWITHIN(loc, POINT(1.0, 2.0), 5.0)");
        match &q.filters[0].node {
            FilterNode::Cond { cond, values, .. } => {
                assert_eq!(*cond, CondType::DWithin);
                assert_eq!(values.len(), 2);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parse_error_reports_position() {
        let err = parse_sql("SELECT * FROM").unwrap_err();
        assert!(err.msg.contains("line 1"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[test]
    fn is_null_and_is_not_null() {
        let q = select("SELECT * FROM t WHERE a IS NULL AND b IS NOT NULL");
        match &q.filters[0].node {
            FilterNode::Cond { cond, .. } => assert_eq!(*cond, CondType::Empty),
            _ => panic!(),
        }
        match &q.filters[1].node {
            FilterNode::Cond { cond, .. } => assert_eq!(*cond, CondType::Any),
            _ => panic!(),
        }
    }
}
