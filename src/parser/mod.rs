//! Bundled SQL parser
//!
//! A reference implementation of the parser collaborator interface:
//! [`parse`] compiles a query string into a [`CompiledIntent`], and
//! [`parse_expression`] compiles a bare predicate into a
//! [`PredicateIntent`]. The engine itself depends only on the intent
//! shapes, never on this grammar.

pub mod tokenizer;

use lazy_static::lazy_static;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::intent::{
    AggregateFunc, CompiledIntent, CompoundOp, CompoundTerm, JoinKind, JoinSpec, Operand,
    PredicateBuilder, PredicateIntent, PredicateOp, SelectItem, TableRef,
};
use crate::types::SortOrder;
use tokenizer::{tokenize, Token};

lazy_static! {
    /// Words that terminate a bare-alias position.
    static ref RESERVED: HashSet<&'static str> = [
        "select", "from", "where", "group", "having", "order", "limit", "offset", "union",
        "intersect", "except", "join", "inner", "left", "right", "full", "outer", "cross", "on",
        "as", "asc", "desc", "and", "or", "not", "between", "in", "like", "is", "null", "by",
        "all",
    ]
    .into_iter()
    .collect();
}

/// Compile a query string.
pub fn parse(sql: &str) -> Result<CompiledIntent> {
    let tokens = tokenize(sql)?;
    let mut p = Parser { tokens, pos: 0 };
    let intent = p.select_statement()?;
    p.expect_end()?;
    Ok(intent)
}

/// Compile a bare predicate expression.
pub fn parse_expression(sql: &str) -> Result<PredicateIntent> {
    let tokens = tokenize(sql)?;
    let mut p = Parser { tokens, pos: 0 };
    let mut b = PredicateBuilder::new();
    let root = p.expr(&mut b)?;
    p.expect_end()?;
    Ok(b.build(root))
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| Error::SqlSyntax("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn at_kw(&self, kw: &str) -> bool {
        self.peek().map(|t| t.is_kw(kw)).unwrap_or(false)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(Error::SqlSyntax(format!("expected {}", kw.to_uppercase())))
        }
    }

    fn expect_tok(&mut self, tok: Token) -> Result<()> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::SqlSyntax(format!("expected {:?}", tok)))
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        if self.peek() == Some(&Token::Semicolon) {
            self.pos += 1;
        }
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(Error::SqlSyntax(format!("trailing input at {:?}", t))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(s) => Ok(s.clone()),
            other => Err(Error::SqlSyntax(format!("expected identifier, got {:?}", other))),
        }
    }

    /// `name` or `qualifier.name`.
    fn qualified_name(&mut self) -> Result<String> {
        let first = self.ident()?;
        if self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let second = self.ident()?;
            Ok(format!("{}.{}", first, second))
        } else {
            Ok(first)
        }
    }

    /// Optional alias: `AS name` or a bare non-reserved identifier.
    fn opt_alias(&mut self) -> Result<Option<String>> {
        if self.eat_kw("as") {
            return Ok(Some(self.ident()?));
        }
        if let Some(Token::Ident(s)) = self.peek() {
            if !RESERVED.contains(s.to_ascii_lowercase().as_str()) {
                let alias = s.clone();
                self.pos += 1;
                return Ok(Some(alias));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn select_statement(&mut self) -> Result<CompiledIntent> {
        let mut head = self.select_core()?;
        loop {
            let op = if self.at_kw("union") {
                self.pos += 1;
                if self.eat_kw("all") {
                    CompoundOp::UnionAll
                } else {
                    CompoundOp::Union
                }
            } else if self.eat_kw("intersect") {
                CompoundOp::Intersect
            } else if self.eat_kw("except") {
                CompoundOp::Except
            } else {
                break;
            };
            let select = self.select_core()?;
            head.compound.push(CompoundTerm { op, select });
        }
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            head.order_by = self.order_terms()?;
        }
        if self.eat_kw("limit") {
            head.limit = Some(self.unsigned_int("LIMIT")?);
            if self.eat_kw("offset") {
                head.offset = Some(self.unsigned_int("OFFSET")?);
            }
        }
        Ok(head)
    }

    fn select_core(&mut self) -> Result<CompiledIntent> {
        self.expect_kw("select")?;
        let mut projection = Vec::new();
        loop {
            projection.push(self.select_item()?);
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect_kw("from")?;
        let from = self.table_ref()?;

        let mut joins = Vec::new();
        while let Some(kind) = self.join_kind()? {
            let table = self.table_ref()?;
            self.expect_kw("on")?;
            let left_key = self.qualified_name()?;
            self.expect_tok(Token::Eq)?;
            let right_key = self.qualified_name()?;
            joins.push(JoinSpec {
                kind,
                table,
                left_key,
                right_key,
            });
        }

        let filter = if self.eat_kw("where") {
            let mut b = PredicateBuilder::new();
            let root = self.expr(&mut b)?;
            Some(b.build(root))
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_kw("group") {
            self.expect_kw("by")?;
            loop {
                group_by.push(self.qualified_name()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let having = if self.eat_kw("having") {
            let mut b = PredicateBuilder::new();
            let root = self.expr(&mut b)?;
            Some(b.build(root))
        } else {
            None
        };

        Ok(CompiledIntent {
            projection,
            from,
            joins,
            filter,
            group_by,
            having,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            compound: Vec::new(),
        })
    }

    fn select_item(&mut self) -> Result<SelectItem> {
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            return Ok(SelectItem::AllColumns);
        }
        // Aggregate call?
        let func = match self.peek() {
            Some(Token::Ident(name)) => match name.to_ascii_lowercase().as_str() {
                "count" => Some(AggregateFunc::Count),
                "sum" => Some(AggregateFunc::Sum),
                "avg" => Some(AggregateFunc::Avg),
                "min" => Some(AggregateFunc::Min),
                "max" => Some(AggregateFunc::Max),
                _ => None,
            },
            _ => None,
        };
        let called = self.tokens.get(self.pos + 1) == Some(&Token::LParen);
        if let (Some(mut func), true) = (func, called) {
            self.pos += 2;
            let arg = if self.peek() == Some(&Token::Star) {
                if func != AggregateFunc::Count {
                    return Err(Error::SqlSyntax("only COUNT accepts *".into()));
                }
                func = AggregateFunc::CountStar;
                self.pos += 1;
                None
            } else {
                Some(self.qualified_name()?)
            };
            self.expect_tok(Token::RParen)?;
            let alias = self.opt_alias()?;
            return Ok(SelectItem::Aggregate { func, arg, alias });
        }
        let name = self.qualified_name()?;
        let alias = self.opt_alias()?;
        Ok(SelectItem::Column { name, alias })
    }

    fn table_ref(&mut self) -> Result<TableRef> {
        let name = self.ident()?;
        let alias = self.opt_alias()?;
        Ok(TableRef { name, alias })
    }

    fn join_kind(&mut self) -> Result<Option<JoinKind>> {
        let kind = if self.at_kw("join") || self.at_kw("inner") {
            let _ = self.eat_kw("inner");
            JoinKind::Inner
        } else if self.at_kw("left") {
            self.pos += 1;
            let _ = self.eat_kw("outer");
            JoinKind::Left
        } else if self.at_kw("right") {
            self.pos += 1;
            let _ = self.eat_kw("outer");
            JoinKind::Right
        } else if self.at_kw("full") {
            self.pos += 1;
            let _ = self.eat_kw("outer");
            JoinKind::Full
        } else {
            return Ok(None);
        };
        self.expect_kw("join")?;
        Ok(Some(kind))
    }

    fn order_terms(&mut self) -> Result<Vec<crate::intent::OrderTerm>> {
        let mut terms = Vec::new();
        loop {
            let column = self.qualified_name()?;
            let order = if self.eat_kw("desc") {
                SortOrder::Desc
            } else {
                let _ = self.eat_kw("asc");
                SortOrder::Asc
            };
            terms.push(crate::intent::OrderTerm { column, order });
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(terms)
    }

    fn unsigned_int(&mut self, what: &str) -> Result<u64> {
        match self.next()? {
            Token::Int(i) if *i >= 0 => Ok(*i as u64),
            _ => Err(Error::SqlSyntax(format!("{} expects a non-negative integer", what))),
        }
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    fn expr(&mut self, b: &mut PredicateBuilder) -> Result<usize> {
        let mut left = self.and_expr(b)?;
        while self.eat_kw("or") {
            let right = self.and_expr(b)?;
            left = b.or(left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self, b: &mut PredicateBuilder) -> Result<usize> {
        let mut left = self.not_expr(b)?;
        while self.eat_kw("and") {
            let right = self.not_expr(b)?;
            left = b.and(left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self, b: &mut PredicateBuilder) -> Result<usize> {
        if self.eat_kw("not") {
            let child = self.not_expr(b)?;
            return Ok(b.not(child));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr(b)?;
            self.expect_tok(Token::RParen)?;
            return Ok(inner);
        }
        self.term(b)
    }

    fn term(&mut self, b: &mut PredicateBuilder) -> Result<usize> {
        // An aggregate call in a HAVING term references the aggregate's
        // output column by its canonical name, e.g. `COUNT(*)`.
        let column = if self.tokens.get(self.pos + 1) == Some(&Token::LParen) {
            let func = self.ident()?;
            self.expect_tok(Token::LParen)?;
            let arg = if self.peek() == Some(&Token::Star) {
                self.pos += 1;
                "*".to_string()
            } else {
                self.qualified_name()?
            };
            self.expect_tok(Token::RParen)?;
            format!("{}({})", func.to_ascii_uppercase(), arg)
        } else {
            self.qualified_name()?
        };

        // NOT LIKE / NOT IN / NOT BETWEEN
        if self.at_kw("not") {
            self.pos += 1;
            let inner = self.column_op(b, &column)?;
            return Ok(b.not(inner));
        }
        self.column_op(b, &column)
    }

    fn column_op(&mut self, b: &mut PredicateBuilder, column: &str) -> Result<usize> {
        let tok = self.next()?.clone();
        match tok {
            Token::Eq => self.comparison(b, PredicateOp::Eq, column),
            Token::Neq => self.comparison(b, PredicateOp::Neq, column),
            Token::Lt => self.comparison(b, PredicateOp::Lt, column),
            Token::Lte => self.comparison(b, PredicateOp::Lte, column),
            Token::Gt => self.comparison(b, PredicateOp::Gt, column),
            Token::Gte => self.comparison(b, PredicateOp::Gte, column),
            Token::Ident(ref kw) if kw.eq_ignore_ascii_case("between") => {
                let low = self.operand()?;
                self.expect_kw("and")?;
                let high = self.operand()?;
                Ok(b.between(column, low, high))
            }
            Token::Ident(ref kw) if kw.eq_ignore_ascii_case("in") => {
                self.expect_tok(Token::LParen)?;
                let set = self.value_set()?;
                self.expect_tok(Token::RParen)?;
                Ok(b.compare(PredicateOp::In, column, set))
            }
            Token::Ident(ref kw) if kw.eq_ignore_ascii_case("like") => {
                let pattern = match self.next()? {
                    Token::Str(s) => s.clone(),
                    other => {
                        return Err(Error::SqlSyntax(format!(
                            "LIKE expects a string pattern, got {:?}",
                            other
                        )))
                    }
                };
                let (op, needle) = classify_like(&pattern);
                Ok(b.compare(op, column, Operand::Text(needle)))
            }
            Token::Ident(ref kw) if kw.eq_ignore_ascii_case("is") => {
                let negated = self.eat_kw("not");
                self.expect_kw("null")?;
                if negated {
                    Ok(b.is_not_null(column))
                } else {
                    Ok(b.is_null(column))
                }
            }
            other => Err(Error::SqlSyntax(format!(
                "expected a comparison operator after '{}', got {:?}",
                column, other
            ))),
        }
    }

    fn comparison(
        &mut self,
        b: &mut PredicateBuilder,
        op: PredicateOp,
        column: &str,
    ) -> Result<usize> {
        let value = self.operand()?;
        Ok(b.compare(op, column, value))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next()? {
            Token::Int(i) => Ok(Operand::Int64(*i)),
            Token::Float(f) => Ok(Operand::Float64(*f)),
            Token::Str(s) => Ok(Operand::Text(s.clone())),
            Token::Blob(bytes) => Ok(Operand::Blob(bytes.clone())),
            Token::Param(name) => Ok(Operand::Parameter(name.clone())),
            Token::Ident(s) if s.eq_ignore_ascii_case("null") => Err(Error::SqlSyntax(
                "comparisons to NULL never match; use IS NULL".into(),
            )),
            Token::Ident(s) => Err(Error::SqlSyntax(format!(
                "column-to-column comparison with '{}' belongs in an ON clause",
                s
            ))),
            other => Err(Error::SqlSyntax(format!("expected a value, got {:?}", other))),
        }
    }

    /// Homogeneous IN list of integers or strings.
    fn value_set(&mut self) -> Result<Operand> {
        let mut ints = Vec::new();
        let mut texts = Vec::new();
        loop {
            match self.next()? {
                Token::Int(i) => ints.push(*i),
                Token::Str(s) => texts.push(s.clone()),
                other => {
                    return Err(Error::SqlSyntax(format!(
                        "IN lists hold integers or strings, got {:?}",
                        other
                    )))
                }
            }
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        match (ints.is_empty(), texts.is_empty()) {
            (false, true) => Ok(Operand::Int64Set(ints)),
            (true, false) => Ok(Operand::TextSet(texts)),
            (true, true) => Err(Error::SqlSyntax("empty IN list".into())),
            (false, false) => Err(Error::SqlSyntax("mixed-type IN list".into())),
        }
    }
}

/// Map a LIKE pattern onto the cheapest operator that matches it.
fn classify_like(pattern: &str) -> (PredicateOp, String) {
    if pattern.contains('_') {
        return (PredicateOp::Like, pattern.to_string());
    }
    let starts = pattern.starts_with('%');
    let ends = pattern.ends_with('%') && pattern.len() > 1;
    let inner = pattern.trim_matches('%');
    if inner.contains('%') {
        return (PredicateOp::Like, pattern.to_string());
    }
    match (starts, ends) {
        (false, true) => (PredicateOp::StartsWith, inner.to_string()),
        (true, false) => (PredicateOp::EndsWith, inner.to_string()),
        (true, true) => (PredicateOp::Contains, inner.to_string()),
        (false, false) => (PredicateOp::Like, pattern.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_select() {
        let q = parse("SELECT name, age FROM users WHERE age > 28 ORDER BY age ASC").unwrap();
        assert_eq!(q.projection.len(), 2);
        assert_eq!(q.from.name, "users");
        let filter = q.filter.unwrap();
        assert_eq!(filter.root_node().op, PredicateOp::Gt);
        assert_eq!(q.order_by.len(), 1);
        assert_eq!(q.order_by[0].order, SortOrder::Asc);
    }

    #[test]
    fn test_parse_join_with_aliases() {
        let q = parse(
            "SELECT u.name, o.amount FROM users u LEFT JOIN orders o ON u.id = o.user_id \
             ORDER BY u.id, o.id",
        )
        .unwrap();
        assert_eq!(q.from.alias.as_deref(), Some("u"));
        assert_eq!(q.joins.len(), 1);
        assert_eq!(q.joins[0].kind, JoinKind::Left);
        assert_eq!(q.joins[0].left_key, "u.id");
        assert_eq!(q.joins[0].right_key, "o.user_id");
    }

    #[test]
    fn test_parse_aggregates_and_group_by() {
        let q = parse("SELECT dept, COUNT(*), AVG(score) FROM users GROUP BY dept").unwrap();
        assert!(q.has_aggregates());
        assert_eq!(q.group_by, vec!["dept".to_string()]);
        assert!(matches!(
            q.projection[1],
            SelectItem::Aggregate {
                func: AggregateFunc::CountStar,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_compound() {
        let q = parse("SELECT id FROM a UNION SELECT id FROM b EXCEPT SELECT id FROM c").unwrap();
        assert_eq!(q.compound.len(), 2);
        assert_eq!(q.compound[0].op, CompoundOp::Union);
        assert_eq!(q.compound[1].op, CompoundOp::Except);
    }

    #[test]
    fn test_parse_between_and_connective_and() {
        let p = parse_expression("x BETWEEN 2.0 AND 6.0 AND y BETWEEN 1.0 AND 3.0").unwrap();
        let root = p.root_node();
        assert_eq!(root.op, PredicateOp::And);
        assert_eq!(p.nodes[root.left.unwrap()].op, PredicateOp::Between);
        assert_eq!(p.nodes[root.right.unwrap()].op, PredicateOp::Between);
    }

    #[test]
    fn test_parse_in_and_like() {
        let p = parse_expression("name LIKE 'Al%' AND id IN (1, 2, 3)").unwrap();
        let root = p.root_node();
        let left = &p.nodes[root.left.unwrap()];
        assert_eq!(left.op, PredicateOp::StartsWith);
        assert_eq!(left.value, Some(Operand::Text("Al".into())));
        let right = &p.nodes[root.right.unwrap()];
        assert_eq!(right.op, PredicateOp::In);
        assert_eq!(right.value, Some(Operand::Int64Set(vec![1, 2, 3])));
    }

    #[test]
    fn test_like_classification() {
        assert_eq!(classify_like("abc%"), (PredicateOp::StartsWith, "abc".into()));
        assert_eq!(classify_like("%abc"), (PredicateOp::EndsWith, "abc".into()));
        assert_eq!(classify_like("%abc%"), (PredicateOp::Contains, "abc".into()));
        assert_eq!(classify_like("a_c"), (PredicateOp::Like, "a_c".into()));
        assert_eq!(classify_like("a%c"), (PredicateOp::Like, "a%c".into()));
    }

    #[test]
    fn test_parameters_parse() {
        let p = parse_expression("age >= :min AND name = :who").unwrap();
        let root = p.root_node();
        assert_eq!(
            p.nodes[root.left.unwrap()].value,
            Some(Operand::Parameter("min".into()))
        );
    }

    #[test]
    fn test_null_comparison_rejected() {
        assert!(matches!(
            parse_expression("x = NULL"),
            Err(Error::SqlSyntax(_))
        ));
    }
}
