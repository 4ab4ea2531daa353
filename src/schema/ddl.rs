//! DDL parsing for the catalog
//!
//! Parses the `sql` column of schema rows: `CREATE TABLE`,
//! `CREATE [UNIQUE] INDEX` and `CREATE VIEW`. Covers what the catalog
//! needs — column names, declared types, the `INTEGER PRIMARY KEY` rowid
//! alias, `NOT NULL`, and index column lists with sort order — and skips
//! over constraint clauses it does not model.

use crate::error::{Error, Result};
use crate::parser::tokenizer::{tokenize, Token};
use crate::schema::{Column, IndexColumn};

/// Parsed `CREATE TABLE`: name and column list.
pub fn parse_create_table(sql: &str) -> Result<(String, Vec<Column>)> {
    let tokens = tokenize(sql)?;
    let mut p = Ddl { tokens, pos: 0 };
    p.expect_kw("create")?;
    p.expect_kw("table")?;
    let _ = p.eat_kw("if") && p.eat_kw("not") && p.eat_kw("exists");
    let name = p.ident()?;
    p.expect(Token::LParen)?;

    let mut columns = Vec::new();
    loop {
        // Table-level constraint clauses end the column list.
        if p.at_kw("primary") || p.at_kw("unique") || p.at_kw("check") || p.at_kw("foreign") {
            p.skip_to_close()?;
            break;
        }
        let col_name = p.ident()?;
        let mut declared_type = String::new();
        while let Some(Token::Ident(word)) = p.peek() {
            if is_constraint_word(word) {
                break;
            }
            if !declared_type.is_empty() {
                declared_type.push(' ');
            }
            declared_type.push_str(word);
            p.pos += 1;
        }
        // Parenthesized type arguments, e.g. VARCHAR(10).
        if p.peek() == Some(&Token::LParen) {
            p.skip_parens()?;
        }

        let mut is_primary_key = false;
        let mut is_not_null = false;
        loop {
            if p.eat_kw("primary") {
                p.expect_kw("key")?;
                let _ = p.eat_kw("asc") || p.eat_kw("desc");
                let _ = p.eat_kw("autoincrement");
                is_primary_key = true;
            } else if p.eat_kw("not") {
                p.expect_kw("null")?;
                is_not_null = true;
            } else if p.eat_kw("unique") || p.eat_kw("null") {
                // accepted, not modeled
            } else if p.eat_kw("default") {
                p.skip_value()?;
            } else if p.eat_kw("check") {
                p.skip_parens()?;
            } else if p.eat_kw("collate") {
                let _ = p.ident()?;
            } else {
                break;
            }
        }

        let is_rowid_alias = is_primary_key && declared_type.eq_ignore_ascii_case("integer");
        columns.push(Column {
            name: col_name,
            declared_type,
            ordinal: columns.len(),
            is_primary_key,
            is_not_null,
            is_rowid_alias,
        });

        match p.next()? {
            Token::Comma => continue,
            Token::RParen => break,
            other => {
                return Err(Error::SqlSyntax(format!(
                    "expected ',' or ')' in column list, got {:?}",
                    other
                )))
            }
        }
    }
    Ok((name, columns))
}

/// Parsed `CREATE [UNIQUE] INDEX`: (index, table, columns, unique).
pub fn parse_create_index(sql: &str) -> Result<(String, String, Vec<IndexColumn>, bool)> {
    let tokens = tokenize(sql)?;
    let mut p = Ddl { tokens, pos: 0 };
    p.expect_kw("create")?;
    let unique = p.eat_kw("unique");
    p.expect_kw("index")?;
    let _ = p.eat_kw("if") && p.eat_kw("not") && p.eat_kw("exists");
    let index_name = p.ident()?;
    p.expect_kw("on")?;
    let table_name = p.ident()?;
    p.expect(Token::LParen)?;
    let mut columns = Vec::new();
    loop {
        let name = p.ident()?;
        let descending = if p.eat_kw("desc") {
            true
        } else {
            let _ = p.eat_kw("asc");
            false
        };
        columns.push(IndexColumn {
            name,
            ordinal: columns.len(),
            descending,
        });
        match p.next()? {
            Token::Comma => continue,
            Token::RParen => break,
            other => {
                return Err(Error::SqlSyntax(format!(
                    "expected ',' or ')' in index column list, got {:?}",
                    other
                )))
            }
        }
    }
    Ok((index_name, table_name, columns, unique))
}

/// Parsed `CREATE VIEW`: (name, body SELECT text).
pub fn parse_create_view(sql: &str) -> Result<(String, String)> {
    let tokens = tokenize(sql)?;
    let mut p = Ddl { tokens, pos: 0 };
    p.expect_kw("create")?;
    p.expect_kw("view")?;
    let _ = p.eat_kw("if") && p.eat_kw("not") && p.eat_kw("exists");
    let name = p.ident()?;
    p.expect_kw("as")?;
    // The body is everything after AS; re-slice the original text so the
    // view registry keeps it verbatim.
    let lower = sql.to_ascii_lowercase();
    let as_pos = lower
        .find(" as ")
        .ok_or_else(|| Error::SqlSyntax("CREATE VIEW without AS".into()))?;
    Ok((name, sql[as_pos + 4..].trim().trim_end_matches(';').to_string()))
}

fn is_constraint_word(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "primary" | "not" | "null" | "unique" | "default" | "check" | "references" | "collate"
            | "constraint" | "generated"
    )
}

// ============================================================================
// Token Walker
// ============================================================================

struct Ddl {
    tokens: Vec<Token>,
    pos: usize,
}

impl Ddl {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| Error::SqlSyntax("unexpected end of DDL".into()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(s) => Ok(s.clone()),
            other => Err(Error::SqlSyntax(format!("expected identifier, got {:?}", other))),
        }
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

    fn expect(&mut self, tok: Token) -> Result<()> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::SqlSyntax(format!("expected {:?}", tok)))
        }
    }

    /// Skip one literal or a parenthesized expression (DEFAULT values).
    fn skip_value(&mut self) -> Result<()> {
        if self.peek() == Some(&Token::LParen) {
            return self.skip_parens();
        }
        self.next()?;
        Ok(())
    }

    /// Skip a balanced parenthesized group, starting at `(`.
    fn skip_parens(&mut self) -> Result<()> {
        self.expect(Token::LParen)?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Skip everything up to and including the closing `)` of the
    /// current group.
    fn skip_to_close(&mut self) -> Result<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_table() {
        let (name, cols) =
            parse_create_table("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
                .unwrap();
        assert_eq!(name, "users");
        assert_eq!(cols.len(), 3);
        assert!(cols[0].is_rowid_alias);
        assert_eq!(cols[1].name, "name");
        assert_eq!(cols[2].declared_type, "INTEGER");
    }

    #[test]
    fn test_parse_table_with_constraints() {
        let (_, cols) = parse_create_table(
            "CREATE TABLE t (a TEXT NOT NULL DEFAULT 'x', b VARCHAR(10) UNIQUE, c REAL, \
             PRIMARY KEY (a, b))",
        )
        .unwrap();
        assert_eq!(cols.len(), 3);
        assert!(cols[0].is_not_null);
        assert!(!cols[0].is_rowid_alias);
        assert_eq!(cols[1].declared_type, "VARCHAR");
    }

    #[test]
    fn test_non_integer_primary_key_is_not_alias() {
        let (_, cols) = parse_create_table("CREATE TABLE t (k TEXT PRIMARY KEY, v BLOB)").unwrap();
        assert!(cols[0].is_primary_key);
        assert!(!cols[0].is_rowid_alias);
    }

    #[test]
    fn test_parse_index() {
        let (idx, table, cols, unique) =
            parse_create_index("CREATE UNIQUE INDEX idx_xy ON points (x, y DESC)").unwrap();
        assert_eq!(idx, "idx_xy");
        assert_eq!(table, "points");
        assert!(unique);
        assert!(!cols[0].descending);
        assert!(cols[1].descending);
    }

    #[test]
    fn test_parse_view() {
        let (name, body) =
            parse_create_view("CREATE VIEW adults AS SELECT name FROM users WHERE age >= 18")
                .unwrap();
        assert_eq!(name, "adults");
        assert!(body.starts_with("SELECT"));
    }
}
