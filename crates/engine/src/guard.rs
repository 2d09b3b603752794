//! SQL validation: only read-only SELECT/WITH statements over the `data`
//! table are allowed through. The LLM is the author of these queries, so the
//! guard treats every input as untrusted.

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::QueryError;

/// Keywords that must never appear as an identifier token, regardless of
/// position. String literals are separate token kinds and are not scanned.
const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "REPLACE", "ATTACH",
    "COPY", "PRAGMA", "LOAD", "INSTALL", "EXPORT", "IMPORT", "CALL",
];

/// The only base relation queries may reference.
const DATA_TABLE: &str = "data";

/// Validate a query without executing it.
///
/// Checks, in order: keyword denylist over identifier tokens (before parsing,
/// so a denied keyword is reported as Forbidden even when it also breaks the
/// grammar), parseability, single read-only statement, and that every
/// referenced relation is either `data` or a CTE defined by the statement
/// itself.
pub fn validate(sql: &str) -> Result<(), QueryError> {
    let dialect = GenericDialect {};

    scan_tokens(&dialect, sql)?;

    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| QueryError::Syntax(e.to_string()))?;

    match statements.len() {
        0 => return Err(QueryError::Syntax("empty query".into())),
        1 => {}
        _ => {
            return Err(QueryError::Forbidden(
                "multiple statements are not allowed".into(),
            ))
        }
    }

    let statement = &statements[0];
    if !matches!(statement, Statement::Query(_)) {
        return Err(QueryError::Forbidden(
            "only SELECT queries are allowed".into(),
        ));
    }

    check_relations(statement)?;

    Ok(())
}

/// Reject any denied keyword appearing as an unquoted word token. Tokenizing
/// (rather than substring matching) means `SELECT 'drop table' FROM data`
/// passes while `SELECT * FROM data; DROP TABLE data` does not.
fn scan_tokens(dialect: &GenericDialect, sql: &str) -> Result<(), QueryError> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| QueryError::Syntax(e.to_string()))?;

    for token in tokens {
        if let Token::Word(word) = token {
            if word.quote_style.is_none() {
                let upper = word.value.to_ascii_uppercase();
                if DENIED_KEYWORDS.contains(&upper.as_str()) {
                    return Err(QueryError::Forbidden(format!(
                        "statement type '{upper}' is not allowed; only SELECT queries are permitted"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Collects every relation reference and every CTE name in one walk.
#[derive(Default)]
struct RelationCollector {
    relations: Vec<String>,
    ctes: HashSet<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        self.relations.push(normalize_relation(relation));
        ControlFlow::Continue(())
    }
}

fn normalize_relation(name: &ObjectName) -> String {
    name.to_string()
        .replace(['"', '`'], "")
        .to_lowercase()
}

fn check_relations(statement: &Statement) -> Result<(), QueryError> {
    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);

    for relation in &collector.relations {
        if relation != DATA_TABLE && !collector.ctes.contains(relation) {
            return Err(QueryError::Forbidden(format!(
                "unknown table '{relation}'; only the `{DATA_TABLE}` table may be queried"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forbidden(sql: &str) -> bool {
        matches!(validate(sql), Err(QueryError::Forbidden(_)))
    }

    #[test]
    fn accepts_plain_select() {
        assert!(validate("SELECT * FROM data").is_ok());
        assert!(validate("select count(*) from data").is_ok());
        assert!(validate("SELECT * FROM data LIMIT 10;").is_ok());
    }

    #[test]
    fn accepts_with_cte() {
        assert!(validate("WITH top AS (SELECT * FROM data LIMIT 5) SELECT * FROM top").is_ok());
        assert!(validate(
            "WITH a AS (SELECT * FROM data), b AS (SELECT * FROM a) SELECT count(*) FROM b"
        )
        .is_ok());
    }

    #[test]
    fn rejects_every_denied_keyword_any_casing() {
        for kw in DENIED_KEYWORDS {
            let lower = kw.to_lowercase();
            assert!(
                forbidden(&format!("SELECT * FROM data WHERE x = 1 OR {lower}(1) = 2")),
                "expected Forbidden for keyword {kw}"
            );
            assert!(
                forbidden(&format!("  SELECT {kw} FROM data ; ")),
                "expected Forbidden for keyword {kw} with whitespace + semicolon"
            );
        }
    }

    #[test]
    fn keyword_inside_string_literal_is_fine() {
        assert!(validate("SELECT 'drop table' AS x FROM data").is_ok());
        assert!(validate("SELECT * FROM data WHERE name = 'insert into y'").is_ok());
    }

    #[test]
    fn rejects_dml_statements() {
        assert!(forbidden("DELETE FROM data"));
        assert!(forbidden("UPDATE data SET x = 1"));
        assert!(forbidden("INSERT INTO data VALUES (1)"));
        assert!(forbidden("DROP TABLE data"));
    }

    #[test]
    fn rejects_multiple_statements() {
        assert!(forbidden("SELECT 1 FROM data; SELECT 2 FROM data"));
    }

    #[test]
    fn rejects_foreign_tables() {
        assert!(forbidden("SELECT * FROM users"));
        assert!(forbidden("SELECT * FROM data JOIN other ON data.id = other.id"));
        // Table functions show up as relations too.
        assert!(forbidden("SELECT * FROM read_csv_auto('/etc/passwd')"));
    }

    #[test]
    fn quoted_data_table_is_accepted() {
        assert!(validate("SELECT * FROM \"data\"").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(validate("not sql at all ("), Err(QueryError::Syntax(_))));
        assert!(matches!(validate(""), Err(QueryError::Syntax(_))));
    }
}
