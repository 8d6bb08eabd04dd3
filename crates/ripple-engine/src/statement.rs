//! Lightweight SQL statement classification.
//!
//! The coordinator needs to know, before a statement runs, which kinds of
//! change events it could produce and whether it is transaction control,
//! savepoint control, or schema-altering DDL. This is a prefix classifier,
//! not a SQL parser: anything it cannot confidently classify degrades to
//! [`StatementKind::Unclassified`], which conservatively activates every
//! registered observer.

use ripple_core::EventKind;

/// How an explicit transaction acquires its locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOp {
    Begin(TransactionKind),
    Commit,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SavepointOp {
    Begin(String),
    Release(String),
    RollbackTo(String),
}

/// Classification of one SQL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Transaction(TransactionOp),
    Savepoint(SavepointOp),
    /// DDL; invalidates schema-derived caches.
    SchemaChange,
    /// DML with the event kinds it could produce.
    Mutation { kinds: Vec<EventKind> },
    /// Reads and other statements that cannot produce row events.
    Other,
    /// Could touch anything (CTE-wrapped DML, unknown syntax).
    Unclassified,
}

impl StatementKind {
    pub fn classify(sql: &str) -> Self {
        let mut t = Tokenizer::new(sql);
        let Some(Token::Word(first)) = t.next() else {
            return Self::Other;
        };
        match first.as_str() {
            "begin" => {
                let kind = match t.peek_word().as_deref() {
                    Some("immediate") => TransactionKind::Immediate,
                    Some("exclusive") => TransactionKind::Exclusive,
                    _ => TransactionKind::Deferred,
                };
                Self::Transaction(TransactionOp::Begin(kind))
            }
            "commit" | "end" => Self::Transaction(TransactionOp::Commit),
            "rollback" => {
                if t.peek_word().as_deref() == Some("transaction") {
                    t.next();
                }
                if t.peek_word().as_deref() == Some("to") {
                    t.next();
                    if t.peek_word().as_deref() == Some("savepoint") {
                        t.next();
                    }
                    match t.next_word() {
                        Some(name) => Self::Savepoint(SavepointOp::RollbackTo(name)),
                        None => Self::Unclassified,
                    }
                } else {
                    Self::Transaction(TransactionOp::Rollback)
                }
            }
            "savepoint" => match t.next_word() {
                Some(name) => Self::Savepoint(SavepointOp::Begin(name)),
                None => Self::Unclassified,
            },
            "release" => {
                if t.peek_word().as_deref() == Some("savepoint") {
                    t.next();
                }
                match t.next_word() {
                    Some(name) => Self::Savepoint(SavepointOp::Release(name)),
                    None => Self::Unclassified,
                }
            }
            "create" | "alter" | "drop" => Self::SchemaChange,
            "insert" | "replace" => classify_insert(&mut t, first == "replace"),
            "update" => classify_update(&mut t),
            "delete" => classify_delete(&mut t),
            "select" | "pragma" | "explain" | "analyze" | "vacuum" | "attach" | "detach"
            | "reindex" => Self::Other,
            _ => Self::Unclassified,
        }
    }
}

fn classify_insert(t: &mut Tokenizer<'_>, mut replace: bool) -> StatementKind {
    let mut word = t.next_word();
    if word.as_deref() == Some("or") {
        if t.peek_word().as_deref() == Some("replace") {
            replace = true;
        }
        t.next();
        word = t.next_word();
    }
    if word.as_deref() != Some("into") {
        return StatementKind::Unclassified;
    }
    let Some(table) = t.next_name() else {
        return StatementKind::Unclassified;
    };
    let mut kinds = vec![EventKind::insert(table.clone())];
    if replace {
        // REPLACE resolves conflicts by deleting the clashing rows.
        kinds.push(EventKind::delete(table));
    }
    StatementKind::Mutation { kinds }
}

fn classify_update(t: &mut Tokenizer<'_>) -> StatementKind {
    if t.peek_word().as_deref() == Some("or") {
        t.next();
        t.next(); // conflict action
    }
    let Some(table) = t.next_name() else {
        return StatementKind::Unclassified;
    };
    if t.next_word().as_deref() != Some("set") {
        return StatementKind::Unclassified;
    }
    let Some(columns) = parse_set_columns(t) else {
        return StatementKind::Unclassified;
    };
    StatementKind::Mutation {
        kinds: vec![EventKind::update(table, columns)],
    }
}

fn classify_delete(t: &mut Tokenizer<'_>) -> StatementKind {
    if t.next_word().as_deref() != Some("from") {
        return StatementKind::Unclassified;
    }
    match t.next_name() {
        Some(table) => StatementKind::Mutation {
            kinds: vec![EventKind::delete(table)],
        },
        None => StatementKind::Unclassified,
    }
}

/// Columns named on the left-hand side of a SET list. Expressions are
/// skipped token-wise, tracking paren depth so commas inside calls do not
/// split the list.
fn parse_set_columns(t: &mut Tokenizer<'_>) -> Option<Vec<String>> {
    let mut columns = Vec::new();
    loop {
        let Some(Token::Word(column)) = t.next() else {
            return None;
        };
        columns.push(column);
        if t.next() != Some(Token::Punct('=')) {
            return None;
        }
        let mut depth: u32 = 0;
        loop {
            match t.next() {
                None => return Some(columns),
                Some(Token::Punct('(')) => depth += 1,
                Some(Token::Punct(')')) => depth = depth.saturating_sub(1),
                Some(Token::Punct(',')) if depth == 0 => break, // next assignment
                Some(Token::Word(w))
                    if depth == 0 && matches!(w.as_str(), "where" | "from" | "returning") =>
                {
                    return Some(columns);
                }
                Some(_) => {}
            }
        }
    }
}

/// Token stream over a SQL string. Words cover keywords and identifiers,
/// with quoted forms unwrapped and everything lowercased; string literals
/// and single punctuation characters pass through as their own tokens.
/// Comments and whitespace are skipped.
#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Literal,
    Punct(char),
}

struct Tokenizer<'a> {
    rest: &'a str,
    peeked: Option<Option<Token>>,
}

impl<'a> Tokenizer<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            rest: sql,
            peeked: None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        if let Some(t) = self.peeked.take() {
            return t;
        }
        self.lex()
    }

    fn peek_word(&mut self) -> Option<String> {
        if self.peeked.is_none() {
            let t = self.lex();
            self.peeked = Some(t);
        }
        match self.peeked.as_ref().and_then(|t| t.as_ref()) {
            Some(Token::Word(w)) => Some(w.clone()),
            _ => None,
        }
    }

    fn next_word(&mut self) -> Option<String> {
        match self.next() {
            Some(Token::Word(w)) => Some(w),
            _ => None,
        }
    }

    /// A possibly schema-qualified name; returns the final component.
    fn next_name(&mut self) -> Option<String> {
        let mut name = self.next_word()?;
        while self.peek_punct('.') {
            self.next();
            name = self.next_word()?;
        }
        Some(name)
    }

    fn peek_punct(&mut self, c: char) -> bool {
        if self.peeked.is_none() {
            let t = self.lex();
            self.peeked = Some(t);
        }
        matches!(
            self.peeked.as_ref().and_then(|t| t.as_ref()),
            Some(Token::Punct(p)) if *p == c
        )
    }

    fn lex(&mut self) -> Option<Token> {
        loop {
            self.rest = self.rest.trim_start();
            if let Some(stripped) = self.rest.strip_prefix("--") {
                self.rest = stripped.split_once('\n').map_or("", |(_, r)| r);
                continue;
            }
            if let Some(stripped) = self.rest.strip_prefix("/*") {
                self.rest = stripped.split_once("*/").map_or("", |(_, r)| r);
                continue;
            }
            break;
        }
        let mut chars = self.rest.char_indices();
        let (_, first) = chars.next()?;
        match first {
            '\'' => {
                // String literal with '' escapes.
                let mut end = self.rest.len();
                let bytes = self.rest.as_bytes();
                let mut i = 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        end = i + 1;
                        break;
                    }
                    i += 1;
                }
                self.rest = &self.rest[end.min(self.rest.len())..];
                Some(Token::Literal)
            }
            '"' | '`' => self.quoted_word(first, first),
            '[' => self.quoted_word('[', ']'),
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let end = self
                    .rest
                    .char_indices()
                    .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '$'))
                    .map_or(self.rest.len(), |(i, _)| i);
                let word = self.rest[..end].to_lowercase();
                self.rest = &self.rest[end..];
                Some(Token::Word(word))
            }
            c => {
                self.rest = &self.rest[c.len_utf8()..];
                Some(Token::Punct(c))
            }
        }
    }

    fn quoted_word(&mut self, open: char, close: char) -> Option<Token> {
        let inner = &self.rest[open.len_utf8()..];
        let (word, consumed) = match inner.find(close) {
            Some(i) => (&inner[..i], open.len_utf8() + i + close.len_utf8()),
            None => (inner, self.rest.len()),
        };
        let token = Token::Word(word.to_lowercase());
        self.rest = &self.rest[consumed.min(self.rest.len())..];
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> StatementKind {
        StatementKind::classify(sql)
    }

    #[test]
    fn transaction_control() {
        assert_eq!(
            classify("BEGIN"),
            StatementKind::Transaction(TransactionOp::Begin(TransactionKind::Deferred))
        );
        assert_eq!(
            classify("begin immediate transaction"),
            StatementKind::Transaction(TransactionOp::Begin(TransactionKind::Immediate))
        );
        assert_eq!(
            classify("COMMIT"),
            StatementKind::Transaction(TransactionOp::Commit)
        );
        assert_eq!(
            classify("END TRANSACTION"),
            StatementKind::Transaction(TransactionOp::Commit)
        );
        assert_eq!(
            classify("ROLLBACK"),
            StatementKind::Transaction(TransactionOp::Rollback)
        );
    }

    #[test]
    fn savepoint_control() {
        assert_eq!(
            classify("SAVEPOINT Alpha"),
            StatementKind::Savepoint(SavepointOp::Begin("alpha".into()))
        );
        assert_eq!(
            classify("RELEASE SAVEPOINT alpha"),
            StatementKind::Savepoint(SavepointOp::Release("alpha".into()))
        );
        assert_eq!(
            classify("RELEASE alpha"),
            StatementKind::Savepoint(SavepointOp::Release("alpha".into()))
        );
        assert_eq!(
            classify("ROLLBACK TO SAVEPOINT \"Alpha\""),
            StatementKind::Savepoint(SavepointOp::RollbackTo("alpha".into()))
        );
        assert_eq!(
            classify("ROLLBACK TRANSACTION TO alpha"),
            StatementKind::Savepoint(SavepointOp::RollbackTo("alpha".into()))
        );
    }

    #[test]
    fn ddl() {
        assert_eq!(classify("CREATE TABLE t (a)"), StatementKind::SchemaChange);
        assert_eq!(classify("drop index i"), StatementKind::SchemaChange);
        assert_eq!(
            classify("ALTER TABLE t ADD COLUMN b"),
            StatementKind::SchemaChange
        );
    }

    #[test]
    fn insert_kinds() {
        assert_eq!(
            classify("INSERT INTO player (name) VALUES ('a')"),
            StatementKind::Mutation {
                kinds: vec![EventKind::insert("player")]
            }
        );
        assert_eq!(
            classify("INSERT OR REPLACE INTO player VALUES (1, 'a')"),
            StatementKind::Mutation {
                kinds: vec![EventKind::insert("player"), EventKind::delete("player")]
            }
        );
        assert_eq!(
            classify("REPLACE INTO main.player VALUES (1)"),
            StatementKind::Mutation {
                kinds: vec![EventKind::insert("player"), EventKind::delete("player")]
            }
        );
    }

    #[test]
    fn update_columns() {
        assert_eq!(
            classify("UPDATE player SET score = score + 1, name = 'x' WHERE id = 1"),
            StatementKind::Mutation {
                kinds: vec![EventKind::update(
                    "player",
                    vec!["score".to_string(), "name".to_string()]
                )]
            }
        );
    }

    #[test]
    fn update_with_function_call_in_expression() {
        assert_eq!(
            classify("UPDATE t SET a = max(b, c), d = 2"),
            StatementKind::Mutation {
                kinds: vec![EventKind::update(
                    "t",
                    vec!["a".to_string(), "d".to_string()]
                )]
            }
        );
    }

    #[test]
    fn delete_kind() {
        assert_eq!(
            classify("DELETE FROM player WHERE id = 1"),
            StatementKind::Mutation {
                kinds: vec![EventKind::delete("player")]
            }
        );
    }

    #[test]
    fn reads_are_other() {
        assert_eq!(classify("SELECT * FROM player"), StatementKind::Other);
        assert_eq!(classify("PRAGMA journal_mode"), StatementKind::Other);
        assert_eq!(classify(""), StatementKind::Other);
    }

    #[test]
    fn cte_degrades_to_unclassified() {
        assert_eq!(
            classify("WITH x AS (SELECT 1) INSERT INTO t SELECT * FROM x"),
            StatementKind::Unclassified
        );
    }

    #[test]
    fn comments_skipped() {
        assert_eq!(
            classify("/* lead */ -- line\n BEGIN"),
            StatementKind::Transaction(TransactionOp::Begin(TransactionKind::Deferred))
        );
    }

    #[test]
    fn quoted_identifiers_unwrapped() {
        assert_eq!(
            classify("DELETE FROM [My Table]"),
            StatementKind::Mutation {
                kinds: vec![EventKind::delete("my table")]
            }
        );
        assert_eq!(
            classify("UPDATE `T` SET `A` = 1"),
            StatementKind::Mutation {
                kinds: vec![EventKind::update("t", vec!["a".to_string()])]
            }
        );
    }

    #[test]
    fn string_literal_with_escape_does_not_confuse_lexer() {
        assert_eq!(
            classify("UPDATE t SET a = 'it''s, fine', b = 2"),
            StatementKind::Mutation {
                kinds: vec![EventKind::update(
                    "t",
                    vec!["a".to_string(), "b".to_string()]
                )]
            }
        );
    }
}
