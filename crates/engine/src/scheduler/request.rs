//! Query classification: kind, cost, batch eligibility and fingerprints.
//!
//! Classification is heuristic and dialect agnostic. It works on a normalized
//! copy of the query text (whitespace collapsed, lowercased outside quoted
//! literals, identifiers and dollar-quoted bodies, trailing semicolons
//! stripped) and on the words found outside those literals.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::pending::Completion;
use crate::executor::QueryParams;

/// Dispatch priority. Ordering follows urgency: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Highest first, the order the dispatch loop visits queues in.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Bulk,
}

impl QueryKind {
    fn default_duration(&self) -> Duration {
        match self {
            QueryKind::Select => Duration::from_millis(100),
            QueryKind::Insert => Duration::from_millis(50),
            QueryKind::Update | QueryKind::Delete => Duration::from_millis(150),
            QueryKind::Ddl => Duration::from_millis(1000),
            QueryKind::Bulk => Duration::from_millis(5000),
        }
    }

    fn base_cost(&self) -> ResourceCost {
        let (cpu, memory, io) = match self {
            QueryKind::Select => (1.0, 1.0, 1.0),
            QueryKind::Insert => (1.0, 1.0, 2.0),
            QueryKind::Update | QueryKind::Delete => (2.0, 1.0, 2.0),
            QueryKind::Ddl => (2.0, 2.0, 3.0),
            QueryKind::Bulk => (4.0, 4.0, 5.0),
        };
        ResourceCost {
            cpu,
            memory,
            io,
            connection_slots: 1,
        }
    }
}

/// Relative resource units a query is expected to consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCost {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
    pub connection_slots: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

const TRANSACTION_WORDS: [&str; 4] = ["begin", "commit", "rollback", "savepoint"];
const TRANSACTION_PAIRS: [(&str, &str); 3] = [
    ("start", "transaction"),
    ("set", "transaction"),
    ("lock", "table"),
];

/// Everything derivable from the query text and parameters alone.
#[derive(Debug, Clone)]
pub struct Classification {
    pub normalized: String,
    pub kind: QueryKind,
    pub cost: ResourceCost,
    pub batch_eligible: bool,
    /// Fingerprint of normalized text plus parameters.
    pub dedup_key: String,
    /// Fingerprint of normalized text only, keyed for duration history.
    pub query_hash: String,
    joins: usize,
    ordered: bool,
}

impl Classification {
    pub fn of(query: &str, params: &QueryParams) -> Self {
        let normalized = normalize_sql(query);
        let words = words_outside_literals(&normalized);

        let kind = classify_kind(&normalized, &words);
        let joins = words.iter().filter(|w| *w == "join").count();
        let ordered = has_pair(&words, "order", "by");
        let grouped = has_pair(&words, "group", "by");
        let distinct = words.iter().any(|w| w == "distinct");
        let transactional = words.iter().any(|w| TRANSACTION_WORDS.contains(&w.as_str()))
            || TRANSACTION_PAIRS.iter().any(|(a, b)| has_pair(&words, a, b));

        let mut cost = kind.base_cost();
        let joins_f = joins as f64;
        cost.cpu += joins_f;
        cost.memory += joins_f * 0.5;
        cost.io += joins_f * 0.5;
        if ordered {
            cost.cpu += 0.5;
            cost.memory += 1.0;
        }
        if grouped {
            cost.cpu += 0.5;
        }
        if distinct {
            cost.memory += 0.5;
        }

        let query_hash = sha256_hex(&[normalized.as_bytes()]);
        // BTreeMap serialization is key-ordered, so equal parameter sets hash equally.
        let params_json = serde_json::to_string(params).unwrap_or_default();
        let dedup_key = sha256_hex(&[normalized.as_bytes(), b"\x1f", params_json.as_bytes()]);

        Self {
            normalized,
            kind,
            cost,
            batch_eligible: kind != QueryKind::Ddl && !transactional,
            dedup_key,
            query_hash,
            joins,
            ordered,
        }
    }

    /// Duration estimate when no history exists for this query hash.
    pub fn default_estimate(&self) -> Duration {
        let factor = 1.0 + 0.5 * self.joins as f64 + if self.ordered { 0.25 } else { 0.0 };
        self.kind.default_duration().mul_f64(factor)
    }
}

/// One submitted unit of work, owned by a priority queue until dispatched.
#[derive(Debug)]
pub struct QueryRequest {
    pub id: QueryId,
    pub query: String,
    pub params: QueryParams,
    pub priority: Priority,
    pub kind: QueryKind,
    pub submitted_at: Instant,
    pub estimated_duration: Duration,
    pub cost: ResourceCost,
    pub batch_eligible: bool,
    pub dedup_key: String,
    pub query_hash: String,
    pub(crate) completion: Completion,
}

impl QueryRequest {
    pub(crate) fn new(
        query: String,
        params: QueryParams,
        priority: Priority,
        classification: Classification,
        estimated_duration: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            id: completion.id(),
            query,
            params,
            priority,
            kind: classification.kind,
            submitted_at: Instant::now(),
            estimated_duration,
            cost: classification.cost,
            batch_eligible: classification.batch_eligible,
            dedup_key: classification.dedup_key,
            query_hash: classification.query_hash,
            completion,
        }
    }
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Stretch of query text, either SQL to be normalized or a literal kept verbatim.
enum Segment<'a> {
    Code(&'a str),
    Literal(&'a str),
}

/// Split `sql` at quoted strings, quoted identifiers and dollar-quoted bodies.
/// An unterminated literal runs to the end of the text.
fn segments(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let close = match bytes[i] {
            q @ (b'\'' | b'"') => sql[i + 1..]
                .find(q as char)
                .map_or(sql.len(), |p| i + 1 + p + 1),
            b'$' => match dollar_tag(sql, i) {
                Some(tag) => sql[i + tag.len()..]
                    .find(tag)
                    .map_or(sql.len(), |p| i + tag.len() + p + tag.len()),
                None => {
                    i += 1;
                    continue;
                }
            },
            _ => {
                i += 1;
                continue;
            }
        };
        if start < i {
            out.push(Segment::Code(&sql[start..i]));
        }
        out.push(Segment::Literal(&sql[i..close]));
        start = close;
        i = close;
    }
    if start < sql.len() {
        out.push(Segment::Code(&sql[start..]));
    }
    out
}

/// PostgreSQL dollar-quote opener (`$$` or `$tag$`) starting at byte `at`.
/// Positional parameters such as `$1` and `$` inside identifiers are not openers.
fn dollar_tag(sql: &str, at: usize) -> Option<&str> {
    let after_word = sql[..at]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$');
    if after_word {
        return None;
    }
    let rest = &sql[at + 1..];
    let end = rest.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
    if rest.starts_with(|c: char| c.is_ascii_digit()) || !rest[end..].starts_with('$') {
        return None;
    }
    Some(&sql[at..at + end + 2])
}

/// Collapse whitespace and lowercase everything outside literals.
///
/// Quoted strings, quoted identifiers and dollar-quoted bodies are copied
/// verbatim, so queries differing only inside them never normalize equal.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;

    for segment in segments(sql) {
        match segment {
            Segment::Literal(text) => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push_str(text);
            }
            Segment::Code(text) => {
                for ch in text.chars() {
                    if ch.is_whitespace() {
                        pending_space = true;
                        continue;
                    }
                    if pending_space && !out.is_empty() {
                        out.push(' ');
                    }
                    pending_space = false;
                    out.extend(ch.to_lowercase());
                }
            }
        }
    }

    while out.ends_with(';') || out.ends_with(' ') {
        out.pop();
    }
    out
}

fn words_outside_literals(normalized: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    for segment in segments(normalized) {
        match segment {
            Segment::Code(text) => {
                for ch in text.chars() {
                    if ch.is_alphanumeric() || ch == '_' {
                        current.push(ch);
                    } else if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                }
            }
            Segment::Literal(_) => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn has_pair(words: &[String], first: &str, second: &str) -> bool {
    words.windows(2).any(|w| w[0] == first && w[1] == second)
}

fn classify_kind(normalized: &str, words: &[String]) -> QueryKind {
    let Some(first) = words.first() else {
        return QueryKind::Ddl;
    };

    match first.as_str() {
        "select" | "values" | "show" | "explain" | "table" => QueryKind::Select,
        // CTEs take the kind of the first data-modifying statement they wrap.
        "with" => words
            .iter()
            .find_map(|w| match w.as_str() {
                "insert" => Some(QueryKind::Insert),
                "update" => Some(QueryKind::Update),
                "delete" => Some(QueryKind::Delete),
                _ => None,
            })
            .unwrap_or(QueryKind::Select),
        "insert" => {
            let multi_row = normalized.contains("),(") || normalized.contains("), (");
            if multi_row || words.iter().any(|w| w == "select") {
                QueryKind::Bulk
            } else {
                QueryKind::Insert
            }
        }
        "update" => QueryKind::Update,
        "delete" => QueryKind::Delete,
        "copy" | "merge" | "load" => QueryKind::Bulk,
        // DDL and anything unrecognized (SET, VACUUM, BEGIN, ...) is never batched.
        _ => QueryKind::Ddl,
    }
}
