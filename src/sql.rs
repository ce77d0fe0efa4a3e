//! SQL query builder and scrolling-window pagination.
//!
//! Composes parameterised SQL by accumulating clauses per keyword, the way
//! `_sql_utils.py`'s `BaseQuery`/`Query` do. Named parameters (`:name`) are
//! collected in a side table and rendered to positional `?` placeholders at
//! `render()` time, in first-use order, since that's what the `sqlx` SQLite
//! driver binds against.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

/// A bindable SQL value. Intentionally small — the engine's own call sites
/// only ever need these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}
impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}
impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Int(if v { 1 } else { 0 })
    }
}
impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}
impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}
impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(x) => x.into(),
            None => SqlValue::Null,
        }
    }
}

/// A single clause item, optionally aliased.
#[derive(Debug, Clone)]
struct Item {
    value: String,
    alias: Option<String>,
}

const KEYWORD_ORDER: &[&str] = &[
    "WITH", "SELECT", "SELECT DISTINCT", "FROM", "JOIN", "WHERE", "GROUP BY", "HAVING",
    "ORDER BY", "LIMIT",
];

fn separator(keyword: &str) -> &'static str {
    match keyword {
        "WHERE" | "HAVING" => " AND ",
        "JOIN" => "\n",
        _ => ", ",
    }
}

/// The query builder itself. Clauses render in [`KEYWORD_ORDER`] regardless
/// of insertion order.
#[derive(Debug, Clone, Default)]
pub struct Query {
    keywords: BTreeMap<&'static str, Vec<Item>>,
    params: BTreeMap<String, SqlValue>,
    scroll_keys: Vec<String>,
    scroll_desc: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, keyword: &'static str, value: impl Into<String>, alias: Option<&str>) -> &mut Self {
        self.keywords.entry(keyword).or_default().push(Item {
            value: value.into(),
            alias: alias.map(|s| s.to_string()),
        });
        self
    }

    pub fn with_(&mut self, alias: &str, value: impl Into<String>) -> &mut Self {
        self.push("WITH", value, Some(alias))
    }

    pub fn select(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("SELECT", value, None)
    }

    pub fn select_aliased(&mut self, value: impl Into<String>, alias: &str) -> &mut Self {
        self.push("SELECT", value, Some(alias))
    }

    pub fn select_distinct(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("SELECT DISTINCT", value, None)
    }

    pub fn from_(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("FROM", value, None)
    }

    pub fn join(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("JOIN", value, None)
    }

    pub fn where_(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("WHERE", value, None)
    }

    pub fn group_by(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("GROUP BY", value, None)
    }

    pub fn having(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("HAVING", value, None)
    }

    pub fn order_by(&mut self, value: impl Into<String>) -> &mut Self {
        self.push("ORDER BY", value, None)
    }

    pub fn limit(&mut self, value: impl Into<String>) -> &mut Self {
        self.keywords.insert("LIMIT", vec![Item { value: value.into(), alias: None }]);
        self
    }

    pub fn bind(&mut self, name: &str, value: impl Into<SqlValue>) -> &mut Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Appends a scrolling-window `ORDER BY` over `keys` (already-`coalesce`d
    /// expressions guaranteed non-null by the caller).
    pub fn scrolling_window_order_by(&mut self, keys: &[&str], desc: bool) -> &mut Self {
        self.scroll_keys = keys.iter().map(|s| s.to_string()).collect();
        self.scroll_desc = desc;
        let dir = if desc { "DESC" } else { "ASC" };
        let rendered = keys
            .iter()
            .map(|k| format!("{k} {dir}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.order_by(rendered)
    }

    /// Adds a cursor comparison for `last`, a row-value tuple matching the
    /// keys passed to [`Query::scrolling_window_order_by`].
    pub fn add_last(&mut self, last: &[SqlValue]) -> &mut Self {
        assert_eq!(last.len(), self.scroll_keys.len(), "cursor arity mismatch");
        let op = if self.scroll_desc { "<" } else { ">" };
        let lhs = self.scroll_keys.join(", ");
        let names: Vec<String> = (0..last.len()).map(|i| format!(":__last_{i}")).collect();
        let rhs = names.join(", ");
        for (name, value) in names.iter().zip(last.iter()) {
            self.params.insert(name.trim_start_matches(':').to_string(), value.clone());
        }
        let keyword = if self.keywords.contains_key("HAVING") { "HAVING" } else { "WHERE" };
        self.push(keyword, format!("({lhs}) {op} ({rhs})"), None);
        self
    }

    /// Renders to `(sql, positional_params)`, converting named `:x`
    /// placeholders to `?` in first-use order.
    pub fn render(&self) -> (String, Vec<SqlValue>) {
        let mut lines = Vec::new();
        for keyword in KEYWORD_ORDER {
            let Some(items) = self.keywords.get(keyword) else { continue };
            if items.is_empty() {
                continue;
            }
            let sep = separator(keyword);
            let rendered = items
                .iter()
                .map(|it| match (&it.alias, *keyword) {
                    (Some(alias), "WITH") => format!("{alias} AS ({})", it.value),
                    (Some(alias), _) => format!("{} AS {alias}", it.value),
                    (None, _) => it.value.clone(),
                })
                .collect::<Vec<_>>()
                .join(sep);

            let head = if *keyword == "SELECT DISTINCT" { "SELECT DISTINCT" } else { keyword };
            if *keyword == "JOIN" {
                lines.push(rendered);
            } else {
                lines.push(format!("{head} {rendered}"));
            }
        }
        let sql = lines.join("\n");
        bind_named_params(&sql, &self.params)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render().0)
    }
}

/// Scans `sql` for `:name` tokens in order, replacing each with `?` and
/// collecting the matching bound value. Panics (a programmer error, not a
/// runtime one) if a referenced name has no bound value.
fn bind_named_params(sql: &str, params: &BTreeMap<String, SqlValue>) -> (String, Vec<SqlValue>) {
    let mut out = String::with_capacity(sql.len());
    let mut bound = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == ':' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_alphabetic() {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && ((bytes[j] as char).is_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            let name = &sql[start..j];
            let value = params
                .get(name)
                .unwrap_or_else(|| panic!("unbound query parameter :{name}"))
                .clone();
            bound.push(value);
            out.push('?');
            i = j;
        } else {
            out.push(c);
            i += 1;
        }
    }
    (out, bound)
}

