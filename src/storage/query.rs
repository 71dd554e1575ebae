//! The parametric query compiler.
//!
//! Translates a structured request — table, ordered filter predicates with
//! boolean connectives and explicit bracketing, whitelisted sort keys and
//! pagination — into a `SELECT` statement (plus an optional `count(*)`
//! companion) for the configured backend. Filters never interpolate user
//! values into SQL text; everything rides on bind parameters. Sort fields
//! are interpolated, which is why they pass through a per-table whitelist
//! first.

use crate::storage::Dialect;
use crate::types::requests::{SortingOption, SortingOrder};
use crate::types::CmpOp;

/// A value bound into a compiled query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
    Like,
    /// Bitwise-containment comparison on a flags column.
    Netflags(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connective {
    #[default]
    And,
    Or,
}

impl Connective {
    fn as_sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// One predicate in a compiled `WHERE` clause. The connective joins this
/// predicate to the *next* one; bracket flags let callers group
/// disjunctions, e.g. `(CounterpartyID = 0x0 OR CounterpartyID = X) AND …`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: SqlValue,
    pub connective: Connective,
    pub open_bracket: bool,
    pub close_bracket: bool,
}

impl Filter {
    pub fn new(
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<SqlValue>,
        connective: Connective,
    ) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
            connective,
            open_bracket: false,
            close_bracket: false,
        }
    }

    pub fn netflags(op: CmpOp, value: u64) -> Self {
        Self::new("Netflags", FilterOp::Netflags(op), value, Connective::And)
    }
}

/// A raw sub-clause injected ahead of the regular filters, e.g. the profile
/// blacklist joins. Each `{}` marker is replaced by the next bind
/// placeholder at compile time.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomFilter {
    pub clause: String,
    pub values: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
pub struct QueryOpts {
    pub table: &'static str,
    pub filters: Vec<Filter>,
    pub sortings: Vec<SortingOption>,
    pub offset: u64,
    /// Zero means "no limit".
    pub limit: u64,
    pub with_count: bool,
    pub select_as: Option<&'static str>,
    pub custom_filter: Option<CustomFilter>,
}

impl QueryOpts {
    #[must_use]
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            filters: Vec::new(),
            sortings: Vec::new(),
            offset: 0,
            limit: 0,
            with_count: false,
            select_as: None,
            custom_filter: None,
        }
    }
}

/// Per-table sortable-column whitelist. Unknown sort fields are dropped
/// silently so a stale client cannot inject SQL or break on schema drift.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSet {
    columns: &'static [&'static str],
    with_benchmarks: bool,
}

impl ColumnSet {
    #[must_use]
    pub const fn new(columns: &'static [&'static str], with_benchmarks: bool) -> Self {
        Self {
            columns,
            with_benchmarks,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str, num_benchmarks: usize) -> bool {
        if self.columns.iter().any(|c| *c == name) {
            return true;
        }
        if self.with_benchmarks {
            if let Some(idx) = name.strip_prefix("Benchmark") {
                if let Ok(idx) = idx.parse::<usize>() {
                    return idx < num_benchmarks;
                }
            }
        }
        false
    }
}

/// Keeps only the sortings whose field the column set admits.
#[must_use]
pub fn filter_sortings(
    sortings: &[SortingOption],
    set: ColumnSet,
    num_benchmarks: usize,
) -> Vec<SortingOption> {
    sortings
        .iter()
        .filter(|s| set.contains(&s.field, num_benchmarks))
        .cloned()
        .collect()
}

/// Name of the dynamically-sized benchmark column `id`.
#[must_use]
pub fn benchmark_column(id: u64) -> String {
    format!("Benchmark{id}")
}

/// The compiled form of a [`QueryOpts`]: the select statement, the optional
/// `count(*)` companion over the same filter expression, and the bind
/// values shared by both.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub select: String,
    pub count: Option<String>,
    pub params: Vec<SqlValue>,
}

/// Compiles `opts` into backend-appropriate SQL.
#[must_use]
pub fn compile(dialect: Dialect, opts: &QueryOpts) -> CompiledQuery {
    let mut params: Vec<SqlValue> = Vec::new();
    let mut conditions = String::new();

    if let Some(custom) = &opts.custom_filter {
        let mut clause = custom.clause.clone();
        for value in &custom.values {
            params.push(value.clone());
            clause = clause.replacen("{}", &dialect.placeholder(params.len()), 1);
        }
        conditions.push_str(&clause);
        if !opts.filters.is_empty() {
            conditions.push_str(" AND ");
        }
    }

    for (pos, filter) in opts.filters.iter().enumerate() {
        if filter.open_bracket {
            conditions.push('(');
        }
        conditions.push_str(&render_predicate(dialect, filter, &mut params));
        if filter.close_bracket {
            conditions.push(')');
        }
        if pos + 1 < opts.filters.len() {
            conditions.push(' ');
            conditions.push_str(filter.connective.as_sql());
            conditions.push(' ');
        }
    }

    let source = match opts.select_as {
        Some(alias) => format!("{} {alias}", opts.table),
        None => opts.table.to_string(),
    };
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {conditions}")
    };

    let mut select = format!("SELECT * FROM {source}{where_clause}");

    if !opts.sortings.is_empty() {
        let order = opts
            .sortings
            .iter()
            .map(|s| {
                let dir = match s.order {
                    SortingOrder::Asc => "ASC",
                    SortingOrder::Desc => "DESC",
                };
                format!("{} {dir}", s.field)
            })
            .collect::<Vec<_>>()
            .join(", ");
        select.push_str(&format!(" ORDER BY {order}"));
    }

    match (opts.limit, opts.offset, dialect) {
        (0, 0, _) => {}
        (0, offset, Dialect::Sqlite) => select.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        (0, offset, Dialect::Postgres) => select.push_str(&format!(" OFFSET {offset}")),
        (limit, 0, _) => select.push_str(&format!(" LIMIT {limit}")),
        (limit, offset, _) => select.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
    }

    let count = opts
        .with_count
        .then(|| format!("SELECT count(*) FROM {source}{where_clause}"));

    CompiledQuery {
        select,
        count,
        params,
    }
}

fn render_predicate(dialect: Dialect, filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    let field = &filter.field;
    match filter.op {
        FilterOp::Eq => {
            params.push(filter.value.clone());
            format!("{field} = {}", dialect.placeholder(params.len()))
        }
        FilterOp::Gte => {
            params.push(filter.value.clone());
            format!("{field} >= {}", dialect.placeholder(params.len()))
        }
        FilterOp::Lte => {
            params.push(filter.value.clone());
            format!("{field} <= {}", dialect.placeholder(params.len()))
        }
        FilterOp::Like => {
            params.push(filter.value.clone());
            format!("{field} LIKE {}", dialect.placeholder(params.len()))
        }
        // Bitwise containment: `A GTE B` means A ⊇ B, `A LTE B` means A ⊆ B.
        FilterOp::Netflags(CmpOp::Gte) => {
            params.push(filter.value.clone());
            params.push(filter.value.clone());
            format!(
                "({field} & {}) = {}",
                dialect.placeholder(params.len() - 1),
                dialect.placeholder(params.len())
            )
        }
        FilterOp::Netflags(CmpOp::Lte) => {
            params.push(filter.value.clone());
            format!(
                "({field} & {}) = {field}",
                dialect.placeholder(params.len())
            )
        }
        FilterOp::Netflags(CmpOp::Eq) => {
            params.push(filter.value.clone());
            format!("{field} = {}", dialect.placeholder(params.len()))
        }
    }
}
