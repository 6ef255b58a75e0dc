//! SQL front-end: parses the supported aggregate query shapes into a typed
//! [`AggregateQuery`] and derives the [`QueryFeatures`] the selector works on.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, OrderByExpr, Query,
    SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::AqeError;

// ============================================================================
// Values and predicates
// ============================================================================

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Call `f` with a stable byte encoding of the value, used for sketch
    /// hashing. Numbers that compare equal encode equally: an integral float
    /// is encoded as the integer it holds.
    pub fn with_key_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Value::Null => f(&[]),
            Value::Int(v) => f(&v.to_le_bytes()),
            Value::Float(v) => match integral(*v) {
                Some(i) => f(&i.to_le_bytes()),
                None => f(&v.to_bits().to_le_bytes()),
            },
            Value::Text(s) => f(s.as_bytes()),
        }
    }
}

/// Floats in the exactly representable integer range with no fraction.
fn integral(v: f64) -> Option<i64> {
    const EXACT: f64 = (1u64 << 53) as f64;
    if v.is_finite() && v.fract() == 0.0 && v.abs() <= EXACT {
        Some(v as i64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:.4}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Total order used for sorting: NULL first, then numbers, then text.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Text(_), _) => Ordering::Greater,
        (_, Value::Text(_)) => Ordering::Less,
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
            other => other,
        }
    }

    fn from_sql(op: &BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(CompareOp::Eq),
            BinaryOperator::NotEq => Some(CompareOp::NotEq),
            BinaryOperator::Lt => Some(CompareOp::Lt),
            BinaryOperator::LtEq => Some(CompareOp::LtEq),
            BinaryOperator::Gt => Some(CompareOp::Gt),
            BinaryOperator::GtEq => Some(CompareOp::GtEq),
            _ => None,
        }
    }
}

/// `column <op> literal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, cell: &Value) -> bool {
        if cell.is_null() || self.value.is_null() {
            return false;
        }
        let ord = match (cell, &self.value) {
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Text(_), _) | (_, Value::Text(_)) => return false,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            _ => match (cell.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => match a.partial_cmp(&b) {
                    Some(ord) => ord,
                    None => return false,
                },
                _ => return false,
            },
        };
        match self.op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::NotEq => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::LtEq => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::GtEq => ord != Ordering::Less,
        }
    }
}

// ============================================================================
// Query model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
    CountDistinct,
    Min,
    Max,
    /// Row-returning query without an aggregate
    Rows,
}

impl AggregationKind {
    pub fn label(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::Sum => "sum",
            AggregationKind::Avg => "avg",
            AggregationKind::CountDistinct => "count_distinct",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::Rows => "rows",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub kind: AggregationKind,
    /// `None` for `COUNT(*)`
    pub column: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Group column or aggregate alias
    pub key: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub table: String,
    pub aggregate: Option<AggregateExpr>,
    /// Plain projected columns. Empty on a row query means `SELECT *`.
    pub projection: Vec<String>,
    pub group_by: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub sql: String,
}

impl AggregateQuery {
    pub fn kind(&self) -> AggregationKind {
        self.aggregate
            .as_ref()
            .map_or(AggregationKind::Rows, |agg| agg.kind)
    }

    pub fn target_column(&self) -> Option<&str> {
        self.aggregate.as_ref().and_then(|agg| agg.column.as_deref())
    }

    /// Equality filter on a single key, eligible for a frequency sketch.
    pub fn point_lookup(&self) -> Option<&Filter> {
        let agg = self.aggregate.as_ref()?;
        if agg.kind != AggregationKind::Count
            || !self.group_by.is_empty()
            || !self.order_by.is_empty()
            || self.limit.is_some()
            || self.filters.len() != 1
        {
            return None;
        }
        let filter = &self.filters[0];
        if filter.op != CompareOp::Eq {
            return None;
        }
        match &agg.column {
            None => Some(filter),
            Some(c) if *c == filter.column => Some(filter),
            Some(_) => None,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_sql(sql: &str) -> Result<AggregateQuery, AqeError> {
    let dialect = GenericDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| AqeError::Parse(e.to_string()))?;

    if statements.is_empty() {
        return Err(AqeError::Parse("empty SQL statement".into()));
    }
    if statements.len() > 1 {
        return Err(AqeError::Unsupported(
            "multiple SQL statements not supported".into(),
        ));
    }
    match &statements[0] {
        Statement::Query(query) => parse_query(query, sql),
        _ => Err(AqeError::Unsupported("only SELECT queries are supported".into())),
    }
}

fn parse_query(query: &Query, sql: &str) -> Result<AggregateQuery, AqeError> {
    if query.with.is_some() {
        return Err(AqeError::Unsupported("WITH clauses not supported".into()));
    }
    if query.offset.is_some() {
        return Err(AqeError::Unsupported("OFFSET not supported".into()));
    }
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        _ => return Err(AqeError::Unsupported("only simple SELECT supported".into())),
    };
    if select.distinct.is_some() {
        return Err(AqeError::Unsupported("SELECT DISTINCT not supported".into()));
    }
    if select.having.is_some() {
        return Err(AqeError::Unsupported("HAVING not supported".into()));
    }

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(AqeError::Unsupported(
            "exactly one table without joins is supported".into(),
        ));
    }
    let table = match &select.from[0].relation {
        TableFactor::Table { name, .. } => name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| AqeError::Parse("empty table name".into()))?,
        _ => {
            return Err(AqeError::Unsupported(
                "only simple table references supported".into(),
            ))
        }
    };

    let mut aggregate: Option<AggregateExpr> = None;
    let mut projection = Vec::new();
    let mut wildcard = false;
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                wildcard = true;
                continue;
            }
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
        };
        match expr {
            Expr::Function(func) => {
                let parsed = parse_aggregate(func, alias)?;
                if aggregate.is_some() {
                    return Err(AqeError::Unsupported(
                        "only one aggregate per query is supported".into(),
                    ));
                }
                aggregate = Some(parsed);
            }
            other => projection.push(column_name(other)?),
        }
    }

    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs) => exprs
            .iter()
            .map(column_name)
            .collect::<Result<Vec<_>, _>>()?,
        GroupByExpr::All => {
            return Err(AqeError::Unsupported("GROUP BY ALL not supported".into()))
        }
    };

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    let order_by = query
        .order_by
        .iter()
        .map(|o| parse_order_by(o, aggregate.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let limit = match &query.limit {
        None => None,
        Some(Expr::Value(SqlValue::Number(n, _))) => Some(
            n.parse::<u64>()
                .map_err(|_| AqeError::Parse(format!("invalid LIMIT: {n}")))?,
        ),
        Some(other) => {
            return Err(AqeError::Unsupported(format!(
                "LIMIT must be a number literal, got {other}"
            )))
        }
    };

    let parsed = AggregateQuery {
        table,
        aggregate,
        projection,
        group_by,
        filters,
        order_by,
        limit,
        sql: sql.trim().to_string(),
    };
    validate_shape(&parsed, wildcard)?;
    Ok(parsed)
}

fn validate_shape(query: &AggregateQuery, wildcard: bool) -> Result<(), AqeError> {
    match &query.aggregate {
        Some(agg) => {
            if wildcard {
                return Err(AqeError::Unsupported(
                    "wildcard projection cannot be mixed with an aggregate".into(),
                ));
            }
            if let Some(col) = query.projection.iter().find(|c| !query.group_by.contains(c)) {
                return Err(AqeError::Unsupported(format!(
                    "column {col} must appear in GROUP BY"
                )));
            }
            for order in &query.order_by {
                if order.key != agg.alias && !query.group_by.contains(&order.key) {
                    return Err(AqeError::Unsupported(format!(
                        "ORDER BY {} must name a group column or the aggregate",
                        order.key
                    )));
                }
            }
        }
        None => {
            if !query.group_by.is_empty() {
                return Err(AqeError::Unsupported(
                    "GROUP BY requires an aggregate".into(),
                ));
            }
            if wildcard && !query.projection.is_empty() {
                return Err(AqeError::Unsupported(
                    "wildcard cannot be mixed with named columns".into(),
                ));
            }
        }
    }
    Ok(())
}

fn parse_aggregate(
    func: &sqlparser::ast::Function,
    alias: Option<String>,
) -> Result<AggregateExpr, AqeError> {
    if func.over.is_some() {
        return Err(AqeError::Unsupported("window functions not supported".into()));
    }
    let name = func.name.to_string().to_lowercase();
    let column = function_column(func)?;
    let kind = match name.as_str() {
        "count" if func.distinct => AggregationKind::CountDistinct,
        "count" => AggregationKind::Count,
        "sum" => AggregationKind::Sum,
        "avg" => AggregationKind::Avg,
        "min" => AggregationKind::Min,
        "max" => AggregationKind::Max,
        _ => return Err(AqeError::Unsupported(format!("function {name} not supported"))),
    };
    if func.distinct && kind != AggregationKind::CountDistinct {
        return Err(AqeError::Unsupported(format!(
            "DISTINCT is only supported inside COUNT, not {name}"
        )));
    }
    if column.is_none() && kind != AggregationKind::Count {
        return Err(AqeError::Parse(format!("{name} requires a column argument")));
    }
    let alias = alias.unwrap_or_else(|| match &column {
        Some(c) => format!("{}_{c}", kind.label()),
        None => kind.label().to_string(),
    });
    Ok(AggregateExpr {
        kind,
        column,
        alias,
    })
}

/// Column argument of an aggregate; `None` for `*` or no argument.
fn function_column(func: &sqlparser::ast::Function) -> Result<Option<String>, AqeError> {
    match func.args.as_slice() {
        [] => Ok(None),
        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => Ok(None),
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => column_name(expr).map(Some),
        _ => Err(AqeError::Unsupported(
            "aggregates take a single column argument".into(),
        )),
    }
}

fn column_name(expr: &Expr) -> Result<String, AqeError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|p| p.value.clone())
            .ok_or_else(|| AqeError::Parse("empty identifier".into())),
        Expr::Nested(inner) => column_name(inner),
        other => Err(AqeError::Unsupported(format!(
            "expected a column reference, got {other}"
        ))),
    }
}

fn literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse::<i64>()
            .map(Value::Int)
            .ok()
            .or_else(|| n.parse::<f64>().ok().map(Value::Float)),
        Expr::Value(SqlValue::SingleQuotedString(s))
        | Expr::Value(SqlValue::DoubleQuotedString(s)) => Some(Value::Text(s.clone())),
        Expr::Value(SqlValue::Boolean(b)) => Some(Value::Int(*b as i64)),
        Expr::Value(SqlValue::Null) => Some(Value::Null),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Value::Int(v) => Some(Value::Int(-v)),
            Value::Float(v) => Some(Value::Float(-v)),
            _ => None,
        },
        Expr::Nested(inner) => literal(inner),
        _ => None,
    }
}

fn collect_filters(expr: &Expr, filters: &mut Vec<Filter>) -> Result<(), AqeError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = CompareOp::from_sql(op).ok_or_else(|| {
                AqeError::Unsupported(format!("operator {op} not supported in WHERE"))
            })?;
            let filter = if let (Ok(column), Some(value)) = (column_name(left), literal(right)) {
                Filter { column, op, value }
            } else if let (Some(value), Ok(column)) = (literal(left), column_name(right)) {
                Filter {
                    column,
                    op: op.flip(),
                    value,
                }
            } else {
                return Err(AqeError::Unsupported(format!(
                    "WHERE predicates must compare a column with a literal: {expr}"
                )));
            };
            filters.push(filter);
            Ok(())
        }
        other => Err(AqeError::Unsupported(format!(
            "WHERE clause not supported: {other}"
        ))),
    }
}

fn parse_order_by(
    order: &OrderByExpr,
    aggregate: Option<&AggregateExpr>,
) -> Result<OrderBy, AqeError> {
    let ascending = order.asc.unwrap_or(true);
    let key = match (&order.expr, aggregate) {
        (Expr::Function(func), Some(agg)) => {
            let parsed = parse_aggregate(func, None)?;
            if parsed.kind != agg.kind || parsed.column != agg.column {
                return Err(AqeError::Unsupported(
                    "ORDER BY may only reference the selected aggregate".into(),
                ));
            }
            agg.alias.clone()
        }
        (expr, _) => column_name(expr)?,
    };
    Ok(OrderBy { key, ascending })
}

// ============================================================================
// Features
// ============================================================================

/// Shape of an aggregate query, as seen by the strategy selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFeatures {
    pub table: String,
    pub kind: AggregationKind,
    pub group_by: Vec<String>,
    pub target_column: Option<String>,
    pub has_filter: bool,
    pub has_order_or_limit: bool,
    /// Ungrouped COUNT with a single equality predicate
    pub point_lookup: bool,
    pub estimated_rows: u64,
    /// Estimated number of groups, for grouped queries
    pub estimated_groups: Option<u64>,
    /// Rows in the smallest group, when storage can tell
    pub smallest_group_rows: Option<u64>,
    /// Distinct values of the looked-up column, for point lookups
    pub key_cardinality: Option<u64>,
}

/// History bucket: queries with the same key share performance summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimilarityKey {
    pub kind: AggregationKind,
    pub grouped: bool,
    pub distinct: bool,
}

impl fmt::Display for SimilarityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.kind.label(),
            if self.grouped { "grouped" } else { "flat" }
        )
    }
}

impl QueryFeatures {
    pub fn from_query(query: &AggregateQuery, estimated_rows: u64) -> Self {
        Self {
            table: query.table.clone(),
            kind: query.kind(),
            group_by: query.group_by.clone(),
            target_column: query.target_column().map(str::to_string),
            has_filter: !query.filters.is_empty(),
            has_order_or_limit: !query.order_by.is_empty() || query.limit.is_some(),
            point_lookup: query.point_lookup().is_some(),
            estimated_rows,
            estimated_groups: None,
            smallest_group_rows: None,
            key_cardinality: None,
        }
    }

    pub fn with_estimated_groups(mut self, groups: Option<u64>) -> Self {
        self.estimated_groups = groups;
        self
    }

    pub fn with_smallest_group_rows(mut self, rows: Option<u64>) -> Self {
        self.smallest_group_rows = rows;
        self
    }

    pub fn with_key_cardinality(mut self, cardinality: Option<u64>) -> Self {
        self.key_cardinality = cardinality;
        self
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn similarity_key(&self) -> SimilarityKey {
        SimilarityKey {
            kind: self.kind,
            grouped: self.is_grouped(),
            distinct: self.kind == AggregationKind::CountDistinct,
        }
    }

    /// Stable FNV-1a hash of the discrete feature fields. Column and table
    /// names are left out so that structurally equal queries collide.
    pub fn fingerprint(&self) -> u64 {
        let magnitude = if self.estimated_rows == 0 {
            0
        } else {
            self.estimated_rows.ilog10() as u8 + 1
        };
        let mut h = Fnv1a::new();
        h.write(self.kind.label().as_bytes());
        h.write(&(self.group_by.len() as u32).to_le_bytes());
        h.write(&[
            self.has_filter as u8,
            self.has_order_or_limit as u8,
            self.point_lookup as u8,
            magnitude,
        ]);
        h.finish()
    }
}

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(0xcbf29ce484222325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_count_star() {
        let q = parse_sql("SELECT COUNT(*) FROM purchases").unwrap();
        assert_eq!(q.table, "purchases");
        assert_eq!(q.kind(), AggregationKind::Count);
        assert_eq!(q.aggregate.as_ref().unwrap().alias, "count");
        assert!(q.aggregate.as_ref().unwrap().column.is_none());
    }

    #[test]
    fn test_parse_grouped_sum_with_filters() {
        let q = parse_sql(
            "SELECT country, SUM(amount) AS revenue FROM purchases \
             WHERE amount > 10 AND 'books' = category GROUP BY country",
        )
        .unwrap();
        assert_eq!(q.kind(), AggregationKind::Sum);
        assert_eq!(q.group_by, vec!["country"]);
        assert_eq!(q.projection, vec!["country"]);
        assert_eq!(q.aggregate.as_ref().unwrap().alias, "revenue");
        assert_eq!(q.filters.len(), 2);
        assert_eq!(q.filters[0].op, CompareOp::Gt);
        assert_eq!(q.filters[1].column, "category");
        assert_eq!(q.filters[1].value, Value::Text("books".into()));
    }

    #[test]
    fn test_literal_on_left_is_flipped() {
        let q = parse_sql("SELECT COUNT(*) FROM t WHERE 5 < amount").unwrap();
        assert_eq!(q.filters[0].op, CompareOp::Gt);
        assert_eq!(q.filters[0].value, Value::Int(5));
    }

    #[test]
    fn test_parse_count_distinct() {
        let q = parse_sql("SELECT COUNT(DISTINCT country) FROM purchases").unwrap();
        assert_eq!(q.kind(), AggregationKind::CountDistinct);
        assert_eq!(q.target_column(), Some("country"));
        assert_eq!(q.aggregate.unwrap().alias, "count_distinct_country");
    }

    #[test]
    fn test_parse_order_by_aggregate() {
        let q = parse_sql(
            "SELECT country, COUNT(*) FROM purchases GROUP BY country ORDER BY COUNT(*) DESC LIMIT 5",
        )
        .unwrap();
        assert_eq!(q.order_by[0].key, "count");
        assert!(!q.order_by[0].ascending);
        assert_eq!(q.limit, Some(5));
    }

    #[test]
    fn test_parse_rows_query() {
        let q = parse_sql("SELECT * FROM purchases WHERE id <= 10").unwrap();
        assert_eq!(q.kind(), AggregationKind::Rows);
        assert!(q.projection.is_empty());
    }

    #[test]
    fn test_rejects_unsupported_shapes() {
        let cases = [
            "SELECT a, COUNT(*) FROM t",
            "SELECT COUNT(*), SUM(x) FROM t",
            "SELECT COUNT(*) FROM t GROUP BY a HAVING COUNT(*) > 1",
            "SELECT COUNT(*) FROM a JOIN b ON a.id = b.id",
            "SELECT COUNT(*) FROM t WHERE a = 1 OR b = 2",
            "SELECT DISTINCT a FROM t",
            "SELECT median(x) FROM t",
        ];
        for sql in cases {
            assert!(
                matches!(parse_sql(sql), Err(AqeError::Unsupported(_))),
                "{sql} should be unsupported"
            );
        }
        assert!(matches!(parse_sql("SELEC nope"), Err(AqeError::Parse(_))));
        assert!(matches!(parse_sql("SELECT SUM(*) FROM t"), Err(AqeError::Parse(_))));
    }

    #[test]
    fn test_point_lookup_detection() {
        let q = parse_sql("SELECT COUNT(*) FROM purchases WHERE country = 'DE'").unwrap();
        assert!(q.point_lookup().is_some());
        let q = parse_sql("SELECT COUNT(*) FROM purchases WHERE amount > 5").unwrap();
        assert!(q.point_lookup().is_none());
        let q = parse_sql("SELECT country, COUNT(*) FROM purchases WHERE country = 'DE' GROUP BY country")
            .unwrap();
        assert!(q.point_lookup().is_none());
    }

    #[test]
    fn test_filter_matching() {
        let f = Filter {
            column: "amount".into(),
            op: CompareOp::GtEq,
            value: Value::Int(10),
        };
        assert!(f.matches(&Value::Float(10.0)));
        assert!(f.matches(&Value::Int(11)));
        assert!(!f.matches(&Value::Int(9)));
        assert!(!f.matches(&Value::Null));
        assert!(!f.matches(&Value::Text("10".into())));
    }

    #[test]
    fn test_numeric_key_bytes_agree_across_types() {
        let bytes = |v: Value| v.with_key_bytes(|b| b.to_vec());
        assert_eq!(bytes(Value::Float(3.0)), bytes(Value::Int(3)));
        assert_eq!(bytes(Value::Float(-0.0)), bytes(Value::Int(0)));
        assert_eq!(bytes(Value::Float(-42.0)), bytes(Value::Int(-42)));
        assert_ne!(bytes(Value::Float(3.5)), bytes(Value::Int(3)));
        assert_ne!(bytes(Value::Float(1e300)), bytes(Value::Int(i64::MAX)));
        assert_ne!(bytes(Value::Text("3".into())), bytes(Value::Int(3)));
    }

    #[test]
    fn test_fingerprint_ignores_column_names() {
        let a = parse_sql("SELECT country, SUM(amount) FROM purchases GROUP BY country").unwrap();
        let b = parse_sql("SELECT city, SUM(price) FROM orders GROUP BY city").unwrap();
        let c = parse_sql("SELECT SUM(amount) FROM purchases").unwrap();
        let fa = QueryFeatures::from_query(&a, 200_000);
        let fb = QueryFeatures::from_query(&b, 150_000);
        let fc = QueryFeatures::from_query(&c, 200_000);
        assert_eq!(fa.fingerprint(), fb.fingerprint());
        assert_ne!(fa.fingerprint(), fc.fingerprint());
        assert_eq!(fa.similarity_key(), fb.similarity_key());
        assert_ne!(fa.similarity_key(), fc.similarity_key());
    }

    #[test]
    fn test_value_ordering() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Float(2.5),
            Value::Null,
            Value::Int(3),
            Value::Int(1),
        ];
        values.sort_by(cmp_values);
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Int(1),
                Value::Float(2.5),
                Value::Int(3),
                Value::Text("b".into()),
            ]
        );
    }
}
