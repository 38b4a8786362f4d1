//! SQL subset for querying a single collection.
//!
//! Supports `SELECT <fields | *> FROM <collection> [WHERE ...]
//! [ORDER BY ...] [LIMIT n]`. Parsing is done by `sqlparser`; the statement
//! is then lowered into a [`SelectPlan`] that is evaluated document by
//! document.

use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;
use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::db::{ExecuteError, RawValue, ResultSet, Row};
use crate::frame::DOCUMENT_PATH_FIELD;

use super::memory::{Collection, Document};

#[derive(Debug, Clone, PartialEq)]
pub struct SelectField {
    /// Output column name.
    pub name: String,
    /// Path into the document, one segment per nesting level.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Fields(Vec<SelectField>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// The operator with its operands swapped (`5 < x` is `x > 5`).
    fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Compare {
        path: Vec<String>,
        op: CompareOp,
        value: RawValue,
    },
    IsNull(Vec<String>),
    IsNotNull(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub path: Vec<String>,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub collection: String,
    pub projection: Projection,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<usize>,
}

fn unsupported(what: impl Into<String>) -> ExecuteError {
    ExecuteError::Unsupported(what.into())
}

/// Parse query text into a plan.
pub fn parse_select(sql: &str) -> Result<SelectPlan, ExecuteError> {
    let dialect = GenericDialect {};
    let mut statements =
        SqlParser::parse_sql(&dialect, sql).map_err(|e| ExecuteError::Syntax(e.to_string()))?;
    if statements.len() != 1 {
        return Err(ExecuteError::Syntax(format!(
            "expected 1 statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        sp::Statement::Query(query) => convert_query(*query),
        other => Err(unsupported(format!("statement: {}", first_word(&other.to_string())))),
    }
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or(s)
}

fn convert_query(query: sp::Query) -> Result<SelectPlan, ExecuteError> {
    if query.with.is_some() {
        return Err(unsupported("WITH"));
    }
    if query.offset.is_some() {
        return Err(unsupported("OFFSET"));
    }

    let select = match *query.body {
        sp::SetExpr::Select(select) => *select,
        _ => return Err(unsupported("only plain SELECT is supported")),
    };

    let order_by = query
        .order_by
        .map(|ob| ob.exprs)
        .unwrap_or_default()
        .into_iter()
        .map(|o| {
            Ok(OrderKey {
                path: field_path(&o.expr)?,
                ascending: o.asc.unwrap_or(true),
            })
        })
        .collect::<Result<Vec<_>, ExecuteError>>()?;

    let limit = query.limit.as_ref().map(convert_limit).transpose()?;

    let mut plan = convert_select(select)?;
    plan.order_by = order_by;
    plan.limit = limit;
    Ok(plan)
}

fn convert_limit(expr: &sp::Expr) -> Result<usize, ExecuteError> {
    match expr {
        sp::Expr::Value(sp::Value::Number(n, _)) => n
            .parse::<usize>()
            .map_err(|_| unsupported(format!("LIMIT {}", n))),
        other => Err(unsupported(format!("LIMIT {}", other))),
    }
}

fn convert_select(select: sp::Select) -> Result<SelectPlan, ExecuteError> {
    if select.distinct.is_some() {
        return Err(unsupported("DISTINCT"));
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING"));
    }
    if let sp::GroupByExpr::Expressions(exprs, _) = &select.group_by {
        if !exprs.is_empty() {
            return Err(unsupported("GROUP BY"));
        }
    } else {
        return Err(unsupported("GROUP BY ALL"));
    }

    let collection = match select.from.as_slice() {
        [twj] if twj.joins.is_empty() => match &twj.relation {
            sp::TableFactor::Table { name, .. } => name
                .0
                .iter()
                .map(|ident| ident.value.as_str())
                .collect::<Vec<_>>()
                .join("/"),
            other => return Err(unsupported(format!("FROM {}", other))),
        },
        [_] => return Err(unsupported("JOIN")),
        [] => return Err(ExecuteError::Syntax("missing FROM clause".into())),
        _ => return Err(unsupported("multiple collections in FROM")),
    };

    let mut fields = Vec::new();
    let mut wildcard = false;
    for item in select.projection {
        match item {
            sp::SelectItem::Wildcard(_) => wildcard = true,
            sp::SelectItem::UnnamedExpr(expr) => {
                let path = field_path(&expr)?;
                fields.push(SelectField {
                    name: path.join("."),
                    path,
                });
            }
            sp::SelectItem::ExprWithAlias { expr, alias } => fields.push(SelectField {
                name: alias.value,
                path: field_path(&expr)?,
            }),
            sp::SelectItem::QualifiedWildcard(name, _) => {
                return Err(unsupported(format!("{}.*", name)))
            }
        }
    }
    let projection = match (wildcard, fields.is_empty()) {
        (true, true) => Projection::All,
        (true, false) => return Err(unsupported("mixing * with named fields")),
        (false, _) => Projection::Fields(fields),
    };

    let filter = select.selection.as_ref().map(convert_filter).transpose()?;

    Ok(SelectPlan {
        collection,
        projection,
        filter,
        order_by: vec![],
        limit: None,
    })
}

fn field_path(expr: &sp::Expr) -> Result<Vec<String>, ExecuteError> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(vec![ident.value.clone()]),
        sp::Expr::CompoundIdentifier(parts) => Ok(parts.iter().map(|p| p.value.clone()).collect()),
        sp::Expr::Nested(inner) => field_path(inner),
        other => Err(unsupported(format!("expression {}", other))),
    }
}

fn convert_filter(expr: &sp::Expr) -> Result<Filter, ExecuteError> {
    match expr {
        sp::Expr::Nested(inner) => convert_filter(inner),
        sp::Expr::IsNull(inner) => Ok(Filter::IsNull(field_path(inner)?)),
        sp::Expr::IsNotNull(inner) => Ok(Filter::IsNotNull(field_path(inner)?)),
        sp::Expr::BinaryOp { left, op, right } => match op {
            sp::BinaryOperator::And => Ok(Filter::And(
                Box::new(convert_filter(left)?),
                Box::new(convert_filter(right)?),
            )),
            sp::BinaryOperator::Or => Ok(Filter::Or(
                Box::new(convert_filter(left)?),
                Box::new(convert_filter(right)?),
            )),
            _ => {
                let op = convert_compare_op(op)?;
                match (literal(left), literal(right)) {
                    (None, Some(value)) => Ok(Filter::Compare {
                        path: field_path(left)?,
                        op,
                        value,
                    }),
                    (Some(value), None) => Ok(Filter::Compare {
                        path: field_path(right)?,
                        op: op.flip(),
                        value,
                    }),
                    _ => Err(unsupported(format!(
                        "comparison must be between a field and a literal: {}",
                        expr
                    ))),
                }
            }
        },
        other => Err(unsupported(format!("filter {}", other))),
    }
}

fn convert_compare_op(op: &sp::BinaryOperator) -> Result<CompareOp, ExecuteError> {
    match op {
        sp::BinaryOperator::Eq => Ok(CompareOp::Eq),
        sp::BinaryOperator::NotEq => Ok(CompareOp::NotEq),
        sp::BinaryOperator::Lt => Ok(CompareOp::Lt),
        sp::BinaryOperator::LtEq => Ok(CompareOp::LtEq),
        sp::BinaryOperator::Gt => Ok(CompareOp::Gt),
        sp::BinaryOperator::GtEq => Ok(CompareOp::GtEq),
        other => Err(unsupported(format!("operator {}", other))),
    }
}

fn literal(expr: &sp::Expr) -> Option<RawValue> {
    match expr {
        sp::Expr::Value(value) => Some(match value {
            sp::Value::Null => RawValue::Null,
            sp::Value::Boolean(b) => RawValue::Bool(*b),
            sp::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    RawValue::Int64(i)
                } else if let Ok(f) = n.parse::<f64>() {
                    RawValue::Float64(f)
                } else {
                    RawValue::Text(n.clone())
                }
            }
            sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
                RawValue::Text(s.clone())
            }
            other => RawValue::Text(other.to_string()),
        }),
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            RawValue::Int64(i) => Some(RawValue::Int64(-i)),
            RawValue::Float64(f) => Some(RawValue::Float64(-f)),
            _ => None,
        },
        _ => None,
    }
}

/// A document together with its full resource path.
struct Candidate<'a> {
    path: String,
    document: &'a Document,
}

impl Candidate<'_> {
    fn lookup(&self, path: &[String]) -> Option<RawValue> {
        match path {
            [single] if single.eq_ignore_ascii_case(DOCUMENT_PATH_FIELD) => {
                Some(RawValue::Text(self.path.clone()))
            }
            [first, rest @ ..] => {
                let root = self.document.get(first)?;
                let segments: Vec<&str> = rest.iter().map(String::as_str).collect();
                root.get_path(&segments).cloned()
            }
            [] => None,
        }
    }
}

/// Rank of a value's type in the cross-type sort order.
fn type_rank(value: &RawValue) -> u8 {
    match value {
        RawValue::Null => 0,
        RawValue::Bool(_) => 1,
        RawValue::Int32(_) | RawValue::Int64(_) | RawValue::Float64(_) => 2,
        RawValue::Timestamp(_) => 3,
        RawValue::Text(_) => 4,
        RawValue::Bytes(_) => 5,
        RawValue::Reference(_) => 6,
        RawValue::GeoPoint { .. } => 7,
        RawValue::Array(_) => 8,
        RawValue::Map(_) => 9,
    }
}

fn as_f64(value: &RawValue) -> f64 {
    match value {
        RawValue::Int32(i) => f64::from(*i),
        RawValue::Int64(i) => *i as f64,
        RawValue::Float64(f) => *f,
        _ => f64::NAN,
    }
}

/// Total order over values: by type rank, then by value within a type.
fn order_values(a: &RawValue, b: &RawValue) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (RawValue::Bool(x), RawValue::Bool(y)) => x.cmp(y),
        (RawValue::Timestamp(x), RawValue::Timestamp(y)) => x.cmp(y),
        (RawValue::Text(x), RawValue::Text(y)) => x.cmp(y),
        (RawValue::Bytes(x), RawValue::Bytes(y)) => x.cmp(y),
        (RawValue::Reference(x), RawValue::Reference(y)) => x.cmp(y),
        (
            RawValue::GeoPoint {
                latitude: la,
                longitude: lo,
            },
            RawValue::GeoPoint {
                latitude: lb,
                longitude: lob,
            },
        ) => la.total_cmp(lb).then(lo.total_cmp(lob)),
        (RawValue::Array(_), RawValue::Array(_)) | (RawValue::Map(_), RawValue::Map(_)) => {
            a.render().cmp(&b.render())
        }
        // numbers of mixed width compare as f64
        _ if type_rank(a) == 2 => as_f64(a).total_cmp(&as_f64(b)),
        _ => Ordering::Equal,
    }
}

/// Let a string literal compare against a timestamp field.
fn align_literal(field: &RawValue, literal: &RawValue) -> RawValue {
    if let (RawValue::Timestamp(_), RawValue::Text(s)) = (field, literal) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return RawValue::Timestamp(ts.with_timezone(&Utc));
        }
    }
    literal.clone()
}

fn matches_filter(candidate: &Candidate<'_>, filter: &Filter) -> bool {
    match filter {
        Filter::And(l, r) => matches_filter(candidate, l) && matches_filter(candidate, r),
        Filter::Or(l, r) => matches_filter(candidate, l) || matches_filter(candidate, r),
        Filter::IsNull(path) => candidate.lookup(path).map_or(true, |v| v.is_null()),
        Filter::IsNotNull(path) => candidate.lookup(path).is_some_and(|v| !v.is_null()),
        Filter::Compare { path, op, value } => {
            let Some(field) = candidate.lookup(path) else {
                return false;
            };
            let value = align_literal(&field, value);
            let same_type = type_rank(&field) == type_rank(&value);
            let ordering = order_values(&field, &value);
            match op {
                CompareOp::Eq => same_type && ordering == Ordering::Equal,
                CompareOp::NotEq => !(same_type && ordering == Ordering::Equal),
                CompareOp::Lt => same_type && ordering == Ordering::Less,
                CompareOp::LtEq => same_type && ordering != Ordering::Greater,
                CompareOp::Gt => same_type && ordering == Ordering::Greater,
                CompareOp::GtEq => same_type && ordering != Ordering::Less,
            }
        }
    }
}

fn compare_candidates(a: &Candidate<'_>, b: &Candidate<'_>, keys: &[OrderKey]) -> Ordering {
    for key in keys {
        let left = a.lookup(&key.path).unwrap_or(RawValue::Null);
        let right = b.lookup(&key.path).unwrap_or(RawValue::Null);
        let ordering = order_values(&left, &right);
        let ordering = if key.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Evaluate a plan over one collection.
///
/// `path_prefix` is the resource path of the collection; each document's
/// `__name__` is `<path_prefix>/<id>`. Rows omit trailing fields a document
/// does not have.
pub fn run_select(plan: &SelectPlan, collection: &Collection, path_prefix: &str) -> ResultSet {
    let mut candidates: Vec<Candidate<'_>> = collection
        .iter()
        .map(|(id, document)| Candidate {
            path: format!("{}/{}", path_prefix, id),
            document,
        })
        .filter(|c| plan.filter.as_ref().map_or(true, |f| matches_filter(c, f)))
        .collect();

    if !plan.order_by.is_empty() {
        candidates.sort_by(|a, b| compare_candidates(a, b, &plan.order_by));
    }
    if let Some(limit) = plan.limit {
        candidates.truncate(limit);
    }

    let fields: Vec<SelectField> = match &plan.projection {
        Projection::Fields(fields) => fields.clone(),
        Projection::All => {
            let mut names: Vec<String> = vec![DOCUMENT_PATH_FIELD.to_string()];
            for candidate in &candidates {
                for name in candidate.document.keys() {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            names
                .into_iter()
                .map(|name| SelectField {
                    path: vec![name.clone()],
                    name,
                })
                .collect()
        }
    };

    let records = candidates
        .iter()
        .map(|candidate| {
            let mut cells: Vec<Option<RawValue>> =
                fields.iter().map(|f| candidate.lookup(&f.path)).collect();
            while matches!(cells.last(), Some(None)) {
                cells.pop();
            }
            cells
                .into_iter()
                .map(|cell| cell.unwrap_or(RawValue::Null))
                .collect::<Row>()
        })
        .collect();

    ResultSet::new(fields.into_iter().map(|f| f.name).collect(), records)
}
