//! Table-level access to the hosted backend.
//!
//! Rows travel as JSON objects so the same calls work against Postgres and
//! against the in-memory store used in tests. Every call carries the
//! caller's [`RequestContext`]; nothing is read from ambient state.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Classes,
    ClassEnrollments,
    Students,
    GradeCategories,
    TraditionalGrades,
    AssignmentGrades,
    Submissions,
    Assignments,
    Profiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Classes => "classes",
            Table::ClassEnrollments => "class_enrollments",
            Table::Students => "students",
            Table::GradeCategories => "grade_categories",
            Table::TraditionalGrades => "traditional_grades",
            Table::AssignmentGrades => "assignment_grades",
            Table::Submissions => "submissions",
            Table::Assignments => "assignments",
            Table::Profiles => "profiles",
        }
    }
}

/// Identity of the caller, passed explicitly to every gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub role: String,
}

impl RequestContext {
    pub fn new(user_id: Uuid, role: impl Into<String>) -> Self {
        Self {
            user_id,
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Eq,
            value,
        }
    }

    pub fn is_in<I>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            column: column.to_string(),
            op: FilterOp::In,
            value: Value::Array(values.into_iter().collect()),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => values_equal(field, &self.value),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|v| values_equal(field, v))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<i64>,
}

impl Select {
    pub fn from(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        for filter in &self.filters {
            check_identifier(&filter.column)?;
        }
        if let Some(order) = &self.order {
            check_identifier(&order.column)?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn select(&self, ctx: &RequestContext, query: Select) -> Result<Vec<Value>, GatewayError>;

    async fn insert(
        &self,
        ctx: &RequestContext,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError>;

    async fn update(
        &self,
        ctx: &RequestContext,
        table: Table,
        patch: Value,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError>;

    async fn delete(
        &self,
        ctx: &RequestContext,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError>;
}

pub fn check_identifier(name: &str) -> Result<(), GatewayError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::InvalidIdentifier(name.to_string()))
    }
}

pub fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Result<Vec<T>, GatewayError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|source| GatewayError::Decode {
                table: table.as_str(),
                source,
            })
        })
        .collect()
}

/// Column names of a row or patch object, validated.
pub fn object_columns(table: Table, value: &Value) -> Result<Vec<String>, GatewayError> {
    let object = value.as_object().ok_or_else(|| GatewayError::Rejected {
        table: table.as_str(),
        message: "expected a JSON object".to_string(),
    })?;
    if object.is_empty() {
        return Err(GatewayError::Rejected {
            table: table.as_str(),
            message: "no columns given".to_string(),
        });
    }
    let mut columns = Vec::with_capacity(object.len());
    for key in object.keys() {
        check_identifier(key)?;
        columns.push(key.clone());
    }
    Ok(columns)
}

// JSON numbers 90 and 90.0 compare equal, as they do in jsonb.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub table: Table,
    pub user_id: Uuid,
}

/// Gateway over in-process tables. Records every call and can be told to
/// fail on a table.
#[derive(Default)]
pub struct InMemoryGateway {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    failing: Mutex<HashSet<Table>>,
    calls: Mutex<Vec<Call>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, table: Table, rows: Vec<Value>) -> Self {
        self.lock_tables().entry(table).or_default().extend(rows);
        self
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock_tables().get(&table).cloned().unwrap_or_default()
    }

    pub fn fail_on(&self, table: Table) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table);
    }

    pub fn heal(&self, table: Table) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&table);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<Table, Vec<Value>>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, ctx: &RequestContext, operation: Operation, table: Table) -> Result<(), GatewayError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Call {
                operation,
                table,
                user_id: ctx.user_id,
            });
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing.contains(&table) {
            return Err(GatewayError::Rejected {
                table: table.as_str(),
                message: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn select(&self, ctx: &RequestContext, query: Select) -> Result<Vec<Value>, GatewayError> {
        self.record(ctx, Operation::Select, query.table)?;
        query.validate()?;

        let tables = self.lock_tables();
        let mut rows: Vec<Value> = tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let a = a.get(&order.column).unwrap_or(&Value::Null);
                let b = b.get(&order.column).unwrap_or(&Value::Null);
                let ordering = compare_values(a, b);
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(rows)
    }

    async fn insert(
        &self,
        ctx: &RequestContext,
        table: Table,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError> {
        self.record(ctx, Operation::Insert, table)?;
        for row in &rows {
            object_columns(table, row)?;
        }
        self.lock_tables()
            .entry(table)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        table: Table,
        patch: Value,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError> {
        self.record(ctx, Operation::Update, table)?;
        object_columns(table, &patch)?;
        for filter in &filters {
            check_identifier(&filter.column)?;
        }

        let mut tables = self.lock_tables();
        let mut affected = Vec::new();
        if let (Some(rows), Some(patch)) = (tables.get_mut(&table), patch.as_object()) {
            for row in rows.iter_mut() {
                if !filters.iter().all(|f| f.matches(row)) {
                    continue;
                }
                if let Some(object) = row.as_object_mut() {
                    for (key, value) in patch {
                        object.insert(key.clone(), value.clone());
                    }
                }
                affected.push(row.clone());
            }
        }
        Ok(affected)
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<Value>, GatewayError> {
        self.record(ctx, Operation::Delete, table)?;
        for filter in &filters {
            check_identifier(&filter.column)?;
        }

        let mut tables = self.lock_tables();
        let Some(rows) = tables.get_mut(&table) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Value>, Vec<Value>) = rows
            .drain(..)
            .partition(|row| filters.iter().all(|f| f.matches(row)));
        *rows = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new(Uuid::new_v4(), "teacher")
    }

    fn gateway() -> InMemoryGateway {
        InMemoryGateway::new().with_rows(
            Table::Students,
            vec![
                json!({"id": "a", "last_name": "Sandoval", "grade": 90}),
                json!({"id": "b", "last_name": "Haddad", "grade": 72.5}),
                json!({"id": "c", "last_name": "Lindqvist"}),
            ],
        )
    }

    #[tokio::test]
    async fn select_applies_filters_order_and_limit() {
        let gw = gateway();
        let rows = gw
            .select(
                &ctx(),
                Select::from(Table::Students)
                    .filter(Filter::is_in("id", vec![json!("a"), json!("b")]))
                    .order_by("last_name", false),
            )
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["last_name"].clone()).collect();
        assert_eq!(names, vec![json!("Haddad"), json!("Sandoval")]);

        let limited = gw
            .select(&ctx(), Select::from(Table::Students).order_by("grade", false).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0]["id"], json!("b"));
    }

    #[tokio::test]
    async fn numeric_equality_ignores_representation() {
        let gw = gateway();
        let rows = gw
            .select(&ctx(), Select::from(Table::Students).filter(Filter::eq("grade", json!(90.0))))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_return_affected_rows() {
        let gw = gateway();
        let updated = gw
            .update(
                &ctx(),
                Table::Students,
                json!({"grade": 95}),
                vec![Filter::eq("id", json!("b"))],
            )
            .await
            .unwrap();
        assert_eq!(updated, vec![json!({"id": "b", "last_name": "Haddad", "grade": 95})]);

        let removed = gw
            .delete(&ctx(), Table::Students, vec![Filter::eq("id", json!("c"))])
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(gw.rows(Table::Students).len(), 2);
    }

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let gw = gateway();
        let err = gw
            .select(
                &ctx(),
                Select::from(Table::Students).filter(Filter::eq("id; drop table", json!(1))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let gw = gateway();
        let context = ctx();
        gw.fail_on(Table::Students);
        assert!(gw.select(&context, Select::from(Table::Students)).await.is_err());
        gw.heal(Table::Students);
        assert!(gw.select(&context, Select::from(Table::Students)).await.is_ok());

        let calls = gw.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.user_id == context.user_id));
    }
}
