use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        client_id: Ulid,
        start: Ms,
        end: Ms,
        contact: String,
        carrier_id: Option<Ulid>,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailableResources {
        candidates: Vec<Ulid>,
        start: Ms,
        end: Ms,
    },
    InsertMailing {
        id: Ulid,
        subject: String,
        body: String,
        send_time: Ms,
        kind: MailingKind,
    },
    UpdateMailing {
        id: Ulid,
        patch: MailingPatch,
    },
    DeleteMailing {
        id: Ulid,
    },
    SelectMailings {
        id: Option<Ulid>,
    },
    InsertSubscription {
        subscription: Subscription,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    Id(Ulid),
    Resource(Ulid),
    Client(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("reservations", 6, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid_expr(&values[0])?,
                resource_id: parse_ulid_expr(&values[1])?,
                client_id: parse_ulid_expr(&values[2])?,
                start: parse_i64_expr(&values[3])?,
                end: parse_i64_expr(&values[4])?,
                contact: parse_string_expr(&values[5])?,
                carrier_id: match values.get(6) {
                    Some(v) => parse_ulid_or_null(v)?,
                    None => None,
                },
            })
        }
        "mailings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("mailings", 4, values.len()));
            }
            Ok(Command::InsertMailing {
                id: parse_ulid_expr(&values[0])?,
                subject: parse_string_expr(&values[1])?,
                body: parse_string_expr(&values[2])?,
                send_time: parse_i64_expr(&values[3])?,
                kind: match values.get(4) {
                    Some(v) => parse_kind(v)?,
                    None => MailingKind::default(),
                },
            })
        }
        "subscriptions" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("subscriptions", 3, values.len()));
            }
            Ok(Command::InsertSubscription {
                subscription: Subscription {
                    mailing_id: parse_ulid_expr(&values[0])?,
                    user_id: parse_ulid_expr(&values[1])?,
                    email: parse_string_expr(&values[2])?,
                    subscribed: match values.get(3) {
                        Some(v) => parse_bool(v)?,
                        None => true,
                    },
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "reservations" => {
            let mut patch = ReservationPatch::default();
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(&assignment.target)?.as_str() {
                    "resource_id" => patch.resource_id = Some(parse_ulid_expr(value)?),
                    "start" => patch.start = Some(parse_i64_expr(value)?),
                    "end" => patch.end = Some(parse_i64_expr(value)?),
                    "status" => patch.status = Some(parse_status(value)?),
                    other => return Err(SqlError::ReadOnlyColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateReservation { id, patch })
        }
        "mailings" => {
            let mut patch = MailingPatch::default();
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(&assignment.target)?.as_str() {
                    "subject" => patch.subject = Some(parse_string_expr(value)?),
                    "body" => patch.body = Some(parse_string_expr(value)?),
                    "send_time" => patch.send_time = Some(parse_i64_expr(value)?),
                    "kind" => patch.kind = Some(parse_kind(value)?),
                    other => return Err(SqlError::ReadOnlyColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateMailing { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id }),
        "mailings" => Ok(Command::DeleteMailing { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality and range predicates collected from a `WHERE a AND b AND ...` chain.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    client_id: Option<Ulid>,
    candidates: Option<Vec<Ulid>>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "reservations" => {
            let filter = if let Some(id) = filters.id {
                ReservationFilter::Id(id)
            } else if let Some(rid) = filters.resource_id {
                ReservationFilter::Resource(rid)
            } else if let Some(cid) = filters.client_id {
                ReservationFilter::Client(cid)
            } else {
                return Err(SqlError::MissingFilter("id, resource_id or client_id"));
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" | "conflicts" => {
            let resource_id = filters.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?;
            let start = filters.start.ok_or(SqlError::MissingFilter("start"))?;
            let end = filters.end.ok_or(SqlError::MissingFilter("end"))?;
            Ok(if table == "availability" {
                Command::SelectAvailability { resource_id, start, end }
            } else {
                Command::SelectConflicts { resource_id, start, end }
            })
        }
        "available_resources" => Ok(Command::SelectAvailableResources {
            candidates: filters
                .candidates
                .or(filters.resource_id.map(|id| vec![id]))
                .ok_or(SqlError::MissingFilter("resource_id IN (...)"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "mailings" => Ok(Command::SelectMailings { id: filters.id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid_expr(right)?),
                Some("resource_id") => filters.resource_id = Some(parse_ulid_expr(right)?),
                Some("client_id") => filters.client_id = Some(parse_ulid_expr(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        Expr::InList {
            expr,
            list,
            negated: false,
        } if expr_column_name(expr).as_deref() == Some("resource_id") => {
            filters.candidates = Some(list.iter().map(parse_ulid_expr).collect::<Result<_, _>>()?);
        }
        _ => {}
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(target: &AssignmentTarget) -> Result<String, SqlError> {
    match target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_kind(expr: &Expr) -> Result<MailingKind, SqlError> {
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    ReadOnlyColumn(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::ReadOnlyColumn(col) => write!(f, "column cannot be updated: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
