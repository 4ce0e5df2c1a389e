use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::RawBooking;
use crate::model::*;

const ROOM_COLUMNS: [&str; 3] = ["id", "name", "description"];
const BOOKING_COLUMNS: [&str; 4] = ["id", "room_id", "start", "end"];

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Owner(String),
    /// Bookings of the room that have not ended yet.
    Room(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Option<Ulid>,
        name: String,
        description: Option<String>,
    },
    UpdateRoom {
        id: Ulid,
        name: Option<String>,
        /// `Some(None)` when the statement sets it to NULL.
        description: Option<Option<String>>,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    InsertBooking {
        id: Option<Ulid>,
        room_id: Ulid,
        raw: RawBooking,
    },
    UpdateBooking {
        id: Ulid,
        raw: RawBooking,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectConflicts {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
}

impl Command {
    /// True for commands that change state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Command::SelectRooms { .. }
                | Command::SelectBookings { .. }
                | Command::SelectConflicts { .. }
        )
    }
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
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "rooms" => {
            let mut id = None;
            let mut name = None;
            let mut description = None;
            for (col, expr) in pair_columns("rooms", &columns, &ROOM_COLUMNS, &values)? {
                match col.as_str() {
                    "id" => id = parse_ulid_or_null(expr)?,
                    "name" => name = value_text(expr),
                    "description" => description = value_text(expr),
                    _ => return Err(SqlError::UnknownColumn("rooms", col)),
                }
            }
            Ok(Command::InsertRoom {
                id,
                name: name.ok_or(SqlError::MissingColumn("name"))?,
                description,
            })
        }
        "bookings" => {
            let mut id = None;
            let mut room_id = None;
            let mut raw = RawBooking::default();
            for (col, expr) in pair_columns("bookings", &columns, &BOOKING_COLUMNS, &values)? {
                match col.as_str() {
                    "id" => id = parse_ulid_or_null(expr)?,
                    "room_id" => room_id = parse_ulid_or_null(expr)?,
                    "start" => raw.from = value_text(expr),
                    "end" => raw.to = value_text(expr),
                    _ => raw.unknown_fields.push(col),
                }
            }
            Ok(Command::InsertBooking {
                id,
                room_id: room_id.ok_or(SqlError::MissingColumn("room_id"))?,
                raw,
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

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((col, &assignment.value));
    }

    match table.as_str() {
        "rooms" => {
            let (mut name, mut description) = (None, None);
            for (col, expr) in set {
                match col.as_str() {
                    "name" => {
                        name = Some(value_text(expr).ok_or(SqlError::MissingColumn("name"))?);
                    }
                    "description" => description = Some(value_text(expr)),
                    _ => return Err(SqlError::UnknownColumn("rooms", col)),
                }
            }
            Ok(Command::UpdateRoom {
                id,
                name,
                description,
            })
        }
        "bookings" => {
            let mut raw = RawBooking::default();
            for (col, expr) in set {
                match col.as_str() {
                    "start" => raw.from = value_text(expr),
                    "end" => raw.to = value_text(expr),
                    _ => raw.unknown_fields.push(col),
                }
            }
            Ok(Command::UpdateBooking { id, raw })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => match filters.as_slice() {
            [] => Ok(Command::SelectRooms { id: None }),
            [(col, expr)] if col == "id" => Ok(Command::SelectRooms {
                id: Some(parse_ulid_expr(expr)?),
            }),
            _ => Err(SqlError::Unsupported("rooms can only be filtered by id".into())),
        },
        "bookings" => {
            let filter = match filters.as_slice() {
                [] => BookingFilter::All,
                [(col, expr)] => match col.as_str() {
                    "id" => BookingFilter::Id(parse_ulid_expr(expr)?),
                    "room_id" => BookingFilter::Room(parse_ulid_expr(expr)?),
                    "owner_id" => BookingFilter::Owner(
                        value_text(expr).ok_or(SqlError::MissingFilter("owner_id"))?,
                    ),
                    _ => return Err(SqlError::Unsupported(format!("filter on {col}"))),
                },
                _ => {
                    return Err(SqlError::Unsupported(
                        "bookings take at most one filter".into(),
                    ));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "conflicts" => {
            let (mut room_id, mut start, mut end, mut exclude) = (None, None, None, None);
            for (col, expr) in filters {
                match col.as_str() {
                    "room_id" => room_id = Some(parse_ulid_expr(expr)?),
                    "start" => start = Some(parse_i64_expr(expr)?),
                    "end" => end = Some(parse_i64_expr(expr)?),
                    "exclude_id" => exclude = parse_ulid_or_null(expr)?,
                    _ => return Err(SqlError::Unsupported(format!("filter on {col}"))),
                }
            }
            Ok(Command::SelectConflicts {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// Match VALUES to column names, defaulting to the table's own column order.
fn pair_columns<'a>(
    table: &'static str,
    columns: &[String],
    defaults: &[&str],
    values: &'a [Expr],
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let names: Vec<String> = if columns.is_empty() {
        defaults.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        columns.to_vec()
    };
    if names.len() != values.len() {
        return Err(SqlError::WrongArity(table, names.len(), values.len()));
    }
    Ok(names.into_iter().zip(values.iter()).collect())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

/// A literal as text, `None` for NULL. Anything that is not a plain
/// literal is passed through as written so validation can reject it.
fn value_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => value_text(expr).map(|s| format!("-{s}")),
        _ => match extract_value(expr) {
            Some(Value::Null) => None,
            Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Some(s.clone()),
            _ => Some(expr.to_string()),
        },
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
