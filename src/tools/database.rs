use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rusqlite::{
    params, params_from_iter,
    types::{Value as SqlValue, ValueRef},
    Connection,
};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tracing::error;

use super::{elapsed_ms, parse_args};
use crate::{
    audit::AuditEntry,
    config_store::{ConfigStoreExt, MAX_RESULT_ROWS},
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
};

pub fn query_database_def() -> ToolDescriptor {
    tool_def(
        "query_database",
        "Execute a read-only SQL query against the tenant database",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "SQL query to execute (SELECT or read-only)"},
                "params": {"type": "array", "description": "Positional query values bound to ? placeholders", "items": {}},
                "limit": {"type": "integer", "description": "Maximum number of rows to return", "default": 1000}
            },
            "required": ["query"]
        }),
    )
}

pub fn execute_sql_def() -> ToolDescriptor {
    tool_def(
        "execute_sql",
        "Execute a write SQL statement (INSERT, UPDATE, DELETE, DDL)",
        json!({
            "type": "object",
            "properties": {
                "statement": {"type": "string", "description": "SQL statement to execute"},
                "params": {"type": "array", "description": "Positional query values bound to ? placeholders", "items": {}}
            },
            "required": ["statement"]
        }),
    )
}

pub fn get_db_schema_def() -> ToolDescriptor {
    tool_def(
        "get_db_schema",
        "Retrieve database schema information",
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list_tables", "describe_table", "list_indexes", "list_constraints"],
                    "description": "What schema information to retrieve"
                },
                "table_name": {"type": "string", "description": "Table name (required for describe_table, list_indexes, list_constraints)"},
                "schema_name": {"type": "string", "description": "Attached database schema", "default": "main"}
            },
            "required": ["action"]
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryArgs {
    query: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatementArgs {
    statement: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaArgs {
    action: String,
    #[serde(default)]
    table_name: Option<String>,
    #[serde(default = "default_schema")]
    schema_name: String,
}

fn default_schema() -> String {
    "main".to_string()
}

pub async fn query_database(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: QueryArgs = parse_args("query_database", args)?;
    ctx.check_rate_limit("query", 100, Duration::from_secs(60))?;

    let max_rows = ctx.params().get_u64(MAX_RESULT_ROWS, 1000);
    let limit = args.limit.min(max_rows);
    let started = Instant::now();

    let query = args.query.clone();
    let bind = args.params.iter().map(json_to_sql).collect::<Vec<_>>();
    let outcome = ctx
        .database()
        .call(move |conn| run_query(conn, &query, bind, limit))
        .await;
    let duration_ms = elapsed_ms(started);

    match outcome {
        Ok((columns, rows)) => {
            let row_count = rows.len();
            let truncated = limit > 0 && row_count as u64 >= limit;
            ctx.audit(
                AuditEntry::new("query_database")
                    .field("query", &args.query)
                    .field("rows", row_count)
                    .duration_ms(duration_ms),
            )
            .await;

            Ok(json!({
                "columns": columns,
                "rows": rows,
                "row_count": row_count,
                "truncated": truncated,
                "duration_ms": duration_ms,
            }))
        }
        Err(err) => {
            error!("Query failed: {err:#}");
            ctx.audit(
                AuditEntry::new("query_database")
                    .field("query", &args.query)
                    .field("error", format!("{err:#}"))
                    .duration_ms(duration_ms),
            )
            .await;
            Err(err.into())
        }
    }
}

pub async fn execute_sql(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: StatementArgs = parse_args("execute_sql", args)?;
    ctx.check_rate_limit("write", 50, Duration::from_secs(60))?;

    let started = Instant::now();
    let statement = args.statement.clone();
    let bind = args.params.iter().map(json_to_sql).collect::<Vec<_>>();
    let outcome = ctx
        .database()
        .call(move |conn| {
            conn.execute(&statement, params_from_iter(bind))
                .context("Statement execution failed")
        })
        .await;
    let duration_ms = elapsed_ms(started);

    match outcome {
        Ok(affected_rows) => {
            ctx.audit(
                AuditEntry::new("execute_sql")
                    .field("statement", &args.statement)
                    .field("affected_rows", affected_rows)
                    .duration_ms(duration_ms),
            )
            .await;

            Ok(json!({
                "affected_rows": affected_rows,
                "status_message": format!("OK {affected_rows}"),
                "duration_ms": duration_ms,
            }))
        }
        Err(err) => {
            error!("Statement execution failed: {err:#}");
            ctx.audit(
                AuditEntry::new("execute_sql")
                    .field("statement", &args.statement)
                    .field("error", format!("{err:#}"))
                    .duration_ms(duration_ms),
            )
            .await;
            Err(err.into())
        }
    }
}

pub async fn get_db_schema(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: SchemaArgs = parse_args("get_db_schema", args)?;
    let started = Instant::now();

    let action = args.action.clone();
    let table = match (action.as_str(), args.table_name.clone()) {
        ("list_tables", table) => table,
        ("describe_table" | "list_indexes" | "list_constraints", Some(table)) => Some(table),
        ("describe_table" | "list_indexes" | "list_constraints", None) => {
            return Err(ToolError::invalid(format!(
                "table_name required for {action} action"
            )))
        }
        (other, _) => return Err(ToolError::invalid(format!("Unknown action: {other}"))),
    };

    let schema = args.schema_name.clone();
    let table_for_call = table.clone().unwrap_or_default();
    let result = ctx
        .database()
        .call(move |conn| match action.as_str() {
            "list_tables" => list_tables(conn, &schema),
            "describe_table" => describe_table(conn, &schema, &table_for_call),
            "list_indexes" => list_indexes(conn, &schema, &table_for_call),
            _ => list_constraints(conn, &schema, &table_for_call),
        })
        .await
        .map_err(|err| {
            error!("Schema retrieval failed: {err:#}");
            ToolError::from(err)
        })?;

    ctx.audit(
        AuditEntry::new("get_db_schema")
            .field("action", &args.action)
            .field("table", table.as_deref().unwrap_or("all"))
            .duration_ms(elapsed_ms(started)),
    )
    .await;

    Ok(result)
}

fn run_query(
    conn: &mut Connection,
    query: &str,
    mut bind: Vec<SqlValue>,
    limit: u64,
) -> Result<(Vec<String>, Vec<Value>)> {
    let mut sql = query.trim().trim_end_matches(';').trim_end().to_string();
    if limit > 0 && !sql.to_uppercase().contains("LIMIT") {
        sql.push_str(" LIMIT ?");
        bind.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql).context("Query preparation failed")?;
    if !stmt.readonly() {
        bail!("Only read-only statements are accepted; use execute_sql for writes");
    }

    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt
        .query(params_from_iter(bind))
        .context("Query execution failed")?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (idx, column) in columns.iter().enumerate() {
            record.insert(column.clone(), sql_to_json(row.get_ref(idx)?));
        }
        out.push(Value::Object(record));
    }

    Ok((columns, out))
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(STANDARD.encode(blob)),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn list_tables(conn: &Connection, schema: &str) -> Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_list
         WHERE schema = ?1 AND type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map(params![schema], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let rows: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}.{}", quote_ident(schema), quote_ident(&name)),
            [],
            |row| row.get(0),
        )?;
        tables.push(json!({"table_name": name, "row_estimate": rows}));
    }

    Ok(json!({"table_count": tables.len(), "tables": tables}))
}

fn describe_table(conn: &Connection, schema: &str, table: &str) -> Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk
         FROM pragma_table_info(?1, ?2) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map(params![table, schema], |row| {
            Ok(json!({
                "name": row.get::<_, String>(0)?,
                "type": row.get::<_, String>(1)?,
                "nullable": row.get::<_, i64>(2)? == 0,
                "default": row.get::<_, Option<String>>(3)?,
                "is_primary_key": row.get::<_, i64>(4)? > 0,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if columns.is_empty() {
        bail!("Table not found: {schema}.{table}");
    }

    Ok(json!({
        "table_name": table,
        "columns": columns,
        "column_count": columns.len(),
    }))
}

fn index_columns(conn: &Connection, schema: &str, index: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")?;
    let columns = stmt
        .query_map(params![index, schema], |row| {
            Ok(row.get::<_, Option<String>>(0)?.unwrap_or_else(|| "<expr>".to_string()))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// (name, unique, origin) for every index on `table`.
fn index_list(conn: &Connection, schema: &str, table: &str) -> Result<Vec<(String, bool, String)>> {
    let mut stmt = conn.prepare(
        "SELECT name, \"unique\", origin FROM pragma_index_list(?1, ?2) ORDER BY name",
    )?;
    let indexes = stmt
        .query_map(params![table, schema], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(indexes)
}

fn list_indexes(conn: &Connection, schema: &str, table: &str) -> Result<Value> {
    let mut indexes = Vec::new();
    for (name, unique, origin) in index_list(conn, schema, table)? {
        let columns = index_columns(conn, schema, &name)?;
        let kind = match origin.as_str() {
            "pk" => "primary key",
            "u" => "unique constraint",
            _ => "index",
        };
        indexes.push(json!({
            "name": name,
            "columns": columns,
            "unique": unique,
            "type": kind,
        }));
    }

    Ok(json!({"table_name": table, "indexes": indexes}))
}

fn list_constraints(conn: &Connection, schema: &str, table: &str) -> Result<Value> {
    let mut constraints = Vec::new();

    let mut pk_stmt = conn.prepare(
        "SELECT name FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk",
    )?;
    let pk_columns = pk_stmt
        .query_map(params![table, schema], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if !pk_columns.is_empty() {
        constraints.push(json!({
            "name": format!("{table}_pkey"),
            "type": "PRIMARY KEY",
            "definition": format!("PRIMARY KEY ({})", pk_columns.join(", ")),
            "columns": pk_columns,
        }));
    }

    for (name, _, origin) in index_list(conn, schema, table)? {
        if origin != "u" {
            continue;
        }
        let columns = index_columns(conn, schema, &name)?;
        constraints.push(json!({
            "name": name,
            "type": "UNIQUE",
            "definition": format!("UNIQUE ({})", columns.join(", ")),
            "columns": columns,
        }));
    }

    let mut fk_stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1, ?2)
         ORDER BY id, seq",
    )?;
    let mut foreign: BTreeMap<i64, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
    let fk_rows = fk_stmt
        .query_map(params![table, schema], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (id, target, from, to) in fk_rows {
        let entry = foreign
            .entry(id)
            .or_insert_with(|| (target, Vec::new(), Vec::new()));
        entry.1.push(from);
        if let Some(to) = to {
            entry.2.push(to);
        }
    }
    for (id, (target, from, to)) in foreign {
        let definition = if to.is_empty() {
            format!("FOREIGN KEY ({}) REFERENCES {target}", from.join(", "))
        } else {
            format!(
                "FOREIGN KEY ({}) REFERENCES {target}({})",
                from.join(", "),
                to.join(", ")
            )
        };
        constraints.push(json!({
            "name": format!("{table}_fk_{id}"),
            "type": "FOREIGN KEY",
            "definition": definition,
            "columns": from,
        }));
    }

    Ok(json!({"table_name": table, "constraints": constraints}))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{execute_sql, get_db_schema, query_database};
    use crate::{
        config_store::MAX_RESULT_ROWS,
        context::ToolContext,
        error::ToolError,
        test_support::{args, test_context, test_context_with},
    };

    async fn seed(ctx: &ToolContext) {
        for statement in [
            "CREATE TABLE partner (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, score REAL DEFAULT 0)",
            "CREATE TABLE invoice (id INTEGER PRIMARY KEY, partner_id INTEGER REFERENCES partner(id), total REAL)",
            "CREATE INDEX invoice_partner_idx ON invoice(partner_id)",
        ] {
            execute_sql(ctx.clone(), args(json!({"statement": statement})))
                .await
                .expect("ddl");
        }
        for (name, score) in [("alpha", 1.5), ("beta", 2.0), ("gamma", 3.25)] {
            let result = execute_sql(
                ctx.clone(),
                args(json!({
                    "statement": "INSERT INTO partner (name, score) VALUES (?, ?)",
                    "params": [name, score]
                })),
            )
            .await
            .expect("insert");
            assert_eq!(result["affected_rows"], 1);
            assert_eq!(result["status_message"], "OK 1");
        }
    }

    #[tokio::test]
    async fn query_returns_rows_as_objects_and_clamps_limit() {
        let (ctx, _guard) = test_context_with(&[(MAX_RESULT_ROWS, "2")]);
        seed(&ctx).await;

        let result = query_database(
            ctx,
            args(json!({"query": "SELECT name, score FROM partner ORDER BY name;", "limit": 50})),
        )
        .await
        .expect("query");

        assert_eq!(result["columns"], json!(["name", "score"]));
        assert_eq!(result["row_count"], 2);
        assert_eq!(result["truncated"], true);
        assert_eq!(result["rows"][0], json!({"name": "alpha", "score": 1.5}));
    }

    #[tokio::test]
    async fn query_binds_positional_params() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let result = query_database(
            ctx,
            args(json!({"query": "SELECT id FROM partner WHERE score > ?", "params": [1.9]})),
        )
        .await
        .expect("query");

        assert_eq!(result["row_count"], 2);
        assert_eq!(result["truncated"], false);
    }

    #[tokio::test]
    async fn query_refuses_writes() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let err = query_database(ctx, args(json!({"query": "DELETE FROM partner"})))
            .await
            .expect_err("write rejected");
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn schema_actions_describe_tables() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let tables = get_db_schema(ctx.clone(), args(json!({"action": "list_tables"})))
            .await
            .expect("list");
        let names = tables["tables"]
            .as_array()
            .expect("tables")
            .iter()
            .map(|t| t["table_name"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert!(names.contains(&"partner".to_string()));
        assert!(names.contains(&"modules".to_string()));

        let described = get_db_schema(
            ctx.clone(),
            args(json!({"action": "describe_table", "table_name": "partner"})),
        )
        .await
        .expect("describe");
        assert_eq!(described["column_count"], 3);
        assert_eq!(described["columns"][0]["is_primary_key"], true);
        assert_eq!(described["columns"][1]["nullable"], false);

        let indexes = get_db_schema(
            ctx.clone(),
            args(json!({"action": "list_indexes", "table_name": "invoice"})),
        )
        .await
        .expect("indexes");
        assert_eq!(indexes["indexes"][0]["name"], "invoice_partner_idx");
        assert_eq!(indexes["indexes"][0]["columns"], json!(["partner_id"]));

        let constraints = get_db_schema(
            ctx.clone(),
            args(json!({"action": "list_constraints", "table_name": "invoice"})),
        )
        .await
        .expect("constraints");
        let kinds = constraints["constraints"]
            .as_array()
            .expect("constraints")
            .iter()
            .map(|c| c["type"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["PRIMARY KEY", "FOREIGN KEY"]);
    }

    #[tokio::test]
    async fn schema_requires_table_for_table_actions() {
        let (ctx, _guard) = test_context();
        let err = get_db_schema(ctx.clone(), args(json!({"action": "describe_table"})))
            .await
            .expect_err("table required");
        assert_eq!(err.to_string(), "table_name required for describe_table action");

        let err = get_db_schema(ctx, args(json!({"action": "drop_everything"})))
            .await
            .expect_err("unknown action");
        assert_eq!(err.to_string(), "Unknown action: drop_everything");
    }
}
