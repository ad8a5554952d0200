//! ClickHouse access for the sink: client construction from the sink
//! config, batched inserts, and the retriable / terminal error split that
//! decides between backoff and the DLQ.

use clickhouse::error::Error as ChError;
use clickhouse::Client;

use crate::mapper::ColumnValue;
use crate::pipeline_config::SinkConfig;

pub struct ClickHouseInserter {
    client: Client,
    table: String,
    columns: Vec<String>,
}

impl ClickHouseInserter {
    pub fn from_config(sink: &SinkConfig) -> Self {
        let scheme = if sink.secure { "https" } else { "http" };
        let url = format!("{scheme}://{}:{}", sink.host, sink.port);

        let mut client = Client::default()
            .with_url(url)
            .with_database(sink.database.as_str());
        if let Some(username) = &sink.username {
            client = client.with_user(username.as_str());
        }
        if let Some(password) = &sink.password {
            client = client.with_password(password.as_str());
        }

        Self {
            client,
            table: sink.table.clone(),
            columns: sink
                .column_mappings
                .iter()
                .map(|mapping| mapping.column_name.clone())
                .collect(),
        }
    }

    /// One INSERT for the whole batch; row order is preserved. The column
    /// set is only known at runtime, so the statement is assembled with one
    /// `?` placeholder per value and the values are bound sequentially.
    pub async fn insert(&self, rows: &[Vec<ColumnValue>]) -> Result<(), ChError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = build_insert_sql(&self.table, &self.columns, rows);
        let mut query = self.client.query(&sql);
        for row in rows {
            for value in row {
                query = match value {
                    ColumnValue::Int(i) => query.bind(*i),
                    ColumnValue::UInt(u) => query.bind(*u),
                    ColumnValue::Float(f) => query.bind(*f),
                    ColumnValue::Bool(b) => query.bind(*b),
                    ColumnValue::String(s) => query.bind(s.as_str()),
                    // Bound as epoch seconds; the statement wraps the
                    // placeholder in toDateTime().
                    ColumnValue::DateTime(dt) => query.bind(dt.timestamp()),
                    ColumnValue::Null => query.bind(None::<i64>),
                };
            }
        }
        query.execute().await
    }

    pub async fn ping(&self) -> Result<(), ChError> {
        self.client.query("SELECT 1").execute().await
    }
}

/// Overload and connectivity problems are worth retrying; everything else
/// (schema mismatch, type violations, parse failures) will fail the same
/// way again and belongs in the DLQ.
pub fn is_retriable(error: &ChError) -> bool {
    match error {
        ChError::Network(_) | ChError::TimedOut => true,
        ChError::BadResponse(response) => server_code(response)
            .map(|code| RETRIABLE_SERVER_CODES.contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

// TIMEOUT_EXCEEDED, TOO_MANY_SIMULTANEOUS_QUERIES, SOCKET_TIMEOUT,
// NETWORK_ERROR, MEMORY_LIMIT_EXCEEDED, TOO_MANY_PARTS
const RETRIABLE_SERVER_CODES: &[u32] = &[159, 202, 209, 210, 241, 252];

/// Extracts N from a server error of the shape "Code: N. DB::Exception: …".
fn server_code(response: &str) -> Option<u32> {
    let rest = response.strip_prefix("Code: ")?;
    let end = rest.find(|c: char| !c.is_ascii_digit())?;
    rest[..end].parse().ok()
}

/// Statement with one placeholder per value. DateTime values arrive as
/// epoch seconds, so their placeholders are wrapped in toDateTime() to
/// avoid any server-timezone ambiguity.
pub fn build_insert_sql(table: &str, columns: &[String], rows: &[Vec<ColumnValue>]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(",");

    let mut sql = format!("INSERT INTO {} ({column_list}) VALUES ", quote_identifier(table));
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('(');
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                sql.push(',');
            }
            sql.push_str(match value {
                ColumnValue::DateTime(_) => "toDateTime(?)",
                _ => "?",
            });
        }
        sql.push(')');
    }
    sql
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "\\`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn insert_statement_shape() {
        let rows = vec![
            vec![ColumnValue::Int(1), ColumnValue::String("a".to_string())],
            vec![ColumnValue::Int(2), ColumnValue::Null],
        ];
        let sql = build_insert_sql(
            "users_dedup",
            &["id".to_string(), "name".to_string()],
            &rows,
        );
        assert_eq!(
            sql,
            "INSERT INTO `users_dedup` (`id`,`name`) VALUES (?,?),(?,?)"
        );
    }

    #[test]
    fn datetime_placeholders_are_wrapped() {
        let dt = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let rows = vec![vec![
            ColumnValue::String("a".to_string()),
            ColumnValue::DateTime(dt),
        ]];
        let sql = build_insert_sql("events", &["id".to_string(), "ts".to_string()], &rows);
        assert_eq!(
            sql,
            "INSERT INTO `events` (`id`,`ts`) VALUES (?,toDateTime(?))"
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        let rows = vec![vec![ColumnValue::Int(1)]];
        let sql = build_insert_sql("odd`table", &["weird`col".to_string()], &rows);
        assert!(sql.starts_with("INSERT INTO `odd\\`table` (`weird\\`col`)"));
    }

    #[test]
    fn server_codes_are_parsed() {
        assert_eq!(
            server_code("Code: 252. DB::Exception: Too many parts"),
            Some(252)
        );
        assert_eq!(server_code("something else"), None);
    }

    #[test]
    fn retriable_classification() {
        assert!(is_retriable(&ChError::TimedOut));
        assert!(is_retriable(&ChError::BadResponse(
            "Code: 252. DB::Exception: Too many parts (300)".to_string()
        )));
        // Schema mismatch is terminal.
        assert!(!is_retriable(&ChError::BadResponse(
            "Code: 16. DB::Exception: No such column".to_string()
        )));
        assert!(!is_retriable(&ChError::RowNotFound));
    }
}
