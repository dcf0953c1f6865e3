use crate::config::DataSourceConfig;
use crate::db::params::duck_to_json;
use crate::db::source_pool::SourcePoolManager;
use crate::util::cache::TtlCache;
use duckdb::types::Value;
use duckdb::Connection;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// SQL variant of the target engine. Drives sample-row syntax and the
/// dialect line in generation prompts; execution itself runs on DuckDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    MySql,
    Postgres,
    SqlServer,
    Oracle,
    Sqlite,
    #[default]
    DuckDb,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySql => "MySQL",
            Dialect::Postgres => "PostgreSQL",
            Dialect::SqlServer => "SQL Server",
            Dialect::Oracle => "Oracle",
            Dialect::Sqlite => "SQLite",
            Dialect::DuckDb => "DuckDB",
        }
    }

    /// "Top N" sample query in this dialect's syntax.
    pub fn sample_query(&self, table: &str, n: usize) -> String {
        match self {
            Dialect::SqlServer => format!("SELECT TOP {} * FROM [{}]", n, table),
            Dialect::Oracle => format!("SELECT * FROM \"{}\" FETCH FIRST {} ROWS ONLY", table, n),
            Dialect::MySql => format!("SELECT * FROM `{}` LIMIT {}", table, n),
            _ => format!("SELECT * FROM \"{}\" LIMIT {}", table, n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableInfo>,
    pub relationships: Vec<Relationship>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Loads table/column/foreign-key metadata plus sample rows for a data
/// source. Snapshots are cached; a hit skips the connection entirely.
pub struct SchemaIntrospector {
    pools: Arc<SourcePoolManager>,
    cache: TtlCache<SchemaSnapshot>,
}

impl SchemaIntrospector {
    pub fn new(pools: Arc<SourcePoolManager>, cache_ttl: Duration) -> Self {
        Self {
            pools,
            cache: TtlCache::new(cache_ttl),
        }
    }

    /// Builds (or fetches from cache) a snapshot for the source. `None`
    /// table list means discover everything. A table that fails to
    /// introspect is logged and skipped; a dead connection yields an empty
    /// snapshot rather than an error.
    pub async fn load(
        &self,
        source: &DataSourceConfig,
        table_names: Option<&[String]>,
        include_samples: bool,
        sample_rows: usize,
    ) -> SchemaSnapshot {
        let key = cache_key(source, table_names, include_samples, sample_rows);
        if let Some(snapshot) = self.cache.get(&key).await {
            debug!("Schema cache hit for source '{}'", source.id);
            return snapshot;
        }

        let pool = match self.pools.pool_for(source) {
            Ok(pool) => pool,
            Err(e) => {
                error!("Failed to build pool for source '{}': {}", source.id, e);
                return SchemaSnapshot::default();
            }
        };

        let dialect = source.dialect;
        let requested: Option<Vec<String>> = table_names.map(|t| t.to_vec());
        let source_id = source.id.clone();

        let snapshot = tokio::task::spawn_blocking(move || {
            let conn = match pool.get() {
                Ok(conn) => conn,
                Err(e) => {
                    error!("No connection for source '{}': {}", source_id, e);
                    return SchemaSnapshot::default();
                }
            };

            let tables = match requested {
                Some(tables) => tables,
                None => discover_tables(&conn),
            };

            let mut infos = Vec::new();
            for table in &tables {
                match introspect_table(&conn, table, dialect, include_samples, sample_rows) {
                    Ok(info) => infos.push(info),
                    Err(e) => {
                        warn!("Skipping table '{}': {}", table, e);
                    }
                }
            }

            let relationships = load_relationships(&conn, &tables);

            SchemaSnapshot {
                tables: infos,
                relationships,
            }
        })
        .await
        .unwrap_or_default();

        if !snapshot.is_empty() {
            info!(
                "Introspected {} tables for source '{}'",
                snapshot.tables.len(),
                source.id
            );
            self.cache.insert(key, snapshot.clone()).await;
        }

        snapshot
    }
}

fn cache_key(
    source: &DataSourceConfig,
    table_names: Option<&[String]>,
    include_samples: bool,
    sample_rows: usize,
) -> String {
    let mut tables: Vec<String> = table_names.map(|t| t.to_vec()).unwrap_or_default();
    tables.sort();
    format!(
        "{}|{}|{}|{}",
        source.id,
        tables.join(","),
        include_samples,
        sample_rows
    )
}

fn discover_tables(conn: &Connection) -> Vec<String> {
    let mut tables = Vec::new();

    // sqlite_master first, SHOW TABLES as a fallback
    let query = "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'duck_%' AND name NOT LIKE 'pg_%'";
    match conn.prepare(query) {
        Ok(mut stmt) => {
            if let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(0)) {
                tables.extend(rows.filter_map(Result::ok));
            }
        }
        Err(e) => {
            error!("Error preparing sqlite_master query: {}", e);
            if let Ok(mut stmt) = conn.prepare("SHOW TABLES") {
                if let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(0)) {
                    tables.extend(rows.filter_map(Result::ok));
                }
            }
        }
    }

    debug!("Discovered {} tables", tables.len());
    tables
}

fn introspect_table(
    conn: &Connection,
    table: &str,
    dialect: Dialect,
    include_samples: bool,
    sample_rows: usize,
) -> Result<TableInfo, duckdb::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns: Vec<ColumnInfo> = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get::<_, String>(1)?,
                data_type: row.get::<_, String>(2)?,
                nullable: !row.get::<_, bool>(3)?,
                primary_key: row.get::<_, bool>(5)?,
                comment: None,
            })
        })?
        .filter_map(Result::ok)
        .collect();

    let sample_rows = if include_samples && sample_rows > 0 {
        collect_samples(conn, &dialect.sample_query(table, sample_rows), columns.len())?
    } else {
        Vec::new()
    };

    Ok(TableInfo {
        name: table.to_string(),
        columns,
        sample_rows,
    })
}

fn collect_samples(
    conn: &Connection,
    query: &str,
    column_count: usize,
) -> Result<Vec<Vec<String>>, duckdb::Error> {
    let mut stmt = conn.prepare(query)?;
    let mut rows = stmt.query([])?;
    let mut samples = Vec::new();

    while let Some(row) = rows.next()? {
        let mut rendered = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get::<_, Value>(i) {
                Ok(Value::Null) => "NULL".to_string(),
                Ok(Value::Text(s)) => s,
                Ok(other) => duck_to_json(other).to_string(),
                Err(_) => "ERROR".to_string(),
            };
            rendered.push(value);
        }
        samples.push(rendered);
    }

    Ok(samples)
}

/// Foreign keys come from duckdb_constraints() constraint text. A source
/// without that function simply reports no relationships.
fn load_relationships(conn: &Connection, tables: &[String]) -> Vec<Relationship> {
    let mut relationships = Vec::new();

    let query = "SELECT table_name, constraint_text FROM duckdb_constraints() WHERE constraint_type = 'FOREIGN KEY'";
    let mut stmt = match conn.prepare(query) {
        Ok(stmt) => stmt,
        Err(e) => {
            debug!("Constraint introspection unavailable: {}", e);
            return relationships;
        }
    };

    let rows = match stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    }) {
        Ok(rows) => rows.filter_map(Result::ok).collect::<Vec<_>>(),
        Err(_) => return relationships,
    };

    let fk_re = Regex::new(
        r#"FOREIGN KEY\s*\(\s*"?(\w+)"?\s*\)\s*REFERENCES\s+"?(\w+)"?\s*\(\s*"?(\w+)"?\s*\)"#,
    )
    .unwrap();

    for (table, text) in rows {
        if !tables.is_empty() && !tables.contains(&table) {
            continue;
        }
        if let Some(caps) = fk_re.captures(&text) {
            relationships.push(Relationship {
                from_table: table,
                from_column: caps[1].to_string(),
                to_table: caps[2].to_string(),
                to_column: caps[3].to_string(),
            });
        }
    }

    relationships
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSourceConfig;

    fn memory_source(id: &str) -> DataSourceConfig {
        DataSourceConfig {
            id: id.to_string(),
            path: ":memory:".to_string(),
            dialect: Dialect::DuckDb,
            pool_size: 1,
        }
    }

    fn seed(pools: &SourcePoolManager, source: &DataSourceConfig) {
        let pool = pools.pool_for(source).unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer VARCHAR, amount DOUBLE);
             INSERT INTO orders VALUES (1, 'acme', 10.5), (2, 'globex', 20.0);",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn discovers_tables_columns_and_samples() {
        let pools = Arc::new(SourcePoolManager::new());
        let source = memory_source("introspect");
        seed(&pools, &source);

        let introspector = SchemaIntrospector::new(pools, Duration::from_secs(60));
        let snapshot = introspector.load(&source, None, true, 2).await;

        assert_eq!(snapshot.tables.len(), 1);
        let orders = &snapshot.tables[0];
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.columns.len(), 3);
        assert!(orders.columns[0].primary_key);
        assert_eq!(orders.sample_rows.len(), 2);
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let pools = Arc::new(SourcePoolManager::new());
        let source = memory_source("cached");
        seed(&pools, &source);

        let introspector = SchemaIntrospector::new(pools, Duration::from_secs(60));
        let first = introspector.load(&source, None, false, 0).await;
        assert!(!first.is_empty());
        assert_eq!(introspector.cache.len().await, 1);

        let second = introspector.load(&source, None, false, 0).await;
        assert_eq!(second.tables.len(), first.tables.len());
    }

    #[tokio::test]
    async fn unknown_table_is_skipped_not_fatal() {
        let pools = Arc::new(SourcePoolManager::new());
        let source = memory_source("partial");
        seed(&pools, &source);

        let introspector = SchemaIntrospector::new(pools, Duration::from_secs(60));
        let wanted = vec!["orders".to_string(), "missing".to_string()];
        let snapshot = introspector.load(&source, Some(&wanted), false, 0).await;

        assert_eq!(snapshot.tables.len(), 1);
        assert_eq!(snapshot.tables[0].name, "orders");
    }

    #[test]
    fn dialect_sample_query_syntax() {
        assert_eq!(
            Dialect::SqlServer.sample_query("t", 5),
            "SELECT TOP 5 * FROM [t]"
        );
        assert!(Dialect::Oracle.sample_query("t", 5).contains("FETCH FIRST 5 ROWS ONLY"));
        assert!(Dialect::DuckDb.sample_query("t", 5).ends_with("LIMIT 5"));
    }
}
