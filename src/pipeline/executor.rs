use crate::config::DataSourceConfig;
use crate::db::params::{duck_to_json, json_to_duck, query_stmt};
use crate::db::source_pool::SourcePoolManager;
use crate::util::cache::TtlCache;
use duckdb::types::{ToSql, Value};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CACHEABLE_ROW_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    pub row_count: usize,
    /// Pre-cap count, present when the caller asked for it.
    pub total_rows: Option<u64>,
    pub execution_time_ms: u64,
    pub from_cache: bool,
}

#[derive(Debug)]
pub enum ExecError {
    /// Wall-clock deadline elapsed. The worker is abandoned, not killed;
    /// the underlying query may still complete.
    Timeout,
    Execution(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Timeout => write!(f, "Query timed out"),
            ExecError::Execution(msg) => write!(f, "Query failed: {}", msg),
        }
    }
}

impl Error for ExecError {}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub max_rows: usize,
    pub want_total: bool,
}

/// A sensitive-data rule: a column whose name matches, or a string value
/// whose shape matches, is masked before rows leave the executor.
pub struct MaskingRule {
    pub name_pattern: Regex,
    pub value_pattern: Option<Regex>,
}

impl MaskingRule {
    pub fn defaults() -> Vec<MaskingRule> {
        vec![
            MaskingRule {
                name_pattern: Regex::new(r"(?i)email|e_mail").unwrap(),
                value_pattern: Some(Regex::new(r"^[\w.+-]+@[\w-]+\.[\w.]+$").unwrap()),
            },
            MaskingRule {
                name_pattern: Regex::new(r"(?i)phone|mobile|tel(ephone)?$").unwrap(),
                value_pattern: Some(Regex::new(r"^\+?[\d\s()-]{7,20}$").unwrap()),
            },
            MaskingRule {
                name_pattern: Regex::new(r"(?i)id_?(number|card)|ssn|passport").unwrap(),
                value_pattern: Some(Regex::new(r"^\d{15}(\d{2}[\dXx])?$").unwrap()),
            },
        ]
    }
}

/// Parameterizes, executes with a hard timeout and row cap, caches small
/// successful results, and masks sensitive columns.
pub struct SqlExecutor {
    pools: Arc<SourcePoolManager>,
    cache: TtlCache<ExecutionResult>,
    masking: Vec<MaskingRule>,
}

impl SqlExecutor {
    pub fn new(pools: Arc<SourcePoolManager>, cache_ttl: Duration) -> Self {
        Self {
            pools,
            cache: TtlCache::new(cache_ttl),
            masking: MaskingRule::defaults(),
        }
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &HashMap<String, JsonValue>,
        source: &DataSourceConfig,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let key = cache_key(sql, params, &source.id, opts.max_rows, opts.want_total);

        if let Some(mut hit) = self.cache.get(&key).await {
            debug!("Result cache hit for source '{}'", source.id);
            hit.from_cache = true;
            hit.execution_time_ms = 0;
            return Ok(hit);
        }

        let (bound_sql, values) = bind_placeholders(sql, params);
        debug!("Bound SQL: {}", bound_sql);

        let pool = self
            .pools
            .pool_for(source)
            .map_err(|e| ExecError::Execution(e.to_string()))?;

        let max_rows = opts.max_rows;
        let want_total = opts.want_total;
        let task_sql = bound_sql.clone();

        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            run_query(&pool, &task_sql, &values, max_rows, want_total)
        });

        let mut result = match tokio::time::timeout(opts.timeout, handle).await {
            Err(_) => {
                warn!("Query exceeded {:?} deadline, abandoning worker", opts.timeout);
                return Err(ExecError::Timeout);
            }
            Ok(Err(join_err)) => {
                return Err(ExecError::Execution(format!(
                    "worker failed: {}",
                    join_err
                )))
            }
            Ok(Ok(Err(e))) => return Err(ExecError::Execution(e)),
            Ok(Ok(Ok(result))) => result,
        };

        result.execution_time_ms = started.elapsed().as_millis() as u64;
        mask_rows(&result.columns, &mut result.rows, &self.masking);

        if result.row_count <= CACHEABLE_ROW_LIMIT {
            self.cache.insert(key, result.clone()).await;
        }

        info!(
            "Executed query in {}ms, {} rows",
            result.execution_time_ms, result.row_count
        );
        Ok(result)
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A `::type` cast is not a placeholder
    RE.get_or_init(|| Regex::new(r"(^|[^:\w]):([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Rewrites `:name` placeholders. Bound names become positional `?`
/// parameters in left-to-right order. An unbound name must not reach the
/// driver, so its comparison collapses to an always-true predicate
/// (leaving `WHERE 1=1` when it was the sole condition); a bare leftover
/// becomes NULL.
pub fn bind_placeholders(
    sql: &str,
    params: &HashMap<String, JsonValue>,
) -> (String, Vec<Value>) {
    let mut missing: Vec<String> = Vec::new();
    for caps in placeholder_re().captures_iter(sql) {
        let name = caps[2].to_string();
        if !params.contains_key(&name) && !missing.contains(&name) {
            missing.push(name);
        }
    }

    let mut rewritten = sql.to_string();
    for name in &missing {
        let comparison = Regex::new(&format!(
            r#"(?i)[A-Za-z_][A-Za-z0-9_."]*\s*(?:=|!=|<>|>=|<=|>|<|LIKE|ILIKE|IN)\s*:{}\b"#,
            name
        ))
        .unwrap();
        rewritten = comparison.replace_all(&rewritten, "1=1").to_string();

        let bare = Regex::new(&format!(r"(^|[^:\w]):{}\b", name)).unwrap();
        rewritten = bare.replace_all(&rewritten, "${1}NULL").to_string();
        warn!("No value for placeholder :{}, predicate neutralized", name);
    }

    let mut values = Vec::new();
    let bound = placeholder_re()
        .replace_all(&rewritten, |caps: &regex::Captures| {
            let name = &caps[2];
            match params.get(name) {
                Some(value) => {
                    values.push(json_to_duck(value));
                    format!("{}?", &caps[1])
                }
                None => caps[0].to_string(),
            }
        })
        .to_string();

    (bound, values)
}

fn run_query(
    pool: &r2d2::Pool<crate::db::db_pool::DuckDbConnectionManager>,
    sql: &str,
    values: &[Value],
    max_rows: usize,
    want_total: bool,
) -> Result<ExecutionResult, String> {
    let conn = pool.get().map_err(|e| e.to_string())?;

    let inner = (|| -> Result<ExecutionResult, duckdb::Error> {
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let mut columns = Vec::with_capacity(column_count);
        for i in 0..column_count {
            columns.push(
                stmt.column_name(i)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|_| format!("col_{}", i)),
            );
        }

        let refs: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let mut rows = query_stmt(&mut stmt, &refs)?;

        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            if data.len() >= max_rows {
                break;
            }
            let mut record = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = row.get::<_, Value>(i).unwrap_or(Value::Null);
                record.push(duck_to_json(value));
            }
            data.push(record);
        }
        drop(rows);

        let total_rows = if want_total {
            count_total(&conn, sql, values).ok()
        } else {
            None
        };

        let row_count = data.len();
        Ok(ExecutionResult {
            columns,
            rows: data,
            row_count,
            total_rows,
            execution_time_ms: 0,
            from_cache: false,
        })
    })();

    inner.map_err(|e| e.to_string())
}

/// Pre-cap count: the same query wrapped in COUNT(*) with any trailing
/// LIMIT stripped.
fn count_total(conn: &duckdb::Connection, sql: &str, values: &[Value]) -> Result<u64, duckdb::Error> {
    let stripped = strip_trailing_limit(sql);
    let count_sql = format!("SELECT COUNT(*) FROM ({}) AS _total", stripped);

    let mut stmt = conn.prepare(&count_sql)?;
    let refs: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
    let mut rows = query_stmt(&mut stmt, &refs)?;
    match rows.next()? {
        Some(row) => row.get::<_, u64>(0),
        None => Ok(0),
    }
}

pub fn strip_trailing_limit(sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\s+LIMIT\s+\d+(\s+OFFSET\s+\d+)?\s*;?\s*$").unwrap()
    });
    re.replace(sql.trim().trim_end_matches(';'), "").to_string()
}

pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_string()
}

fn cache_key(
    sql: &str,
    params: &HashMap<String, JsonValue>,
    source_id: &str,
    max_rows: usize,
    want_total: bool,
) -> String {
    let mut sorted: Vec<(&String, &JsonValue)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| k.as_str());

    let mut hasher = DefaultHasher::new();
    normalize_sql(sql).hash(&mut hasher);
    for (k, v) in sorted {
        k.hash(&mut hasher);
        v.to_string().hash(&mut hasher);
    }
    source_id.hash(&mut hasher);
    max_rows.hash(&mut hasher);
    // A result fetched without the total count must not satisfy a
    // request that needs one
    want_total.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Masks any column whose name matches a rule, and any string value whose
/// shape matches a rule's value pattern. Mandatory post-processing.
fn mask_rows(columns: &[String], rows: &mut [Vec<JsonValue>], rules: &[MaskingRule]) {
    let masked_columns: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, name)| rules.iter().any(|rule| rule.name_pattern.is_match(name)))
        .map(|(i, _)| i)
        .collect();

    for row in rows.iter_mut() {
        for (i, value) in row.iter_mut().enumerate() {
            let by_name = masked_columns.contains(&i);
            let by_value = match value {
                JsonValue::String(s) => rules
                    .iter()
                    .any(|rule| rule.value_pattern.as_ref().map(|re| re.is_match(s)).unwrap_or(false)),
                _ => false,
            };

            if by_name || by_value {
                *value = JsonValue::String(mask_value(value));
            }
        }
    }
}

fn mask_value(value: &JsonValue) -> String {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let prefix: String = text.chars().take(3).collect();
    format!("{}****", prefix)
}
