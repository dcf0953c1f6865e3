pub mod chart;
pub mod executor;
pub mod generator;
pub mod prompt;
pub mod validator;

use crate::config::{DataSourceConfig, PipelineConfig};
use crate::llm::LlmManager;
use crate::retrieval::RetrievalCoordinator;
use crate::schema::SchemaIntrospector;
use chart::ChartSpec;
use executor::{ExecError, ExecOptions, ExecutionResult, SqlExecutor};
use generator::GenerateError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use validator::ValidatorPolicy;

/// The user's question. Immutable once the pipeline starts.
#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    pub text: String,
    /// Text from an external rewriter, preferred over `text` when present.
    #[serde(default)]
    pub rewritten: Option<String>,
    /// Restricts the schema snapshot when non-empty.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl Question {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            rewritten: None,
            tables: Vec::new(),
        }
    }

    pub fn effective_text(&self) -> &str {
        self.rewritten.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum PipelineError {
    GenerationFailure(String),
    SafetyViolation(String),
    ExecutionFailed(String),
    Timeout,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::GenerationFailure(msg) => write!(f, "SQL generation failed: {}", msg),
            PipelineError::SafetyViolation(msg) => write!(f, "Cannot execute: {}", msg),
            PipelineError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            PipelineError::Timeout => write!(f, "Execution timed out"),
        }
    }
}

impl Error for PipelineError {}

/// Mutable state threaded through one pipeline run. Exclusively owned by
/// the in-flight request.
#[derive(Debug, Default)]
struct GenerationState {
    prompt: String,
    sql: String,
    retry_count: u32,
    execution_error: Option<String>,
    contains_complex_sql: bool,
    thinking_steps: Vec<String>,
}

impl GenerationState {
    fn step(&mut self, text: String) {
        self.thinking_steps.push(text);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Generating,
    Validating,
    Executing,
    Succeeded,
    Failing,
    Terminal,
}

/// Everything a terminal outcome carries back to the caller. The generated
/// SQL is never discarded, even on failure, so a human can edit and
/// resubmit it.
#[derive(Debug, Serialize)]
pub struct PipelineOutcome {
    pub sql: String,
    pub contains_complex_sql: bool,
    pub result: Option<ExecutionResult>,
    pub error: Option<PipelineError>,
    pub chart: Option<ChartSpec>,
    pub explanation: String,
    pub retry_count: u32,
    pub thinking_steps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_rows: Option<usize>,
    pub want_total: bool,
    pub params: HashMap<String, JsonValue>,
}

pub struct Pipeline {
    llm: Arc<LlmManager>,
    retrieval: RetrievalCoordinator,
    introspector: SchemaIntrospector,
    executor: SqlExecutor,
    policy: ValidatorPolicy,
    max_retries: u32,
    query_timeout: Duration,
    max_rows: usize,
    sample_rows: usize,
}

impl Pipeline {
    pub fn new(
        llm: Arc<LlmManager>,
        retrieval: RetrievalCoordinator,
        introspector: SchemaIntrospector,
        executor: SqlExecutor,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            llm,
            retrieval,
            introspector,
            executor,
            policy: ValidatorPolicy {
                block_unbounded_select_star: config.block_unbounded_select_star,
            },
            max_retries: config.max_retries,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            max_rows: config.max_rows,
            sample_rows: config.sample_rows,
        }
    }

    /// Snapshot of the source's schema, without sample rows.
    pub async fn describe(&self, source: &DataSourceConfig) -> crate::schema::SchemaSnapshot {
        self.introspector.load(source, None, false, 0).await
    }

    /// Runs the whole question-to-chart pipeline. Cancellable at every
    /// await point: dropping the returned future abandons the run.
    pub async fn run(
        &self,
        question: Question,
        source: &DataSourceConfig,
        options: RunOptions,
    ) -> PipelineOutcome {
        let mut state = GenerationState::default();
        state.step("Loading schema and retrieving context".to_string());

        let table_filter = if question.tables.is_empty() {
            None
        } else {
            Some(question.tables.as_slice())
        };

        // Schema introspection and context retrieval are independent
        let (schema, context) = tokio::join!(
            self.introspector
                .load(source, table_filter, true, self.sample_rows),
            self.retrieval.retrieve_all(question.effective_text()),
        );

        state.step(format!(
            "Schema has {} tables; {} context items retrieved",
            schema.tables.len(),
            context.len()
        ));

        state.prompt = prompt::build_prompt(&question, &schema, &context, source.dialect);

        let exec_opts = ExecOptions {
            timeout: self.query_timeout,
            max_rows: options.max_rows.unwrap_or(self.max_rows),
            want_total: options.want_total,
        };

        let mut machine = PipelineState::Generating;
        let mut error: Option<PipelineError> = None;
        let mut result: Option<ExecutionResult> = None;
        let mut last_exec_error: Option<PipelineError> = None;

        while machine != PipelineState::Terminal {
            machine = match machine {
                PipelineState::Generating => {
                    match generator::generate(&self.llm, &state.prompt).await {
                        Ok(generated) if generated.contains_complex_sql => {
                            state.sql = generated.sql;
                            state.contains_complex_sql = true;
                            state.step(
                                "Reply contains DDL; returning SQL for manual execution"
                                    .to_string(),
                            );
                            PipelineState::Terminal
                        }
                        Ok(generated) => {
                            state.sql = generated.sql;
                            state.step(format!(
                                "Generated SQL (attempt {})",
                                state.retry_count + 1
                            ));
                            PipelineState::Validating
                        }
                        Err(GenerateError::Forbidden { keyword, sql }) => {
                            state.sql = sql;
                            state.step(format!("Generated SQL rejected: {} keyword", keyword));
                            error = Some(PipelineError::SafetyViolation(format!(
                                "forbidden keyword {}",
                                keyword
                            )));
                            PipelineState::Terminal
                        }
                        Err(e) => {
                            state.step(format!("Generation failed: {}", e));
                            error = Some(PipelineError::GenerationFailure(e.to_string()));
                            PipelineState::Terminal
                        }
                    }
                }
                PipelineState::Validating => {
                    match validator::validate(&state.sql, &self.policy) {
                        Ok(()) => {
                            state.step("SQL passed safety validation".to_string());
                            PipelineState::Executing
                        }
                        Err(violation) => {
                            state.step(format!("Safety validation failed: {}", violation.0));
                            error = Some(PipelineError::SafetyViolation(violation.0));
                            PipelineState::Terminal
                        }
                    }
                }
                PipelineState::Executing => {
                    match self
                        .executor
                        .execute(&state.sql, &options.params, source, &exec_opts)
                        .await
                    {
                        Ok(execution) => {
                            state.step(format!(
                                "Query returned {} rows in {}ms{}",
                                execution.row_count,
                                execution.execution_time_ms,
                                if execution.from_cache { " (cached)" } else { "" }
                            ));
                            result = Some(execution);
                            PipelineState::Succeeded
                        }
                        Err(e) => {
                            let (message, pipeline_error) = match e {
                                ExecError::Timeout => {
                                    ("query timed out".to_string(), PipelineError::Timeout)
                                }
                                ExecError::Execution(msg) => {
                                    (msg.clone(), PipelineError::ExecutionFailed(msg))
                                }
                            };
                            state.step(format!("Execution failed: {}", message));
                            state.execution_error = Some(message);
                            last_exec_error = Some(pipeline_error);
                            PipelineState::Failing
                        }
                    }
                }
                PipelineState::Failing => {
                    if state.retry_count < self.max_retries {
                        state.retry_count += 1;
                        let diagnostic = format!(
                            "\n\nThe previous SQL failed. Previous SQL: {}\nError: {}\nFix the problem and regenerate the query.\n",
                            state.sql,
                            state.execution_error.as_deref().unwrap_or("unknown"),
                        );
                        state.prompt.push_str(&diagnostic);
                        state.step(format!(
                            "Retrying with error feedback ({}/{})",
                            state.retry_count, self.max_retries
                        ));
                        PipelineState::Generating
                    } else {
                        warn!("Retry budget exhausted after {} retries", state.retry_count);
                        state.step("Retry budget exhausted".to_string());
                        error = last_exec_error.take();
                        PipelineState::Terminal
                    }
                }
                PipelineState::Succeeded => {
                    let chart_ready = result.as_ref().map(|r| {
                        chart::recommend(question.effective_text(), r)
                    });
                    if let Some(chart) = &chart_ready {
                        state.step(format!("Recommended chart: {}", chart_label(chart)));
                    }
                    return self.finish(state, result, None, chart_ready);
                }
                PipelineState::Terminal => PipelineState::Terminal,
            };
        }

        self.finish(state, result, error, None)
    }

    fn finish(
        &self,
        state: GenerationState,
        result: Option<ExecutionResult>,
        error: Option<PipelineError>,
        chart: Option<ChartSpec>,
    ) -> PipelineOutcome {
        let explanation = match (&error, state.contains_complex_sql, &result) {
            (Some(e), _, _) => e.to_string(),
            (None, true, _) => {
                "The generated SQL contains DDL and was not executed; run it manually if it is what you want.".to_string()
            }
            (None, false, Some(r)) => format!(
                "Query succeeded with {} rows after {} retr{}.",
                r.row_count,
                state.retry_count,
                if state.retry_count == 1 { "y" } else { "ies" }
            ),
            (None, false, None) => "Pipeline finished without a result.".to_string(),
        };

        info!(
            "Pipeline finished: retries={} complex={} error={}",
            state.retry_count,
            state.contains_complex_sql,
            error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "none".to_string())
        );

        PipelineOutcome {
            sql: state.sql,
            contains_complex_sql: state.contains_complex_sql,
            result,
            error,
            chart,
            explanation,
            retry_count: state.retry_count,
            thinking_steps: state.thinking_steps,
        }
    }
}

fn chart_label(chart: &ChartSpec) -> &'static str {
    match chart {
        ChartSpec::Line { .. } => "line",
        ChartSpec::Bar { .. } => "bar",
        ChartSpec::Pie { .. } => "pie",
        ChartSpec::Scatter { .. } => "scatter",
        ChartSpec::Table { .. } => "table",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSourceConfig;
    use crate::db::source_pool::SourcePoolManager;
    use crate::llm::{LlmClient, LlmError};
    use crate::schema::Dialect;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::ResponseError("script exhausted".to_string())))
        }
    }

    fn scripted(replies: Vec<Result<String, LlmError>>) -> Arc<LlmManager> {
        Arc::new(LlmManager::from_client(Box::new(ScriptedClient {
            replies: Mutex::new(replies.into()),
        })))
    }

    fn memory_source(id: &str) -> DataSourceConfig {
        DataSourceConfig {
            id: id.to_string(),
            path: ":memory:".to_string(),
            dialect: Dialect::DuckDb,
            pool_size: 1,
        }
    }

    fn build_pipeline(
        id: &str,
        llm: Arc<LlmManager>,
        max_retries: u32,
    ) -> (Pipeline, DataSourceConfig) {
        let config = PipelineConfig {
            max_retries,
            ..PipelineConfig::default()
        };
        build_pipeline_with(id, llm, config)
    }

    fn build_pipeline_with(
        id: &str,
        llm: Arc<LlmManager>,
        config: PipelineConfig,
    ) -> (Pipeline, DataSourceConfig) {
        let pools = Arc::new(SourcePoolManager::new());
        let source = memory_source(id);

        let pool = pools.pool_for(&source).unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER, month VARCHAR, cnt INTEGER);
             INSERT INTO orders VALUES (1, '2024-01', 10), (2, '2024-02', 20), (3, '2024-03', 5);",
        )
        .unwrap();
        drop(conn);

        let pipeline = Pipeline::new(
            llm,
            RetrievalCoordinator::new(config.context_limit),
            SchemaIntrospector::new(Arc::clone(&pools), Duration::from_secs(60)),
            SqlExecutor::new(pools, Duration::from_secs(60)),
            &config,
        );

        (pipeline, source)
    }

    #[tokio::test]
    async fn happy_path_produces_sql_result_and_chart() {
        let llm = scripted(vec![Ok(
            "```sql\nSELECT month, cnt FROM orders ORDER BY month LIMIT 50\n```".to_string(),
        )]);
        let (pipeline, source) = build_pipeline("pipe-happy", llm, 3);

        let outcome = pipeline
            .run(
                Question::new("show monthly order count trend"),
                &source,
                RunOptions::default(),
            )
            .await;

        assert!(outcome.error.is_none());
        assert!(outcome
            .sql
            .trim()
            .to_uppercase()
            .starts_with("SELECT"));
        assert_eq!(outcome.retry_count, 0);
        let result = outcome.result.expect("execution result");
        assert_eq!(result.row_count, 3);
        assert!(matches!(outcome.chart, Some(ChartSpec::Line { .. })));
        assert!(!outcome.thinking_steps.is_empty());
    }

    #[tokio::test]
    async fn two_failures_then_success_counts_two_retries() {
        let llm = scripted(vec![
            Ok("SELECT missing_col FROM orders LIMIT 5".to_string()),
            Ok("SELECT another_missing FROM orders LIMIT 5".to_string()),
            Ok("SELECT id FROM orders ORDER BY id LIMIT 5".to_string()),
        ]);
        let (pipeline, source) = build_pipeline("pipe-retry", llm, 3);

        let outcome = pipeline
            .run(Question::new("order ids"), &source, RunOptions::default())
            .await;

        assert_eq!(outcome.retry_count, 2);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.unwrap().row_count, 3);
    }

    #[tokio::test]
    async fn complex_sql_is_terminal_and_never_executed() {
        let llm = scripted(vec![Ok(
            "CREATE TEMP TABLE tmp AS SELECT 1; SELECT * FROM tmp".to_string(),
        )]);
        let (pipeline, source) = build_pipeline("pipe-complex", llm, 3);

        let outcome = pipeline
            .run(Question::new("whatever"), &source, RunOptions::default())
            .await;

        assert!(outcome.contains_complex_sql);
        assert!(outcome.result.is_none());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.retry_count, 0);
        assert!(outcome.sql.contains("CREATE TEMP TABLE"));
    }

    #[tokio::test]
    async fn safety_violation_is_terminal_without_retry() {
        let llm = scripted(vec![Ok("SELECT * FROM orders".to_string())]);
        let (pipeline, source) = build_pipeline("pipe-safety", llm, 3);

        let outcome = pipeline
            .run(Question::new("dump everything"), &source, RunOptions::default())
            .await;

        assert!(matches!(
            outcome.error,
            Some(PipelineError::SafetyViolation(_))
        ));
        assert_eq!(outcome.retry_count, 0);
        assert!(outcome.result.is_none());
        // The rejected SQL is still surfaced for transparency
        assert_eq!(outcome.sql, "SELECT * FROM orders");
    }

    #[tokio::test]
    async fn llm_failure_is_a_generation_failure() {
        let llm = scripted(vec![Err(LlmError::ConnectionError("refused".to_string()))]);
        let (pipeline, source) = build_pipeline("pipe-genfail", llm, 3);

        let outcome = pipeline
            .run(Question::new("anything"), &source, RunOptions::default())
            .await;

        assert!(matches!(
            outcome.error,
            Some(PipelineError::GenerationFailure(_))
        ));
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn timeout_consumes_a_retry_and_regenerates() {
        // Zero deadline times out every execution; the query is heavy
        // enough that the worker is never done before the first poll
        let llm = scripted(vec![
            Ok("SELECT COUNT(*) FROM range(20000000) LIMIT 1".to_string()),
            Ok("SELECT COUNT(*) c FROM range(20000000) LIMIT 1".to_string()),
        ]);
        let config = PipelineConfig {
            max_retries: 1,
            query_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        let (pipeline, source) = build_pipeline_with("pipe-timeout", llm, config);

        let outcome = pipeline
            .run(Question::new("big count"), &source, RunOptions::default())
            .await;

        assert_eq!(outcome.retry_count, 1);
        assert!(matches!(outcome.error, Some(PipelineError::Timeout)));
        // The second reply made it through regeneration
        assert_eq!(outcome.sql, "SELECT COUNT(*) c FROM range(20000000) LIMIT 1");
        assert!(outcome.result.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_keep_last_sql_for_the_caller() {
        let llm = scripted(vec![
            Ok("SELECT a FROM orders LIMIT 1".to_string()),
            Ok("SELECT b FROM orders LIMIT 1".to_string()),
            Ok("SELECT c FROM orders LIMIT 1".to_string()),
        ]);
        let (pipeline, source) = build_pipeline("pipe-exhaust", llm, 2);

        let outcome = pipeline
            .run(Question::new("bad columns"), &source, RunOptions::default())
            .await;

        assert_eq!(outcome.retry_count, 2);
        assert!(matches!(
            outcome.error,
            Some(PipelineError::ExecutionFailed(_))
        ));
        assert_eq!(outcome.sql, "SELECT c FROM orders LIMIT 1");
        assert!(outcome.result.is_none());
    }
}
