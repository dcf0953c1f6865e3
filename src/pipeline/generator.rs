use crate::llm::{LlmError, LlmManager};
use regex::Regex;
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Generated {
    pub sql: String,
    /// DDL-bearing reply. Terminal: never validated, never executed,
    /// surfaced to the caller for manual handling.
    pub contains_complex_sql: bool,
}

#[derive(Debug)]
pub enum GenerateError {
    Llm(LlmError),
    /// Reply was empty or error-shaped; there is no SQL to diagnose.
    Unusable(String),
    /// Extracted SQL carries a write keyword. Not retryable; the SQL is
    /// kept so the caller can still surface it.
    Forbidden { keyword: String, sql: String },
}

impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerateError::Llm(e) => write!(f, "{}", e),
            GenerateError::Unusable(msg) => write!(f, "Unusable LLM reply: {}", msg),
            GenerateError::Forbidden { keyword, .. } => {
                write!(f, "Generated SQL contains forbidden keyword: {}", keyword)
            }
        }
    }
}

impl Error for GenerateError {}

impl From<LlmError> for GenerateError {
    fn from(e: LlmError) -> Self {
        GenerateError::Llm(e)
    }
}

const FAILURE_MARKERS: [&str; 5] = ["error:", "sorry", "i cannot", "i can't", "unable to"];

fn complex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(CREATE|DROP|ALTER)\b").unwrap())
}

fn forbidden_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|TRUNCATE|MERGE|GRANT|REVOKE|EXEC|EXECUTE)\b")
            .unwrap()
    })
}

/// Invokes the model and extracts a runnable statement from the free-text
/// reply.
pub async fn generate(llm: &LlmManager, prompt: &str) -> Result<Generated, GenerateError> {
    let reply = llm.complete(prompt).await?;

    if looks_like_failure(&reply) {
        return Err(GenerateError::Unusable(
            reply.lines().next().unwrap_or("").to_string(),
        ));
    }

    let body = strip_code_fences(&reply);

    // DDL in the reply means the model decided the question needs a temp
    // table or similar. Hand the statements back untouched.
    if let Some(m) = complex_re().find(&body) {
        warn!("Reply contains complex SQL keyword '{}'", m.as_str());
        return Ok(Generated {
            sql: body.trim().to_string(),
            contains_complex_sql: true,
        });
    }

    let extracted = match extract_statement(&body) {
        Some(statement) => statement,
        None => {
            // A reply that is pure DML has no SELECT span to extract
            if let Some(m) = forbidden_re().find(&body) {
                return Err(GenerateError::Forbidden {
                    keyword: m.as_str().to_uppercase(),
                    sql: body.trim().to_string(),
                });
            }
            return Err(GenerateError::Unusable(
                "no SELECT or WITH statement in reply".to_string(),
            ));
        }
    };

    let sql = repair_missing_with(&extracted);

    if let Some(m) = forbidden_re().find(&sql) {
        return Err(GenerateError::Forbidden {
            keyword: m.as_str().to_uppercase(),
            sql,
        });
    }

    info!("Generated SQL: {}", sql);
    Ok(Generated {
        sql,
        contains_complex_sql: false,
    })
}

fn looks_like_failure(reply: &str) -> bool {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return true;
    }
    let first_line = trimmed.lines().next().unwrap_or("").to_lowercase();
    FAILURE_MARKERS.iter().any(|m| first_line.starts_with(m))
}

/// Strips fenced code blocks the way models like to wrap SQL.
pub fn strip_code_fences(content: &str) -> String {
    // Try to extract SQL from between ```sql and ``` markers
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
        return after.trim().to_string();
    }

    // Alternate syntax without a language specifier
    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
        return after.trim().to_string();
    }

    content.trim().to_string()
}

/// Extracts the first `WITH ... SELECT` span, or failing that the first
/// `SELECT ...` span, up to a top-level semicolon or end of text. Uses a
/// balanced-parenthesis walk: a semicolon inside a CTE body must not end
/// the statement.
///
/// A `(` sitting directly before the first SELECT is kept: that is the
/// anonymous-CTE shape whose missing WITH gets reconstructed afterwards,
/// and dropping the paren would leave the span unbalanced.
pub fn extract_statement(text: &str) -> Option<String> {
    let start = match find_keyword(text, "WITH") {
        Some(pos) => pos,
        None => {
            let select = find_keyword(text, "SELECT")?;
            let before = text[..select].trim_end();
            if before.ends_with('(') {
                before.len() - 1
            } else {
                select
            }
        }
    };
    let tail = &text[start..];

    let mut depth: i32 = 0;
    let mut end = tail.len();
    for (i, ch) in tail.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' if depth <= 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }

    let statement = tail[..end].trim();
    if statement.is_empty() {
        None
    } else {
        Some(statement.to_string())
    }
}

/// Case-insensitive whole-word search. ASCII uppercasing keeps byte
/// offsets aligned with the original text.
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let upper = text.to_ascii_uppercase();
    let mut from = 0;
    while let Some(pos) = upper[from..].find(keyword) {
        let abs = from + pos;
        let before_ok = abs == 0
            || !upper.as_bytes()[abs - 1].is_ascii_alphanumeric()
                && upper.as_bytes()[abs - 1] != b'_';
        let after = abs + keyword.len();
        let after_ok = after >= upper.len()
            || !upper.as_bytes()[after].is_ascii_alphanumeric() && upper.as_bytes()[after] != b'_';
        if before_ok && after_ok {
            return Some(abs);
        }
        from = abs + keyword.len();
    }
    None
}

/// Reconstructs a missing leading `WITH` keyword. Models frequently emit
/// `(SELECT ...) SELECT ...` or `(SELECT ...), name AS (...) SELECT ...`
/// with syntactically valid CTE bodies; the anonymous first body gets its
/// name from the `FROM` references of the trailing query. Handles exactly
/// those two shapes; anything else is returned unchanged.
pub fn repair_missing_with(sql: &str) -> String {
    let trimmed = sql.trim();

    if trimmed.to_uppercase().starts_with("WITH") || !trimmed.starts_with('(') {
        return trimmed.to_string();
    }

    // Leading anonymous block
    let first_end = match matching_paren(trimmed, 0) {
        Some(end) => end,
        None => return trimmed.to_string(),
    };
    let first_body = &trimmed[1..first_end];

    let mut rest = trimmed[first_end + 1..].trim_start();
    let mut named: Vec<(String, String)> = Vec::new();

    // Zero or more `, name AS ( ... )` fragments
    let name_re = Regex::new(r"(?i)^,\s*([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(").unwrap();
    while let Some(caps) = name_re.captures(rest) {
        let open = caps.get(0).unwrap().end() - 1;
        let close = match matching_paren(rest, open) {
            Some(close) => close,
            None => return trimmed.to_string(),
        };
        named.push((caps[1].to_string(), rest[open + 1..close].to_string()));
        rest = rest[close + 1..].trim_start();
    }

    if !rest.to_uppercase().starts_with("SELECT") {
        return trimmed.to_string();
    }

    // The anonymous block's name is whichever FROM/JOIN reference of the
    // trailing query is not one of the named CTEs.
    let ref_re = Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    let named_names: Vec<&str> = named.iter().map(|(n, _)| n.as_str()).collect();
    let first_name = ref_re
        .captures_iter(rest)
        .map(|c| c.get(1).unwrap().as_str().to_string())
        .find(|name| !named_names.contains(&name.as_str()))
        .unwrap_or_else(|| "cte".to_string());

    let mut repaired = format!("WITH {} AS ({})", first_name, first_body);
    for (name, body) in &named {
        repaired.push_str(&format!(", {} AS ({})", name, body));
    }
    repaired.push(' ');
    repaired.push_str(rest);

    debug!("Repaired missing WITH: {}", repaired);
    repaired
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    debug_assert_eq!(&text[open..open + 1], "(");
    let mut depth = 0;
    for (i, ch) in text[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedClient {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
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

    fn manager(replies: Vec<Result<String, LlmError>>) -> LlmManager {
        LlmManager::from_client(Box::new(ScriptedClient::new(replies)))
    }

    #[test]
    fn fenced_sql_block_is_stripped() {
        let reply = "Here you go:\n```sql\nSELECT 1\n```\nhope that helps";
        assert_eq!(strip_code_fences(reply), "SELECT 1");
    }

    #[test]
    fn unterminated_fence_is_tolerated() {
        assert_eq!(strip_code_fences("```sql\nSELECT 2"), "SELECT 2");
    }

    #[test]
    fn statement_ends_at_top_level_semicolon() {
        let text = "SELECT a FROM t; DROP TABLE t";
        assert_eq!(extract_statement(text).unwrap(), "SELECT a FROM t");
    }

    #[test]
    fn with_span_survives_nested_parens() {
        let text = "noise WITH x AS (SELECT a, COUNT(*) FROM t GROUP BY a) SELECT * FROM x; trailing";
        assert_eq!(
            extract_statement(text).unwrap(),
            "WITH x AS (SELECT a, COUNT(*) FROM t GROUP BY a) SELECT * FROM x"
        );
    }

    #[test]
    fn with_inside_identifier_is_not_a_keyword() {
        let text = "the withdrawal table: SELECT id FROM withdrawal";
        assert_eq!(
            extract_statement(text).unwrap(),
            "SELECT id FROM withdrawal"
        );
    }

    #[test]
    fn leading_paren_before_select_is_kept() {
        let text = "Here you go: (SELECT id FROM a) SELECT * FROM b";
        assert_eq!(
            extract_statement(text).unwrap(),
            "(SELECT id FROM a) SELECT * FROM b"
        );
    }

    #[test]
    fn repairs_anonymous_leading_cte() {
        let input = "(SELECT a, COUNT(*) c FROM t GROUP BY a) SELECT * FROM s WHERE c > 1";
        assert_eq!(
            repair_missing_with(input),
            "WITH s AS (SELECT a, COUNT(*) c FROM t GROUP BY a) SELECT * FROM s WHERE c > 1"
        );
    }

    #[test]
    fn repairs_chain_of_named_fragments() {
        let input = "(SELECT id FROM a), second AS (SELECT id FROM first) SELECT * FROM first JOIN second ON first.id = second.id";
        assert_eq!(
            repair_missing_with(input),
            "WITH first AS (SELECT id FROM a), second AS (SELECT id FROM first) SELECT * FROM first JOIN second ON first.id = second.id"
        );
    }

    #[test]
    fn well_formed_sql_is_left_alone() {
        let input = "WITH x AS (SELECT 1) SELECT * FROM x";
        assert_eq!(repair_missing_with(input), input);
        assert_eq!(repair_missing_with("SELECT 1"), "SELECT 1");
    }

    #[tokio::test]
    async fn created_at_does_not_trip_keyword_checks() {
        let llm = manager(vec![Ok(
            "```sql\nSELECT id FROM users WHERE created_at > :d\n```".to_string()
        )]);
        let generated = generate(&llm, "p").await.unwrap();
        assert!(!generated.contains_complex_sql);
        assert_eq!(generated.sql, "SELECT id FROM users WHERE created_at > :d");
    }

    #[tokio::test]
    async fn missing_with_is_repaired_end_to_end() {
        let llm = manager(vec![Ok(
            "(SELECT a, COUNT(*) c FROM t GROUP BY a) SELECT * FROM s WHERE c > 1".to_string(),
        )]);
        let generated = generate(&llm, "p").await.unwrap();
        assert_eq!(
            generated.sql,
            "WITH s AS (SELECT a, COUNT(*) c FROM t GROUP BY a) SELECT * FROM s WHERE c > 1"
        );
    }

    #[tokio::test]
    async fn ddl_reply_is_flagged_complex() {
        let llm = manager(vec![Ok(
            "CREATE TEMP TABLE tmp AS SELECT 1; SELECT * FROM tmp".to_string()
        )]);
        let generated = generate(&llm, "p").await.unwrap();
        assert!(generated.contains_complex_sql);
        assert!(generated.sql.contains("CREATE TEMP TABLE"));
    }

    #[tokio::test]
    async fn write_statement_is_forbidden() {
        let llm = manager(vec![Ok("DELETE FROM users".to_string())]);
        match generate(&llm, "p").await {
            Err(GenerateError::Forbidden { keyword, sql }) => {
                assert_eq!(keyword, "DELETE");
                assert_eq!(sql, "DELETE FROM users");
            }
            other => panic!("expected Forbidden, got {:?}", other.map(|g| g.sql)),
        }
    }

    #[tokio::test]
    async fn error_shaped_reply_is_unusable() {
        let llm = manager(vec![Ok(
            "Sorry, I cannot answer that from the schema.".to_string()
        )]);
        assert!(matches!(
            generate(&llm, "p").await,
            Err(GenerateError::Unusable(_))
        ));
    }

    #[tokio::test]
    async fn empty_reply_is_unusable() {
        let llm = manager(vec![Ok("   ".to_string())]);
        assert!(matches!(
            generate(&llm, "p").await,
            Err(GenerateError::Unusable(_))
        ));
    }
}
