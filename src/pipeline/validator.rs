use regex::Regex;
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;

/// Terminal rejection: the statement never reaches the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyViolation(pub String);

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQL rejected: {}", self.0)
    }
}

impl Error for SafetyViolation {}

#[derive(Debug, Clone)]
pub struct ValidatorPolicy {
    /// Reject `SELECT *` with no WHERE/LIMIT/aggregate. Heuristic against
    /// unbounded full-table scans, kept configurable because it can reject
    /// legitimate small-table dumps.
    pub block_unbounded_select_star: bool,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            block_unbounded_select_star: true,
        }
    }
}

fn dangerous_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|TRUNCATE|MERGE|GRANT|REVOKE|EXEC|EXECUTE|CALL|ATTACH|PRAGMA|COPY)\b",
        )
        .unwrap()
    })
}

fn injection_res() -> &'static Vec<(Regex, &'static str)> {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            (
                Regex::new(r"'[^']*--").unwrap(),
                "comment-terminated string literal",
            ),
            (
                Regex::new(r"(?is)\bUNION\b.*?(\binformation_schema\b|\bsys\s*\.)").unwrap(),
                "UNION against system catalogs",
            ),
            (
                Regex::new(r"(?i)\b(LOAD_FILE|PG_READ_FILE)\s*\(|\bINTO\s+(OUT|DUMP)FILE\b").unwrap(),
                "file read/write primitive",
            ),
        ]
    })
}

fn aggregate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(COUNT|SUM|AVG|MIN|MAX)\s*\(|\bGROUP\s+BY\b").unwrap())
}

/// Pure, side-effect-free check run on every statement before anything
/// touches the database.
pub fn validate(sql: &str, policy: &ValidatorPolicy) -> Result<(), SafetyViolation> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(SafetyViolation("empty statement".to_string()));
    }

    let upper = trimmed.to_uppercase();
    if !(starts_with_word(&upper, "SELECT") || starts_with_word(&upper, "WITH")) {
        return Err(SafetyViolation(
            "only SELECT or WITH statements are allowed".to_string(),
        ));
    }

    if let Some(m) = dangerous_re().find(trimmed) {
        return Err(SafetyViolation(format!(
            "dangerous keyword: {}",
            m.as_str().to_uppercase()
        )));
    }

    // Anything after a semicolon would be a second statement
    if let Some(pos) = trimmed.find(';') {
        if !trimmed[pos + 1..].trim().is_empty() {
            return Err(SafetyViolation("multiple statements".to_string()));
        }
    }

    for (re, reason) in injection_res() {
        if re.is_match(trimmed) {
            return Err(SafetyViolation(format!("injection pattern: {}", reason)));
        }
    }

    if policy.block_unbounded_select_star && is_unbounded_select_star(&upper) {
        return Err(SafetyViolation(
            "SELECT * without WHERE, LIMIT or aggregation".to_string(),
        ));
    }

    Ok(())
}

fn starts_with_word(upper: &str, word: &str) -> bool {
    upper.starts_with(word)
        && upper[word.len()..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric() && c != '_')
            .unwrap_or(true)
}

fn is_unbounded_select_star(upper: &str) -> bool {
    let star = Regex::new(r"^\s*SELECT\s+\*").unwrap();
    star.is_match(upper)
        && !upper.contains("WHERE")
        && !upper.contains("LIMIT")
        && !aggregate_re().is_match(upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(sql: &str) -> Result<(), SafetyViolation> {
        validate(sql, &ValidatorPolicy::default())
    }

    #[test]
    fn plain_select_passes() {
        assert!(check("SELECT id FROM users WHERE created_at > :d").is_ok());
        assert!(check("WITH x AS (SELECT 1) SELECT * FROM x LIMIT 10").is_ok());
    }

    #[test]
    fn dml_is_rejected() {
        assert!(check("DELETE FROM users").is_err());
        assert!(check("UPDATE users SET name = 'x'").is_err());
        assert!(check("INSERT INTO users VALUES (1)").is_err());
    }

    #[test]
    fn stacked_statements_are_rejected() {
        assert!(check("SELECT * FROM users; DROP TABLE users").is_err());
        assert!(check("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn trailing_semicolon_is_fine() {
        assert!(check("SELECT id FROM users WHERE id = 1;").is_ok());
    }

    #[test]
    fn column_names_do_not_trip_keyword_scan() {
        assert!(check("SELECT created_at, updated_at FROM events WHERE id = 1").is_ok());
        assert!(check("SELECT deleted_flag FROM t LIMIT 5").is_ok());
    }

    #[test]
    fn injection_shapes_are_rejected() {
        assert!(check("SELECT name FROM t WHERE name = 'x' -- ' AND secret = 1").is_err());
        assert!(check("SELECT a FROM t UNION SELECT table_name FROM information_schema.tables").is_err());
        assert!(check("SELECT load_file('/etc/passwd')").is_err());
    }

    #[test]
    fn unbounded_select_star_is_policy() {
        assert!(check("SELECT * FROM users").is_err());
        assert!(check("SELECT * FROM users WHERE id = 1").is_ok());
        assert!(check("SELECT * FROM users LIMIT 10").is_ok());
        assert!(check("SELECT * FROM (SELECT a, COUNT(*) FROM t GROUP BY a)").is_ok());

        let open = ValidatorPolicy {
            block_unbounded_select_star: false,
        };
        assert!(validate("SELECT * FROM users", &open).is_ok());
    }
}
