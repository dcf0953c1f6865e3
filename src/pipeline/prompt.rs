use crate::pipeline::Question;
use crate::retrieval::ContextItem;
use crate::schema::{Dialect, SchemaSnapshot};

/// Builds the generation prompt from the schema snapshot, retrieved context
/// and the question. Deterministic string template, no side effects.
pub fn build_prompt(
    question: &Question,
    schema: &SchemaSnapshot,
    context: &[ContextItem],
    dialect: Dialect,
) -> String {
    let mut prompt = String::from("# DATABASE SCHEMA\n\n");

    if schema.tables.is_empty() {
        prompt.push_str("No tables available.\n\n");
    }

    for table in &schema.tables {
        prompt.push_str(&format!("## Table: {}\n\n", table.name));
        prompt.push_str("| Column Name | Data Type | Nullable | Primary Key |\n");
        prompt.push_str("|------------|-----------|----------|-------------|\n");

        for column in &table.columns {
            prompt.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                column.name,
                column.data_type,
                if column.nullable { "YES" } else { "NO" },
                if column.primary_key { "YES" } else { "NO" }
            ));
        }
        prompt.push('\n');

        if !table.sample_rows.is_empty() {
            prompt.push_str("### Sample Data:\n\n");
            prompt.push_str("| ");
            for column in &table.columns {
                prompt.push_str(&format!("{} | ", column.name));
            }
            prompt.push_str("\n| ");
            for _ in &table.columns {
                prompt.push_str("--- | ");
            }
            prompt.push('\n');

            for row in &table.sample_rows {
                prompt.push_str("| ");
                for value in row {
                    prompt.push_str(&format!("{} | ", value));
                }
                prompt.push('\n');
            }
            prompt.push('\n');
        }
    }

    if !schema.relationships.is_empty() {
        prompt.push_str("## Relationships\n\n");
        for rel in &schema.relationships {
            prompt.push_str(&format!(
                "- {}.{} references {}.{}\n",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            ));
        }
        prompt.push('\n');
    }

    if !context.is_empty() {
        prompt.push_str("# CONTEXT\n\n");
        for item in context {
            prompt.push_str(&format!("- [{}] {}\n", item.category.label(), item.content));
        }
        prompt.push('\n');
    }

    let question_text = question.effective_text();

    prompt.push_str(&format!(
        r#"### Instructions:
Your task is to convert a question into a SQL query for {dialect}, given the database schema above.
Adhere to these rules:
- **Only produce a SELECT statement (or WITH ... SELECT)** - never INSERT, UPDATE, DELETE, or any DDL
- **Use a CTE (`WITH name AS (...)`) for complex intermediate results** - never a temporary table
- **Write parameter placeholders as `:name`** when the question implies a runtime value
- **The query must be valid {dialect} syntax**
- **Use the exact spelling of column names as provided in the schema**
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT t1.col1, t2.col1 FROM table1 t1 JOIN table2 t2 ON t1.id = t2.id`.

### Input:
Generate a SQL query that answers the question `{question}`.

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{question}`:
```sql
"#,
        dialect = dialect.name(),
        question = question_text,
    ));

    prompt
}
