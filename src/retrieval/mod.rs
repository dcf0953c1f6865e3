use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCategory {
    Terminology,
    SqlExample,
    DomainKnowledge,
}

impl ContextCategory {
    pub const ALL: [ContextCategory; 3] = [
        ContextCategory::Terminology,
        ContextCategory::SqlExample,
        ContextCategory::DomainKnowledge,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ContextCategory::Terminology => "terminology",
            ContextCategory::SqlExample => "sql_example",
            ContextCategory::DomainKnowledge => "domain_knowledge",
        }
    }
}

/// A retrieved fragment used to ground SQL generation. Never mutated after
/// the retriever produces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    pub category: ContextCategory,
    pub source_id: Option<String>,
}

#[derive(Debug)]
pub struct RetrievalError(pub String);

impl fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Retrieval error: {}", self.0)
    }
}

impl Error for RetrievalError {}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<ContextItem>, RetrievalError>;
}

/// Retriever backed by a JSON file of entries, ranked by naive keyword
/// overlap with the question. Stands in for the vector-store backend the
/// pipeline consumes through the `Retriever` trait.
pub struct FileRetriever {
    path: PathBuf,
    category: ContextCategory,
}

#[derive(Deserialize)]
struct FileEntry {
    content: String,
    #[serde(default)]
    id: Option<String>,
}

impl FileRetriever {
    pub fn new(path: PathBuf, category: ContextCategory) -> Self {
        Self { path, category }
    }
}

#[async_trait]
impl Retriever for FileRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<ContextItem>, RetrievalError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RetrievalError(format!("{}: {}", self.path.display(), e)))?;

        let entries: Vec<FileEntry> =
            serde_json::from_str(&raw).map_err(|e| RetrievalError(e.to_string()))?;

        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(|w| w.to_string())
            .collect();

        let mut scored: Vec<(usize, ContextItem)> = entries
            .into_iter()
            .map(|entry| {
                let haystack = entry.content.to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(*t)).count();
                (
                    score,
                    ContextItem {
                        content: entry.content,
                        category: self.category,
                        source_id: entry.id,
                    },
                )
            })
            .filter(|(score, _)| !terms.is_empty() && *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().map(|(_, item)| item).collect())
    }
}

/// Fans out to one retriever per category concurrently. Retrieval is
/// best-effort: an unset or failing retriever contributes nothing. Merged
/// results are deduplicated by content hash and truncated to `limit`.
pub struct RetrievalCoordinator {
    retrievers: Vec<(ContextCategory, Arc<dyn Retriever>)>,
    limit: usize,
}

impl RetrievalCoordinator {
    pub fn new(limit: usize) -> Self {
        Self {
            retrievers: Vec::new(),
            limit,
        }
    }

    pub fn with_retriever(mut self, category: ContextCategory, retriever: Arc<dyn Retriever>) -> Self {
        self.retrievers.push((category, retriever));
        self
    }

    pub async fn retrieve_all(&self, query: &str) -> Vec<ContextItem> {
        let mut set = JoinSet::new();

        for (category, retriever) in &self.retrievers {
            let category = *category;
            let retriever = Arc::clone(retriever);
            let query = query.to_string();
            set.spawn(async move {
                match retriever.retrieve(&query).await {
                    Ok(items) => (category, items),
                    Err(e) => {
                        warn!("Retriever for {} failed: {}", category.label(), e);
                        (category, Vec::new())
                    }
                }
            });
        }

        let mut by_category: Vec<(ContextCategory, Vec<ContextItem>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => by_category.push(result),
                Err(e) => warn!("Retriever task panicked: {}", e),
            }
        }

        // Deterministic category order regardless of completion order
        let mut merged = Vec::new();
        for wanted in ContextCategory::ALL {
            for (category, items) in &by_category {
                if *category == wanted {
                    merged.extend(items.iter().cloned());
                }
            }
        }

        let mut seen = HashSet::new();
        merged.retain(|item| {
            let mut hasher = DefaultHasher::new();
            item.content.hash(&mut hasher);
            seen.insert(hasher.finish())
        });

        if merged.len() > self.limit {
            debug!("Truncating context from {} to {} items", merged.len(), self.limit);
            merged.truncate(self.limit);
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRetriever {
        items: Vec<ContextItem>,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<ContextItem>, RetrievalError> {
            Ok(self.items.clone())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<ContextItem>, RetrievalError> {
            Err(RetrievalError("backend down".to_string()))
        }
    }

    fn item(category: ContextCategory, content: &str) -> ContextItem {
        ContextItem {
            content: content.to_string(),
            category,
            source_id: None,
        }
    }

    #[tokio::test]
    async fn failing_retriever_is_best_effort() {
        let coordinator = RetrievalCoordinator::new(20)
            .with_retriever(
                ContextCategory::Terminology,
                Arc::new(FixedRetriever {
                    items: vec![item(ContextCategory::Terminology, "GMV means gross value")],
                }),
            )
            .with_retriever(ContextCategory::DomainKnowledge, Arc::new(FailingRetriever));

        let items = coordinator.retrieve_all("what is gmv").await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_by_content() {
        let coordinator = RetrievalCoordinator::new(20)
            .with_retriever(
                ContextCategory::Terminology,
                Arc::new(FixedRetriever {
                    items: vec![
                        item(ContextCategory::Terminology, "same text"),
                        item(ContextCategory::Terminology, "same text"),
                    ],
                }),
            )
            .with_retriever(
                ContextCategory::SqlExample,
                Arc::new(FixedRetriever {
                    items: vec![item(ContextCategory::SqlExample, "same text")],
                }),
            );

        let items = coordinator.retrieve_all("q").await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn merged_results_are_truncated_and_ordered() {
        let many: Vec<ContextItem> = (0..30)
            .map(|i| item(ContextCategory::DomainKnowledge, &format!("fact {}", i)))
            .collect();

        let coordinator = RetrievalCoordinator::new(20)
            .with_retriever(
                ContextCategory::DomainKnowledge,
                Arc::new(FixedRetriever { items: many }),
            )
            .with_retriever(
                ContextCategory::Terminology,
                Arc::new(FixedRetriever {
                    items: vec![item(ContextCategory::Terminology, "term first")],
                }),
            );

        let items = coordinator.retrieve_all("q").await;
        assert_eq!(items.len(), 20);
        // Terminology sorts ahead of domain knowledge in the merge
        assert_eq!(items[0].content, "term first");
    }
}
