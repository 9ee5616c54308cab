//! Query expansion via the generator port.
//!
//! Produces lexical keyword variants, semantic rephrasings, and a HyDE
//! passage (a hypothetical answer used as an additional vector query).
//! The generator's output must match the expansion schema exactly;
//! anything malformed is rejected and the caller gets the identity
//! expansion instead. Unvalidated generator output never flows
//! downstream.

use serde::Deserialize;
use tracing::debug;

use crate::model::Generator;

/// Structured expansion of a user query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpansion {
    /// Short keyword variants, 1-3 tokens each.
    pub lexical_queries: Vec<String>,
    /// Natural-language rephrasings preserving intent.
    pub vector_queries: Vec<String>,
    /// Hypothetical answer passage; empty when unavailable.
    pub hyde_passage: String,
}

impl QueryExpansion {
    /// The fallback expansion: the query itself, no HyDE.
    pub fn identity(query: &str) -> Self {
        Self {
            lexical_queries: vec![query.to_string()],
            vector_queries: vec![query.to_string()],
            hyde_passage: String::new(),
        }
    }
}

const MAX_VARIANTS: usize = 5;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExpansion {
    lexical_queries: Vec<String>,
    vector_queries: Vec<String>,
    hyde_passage: String,
}

fn expansion_prompt(query: &str) -> String {
    format!(
        r#"You expand search queries for a document retrieval system.

Given the query below, respond with ONLY a JSON object of this exact shape:
{{
  "lexical_queries": ["1-3 keyword variants, each 1 to 3 words"],
  "vector_queries": ["1-3 full rephrasings of the question"],
  "hyde_passage": "a short passage (2-4 sentences) that would plausibly answer the query"
}}

No prose, no markdown fences, no extra keys.

Query: {}"#,
        query
    )
}

/// Strip a surrounding markdown code fence, if the model added one
/// despite instructions.
fn strip_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end_matches('`').trim()
}

fn token_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Validate parsed output against the expansion contract. Any violation
/// rejects the whole output.
fn validate(raw: RawExpansion) -> Option<QueryExpansion> {
    let lexical: Vec<String> = raw
        .lexical_queries
        .iter()
        .map(|q| q.trim().to_string())
        .collect();
    let vector: Vec<String> = raw
        .vector_queries
        .iter()
        .map(|q| q.trim().to_string())
        .collect();

    if lexical.is_empty() || vector.is_empty() {
        return None;
    }
    if lexical
        .iter()
        .any(|q| q.is_empty() || !(1..=3).contains(&token_count(q)))
    {
        return None;
    }
    if vector.iter().any(|q| q.is_empty()) {
        return None;
    }

    Some(QueryExpansion {
        lexical_queries: lexical.into_iter().take(MAX_VARIANTS).collect(),
        vector_queries: vector.into_iter().take(MAX_VARIANTS).collect(),
        hyde_passage: raw.hyde_passage.trim().to_string(),
    })
}

pub struct QueryExpander<'a> {
    generator: &'a dyn Generator,
}

impl<'a> QueryExpander<'a> {
    pub fn new(generator: &'a dyn Generator) -> Self {
        Self { generator }
    }

    /// Expand a query. Never fails: on any generator or schema problem
    /// the identity expansion is returned.
    pub async fn expand(&self, query: &str) -> QueryExpansion {
        let output = match self.generator.generate(&expansion_prompt(query)).await {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "query expansion failed, using identity");
                return QueryExpansion::identity(query);
            }
        };
        let parsed: Option<RawExpansion> = serde_json::from_str(strip_fence(&output)).ok();
        match parsed.and_then(validate) {
            Some(expansion) => expansion,
            None => {
                debug!("query expansion output failed schema validation, using identity");
                QueryExpansion::identity(query)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::{Error, ErrorKind, Result};

    struct FixedGenerator {
        output: std::result::Result<String, ()>,
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            match &self.output {
                Ok(s) => Ok(s.clone()),
                Err(()) => Err(Error::new(ErrorKind::AdapterFailure, "down")),
            }
        }
    }

    fn gen_ok(output: &str) -> FixedGenerator {
        FixedGenerator {
            output: Ok(output.to_string()),
        }
    }

    const VALID: &str = r#"{
        "lexical_queries": ["rust lifetimes", "borrow checker"],
        "vector_queries": ["how do lifetimes work in rust"],
        "hyde_passage": "Lifetimes describe how long references are valid."
    }"#;

    #[tokio::test]
    async fn valid_output_is_parsed() {
        let generator = gen_ok(VALID);
        let expansion = QueryExpander::new(&generator).expand("rust lifetimes?").await;
        assert_eq!(
            expansion.lexical_queries,
            vec!["rust lifetimes", "borrow checker"]
        );
        assert_eq!(expansion.vector_queries.len(), 1);
        assert!(expansion.hyde_passage.starts_with("Lifetimes"));
    }

    #[tokio::test]
    async fn fenced_output_is_unwrapped() {
        let generator = gen_ok(&format!("```json\n{}\n```", VALID));
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion.lexical_queries.len(), 2);
    }

    #[tokio::test]
    async fn generator_failure_falls_back_to_identity() {
        let generator = FixedGenerator { output: Err(()) };
        let expansion = QueryExpander::new(&generator).expand("my query").await;
        assert_eq!(expansion, QueryExpansion::identity("my query"));
        assert_eq!(expansion.lexical_queries, vec!["my query"]);
        assert!(expansion.hyde_passage.is_empty());
    }

    #[tokio::test]
    async fn non_json_falls_back() {
        let generator = gen_ok("Sure! Here are some expansions: ...");
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion, QueryExpansion::identity("q"));
    }

    #[tokio::test]
    async fn unknown_keys_rejected() {
        let generator = gen_ok(
            r#"{"lexical_queries": ["a"], "vector_queries": ["b"], "hyde_passage": "", "extra": 1}"#,
        );
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion, QueryExpansion::identity("q"));
    }

    #[tokio::test]
    async fn overlong_lexical_variant_rejects_whole_output() {
        let generator = gen_ok(
            r#"{"lexical_queries": ["this one has four tokens"], "vector_queries": ["fine"], "hyde_passage": ""}"#,
        );
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion, QueryExpansion::identity("q"));
    }

    #[tokio::test]
    async fn empty_lists_rejected() {
        let generator =
            gen_ok(r#"{"lexical_queries": [], "vector_queries": ["x"], "hyde_passage": ""}"#);
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion, QueryExpansion::identity("q"));
    }

    #[tokio::test]
    async fn variant_lists_are_capped() {
        let many: Vec<String> = (0..10).map(|i| format!("\"kw {}\"", i)).collect();
        let generator = gen_ok(&format!(
            r#"{{"lexical_queries": [{}], "vector_queries": ["x"], "hyde_passage": ""}}"#,
            many.join(", ")
        ));
        let expansion = QueryExpander::new(&generator).expand("q").await;
        assert_eq!(expansion.lexical_queries.len(), MAX_VARIANTS);
    }
}
