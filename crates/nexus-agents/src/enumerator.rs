//! # Search-Space Enumerator
//!
//! Decomposes a geographic or categorical constraint into an exhaustive
//! set of subspace queries via the LLM ("universities" + "in Colombia" →
//! one query per department). Malformed model output or an LLM failure
//! degrades to a single direct-search subspace rather than an error.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use nexus_shared::llm::{parse_json_or_extract, LlmClient};
use nexus_shared::NexusResult;

/// One narrowed query covering part of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSubspace {
    pub id: String,
    pub query: String,
    pub metadata: Value,
}

#[derive(Debug)]
pub struct SearchSpaceEnumerator {
    llm: Arc<LlmClient>,
}

impl SearchSpaceEnumerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(base_query: &str, search_space: &str) -> String {
        format!(
            r#"You are a geographic search space analyzer. Your task is to decompose the given search space into appropriate subspaces for data aggregation.

Entities to search for: {base_query}
Search space constraint: {search_space}

Instructions:
1. Focus ONLY on decomposing the search space ("{search_space}"), not on the entities
2. Determine what geographic level the search space represents (country, state, province, department, etc.)
3. Provide an exhaustive, complete enumeration of the next hierarchical level down
4. For any geographic area, enumerate ALL sub-areas at the next level (not just samples)

Examples of proper decomposition:
- "Colombia" → all departments: "Amazonas", "Antioquia", "Arauca", ...
- "Canada" → all provinces: "Ontario", "Quebec", "British Columbia", ...
- "California" → all counties: "Alameda County", "Orange County", ...

Return ONLY a JSON object with this structure, no other text:
{{
  "decomposition_type": "country_to_states|state_to_counties|country_to_provinces|country_to_departments|direct",
  "subspaces": [
    {{
      "id": "unique_identifier",
      "query": "{base_query} in [subspace name]",
      "metadata": {{"type": "subspace_type", "parent": "{search_space}", "name": "subspace name", "level": "hierarchical_level"}}
    }}
  ]
}}"#
        )
    }

    /// The fallback shape shared by both failure paths.
    fn direct_fallback(
        base_query: &str,
        search_space: &str,
        id: &str,
        error: Option<String>,
    ) -> Vec<SearchSubspace> {
        let query = format!("{base_query} {search_space}");
        let mut metadata = json!({
            "type": "direct",
            "query": query,
            "search_space": search_space,
        });
        if let Some(error) = error {
            metadata["error"] = Value::String(error);
        }
        vec![SearchSubspace {
            id: id.to_string(),
            query,
            metadata,
        }]
    }

    /// Enumerate subspaces for `base_query` within `search_space`.
    pub async fn enumerate(
        &self,
        base_query: &str,
        search_space: &str,
    ) -> NexusResult<Vec<SearchSubspace>> {
        info!(base_query, search_space, "enumerating search space");

        let response = match self
            .llm
            .generate(&Self::prompt(base_query, search_space), false)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "LLM error during enumeration, using direct search");
                return Ok(Self::direct_fallback(
                    base_query,
                    search_space,
                    "error_fallback",
                    Some(e.to_string()),
                ));
            }
        };

        let parsed = match parse_json_or_extract(&response) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "unparseable enumeration response, using direct search");
                return Ok(Self::direct_fallback(
                    base_query,
                    search_space,
                    "direct_fallback",
                    None,
                ));
            }
        };

        let rows = parsed
            .get("subspaces")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut seen_ids = HashSet::new();
        let mut subspaces = Vec::with_capacity(rows.len());
        for row in &rows {
            let (Some(id), Some(query)) = (
                row.get("id").and_then(Value::as_str),
                row.get("query").and_then(Value::as_str),
            ) else {
                continue;
            };
            // Ids must be unique within one call
            let mut unique_id = id.to_string();
            let mut suffix = 2;
            while !seen_ids.insert(unique_id.clone()) {
                unique_id = format!("{id}_{suffix}");
                suffix += 1;
            }
            subspaces.push(SearchSubspace {
                id: unique_id,
                query: query.to_string(),
                metadata: row.get("metadata").cloned().unwrap_or(Value::Null),
            });
        }

        if subspaces.is_empty() {
            warn!("enumeration produced no subspaces, using direct search");
            return Ok(Self::direct_fallback(
                base_query,
                search_space,
                "direct_fallback",
                None,
            ));
        }

        info!(count = subspaces.len(), "search space enumerated");
        Ok(subspaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enumerator_with(responses: &[&str]) -> SearchSpaceEnumerator {
        let llm = LlmClient::scripted();
        for response in responses {
            llm.as_scripted().push_response(*response);
        }
        SearchSpaceEnumerator::new(Arc::new(llm))
    }

    #[tokio::test]
    async fn test_enumerates_geographic_subspaces() {
        let response = json!({
            "decomposition_type": "country_to_departments",
            "subspaces": [
                {"id": "amazonas", "query": "universities in Amazonas",
                 "metadata": {"type": "department", "parent": "Colombia", "name": "Amazonas", "level": "department"}},
                {"id": "antioquia", "query": "universities in Antioquia",
                 "metadata": {"type": "department", "parent": "Colombia", "name": "Antioquia", "level": "department"}},
            ]
        });
        let enumerator = enumerator_with(&[&response.to_string()]);

        let subspaces = enumerator
            .enumerate("universities", "in Colombia")
            .await
            .unwrap();
        assert_eq!(subspaces.len(), 2);
        assert_eq!(subspaces[0].id, "amazonas");
        assert_eq!(subspaces[1].metadata["name"], json!("Antioquia"));
    }

    #[tokio::test]
    async fn test_fenced_response_is_trimmed() {
        let response = format!(
            "```json\n{}\n```",
            json!({"subspaces": [
                {"id": "on", "query": "schools in Ontario", "metadata": {"type": "province"}}
            ]})
        );
        let enumerator = enumerator_with(&[&response]);
        let subspaces = enumerator.enumerate("schools", "Canada").await.unwrap();
        assert_eq!(subspaces.len(), 1);
        assert_eq!(subspaces[0].query, "schools in Ontario");
    }

    #[tokio::test]
    async fn test_malformed_json_falls_back_to_direct() {
        let enumerator = enumerator_with(&["not json"]);
        let subspaces = enumerator
            .enumerate("universities", "in Colombia")
            .await
            .unwrap();

        assert_eq!(subspaces.len(), 1);
        assert_eq!(subspaces[0].query, "universities in Colombia");
        assert_eq!(subspaces[0].metadata["type"], json!("direct"));
        assert!(subspaces[0].metadata.get("error").is_none());
    }

    #[tokio::test]
    async fn test_llm_error_falls_back_with_error_metadata() {
        // Scripted client with no responses queued fails like a provider
        let enumerator = enumerator_with(&[]);
        let subspaces = enumerator.enumerate("universities", "in Colombia").await.unwrap();

        assert_eq!(subspaces.len(), 1);
        assert_eq!(subspaces[0].metadata["type"], json!("direct"));
        assert!(subspaces[0].metadata["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_made_unique() {
        let response = json!({"subspaces": [
            {"id": "dup", "query": "a", "metadata": {}},
            {"id": "dup", "query": "b", "metadata": {}},
            {"id": "dup", "query": "c", "metadata": {}},
        ]});
        let enumerator = enumerator_with(&[&response.to_string()]);
        let subspaces = enumerator.enumerate("q", "s").await.unwrap();

        let ids: HashSet<_> = subspaces.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_subspace_list_falls_back() {
        let enumerator = enumerator_with(&[&json!({"subspaces": []}).to_string()]);
        let subspaces = enumerator.enumerate("q", "space").await.unwrap();
        assert_eq!(subspaces.len(), 1);
        assert_eq!(subspaces[0].query, "q space");
    }
}
