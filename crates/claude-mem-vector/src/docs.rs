//! Granular document formation.
//!
//! Hierarchical store rows are denormalized into several small vector
//! documents to improve recall: an observation contributes its narrative,
//! each fact, and any legacy text body as separate documents. Document ids
//! are deterministic, and the owning store row is recoverable from any id by
//! regex.

use std::sync::LazyLock;

use claude_mem_schema::{Observation, SessionSummary, UserPromptRow};
use regex::Regex;

use crate::{DocMetadata, DocType, VectorDocument};

pub fn observation_doc_id(sqlite_id: i64, field_type: &str, fact_index: Option<usize>) -> String {
    match fact_index {
        Some(i) => format!("obs_{sqlite_id}_{field_type}_{i}"),
        None => format!("obs_{sqlite_id}_{field_type}"),
    }
}

pub fn summary_doc_id(sqlite_id: i64, field_type: &str) -> String {
    format!("summary_{sqlite_id}_{field_type}")
}

pub fn prompt_doc_id(sqlite_id: i64) -> String {
    format!("prompt_{sqlite_id}")
}

static OBS_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^obs_(\d+)_[a-z_]+(?:_\d+)?$").unwrap());
static SUMMARY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^summary_(\d+)_[a-z_]+$").unwrap());
static PROMPT_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^prompt_(\d+)$").unwrap());

/// Recover `(doc_type, sqlite_id)` from a document id.
pub fn parse_doc_id(doc_id: &str) -> Option<(DocType, i64)> {
    for (regex, doc_type) in [
        (&*OBS_ID, DocType::Observation),
        (&*SUMMARY_ID, DocType::SessionSummary),
        (&*PROMPT_ID, DocType::UserPrompt),
    ] {
        if let Some(captures) = regex.captures(doc_id) {
            if let Ok(id) = captures[1].parse() {
                return Some((doc_type, id));
            }
        }
    }
    None
}

fn observation_metadata(obs: &Observation, field_type: &str, fact_index: Option<usize>) -> DocMetadata {
    DocMetadata {
        sqlite_id: obs.id,
        doc_type: DocType::Observation,
        memory_session_id: Some(obs.memory_session_id.clone()),
        project: obs.project.clone(),
        created_at_epoch: obs.created_at_epoch,
        field_type: field_type.to_string(),
        fact_index,
    }
}

pub fn observation_documents(obs: &Observation) -> Vec<VectorDocument> {
    let mut docs = Vec::new();
    if let Some(narrative) = obs.narrative.as_deref().filter(|n| !n.trim().is_empty()) {
        docs.push(VectorDocument {
            id: observation_doc_id(obs.id, "narrative", None),
            text: narrative.to_string(),
            metadata: observation_metadata(obs, "narrative", None),
        });
    }
    for (i, fact) in obs.facts.iter().enumerate() {
        if fact.trim().is_empty() {
            continue;
        }
        docs.push(VectorDocument {
            id: observation_doc_id(obs.id, "fact", Some(i)),
            text: fact.clone(),
            metadata: observation_metadata(obs, "fact", Some(i)),
        });
    }
    if let Some(text) = obs.text.as_deref().filter(|t| !t.trim().is_empty()) {
        docs.push(VectorDocument {
            id: observation_doc_id(obs.id, "text", None),
            text: text.to_string(),
            metadata: observation_metadata(obs, "text", None),
        });
    }
    docs
}

pub fn summary_documents(summary: &SessionSummary) -> Vec<VectorDocument> {
    let fields = [
        ("request", &summary.request),
        ("investigated", &summary.investigated),
        ("learned", &summary.learned),
        ("completed", &summary.completed),
        ("next_steps", &summary.next_steps),
        ("notes", &summary.notes),
    ];
    fields
        .into_iter()
        .filter_map(|(field_type, value)| {
            let text = value.as_deref()?.trim();
            if text.is_empty() {
                return None;
            }
            Some(VectorDocument {
                id: summary_doc_id(summary.id, field_type),
                text: text.to_string(),
                metadata: DocMetadata {
                    sqlite_id: summary.id,
                    doc_type: DocType::SessionSummary,
                    memory_session_id: Some(summary.memory_session_id.clone()),
                    project: summary.project.clone(),
                    created_at_epoch: summary.created_at_epoch,
                    field_type: field_type.to_string(),
                    fact_index: None,
                },
            })
        })
        .collect()
}

pub fn prompt_document(prompt: &UserPromptRow, project: &str) -> Option<VectorDocument> {
    if prompt.prompt_text.trim().is_empty() {
        return None;
    }
    Some(VectorDocument {
        id: prompt_doc_id(prompt.id),
        text: prompt.prompt_text.clone(),
        metadata: DocMetadata {
            sqlite_id: prompt.id,
            doc_type: DocType::UserPrompt,
            memory_session_id: None,
            project: project.to_string(),
            created_at_epoch: prompt.created_at_epoch,
            field_type: "prompt".to_string(),
            fact_index: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_mem_schema::{ObservationType, Visibility};

    fn observation() -> Observation {
        Observation {
            id: 42,
            memory_session_id: "mem-1".into(),
            project: "p".into(),
            kind: ObservationType::Discovery,
            title: "T".into(),
            subtitle: None,
            narrative: Some("the narrative".into()),
            text: Some("legacy body".into()),
            facts: vec!["fact zero".into(), "fact one".into()],
            concepts: vec![],
            files_read: vec![],
            files_modified: vec![],
            prompt_number: None,
            discovery_tokens: 0,
            bead_id: None,
            agent: "legacy".into(),
            department: "default".into(),
            visibility: Visibility::Project,
            created_at_epoch: 1,
        }
    }

    #[test]
    fn observation_yields_narrative_facts_and_legacy_text() {
        let docs = observation_documents(&observation());
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["obs_42_narrative", "obs_42_fact_0", "obs_42_fact_1", "obs_42_text"]
        );
        assert_eq!(docs[1].metadata.fact_index, Some(0));
        assert_eq!(docs[1].text, "fact zero");
    }

    #[test]
    fn empty_fields_yield_no_documents() {
        let mut obs = observation();
        obs.narrative = None;
        obs.text = Some("   ".into());
        obs.facts = vec!["".into()];
        assert!(observation_documents(&obs).is_empty());
    }

    #[test]
    fn summary_yields_one_doc_per_populated_field() {
        let summary = SessionSummary {
            id: 7,
            memory_session_id: "mem-1".into(),
            project: "p".into(),
            request: Some("do it".into()),
            investigated: None,
            learned: Some("learned it".into()),
            completed: None,
            next_steps: None,
            notes: None,
            prompt_number: None,
            agent: "legacy".into(),
            department: "default".into(),
            visibility: Visibility::Project,
            created_at_epoch: 1,
        };
        let docs = summary_documents(&summary);
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["summary_7_request", "summary_7_learned"]);
    }

    #[test]
    fn doc_ids_round_trip_through_the_regex() {
        assert_eq!(parse_doc_id("obs_42_narrative"), Some((DocType::Observation, 42)));
        assert_eq!(parse_doc_id("obs_42_fact_3"), Some((DocType::Observation, 42)));
        assert_eq!(parse_doc_id("obs_42_text"), Some((DocType::Observation, 42)));
        assert_eq!(
            parse_doc_id("summary_7_next_steps"),
            Some((DocType::SessionSummary, 7))
        );
        assert_eq!(parse_doc_id("prompt_9"), Some((DocType::UserPrompt, 9)));
        assert_eq!(parse_doc_id("garbage"), None);
        assert_eq!(parse_doc_id("obs_x_narrative"), None);
    }
}
