use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Template keys with a built-in meaning; payload blocks may not shadow them.
pub const RESERVED_NAMES: &[&str] = &["previous", "context"];

/// The input bundle of one job.
///
/// Every entry becomes a named block of the run's context: inline `texts`
/// as they are, `links` after being fetched and read as documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub texts: BTreeMap<String, String>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

impl JobPayload {
    pub fn with_text(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.texts.insert(name.into(), text.into());
        self
    }

    pub fn with_link(mut self, name: impl Into<String>, link: impl Into<String>) -> Self {
        self.links.insert(name.into(), link.into());
        self
    }

    /// Reject payloads that can never produce a meaningful run.
    ///
    /// `stage_names` are the stages of the pipeline that will run the job. A
    /// block sharing a stage's name would be overwritten by that stage's
    /// output, so such payloads are refused up front.
    pub fn validate(&self, max_input_bytes: usize, stage_names: &[String]) -> Result<(), PipelineError> {
        if self.texts.is_empty() && self.links.is_empty() {
            return Err(PipelineError::Validation(
                "payload must contain at least one text or link".into(),
            ));
        }

        for name in self.texts.keys().chain(self.links.keys()) {
            validate_name(name)?;
            if stage_names.contains(name) {
                return Err(PipelineError::Validation(format!(
                    "block name '{name}' is already used by a pipeline stage"
                )));
            }
        }
        if let Some(name) = self.texts.keys().find(|n| self.links.contains_key(*n)) {
            return Err(PipelineError::Validation(format!(
                "'{name}' is given both as text and as link"
            )));
        }

        let total: usize = self.texts.values().map(String::len).sum();
        if total > max_input_bytes {
            return Err(PipelineError::Validation(format!(
                "inline text is {total} bytes, limit is {max_input_bytes}"
            )));
        }

        for (name, link) in &self.links {
            parse_link(link).map_err(|reason| {
                PipelineError::Validation(format!("link '{name}' is not usable: {reason}"))
            })?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), PipelineError> {
    if name.is_empty() {
        return Err(PipelineError::Validation("block names must not be empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PipelineError::Validation(format!(
            "block name '{name}' may only contain letters, digits, '_' and '-'"
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(PipelineError::Validation(format!(
            "block name '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Parse a remote reference, accepting only absolute http(s) URLs with a host.
pub fn parse_link(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".into());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    #[test]
    fn empty_payload_is_rejected() {
        let err = JobPayload::default().validate(LIMIT, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn texts_and_links_validate() {
        let payload = JobPayload::default()
            .with_text("cv", "Jane Doe, QA engineer")
            .with_link("requirements", "https://example.com/req.txt");
        assert!(payload.validate(LIMIT, &[]).is_ok());
    }

    #[test]
    fn unparsable_link_is_rejected() {
        let payload = JobPayload::default().with_link("video", "not a link");
        let err = payload.validate(LIMIT, &[]).unwrap_err();
        assert!(err.to_string().contains("link 'video'"));
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(parse_link("ftp://example.com/file").is_err());
        assert!(parse_link("file:///etc/passwd").is_err());
        assert!(parse_link(" https://example.com/a ").is_ok());
    }

    #[test]
    fn reserved_and_malformed_names_are_rejected() {
        let reserved = JobPayload::default().with_text("previous", "x");
        assert!(reserved.validate(LIMIT, &[]).is_err());

        let spaced = JobPayload::default().with_text("job notes", "x");
        assert!(spaced.validate(LIMIT, &[]).is_err());
    }

    #[test]
    fn block_named_like_a_stage_is_rejected() {
        let stages = vec!["extract".to_string(), "plan".to_string()];
        let payload = JobPayload::default()
            .with_text("cv", "Jane")
            .with_link("plan", "https://example.com/plan.txt");
        let err = payload.validate(LIMIT, &stages).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(err.to_string().contains("'plan' is already used"));

        let clear = JobPayload::default().with_text("cv", "Jane");
        assert!(clear.validate(LIMIT, &stages).is_ok());
    }

    #[test]
    fn same_name_in_texts_and_links_is_rejected() {
        let payload = JobPayload::default()
            .with_text("cv", "inline")
            .with_link("cv", "https://example.com/cv.txt");
        assert!(payload.validate(LIMIT, &[]).is_err());
    }

    #[test]
    fn oversized_text_is_rejected() {
        let payload = JobPayload::default().with_text("cv", "x".repeat(LIMIT + 1));
        let err = payload.validate(LIMIT, &[]).unwrap_err();
        assert!(err.to_string().contains("limit is 1024"));
    }

    #[test]
    fn payload_deserializes_with_missing_sections() {
        let payload: JobPayload = serde_json::from_str(r#"{"texts": {"cv": "hi"}}"#).unwrap();
        assert_eq!(payload.texts["cv"], "hi");
        assert!(payload.links.is_empty());
    }
}
