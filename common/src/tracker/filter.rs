// Job listing filters

use crate::errors::ValidationError;
use crate::models::{JobStatus, Metadata};
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1_000;

/// `all` or one engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(JobStatus),
}

impl StatusFilter {
    pub fn statuses(&self) -> Vec<JobStatus> {
        match self {
            StatusFilter::All => JobStatus::ALL.to_vec(),
            StatusFilter::Only(status) => vec![*status],
        }
    }
}

impl FromStr for StatusFilter {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        s.parse::<JobStatus>().map(StatusFilter::Only)
    }
}

impl<'de> Deserialize<'de> for StatusFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Query for `JobTracker::list_jobs`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobListFilter {
    pub queue: Option<String>,
    pub status: StatusFilter,
    /// Every pair must be present on the job with an equal value
    pub metadata: Metadata,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobListFilter {
    fn default() -> Self {
        Self {
            queue: None,
            status: StatusFilter::All,
            metadata: Metadata::new(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl JobListFilter {
    pub fn page_size(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

pub fn metadata_matches(metadata: &Metadata, wanted: &Metadata) -> bool {
    wanted
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_filter_parsing() {
        assert_eq!("all".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!(
            "failed".parse::<StatusFilter>().unwrap(),
            StatusFilter::Only(JobStatus::Failed)
        );
        assert!("done".parse::<StatusFilter>().is_err());
        assert_eq!(StatusFilter::All.statuses().len(), 6);
    }

    #[test]
    fn test_filter_deserializes_with_defaults() {
        let filter: JobListFilter =
            serde_json::from_value(json!({"status": "completed", "metadata": {"a": 1}})).unwrap();
        assert_eq!(filter.status, StatusFilter::Only(JobStatus::Completed));
        assert_eq!(filter.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset, 0);
        assert!(filter.queue.is_none());
    }

    #[test]
    fn test_metadata_matches_is_and_across_keys() {
        let mut metadata = Metadata::new();
        metadata.insert("a".to_string(), json!(1));
        metadata.insert("b".to_string(), json!("x"));

        let mut wanted = Metadata::new();
        assert!(metadata_matches(&metadata, &wanted));

        wanted.insert("a".to_string(), json!(1));
        assert!(metadata_matches(&metadata, &wanted));

        wanted.insert("b".to_string(), json!("y"));
        assert!(!metadata_matches(&metadata, &wanted));

        let mut missing = Metadata::new();
        missing.insert("c".to_string(), json!(null));
        assert!(!metadata_matches(&metadata, &missing));
    }

    #[test]
    fn test_page_size_is_clamped() {
        let filter = JobListFilter {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(filter.page_size(), 1);
        let filter = JobListFilter {
            limit: 10_000,
            ..Default::default()
        };
        assert_eq!(filter.page_size(), MAX_PAGE_SIZE);
    }
}
