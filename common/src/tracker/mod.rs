// Job tracker: tenant-facing job submission, updates, status queries and
// lifecycle event fan-out.

pub mod filter;
pub mod job_tracker;

pub use filter::{metadata_matches, JobListFilter, StatusFilter, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use job_tracker::{
    JobPage, JobTracker, JobUpdate, JobUpdateRecord, JobView, SubmitOptions, SubmittedJob,
    TrackerConfig, JOB_WEBHOOK_FAILURE_LIMIT,
};
