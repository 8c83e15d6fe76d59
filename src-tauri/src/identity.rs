//! Decides whether a start request resumes the stored job or begins a new attempt.

use crate::job::{Job, JobIdentity, JobStatus};
use crate::store::JobStore;

/// Statuses the host-engine path treats as "nothing to do".
pub const NATIVE_RESUMABLE: &[JobStatus] = &[
    JobStatus::Done,
    JobStatus::LoadingModel,
    JobStatus::Transcribing,
];

/// The in-process path additionally keeps a cancelled job as is.
pub const IN_PROCESS_RESUMABLE: &[JobStatus] = &[
    JobStatus::Done,
    JobStatus::Cancelled,
    JobStatus::LoadingModel,
    JobStatus::Transcribing,
];

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    Resume(Job),
    StartNew,
}

pub fn resume_decision(
    store: &JobStore,
    identity: &JobIdentity,
    resumable: &[JobStatus],
) -> ResumeDecision {
    match store.match_or_null(&identity.audio, &identity.model) {
        Some(job) if resumable.contains(&job.status) => {
            log::info!(
                "Resuming existing job for {} ({:?}, {:.0}%)",
                identity.audio.display_name(),
                job.status,
                job.progress
            );
            ResumeDecision::Resume(job)
        }
        _ => ResumeDecision::StartNew,
    }
}
