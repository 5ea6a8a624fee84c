//! Notification collaborator called when a job reaches its final state

use tracing::info;

use crate::models::DicomJob;

/// Invoked at most once per terminal job transition. The mail delivery
/// itself lives outside the engine; deployments plug their own
/// implementation in here.
pub trait JobNotifier: Send + Sync {
    fn notify_job_finished(&self, job: &DicomJob);
}

/// Default notifier that only writes a log line
#[derive(Debug, Default)]
pub struct LogNotifier;

impl JobNotifier for LogNotifier {
    fn notify_job_finished(&self, job: &DicomJob) {
        info!(
            "{} of {} finished with status {}: {}",
            job, job.owner, job.status, job.message
        );
    }
}
