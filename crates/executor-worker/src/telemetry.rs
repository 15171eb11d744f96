// Per-job telemetry event, emitted once when a job finishes.

use serde::Serialize;
use std::time::Duration;

use crate::job::Job;

pub const TELEMETRY_TARGET: &str = "executor::telemetry";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTelemetry {
    pub job_id: i64,
    pub record_id: i64,
    pub repository: String,
    pub queue: String,
    pub runtime: String,
    pub docker_steps: usize,
    pub cli_steps: usize,
    pub duration_ms: u64,
    pub succeeded: bool,
}

impl JobTelemetry {
    pub fn new(job: &Job, runtime: &str, elapsed: Duration, succeeded: bool) -> Self {
        Self {
            job_id: job.id,
            record_id: job.record_id,
            repository: job.repository_name.clone(),
            queue: job.queue.clone(),
            runtime: runtime.to_string(),
            docker_steps: job.docker_steps.len(),
            cli_steps: job.cli_steps.len(),
            duration_ms: elapsed.as_millis() as u64,
            succeeded,
        }
    }

    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(
                target: TELEMETRY_TARGET,
                job_id = self.job_id,
                succeeded = self.succeeded,
                telemetry = %json,
                "job finished",
            ),
            Err(e) => tracing::debug!(target: TELEMETRY_TARGET, error = %e, "failed to encode telemetry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CliStep, DockerStep};

    #[test]
    fn captures_identity_and_step_counts() {
        let job = Job {
            id: 5,
            record_id: 9,
            repository_name: "acme/widgets".to_string(),
            docker_steps: vec![DockerStep::default(); 3],
            cli_steps: vec![CliStep::default()],
            ..Default::default()
        };
        let t = JobTelemetry::new(&job, "docker", Duration::from_millis(1500), false);
        assert_eq!(t.docker_steps, 3);
        assert_eq!(t.cli_steps, 1);
        assert_eq!(t.duration_ms, 1500);

        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["jobId"], 5);
        assert_eq!(json["runtime"], "docker");
        assert_eq!(json["succeeded"], false);
        t.emit();
    }
}
