use types::{EffectiveJobConf, JobConf, JobDefaults, ScheduleJob};

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(String),
}

/// Job admission against the party's parallelism and core ceilings.
///
/// Counts are read at admission time and not reserved; a race between two
/// schedulers may overshoot briefly.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    max_running_jobs: usize,
    total_cores: u32,
}

impl ResourceManager {
    pub fn new(max_running_jobs: usize, total_cores: u32) -> Self {
        Self {
            max_running_jobs,
            total_cores,
        }
    }

    pub fn admit(
        &self,
        requested: &EffectiveJobConf,
        running: &[ScheduleJob],
        defaults: &JobDefaults,
    ) -> Admission {
        if running.len() >= self.max_running_jobs {
            return Admission::Rejected(format!(
                "{} jobs running, limit is {}",
                running.len(),
                self.max_running_jobs
            ));
        }

        let used: u32 = running
            .iter()
            .map(|job| job_conf(job, defaults).requested_cores())
            .sum();
        let wanted = requested.requested_cores();
        if used.saturating_add(wanted) > self.total_cores {
            return Admission::Rejected(format!(
                "requested {} cores with {} of {} in use",
                wanted, used, self.total_cores
            ));
        }

        Admission::Admitted
    }
}

/// Effective conf of a stored job; an unreadable conf falls back to defaults.
pub fn job_conf(job: &ScheduleJob, defaults: &JobDefaults) -> EffectiveJobConf {
    JobConf::from_dag_document(&job.dag)
        .unwrap_or_default()
        .resolve(defaults)
}
