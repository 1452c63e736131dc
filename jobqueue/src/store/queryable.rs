use crate::job::Job;

use super::Query;

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::TenantEqual(tenant) => job.tenant_id == *tenant,
            Query::StatusEqual(status) => job.status == *status,
            Query::CreatedBefore(cutoff) => job.created_at < *cutoff,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn tenant_and_status_filters_combine() {
        let job = Job::new("alice".into(), json!(null));

        assert!(Query::for_tenant("alice".into(), None).matches(&job));
        assert!(Query::for_tenant("alice".into(), Some(JobStatus::Queued)).matches(&job));
        assert!(!Query::for_tenant("alice".into(), Some(JobStatus::Failed)).matches(&job));
        assert!(!Query::for_tenant("bob".into(), None).matches(&job));
    }

    #[test]
    fn stranded_matches_old_queued_jobs_only() {
        let mut job = Job::new("alice".into(), json!(null));
        job.created_at = Utc::now() - TimeDelta::minutes(5);

        assert!(Query::stranded(Utc::now() - TimeDelta::minutes(1)).matches(&job));
        assert!(!Query::stranded(Utc::now() - TimeDelta::minutes(10)).matches(&job));

        job.status = JobStatus::Running;
        assert!(!Query::stranded(Utc::now()).matches(&job));
    }
}
