// End-to-end scheduling across a guest (scheduler) party and a host party

mod common;

use common::fixtures::{reader_psi_dag, single_task_dag, submit_request};
use common::{Federation, HOST_PARTY};
use scheduler_core::error::{SchedulerError, StoreError};
use serde_json::json;
use std::time::Duration;
use types::{JobStatus, TaskStatus};

#[tokio::test]
async fn test_two_party_job_runs_to_success() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-a", reader_psi_dag(json!({"task_parallelism": 2}))))
        .await
        .unwrap();
    assert_eq!(job_id, "job-a");
    assert_eq!(fed.job(&job_id).status, JobStatus::Waiting);

    // Created everywhere, started, first task dispatched.
    fed.tick().await;
    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.created_parties.len(), 2);
    for party in fed.parties.values() {
        assert_eq!(party.job(&job_id).status, JobStatus::Running);
        assert_eq!(party.task("reader_0").party_status, TaskStatus::Running);
        assert_eq!(party.task("psi_0").party_status, TaskStatus::Pending);
    }
    assert!(fed
        .schedule_tasks("reader_0")
        .iter()
        .all(|t| t.status == TaskStatus::Running));

    // Upstream done: the poll picks it up and psi_0 starts.
    fed.report_all("reader_0", TaskStatus::Success).await;
    fed.tick().await;
    assert!(fed
        .schedule_tasks("reader_0")
        .iter()
        .all(|t| t.status == TaskStatus::Success));
    assert!(fed
        .schedule_tasks("psi_0")
        .iter()
        .all(|t| t.status == TaskStatus::Running));
    assert_eq!(fed.job(&job_id).progress, 50);

    fed.report_all("psi_0", TaskStatus::Success).await;
    fed.tick().await;

    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.progress, 100);
    assert!(!job.schedule_signal);
    assert!(job.end_time.is_some());
    for party in fed.parties.values() {
        let local = party.job(&job_id);
        assert_eq!(local.status, JobStatus::Success);
        assert_eq!(local.progress, 100);
        assert_eq!(party.engine.runs_of("reader_0"), 1);
        assert_eq!(party.engine.runs_of("psi_0"), 1);
    }

    let status = fed.scheduler.query_job_status(&job_id).await.unwrap();
    assert_eq!(status.job_status, JobStatus::Success);
    assert_eq!(status.status.len(), 4);
}

#[tokio::test]
async fn test_downstream_waits_for_every_party() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-b", reader_psi_dag(json!({"task_parallelism": 2}))))
        .await
        .unwrap();
    fed.tick().await;

    // Only the guest finished reader_0.
    fed.guest().report("reader_0", TaskStatus::Success).await;
    fed.tick().await;

    assert!(fed
        .schedule_tasks("psi_0")
        .iter()
        .all(|t| t.status == TaskStatus::Pending));
    assert_eq!(fed.guest().engine.runs_of("psi_0"), 0);
    assert_eq!(fed.job(&job_id).status, JobStatus::Running);
}

#[tokio::test]
async fn test_failed_task_is_retried_with_new_version() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request(
            "job-c",
            single_task_dag(json!({"auto_retries": 1, "auto_retry_delay": 0})),
        ))
        .await
        .unwrap();
    fed.tick().await;

    fed.host().report("reader_0", TaskStatus::Failed).await;
    fed.tick().await;

    // Version 2 dispatched on both parties; the guest's healthy v1 was stopped.
    let rows = fed.schedule_tasks("reader_0");
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.task_version, 2);
        assert_eq!(row.status, TaskStatus::Running);
        assert_eq!(row.auto_retries, 0);
    }
    assert_eq!(fed.host().engine.runs_of("reader_0"), 2);
    assert_eq!(fed.guest().engine.runs_of("reader_0"), 2);
    assert_eq!(fed.guest().engine.kills().len(), 1);
    assert_eq!(fed.job(&job_id).status, JobStatus::Running);

    let guest_v1 = fed
        .guest()
        .job_store
        .get_all_tasks()
        .into_iter()
        .find(|t| t.task_version == 1)
        .unwrap();
    assert_eq!(guest_v1.party_status, TaskStatus::Failed);

    fed.report_all("reader_0", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-d", reader_psi_dag(json!({}))))
        .await
        .unwrap();
    fed.tick().await;

    fed.host().report("reader_0", TaskStatus::Failed).await;
    fed.tick().await;

    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("reader_0"));
    assert!(fed
        .schedule_tasks("reader_0")
        .iter()
        .all(|t| t.status == TaskStatus::Failed));
    // psi_0 never ran.
    assert!(fed
        .schedule_tasks("psi_0")
        .iter()
        .all(|t| t.status == TaskStatus::Failed));

    for party in fed.parties.values() {
        assert_eq!(party.job(&job_id).status, JobStatus::Failed);
        assert_eq!(party.engine.alive_count(), 0);
        assert_eq!(party.engine.runs_of("psi_0"), 0);
    }
}

#[tokio::test]
async fn test_launch_failure_counts_as_task_failure() {
    let fed = Federation::new();
    fed.host().engine.fail_launch_of("reader_0");
    let job_id = fed
        .api
        .submit_job(submit_request("job-e", single_task_dag(json!({}))))
        .await
        .unwrap();

    fed.tick().await;
    let host_row = fed
        .schedule_tasks("reader_0")
        .into_iter()
        .find(|t| t.party_id == HOST_PARTY)
        .unwrap();
    assert_eq!(host_row.status, TaskStatus::Failed);
    assert!(fed
        .host()
        .task("reader_0")
        .error_report
        .unwrap()
        .contains("cannot start reader_0"));

    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Failed);
}

#[tokio::test]
async fn test_stop_cancels_job_on_every_party() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-f", reader_psi_dag(json!({}))))
        .await
        .unwrap();
    fed.tick().await;

    fed.scheduler.stop_job(&job_id, None).await.unwrap();
    assert!(fed.job(&job_id).cancel_signal);
    fed.tick().await;

    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Canceled);
    for party in fed.parties.values() {
        assert_eq!(party.job(&job_id).status, JobStatus::Canceled);
        assert_eq!(party.task("reader_0").party_status, TaskStatus::Failed);
        assert_eq!(party.engine.kills().len(), 1);
        assert_eq!(party.engine.alive_count(), 0);
    }

    // Finished jobs cannot be stopped again.
    let err = fed.scheduler.stop_job(&job_id, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_stop_completes_with_unreachable_party() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-g", single_task_dag(json!({}))))
        .await
        .unwrap();
    fed.tick().await;

    fed.network.set_down(HOST_PARTY, true);
    fed.scheduler
        .stop_job(&job_id, Some(JobStatus::Failed))
        .await
        .unwrap();
    fed.tick().await;

    assert_eq!(fed.job(&job_id).status, JobStatus::Failed);
    assert_eq!(fed.guest().job(&job_id).status, JobStatus::Failed);
    // The host never heard about it.
    assert_eq!(fed.host().job(&job_id).status, JobStatus::Running);
}

#[tokio::test]
async fn test_rerun_after_failure() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-h", reader_psi_dag(json!({"task_parallelism": 2}))))
        .await
        .unwrap();
    fed.tick().await;
    fed.report_all("reader_0", TaskStatus::Success).await;
    fed.tick().await;
    fed.host().report("psi_0", TaskStatus::Failed).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Failed);

    // Unknown tasks are rejected.
    let err = fed
        .scheduler
        .rerun_job(&job_id, vec!["ghost".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));

    fed.scheduler.rerun_job(&job_id, Vec::new()).await.unwrap();
    fed.tick().await;

    // Only the failed task gets a new version.
    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Waiting);
    assert!(!job.rerun_signal);
    assert!(fed
        .schedule_tasks("reader_0")
        .iter()
        .all(|t| t.task_version == 1 && t.status == TaskStatus::Success));
    assert!(fed
        .schedule_tasks("psi_0")
        .iter()
        .all(|t| t.task_version == 2 && t.status == TaskStatus::Pending));
    for party in fed.parties.values() {
        assert_eq!(party.job(&job_id).status, JobStatus::Waiting);
    }

    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Running);
    for party in fed.parties.values() {
        let psi = party.task("psi_0");
        assert_eq!(psi.task_version, 2);
        assert_eq!(psi.party_status, TaskStatus::Running);
        assert_eq!(party.engine.runs_of("reader_0"), 1);
    }

    fed.report_all("psi_0", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);
    for party in fed.parties.values() {
        assert_eq!(party.job(&job_id).status, JobStatus::Success);
    }
}

#[tokio::test]
async fn test_callback_sync_reports_to_scheduler() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-i", single_task_dag(json!({"sync_type": "callback"}))))
        .await
        .unwrap();
    fed.tick().await;

    // Reports land on the scheduler before any poll.
    fed.report_all("reader_0", TaskStatus::Success).await;
    assert!(fed
        .schedule_tasks("reader_0")
        .iter()
        .all(|t| t.status == TaskStatus::Success));

    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);
}

#[tokio::test]
async fn test_lost_worker_fails_the_job() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-j", single_task_dag(json!({}))))
        .await
        .unwrap();
    fed.tick().await;

    let host = fed.host();
    host.engine.crash(&host.task("reader_0"));
    let report = host.detector.scan_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.lost, 1);
    assert_eq!(host.task("reader_0").party_status, TaskStatus::Failed);
    assert!(fed.job(&job_id).cancel_signal);

    // The guest worker is still fine.
    let report = fed.guest().detector.scan_once().await.unwrap();
    assert_eq!(report.lost, 0);

    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Failed);
    assert_eq!(fed.guest().engine.kills().len(), 1);
}

#[tokio::test]
async fn test_job_timeout_fails_job() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-k", single_task_dag(json!({"timeout": 0}))))
        .await
        .unwrap();
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Running);

    tokio::time::sleep(Duration::from_millis(20)).await;
    fed.tick().await;

    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("job timed out"));
}

#[tokio::test]
async fn test_submission_is_not_repeated() {
    let fed = Federation::new();
    let request = submit_request("job-l", single_task_dag(json!({})));
    fed.api.submit_job(request.clone()).await.unwrap();

    let err = fed.api.submit_job(request).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Store(StoreError::Duplicate(_))));
    assert_eq!(fed.schedule_store.get_all_jobs().len(), 1);
    assert_eq!(fed.schedule_store.get_all_tasks().len(), 2);

    // Creating the job on a party twice is harmless.
    fed.tick().await;
    let create = types::CreateJobRequest {
        job_id: "job-l".to_string(),
        dag: fed.job("job-l").dag,
        config: json!({}),
        flow_id: None,
        old_job_id: None,
        scheduler_party_id: "9999".to_string(),
        initiator_party_id: "9999".to_string(),
    };
    fed.host().service.create_job(create).await.unwrap();
    assert_eq!(fed.host().job_store.get_all_jobs().len(), 1);
    assert_eq!(fed.host().job_store.get_all_tasks().len(), 1);
}

#[tokio::test]
async fn test_invalid_dag_is_rejected_at_submit() {
    let fed = Federation::new();
    let dag = common::fixtures::two_party_dag(
        json!({"a": {"component_ref": "x", "dependent_tasks": ["ghost"]}}),
        json!({}),
    );
    let err = fed.api.submit_job(submit_request("job-m", dag)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Dag(_)));
    assert!(fed.schedule_store.get_all_jobs().is_empty());
}

#[tokio::test]
async fn test_single_party_job_dispatches_in_dependency_order() {
    let fed = Federation::new();
    let dag = json!({
        "dag": {
            "parties": [{"role": "guest", "party_id": [common::SCHEDULER_PARTY]}],
            "conf": {},
            "tasks": {
                "a": {"component_ref": "reader"},
                "b": {"component_ref": "psi", "dependent_tasks": ["a"]}
            }
        },
        "schema_version": "2.0.0"
    });
    let job_id = fed.api.submit_job(submit_request("job-n", dag)).await.unwrap();

    fed.tick().await;
    let guest = fed.guest();
    assert_eq!(guest.task("a").party_status, TaskStatus::Running);
    assert_eq!(guest.task("b").party_status, TaskStatus::Pending);
    assert!(fed.host().job_store.get_all_jobs().is_empty());

    guest.report("a", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(guest.task("b").party_status, TaskStatus::Running);

    guest.report("b", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);
    assert_eq!(fed.job(&job_id).parties.len(), 1);
}

#[tokio::test]
async fn test_task_succeeds_on_third_attempt() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request(
            "job-o",
            single_task_dag(json!({"auto_retries": 2, "auto_retry_delay": 0})),
        ))
        .await
        .unwrap();
    fed.tick().await;

    for _ in 0..2 {
        fed.host().report("reader_0", TaskStatus::Failed).await;
        fed.tick().await;
        assert_eq!(fed.job(&job_id).status, JobStatus::Running);
    }

    let rows = fed.schedule_tasks("reader_0");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|t| t.task_version == 3 && t.auto_retries == 0));

    fed.report_all("reader_0", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);

    let host_history: Vec<i32> = fed
        .schedule_store
        .get_all_tasks()
        .into_iter()
        .filter(|t| t.party_id == HOST_PARTY)
        .map(|t| t.task_version)
        .collect();
    assert_eq!(host_history.len(), 3);
    assert_eq!(fed.host().job_store.get_all_tasks().len(), 3);
    assert_eq!(fed.host().engine.runs_of("reader_0"), 3);
}

#[tokio::test]
async fn test_unreachable_party_keeps_job_waiting() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-p", single_task_dag(json!({}))))
        .await
        .unwrap();

    fed.network.set_down(HOST_PARTY, true);
    fed.tick().await;
    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.created_parties, vec![common::SCHEDULER_PARTY.to_string()]);
    assert!(!job.schedule_signal);

    fed.network.set_down(HOST_PARTY, false);
    fed.tick().await;
    let job = fed.job(&job_id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.created_parties.len(), 2);
    assert_eq!(fed.host().task("reader_0").party_status, TaskStatus::Running);
}

#[tokio::test]
async fn test_start_missed_by_one_party_is_resent() {
    let fed = Federation::new();
    let job_id = fed
        .api
        .submit_job(submit_request("job-q", reader_psi_dag(json!({"sync_type": "callback"}))))
        .await
        .unwrap();
    fed.tick().await;
    fed.report_all("reader_0", TaskStatus::Success).await;

    fed.network.set_down(HOST_PARTY, true);
    fed.tick().await;
    assert_eq!(fed.guest().task("psi_0").party_status, TaskStatus::Running);
    assert_eq!(fed.host().task("psi_0").party_status, TaskStatus::Pending);

    fed.network.set_down(HOST_PARTY, false);
    fed.tick().await;
    assert_eq!(fed.host().task("psi_0").party_status, TaskStatus::Running);
    assert_eq!(fed.host().engine.runs_of("psi_0"), 1);
    assert_eq!(fed.guest().engine.runs_of("psi_0"), 1);
    for row in fed.schedule_tasks("psi_0") {
        assert_eq!(row.status, TaskStatus::Running);
    }

    fed.report_all("psi_0", TaskStatus::Success).await;
    fed.tick().await;
    assert_eq!(fed.job(&job_id).status, JobStatus::Success);
}
