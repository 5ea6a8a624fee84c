//! Worker driven job lifecycle: status aggregation, cancellation and the
//! at-most-once finished notification.

#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use convoy::models::{DicomJob, DicomNode, DicomTask, JobKind, JobStatus, TaskStatus, TransferSpec};
use convoy::store::Store;
use convoy::worker::{DicomWorker, WorkerOptions};
use tempfile::TempDir;

use support::*;

fn open_store(dir: &TempDir) -> Arc<Store> {
    Arc::new(Store::open(&dir.path().join("convoy.redb")).unwrap())
}

fn pending_job(store: &Store, kind: JobKind) -> DicomJob {
    let mut job = DicomJob::new(kind, "tester");
    job.status = JobStatus::Pending;
    store.create_job(job).unwrap()
}

fn transfer_task(store: &Store, job: &DicomJob, patient_id: &str, destination: DicomNode) -> DicomTask {
    let task = DicomTask::new(job.id, source_node(), Some(destination)).with_spec(TransferSpec {
        patient_id: Some(patient_id.into()),
        ..Default::default()
    });
    store.create_task(task).unwrap()
}

/// Process queued tasks until no eligible entry is left
fn drain(worker: &DicomWorker) {
    while worker.check_and_process_next_task().unwrap() {}
}

#[test]
fn test_two_task_job_with_ambiguous_patient_ends_in_failure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // the second patient id matches two different patients on the source
    let mut backend = single_study_backend();
    backend.patients.push(FakePatient {
        patient_id: "9999".into(),
        patient_name: "Smith^Anna".into(),
        birth_date: "19790301".into(),
    });
    backend.patients.push(FakePatient {
        patient_id: "9999".into(),
        patient_name: "Smith^Anne".into(),
        birth_date: "19790301".into(),
    });
    let factory = FakeFactory::new(backend);
    let notifier = Arc::new(CountingNotifier::default());

    let mut job = DicomJob::new(JobKind::Batch, "tester");
    job.status = JobStatus::Pending;
    job.send_finished_mail = true;
    let job = store.create_job(job).unwrap();

    let good = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("out")));
    let bad = transfer_task(&store, &job, "9999", DicomNode::folder(dir.path().join("out")));
    store.queue_pending_tasks(job.id, 4, 8).unwrap();

    let worker = test_worker(
        store.clone(),
        factory,
        notifier.clone(),
        WorkerOptions::default(),
    );
    drain(&worker);

    let good = store.task(good.id).unwrap();
    assert_eq!(good.status, TaskStatus::Success);
    assert_eq!(good.message, "Transfer task completed successfully.");

    let bad = store.task(bad.id).unwrap();
    assert_eq!(bad.status, TaskStatus::Failure);
    assert!(bad.message.contains("Ambiguous patient"));

    let job = store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.message, "Some tasks failed.");
    assert!(job.start.is_some());
    assert!(job.end.is_some());
    assert!(store.queued_entries().unwrap().is_empty());

    // notified exactly once, re-running post processing does not re-notify
    assert_eq!(notifier.notified.load(Ordering::SeqCst), 1);
    let again = store.post_process_job(job.id).unwrap();
    assert!(!again.should_notify);
    assert_eq!(again.job.status, JobStatus::Failure);
}

#[test]
fn test_all_tasks_succeeding_finish_the_job() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());
    let notifier = Arc::new(CountingNotifier::default());

    let job = pending_job(&store, JobKind::Selective);
    let first = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("a")));
    let second = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("b")));
    store.queue_pending_tasks(job.id, 4, 8).unwrap();

    let worker = test_worker(store.clone(), factory, notifier.clone(), WorkerOptions::default());
    drain(&worker);

    assert_eq!(store.task(first.id).unwrap().status, TaskStatus::Success);
    assert_eq!(store.task(second.id).unwrap().status, TaskStatus::Success);

    let job = store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.message, "All tasks succeeded.");
    // mail delivery was not requested for this job
    assert_eq!(notifier.notified.load(Ordering::SeqCst), 0);
}

#[test]
fn test_store_warnings_aggregate_to_job_warning() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // the destination acknowledges one instance with a warning status
    let mut backend = single_study_backend();
    backend.store_warnings.insert("1.2.840.1.1.3.1".into());
    let factory = FakeFactory::new(backend);
    let notifier = Arc::new(CountingNotifier::default());

    let job = pending_job(&store, JobKind::Batch);
    let warned = transfer_task(&store, &job, "4711", destination_node());
    let clean = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("out")));
    store.queue_pending_tasks(job.id, 4, 8).unwrap();

    let worker = test_worker(store.clone(), factory, notifier, WorkerOptions::default());
    drain(&worker);

    let warned = store.task(warned.id).unwrap();
    assert_eq!(warned.status, TaskStatus::Warning);
    assert!(warned.log.contains("Warning during C-STORE"));
    assert_eq!(store.task(clean.id).unwrap().status, TaskStatus::Success);

    let job = store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Warning);
    assert_eq!(job.message, "Some tasks have warnings.");
}

#[test]
fn test_canceling_job_is_only_left_via_canceled() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());
    let notifier = Arc::new(CountingNotifier::default());

    let mut job = pending_job(&store, JobKind::Batch);
    job.send_finished_mail = true;
    store.update_job(&job).unwrap();
    let task = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("out")));
    store.queue_pending_tasks(job.id, 4, 8).unwrap();

    // cancellation was requested while the task is queued but not consumed
    job.status = JobStatus::Canceling;
    store.update_job(&job).unwrap();

    let worker = test_worker(store.clone(), factory, notifier.clone(), WorkerOptions::default());
    drain(&worker);

    let task = store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert_eq!(task.message, "Task was canceled.");

    let job = store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.end.is_some());
    // a canceled job never counts as finished, so no mail goes out
    assert_eq!(notifier.notified.load(Ordering::SeqCst), 0);
    assert!(store.queued_entries().unwrap().is_empty());
}

#[test]
fn test_retry_after_failure_runs_only_failed_tasks_again() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut backend = single_study_backend();
    backend.patients.push(FakePatient {
        patient_id: "9999".into(),
        patient_name: "Smith^Anna".into(),
        birth_date: "19790301".into(),
    });
    backend.studies.push(FakeStudy {
        patient_id: "9999".into(),
        study_uid: "1.2.840.2.1".into(),
        study_date: "20240201".into(),
        study_time: "091500".into(),
        description: "MR Head".into(),
        modalities: vec!["MR".into()],
    });
    backend.series.push(FakeSeries {
        study_uid: "1.2.840.2.1".into(),
        series_uid: "1.2.840.2.1.1".into(),
        series_number: Some(1),
        modality: "MR".into(),
        description: "t1".into(),
        instances: 1,
    });
    backend.patients.push(FakePatient {
        patient_id: "9999".into(),
        patient_name: "Smith^Anne".into(),
        birth_date: "19790301".into(),
    });
    let factory = FakeFactory::new(backend);
    let notifier = Arc::new(CountingNotifier::default());

    let job = pending_job(&store, JobKind::Batch);
    let good = transfer_task(&store, &job, "4711", DicomNode::folder(dir.path().join("out")));
    let bad = transfer_task(&store, &job, "9999", DicomNode::folder(dir.path().join("out")));
    store.queue_pending_tasks(job.id, 4, 8).unwrap();

    let worker = test_worker(store.clone(), factory.clone(), notifier, WorkerOptions::default());
    drain(&worker);
    assert_eq!(store.job(job.id).unwrap().status, JobStatus::Failure);

    // drop the duplicate patient, then retry the job
    factory.backend.lock().unwrap().patients.pop();
    let job = store.retry_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(store.task(bad.id).unwrap().status, TaskStatus::Pending);
    assert_eq!(store.task(good.id).unwrap().status, TaskStatus::Success);

    store.queue_pending_tasks(job.id, 4, 8).unwrap();
    assert_eq!(store.queued_entries().unwrap().len(), 1);
    drain(&worker);

    assert_eq!(store.task(bad.id).unwrap().status, TaskStatus::Success);
    let job = store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.message, "All tasks succeeded.");
}
