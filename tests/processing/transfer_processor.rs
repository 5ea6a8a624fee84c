//! Transfer processor behavior: resolution rules, destination handling and
//! pseudonymization of the moved datasets.

#[path = "../support/mod.rs"]
mod support;

use std::path::Path;
use std::sync::Arc;

use convoy::error::Error;
use convoy::models::{DicomJob, DicomNode, DicomTask, JobKind, JobStatus, TaskStatus, TransferSpec};
use convoy::processors::{
    resolution, CancelCheck, ConnectorFactory, ProcessContext, TaskProcessor, TransferProcessor,
};
use convoy::store::Store;
use dicom_dictionary_std::tags;
use dimse::{Capabilities, ServerNode};
use tempfile::TempDir;
use walkdir::WalkDir;

use support::*;

fn open_store(dir: &TempDir) -> Arc<Store> {
    Arc::new(Store::open(&dir.path().join("convoy.redb")).unwrap())
}

fn job_and_task(
    store: &Store,
    spec: TransferSpec,
    destination: DicomNode,
) -> (DicomJob, DicomTask) {
    let mut job = DicomJob::new(JobKind::Batch, "tester");
    job.status = JobStatus::InProgress;
    let job = store.create_job(job).unwrap();

    let task = DicomTask::new(job.id, source_node(), Some(destination)).with_spec(spec);
    let task = store.create_task(task).unwrap();
    (job, task)
}

fn context(store: &Arc<Store>, job_id: u64) -> ProcessContext {
    ProcessContext {
        store: store.clone(),
        cancel: CancelCheck::new(store.clone(), job_id),
    }
}

fn spec_for(patient_id: &str) -> TransferSpec {
    TransferSpec {
        patient_id: Some(patient_id.into()),
        ..Default::default()
    }
}

fn dcm_files(folder: &Path) -> Vec<String> {
    WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().display().to_string())
        .collect()
}

#[test]
fn test_transfer_study_to_folder() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let dest = dir.path().join("downloads");
    let (job, task) = job_and_task(&store, spec_for("4711"), DicomNode::folder(&dest));
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory, vec![]);
    let result = processor.process(&job, &task, &ctx).unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.message, "Transfer task completed successfully.");

    // all five instances below <job folder>/<patient>/<date>-<time>-<modalities>
    let files = dcm_files(&dest);
    assert_eq!(files.len(), 5);
    for file in &files {
        assert!(file.contains("4711"));
        assert!(file.contains("20240117-134500-CT,SR"));
        assert!(file.ends_with(".dcm"));
    }
}

#[test]
fn test_pseudonymized_transfer_rewrites_identity() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let dest = dir.path().join("downloads");
    let mut spec = spec_for("4711");
    spec.pseudonym = Some("PSEUDO1".into());
    let (mut job, task) = job_and_task(&store, spec, DicomNode::folder(&dest));
    job.trial_protocol_id = Some("TRIAL-7".into());
    store.update_job(&job).unwrap();
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory, vec![]);
    let result = processor.process(&job, &task, &ctx).unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    let files = dcm_files(&dest);
    assert_eq!(files.len(), 5);
    // files live below the pseudonym, never the original patient id
    for file in &files {
        assert!(file.contains("PSEUDO1"));
        assert!(!file.contains("4711/"));
    }

    let obj = dicom_object::open_file(&files[0]).unwrap().into_inner();
    let value = |tag| {
        obj.get(tag)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0')
            .trim()
            .to_string()
    };
    assert_eq!(value(tags::PATIENT_ID), "PSEUDO1");
    assert_eq!(value(tags::PATIENT_NAME), "PSEUDO1");
    assert_eq!(value(tags::PATIENT_BIRTH_DATE), "19870101");
    assert_eq!(value(tags::REFERRING_PHYSICIAN_NAME), "ANONYMIZED");
    assert_eq!(value(dicom_core::Tag(0x0012, 0x0020)), "TRIAL-7");
}

#[test]
fn test_excluded_modalities_are_not_transferred_when_pseudonymizing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let dest = dir.path().join("downloads");
    let mut spec = spec_for("4711");
    spec.pseudonym = Some("PSEUDO1".into());
    let (job, task) = job_and_task(&store, spec, DicomNode::folder(&dest));
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory, vec!["SR".into()]);
    let result = processor.process(&job, &task, &ctx).unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    // the SR series (1 instance) is dropped, its modality leaves the folder name
    let files = dcm_files(&dest);
    assert_eq!(files.len(), 4);
    for file in &files {
        assert!(file.contains("20240117-134500-CT"));
        assert!(!file.contains("CT,SR"));
    }
}

#[test]
fn test_transfer_to_server_stores_all_instances() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let (job, task) = job_and_task(&store, spec_for("4711"), destination_node());
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory.clone(), vec![]);
    let result = processor.process(&job, &task, &ctx).unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    let backend = factory.backend.lock().unwrap();
    assert_eq!(backend.stored.len(), 5);
    assert!(backend.stored.contains(&"1.2.840.1.1.1.1".to_string()));
    assert!(backend.stored.contains(&"1.2.840.1.1.3.1".to_string()));
}

#[test]
fn test_move_is_used_when_source_lacks_get() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    // a peer with Query/Retrieve find and move, but no C-GET
    let source = DicomNode::server(
        ServerNode::new("LEGACY", "localhost", 104).with_capabilities(Capabilities {
            study_root_find: true,
            study_root_move: true,
            ..Default::default()
        }),
    );
    let mut job = DicomJob::new(JobKind::Batch, "tester");
    job.status = JobStatus::InProgress;
    let job = store.create_job(job).unwrap();
    let task = DicomTask::new(job.id, source, Some(destination_node()))
        .with_spec(spec_for("4711"));
    let task = store.create_task(task).unwrap();
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory.clone(), vec![]);
    let result = processor.process(&job, &task, &ctx).unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    let backend = factory.backend.lock().unwrap();
    assert_eq!(
        backend.move_requests,
        vec![("1.2.840.1.1".to_string(), "ARCHIVE".to_string())]
    );
    assert!(backend.stored.is_empty());
    drop(backend);

    // a pseudonymized transfer cannot bypass the modifier via C-MOVE
    let mut spec = spec_for("4711");
    spec.pseudonym = Some("PSEUDO1".into());
    let mut task = store.task(task.id).unwrap();
    task.spec = spec;
    store.update_task(&task).unwrap();
    let err = processor.process(&job, &task, &ctx).unwrap_err();
    assert!(matches!(err, Error::Task(_)));
    assert!(err.to_string().contains("C-GET"));
}

#[test]
fn test_ambiguous_and_missing_patients_fail_fatally() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut backend = single_study_backend();
    backend.patients.push(FakePatient {
        patient_id: "4711".into(),
        patient_name: "Doe^Jane".into(),
        birth_date: "19870522".into(),
    });
    let factory = FakeFactory::new(backend);

    let (job, task) = job_and_task(
        &store,
        spec_for("4711"),
        DicomNode::folder(dir.path().join("out")),
    );
    let ctx = context(&store, job.id);
    let mut processor = TransferProcessor::new(factory.clone(), vec![]);

    let err = processor.process(&job, &task, &ctx).unwrap_err();
    assert!(err.to_string().contains("Ambiguous patient"));
    assert!(!err.is_retriable());

    let mut task = store.task(task.id).unwrap();
    task.spec = spec_for("0000");
    store.update_task(&task).unwrap();
    let err = processor.process(&job, &task, &ctx).unwrap_err();
    assert!(err.to_string().contains("No patient found"));
    assert!(!err.is_retriable());
}

#[test]
fn test_mismatching_patient_details_fail_fatally() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let spec = TransferSpec {
        patient_id: Some("4711".into()),
        patient_name: Some("Mallory^Eve".into()),
        patient_birth_date: chrono::NaiveDate::from_ymd_opt(1987, 5, 22),
        ..Default::default()
    };
    let (job, task) = job_and_task(&store, spec, DicomNode::folder(dir.path().join("out")));
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory, vec![]);
    let err = processor.process(&job, &task, &ctx).unwrap_err();
    assert!(err.to_string().contains("PatientName doesn't match"));
}

#[test]
fn test_store_failures_surface_as_retriable() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut backend = single_study_backend();
    backend.store_failures.insert("1.2.840.1.1.1.1".into());
    backend.store_failures.insert("1.2.840.1.1.2.2".into());
    let factory = FakeFactory::new(backend);

    let (job, task) = job_and_task(&store, spec_for("4711"), destination_node());
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory.clone(), vec![]);
    let err = processor.process(&job, &task, &ctx).unwrap_err();
    assert!(err.is_retriable());
    assert!(err.to_string().contains("2 C-STORE operation(s) failed"));

    // every other instance was still attempted before the error was raised
    assert_eq!(factory.backend.lock().unwrap().stored.len(), 3);
}

#[test]
fn test_transfer_to_archive_appends_patient_folder() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let factory = FakeFactory::new(single_study_backend());

    let dest = dir.path().join("archives");
    let (mut job, task) = job_and_task(&store, spec_for("4711"), DicomNode::folder(&dest));
    job.archive_password = Some("secret".into());
    store.update_job(&job).unwrap();
    let ctx = context(&store, job.id);

    let mut processor = TransferProcessor::new(factory, vec![]);
    let result = processor.process(&job, &task, &ctx).unwrap();
    assert_eq!(result.status, TaskStatus::Success);

    let archives: Vec<_> = std::fs::read_dir(&dest)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].extension().unwrap(), "zip");

    let zip_file = std::fs::File::open(&archives[0]).unwrap();
    let archive = zip::ZipArchive::new(zip_file).unwrap();
    let names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    assert_eq!(names.len(), 6);
    assert!(names.contains(&"INDEX.txt".to_string()));
    assert!(names
        .iter()
        .any(|n| n.starts_with("4711/20240117-134500-CT,SR/") && n.ends_with(".dcm")));
}

#[test]
fn test_study_deduplication_across_modalities() {
    let backend = FakeBackend {
        patients: vec![FakePatient {
            patient_id: "4711".into(),
            patient_name: "Doe^John".into(),
            birth_date: "19870522".into(),
        }],
        studies: vec![
            FakeStudy {
                patient_id: "4711".into(),
                study_uid: "1.2.1".into(),
                study_date: "20240301".into(),
                study_time: "120000".into(),
                description: "later".into(),
                modalities: vec!["CT".into(), "MR".into()],
            },
            FakeStudy {
                patient_id: "4711".into(),
                study_uid: "1.2.2".into(),
                study_date: "20240101".into(),
                study_time: "120000".into(),
                description: "earlier".into(),
                modalities: vec!["MR".into(), "US".into()],
            },
            FakeStudy {
                patient_id: "4711".into(),
                study_uid: "1.2.3".into(),
                study_date: "20240201".into(),
                study_time: "120000".into(),
                description: "middle".into(),
                modalities: vec!["US".into(), "CT".into()],
            },
        ],
        ..Default::default()
    };
    let factory = FakeFactory::new(backend);
    let node = source_node();
    let mut connector = factory.create_connector(node.as_server().unwrap());

    let spec = TransferSpec {
        modalities: vec!["CT".into(), "MR".into(), "US".into()],
        ..Default::default()
    };
    let studies = resolution::find_studies(&mut *connector, &spec, "4711").unwrap();

    // every overlapping study exactly once, ordered by StudyDate ascending
    let uids: Vec<String> = studies.iter().map(|s| s.study_instance_uid()).collect();
    assert_eq!(uids, vec!["1.2.2", "1.2.3", "1.2.1"]);
}

#[test]
fn test_series_sort_puts_missing_numbers_last() {
    let mut backend = single_study_backend();
    backend.series = vec![
        FakeSeries {
            study_uid: "1.2.840.1.1".into(),
            series_uid: "1.2.840.1.1.9".into(),
            series_number: None,
            modality: "CT".into(),
            description: "scout".into(),
            instances: 1,
        },
        FakeSeries {
            study_uid: "1.2.840.1.1".into(),
            series_uid: "1.2.840.1.1.3".into(),
            series_number: Some(3),
            modality: "CT".into(),
            description: "late".into(),
            instances: 1,
        },
        FakeSeries {
            study_uid: "1.2.840.1.1".into(),
            series_uid: "1.2.840.1.1.1".into(),
            series_number: Some(1),
            modality: "CT".into(),
            description: "native".into(),
            instances: 1,
        },
    ];
    let factory = FakeFactory::new(backend);
    let node = source_node();
    let mut connector = factory.create_connector(node.as_server().unwrap());

    let series = resolution::find_series(
        &mut *connector,
        &TransferSpec::default(),
        "4711",
        "1.2.840.1.1",
    )
    .unwrap();

    let numbers: Vec<Option<i64>> = series.iter().map(|s| s.series_number()).collect();
    assert_eq!(numbers, vec![Some(1), Some(3), None]);
}
