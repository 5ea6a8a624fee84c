//! Shared test helpers: an in-memory DIMSE peer and worker wiring
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dimse::{
    Capabilities, DimseConnector, DimseError, LogEntry, Modifier, QueryDataset, ResultDataset,
    ServerNode, StoreSink,
};

use convoy::models::{DicomJob, DicomNode, JobKind};
use convoy::notify::JobNotifier;
use convoy::processors::{ConnectorFactory, ProcessorRegistry, QueryProcessor, TransferProcessor};
use convoy::store::Store;
use convoy::worker::{DicomWorker, DispatchLock, WorkerOptions};

pub fn str_element(tag: dicom_core::Tag, vr: VR, value: &str) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

#[derive(Debug, Clone)]
pub struct FakePatient {
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: String,
}

#[derive(Debug, Clone)]
pub struct FakeStudy {
    pub patient_id: String,
    pub study_uid: String,
    pub study_date: String,
    pub study_time: String,
    pub description: String,
    pub modalities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FakeSeries {
    pub study_uid: String,
    pub series_uid: String,
    pub series_number: Option<i64>,
    pub modality: String,
    pub description: String,
    pub instances: usize,
}

/// Scriptable in-memory stand-in for a PACS
#[derive(Default)]
pub struct FakeBackend {
    pub patients: Vec<FakePatient>,
    pub studies: Vec<FakeStudy>,
    pub series: Vec<FakeSeries>,
    /// SOP instance UIDs the peer rejects during C-STORE
    pub store_failures: HashSet<String>,
    /// SOP instance UIDs the peer acknowledges with a warning status
    pub store_warnings: HashSet<String>,
    /// Instance UIDs received via C-STORE, in arrival order
    pub stored: Vec<String>,
    /// (study/series uid, destination AET) pairs of C-MOVE requests
    pub move_requests: Vec<(String, String)>,
}

impl FakeBackend {
    pub fn instances_of(&self, series: &FakeSeries, patient_id: &str) -> Vec<InMemDicomObject> {
        (0..series.instances)
            .map(|index| {
                let mut obj = InMemDicomObject::new_empty();
                obj.put(str_element(
                    tags::SOP_CLASS_UID,
                    VR::UI,
                    uids::CT_IMAGE_STORAGE,
                ));
                obj.put(str_element(
                    tags::SOP_INSTANCE_UID,
                    VR::UI,
                    &format!("{}.{}", series.series_uid, index + 1),
                ));
                obj.put(str_element(tags::PATIENT_ID, VR::LO, patient_id));
                obj.put(str_element(tags::PATIENT_NAME, VR::PN, "Doe^John"));
                obj.put(str_element(tags::PATIENT_BIRTH_DATE, VR::DA, "19870522"));
                obj.put(str_element(
                    tags::REFERRING_PHYSICIAN_NAME,
                    VR::PN,
                    "Dr^House",
                ));
                obj.put(str_element(
                    tags::STUDY_INSTANCE_UID,
                    VR::UI,
                    &series.study_uid,
                ));
                obj.put(str_element(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    &series.series_uid,
                ));
                obj.put(str_element(tags::MODALITY, VR::CS, &series.modality));
                obj
            })
            .collect()
    }
}

fn patient_dataset(patient: &FakePatient) -> ResultDataset {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(tags::PATIENT_ID, VR::LO, &patient.patient_id));
    obj.put(str_element(tags::PATIENT_NAME, VR::PN, &patient.patient_name));
    obj.put(str_element(
        tags::PATIENT_BIRTH_DATE,
        VR::DA,
        &patient.birth_date,
    ));
    ResultDataset::new(obj)
}

fn study_dataset(study: &FakeStudy) -> ResultDataset {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(tags::PATIENT_ID, VR::LO, &study.patient_id));
    obj.put(str_element(tags::PATIENT_NAME, VR::PN, "Doe^John"));
    obj.put(str_element(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        &study.study_uid,
    ));
    obj.put(str_element(tags::STUDY_DATE, VR::DA, &study.study_date));
    obj.put(str_element(tags::STUDY_TIME, VR::TM, &study.study_time));
    obj.put(str_element(
        tags::STUDY_DESCRIPTION,
        VR::LO,
        &study.description,
    ));
    obj.put(DataElement::new(
        tags::MODALITIES_IN_STUDY,
        VR::CS,
        PrimitiveValue::Strs(study.modalities.clone().into()),
    ));
    ResultDataset::new(obj)
}

fn series_dataset(series: &FakeSeries, patient_id: &str) -> ResultDataset {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(str_element(tags::PATIENT_ID, VR::LO, patient_id));
    obj.put(str_element(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        &series.study_uid,
    ));
    obj.put(str_element(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        &series.series_uid,
    ));
    if let Some(number) = series.series_number {
        obj.put(str_element(
            tags::SERIES_NUMBER,
            VR::IS,
            &number.to_string(),
        ));
    }
    obj.put(str_element(tags::MODALITY, VR::CS, &series.modality));
    obj.put(str_element(
        tags::SERIES_DESCRIPTION,
        VR::LO,
        &series.description,
    ));
    ResultDataset::new(obj)
}

/// Connector factory handing out connectors backed by one shared
/// [`FakeBackend`]. `fail_next_ops` makes the next N operations fail with a
/// retriable association error.
pub struct FakeFactory {
    pub backend: Arc<Mutex<FakeBackend>>,
    failing_ops: Arc<AtomicUsize>,
}

impl FakeFactory {
    pub fn new(backend: FakeBackend) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(Mutex::new(backend)),
            failing_ops: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn fail_next_ops(&self, count: usize) {
        self.failing_ops.store(count, Ordering::SeqCst);
    }
}

impl ConnectorFactory for FakeFactory {
    fn create_connector(&self, node: &ServerNode) -> Box<dyn DimseConnector> {
        Box::new(FakeConnector {
            node: node.clone(),
            backend: self.backend.clone(),
            failing_ops: self.failing_ops.clone(),
            logs: Vec::new(),
        })
    }
}

pub struct FakeConnector {
    node: ServerNode,
    backend: Arc<Mutex<FakeBackend>>,
    failing_ops: Arc<AtomicUsize>,
    logs: Vec<LogEntry>,
}

impl FakeConnector {
    fn check_failure(&self) -> dimse::Result<()> {
        let remaining = self.failing_ops.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_ops.store(remaining - 1, Ordering::SeqCst);
            return Err(DimseError::Association {
                peer: self.node.to_string(),
                message: "Connection refused".into(),
            });
        }
        Ok(())
    }
}

impl DimseConnector for FakeConnector {
    fn node(&self) -> &ServerNode {
        &self.node
    }

    fn find_patients(
        &mut self,
        query: QueryDataset,
        _limit: Option<usize>,
    ) -> dimse::Result<Vec<ResultDataset>> {
        self.check_failure()?;
        let backend = self.backend.lock().unwrap();

        let patient_id = query.get(tags::PATIENT_ID);
        let patient_name = query.get(tags::PATIENT_NAME);
        let birth_date = query.get(tags::PATIENT_BIRTH_DATE);

        Ok(backend
            .patients
            .iter()
            .filter(|p| match &patient_id {
                Some(id) => p.patient_id == *id,
                None => {
                    patient_name.as_deref() == Some(p.patient_name.as_str())
                        && birth_date.as_deref() == Some(p.birth_date.as_str())
                }
            })
            .map(patient_dataset)
            .collect())
    }

    fn find_studies(
        &mut self,
        query: QueryDataset,
        _limit: Option<usize>,
    ) -> dimse::Result<Vec<ResultDataset>> {
        self.check_failure()?;
        let backend = self.backend.lock().unwrap();

        let patient_id = query.get(tags::PATIENT_ID);
        let study_uid = query.get(tags::STUDY_INSTANCE_UID);
        let modality = query.get(tags::MODALITIES_IN_STUDY);

        Ok(backend
            .studies
            .iter()
            .filter(|s| match &study_uid {
                Some(uid) => s.study_uid == *uid,
                None => true,
            })
            .filter(|s| match &patient_id {
                Some(id) => s.patient_id == *id,
                None => true,
            })
            .filter(|s| match &modality {
                Some(m) => s.modalities.iter().any(|sm| sm == m),
                None => true,
            })
            .map(study_dataset)
            .collect())
    }

    fn find_series(
        &mut self,
        query: QueryDataset,
        _limit: Option<usize>,
    ) -> dimse::Result<Vec<ResultDataset>> {
        self.check_failure()?;
        let backend = self.backend.lock().unwrap();

        let study_uid = query
            .get(tags::STUDY_INSTANCE_UID)
            .ok_or_else(|| DimseError::InvalidQuery("StudyInstanceUID required".into()))?;
        let series_number = query
            .get(tags::SERIES_NUMBER)
            .and_then(|v| v.parse::<i64>().ok());
        let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();

        Ok(backend
            .series
            .iter()
            .filter(|s| s.study_uid == study_uid)
            .filter(|s| match series_number {
                Some(number) => s.series_number == Some(number),
                None => true,
            })
            .map(|s| series_dataset(s, &patient_id))
            .collect())
    }

    fn get_study(&mut self, query: QueryDataset, sink: StoreSink) -> dimse::Result<()> {
        self.check_failure()?;
        let instances = {
            let backend = self.backend.lock().unwrap();
            let study_uid = query.get(tags::STUDY_INSTANCE_UID).unwrap_or_default();
            let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();
            backend
                .series
                .iter()
                .filter(|s| s.study_uid == study_uid)
                .flat_map(|s| backend.instances_of(s, &patient_id))
                .collect::<Vec<_>>()
        };
        for obj in instances {
            sink(obj)?;
        }
        Ok(())
    }

    fn get_series(&mut self, query: QueryDataset, sink: StoreSink) -> dimse::Result<()> {
        self.check_failure()?;
        let instances = {
            let backend = self.backend.lock().unwrap();
            let series_uid = query.get(tags::SERIES_INSTANCE_UID).unwrap_or_default();
            let patient_id = query.get(tags::PATIENT_ID).unwrap_or_default();
            backend
                .series
                .iter()
                .filter(|s| s.series_uid == series_uid)
                .flat_map(|s| backend.instances_of(s, &patient_id))
                .collect::<Vec<_>>()
        };
        for obj in instances {
            sink(obj)?;
        }
        Ok(())
    }

    fn move_study(&mut self, query: QueryDataset, destination_aet: &str) -> dimse::Result<()> {
        self.check_failure()?;
        let mut backend = self.backend.lock().unwrap();
        let study_uid = query.get(tags::STUDY_INSTANCE_UID).unwrap_or_default();
        backend
            .move_requests
            .push((study_uid, destination_aet.to_string()));
        Ok(())
    }

    fn move_series(&mut self, query: QueryDataset, destination_aet: &str) -> dimse::Result<()> {
        self.check_failure()?;
        let mut backend = self.backend.lock().unwrap();
        let series_uid = query.get(tags::SERIES_INSTANCE_UID).unwrap_or_default();
        backend
            .move_requests
            .push((series_uid, destination_aet.to_string()));
        Ok(())
    }

    fn store(
        &mut self,
        datasets: Vec<InMemDicomObject>,
        modifier: Option<Modifier>,
    ) -> dimse::Result<()> {
        self.check_failure()?;

        // same accounting policy as the production client: every instance
        // is attempted, failures raise afterwards
        let mut failures = 0usize;
        for mut obj in datasets {
            if let Some(modify) = modifier {
                modify(&mut obj);
            }
            let uid = obj
                .get(tags::SOP_INSTANCE_UID)
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches('\0').trim().to_string())
                .unwrap_or_default();

            let mut backend = self.backend.lock().unwrap();
            if backend.store_failures.contains(&uid) {
                failures += 1;
                continue;
            }
            if backend.store_warnings.contains(&uid) {
                self.logs.push(LogEntry::warning(
                    "C-STORE warning",
                    format!("Warning during C-STORE of {}.", uid),
                ));
            }
            backend.stored.push(uid);
        }

        if failures > 0 {
            return Err(DimseError::StoreFailed { failures });
        }
        Ok(())
    }

    fn store_folder(&mut self, folder: &Path, modifier: Option<Modifier>) -> dimse::Result<()> {
        let mut datasets = Vec::new();
        for entry in walkdir::WalkDir::new(folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let obj = dicom_object::open_file(entry.path())
                .map_err(|e| DimseError::Storage(e.to_string()))?;
            datasets.push(obj.into_inner());
        }
        self.store(datasets, modifier)
    }

    fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs)
    }
}

/// Notifier counting its invocations
#[derive(Default)]
pub struct CountingNotifier {
    pub notified: AtomicUsize,
}

impl JobNotifier for CountingNotifier {
    fn notify_job_finished(&self, _job: &DicomJob) {
        self.notified.fetch_add(1, Ordering::SeqCst);
    }
}

/// A source server with full Query/Retrieve support
pub fn source_node() -> DicomNode {
    DicomNode::server(ServerNode::new("PACS", "localhost", 11112).with_capabilities(Capabilities::all()))
}

/// A destination server with storage support
pub fn destination_node() -> DicomNode {
    DicomNode::server(ServerNode::new("ARCHIVE", "localhost", 11113).with_capabilities(Capabilities::all()))
}

/// A backend with one patient owning one study of three series
pub fn single_study_backend() -> FakeBackend {
    FakeBackend {
        patients: vec![FakePatient {
            patient_id: "4711".into(),
            patient_name: "Doe^John".into(),
            birth_date: "19870522".into(),
        }],
        studies: vec![FakeStudy {
            patient_id: "4711".into(),
            study_uid: "1.2.840.1.1".into(),
            study_date: "20240117".into(),
            study_time: "134500".into(),
            description: "CT Thorax".into(),
            modalities: vec!["CT".into(), "SR".into()],
        }],
        series: vec![
            FakeSeries {
                study_uid: "1.2.840.1.1".into(),
                series_uid: "1.2.840.1.1.1".into(),
                series_number: Some(1),
                modality: "CT".into(),
                description: "native".into(),
                instances: 2,
            },
            FakeSeries {
                study_uid: "1.2.840.1.1".into(),
                series_uid: "1.2.840.1.1.2".into(),
                series_number: Some(2),
                modality: "CT".into(),
                description: "contrast".into(),
                instances: 2,
            },
            FakeSeries {
                study_uid: "1.2.840.1.1".into(),
                series_uid: "1.2.840.1.1.3".into(),
                series_number: Some(3),
                modality: "SR".into(),
                description: "report".into(),
                instances: 1,
            },
        ],
        ..Default::default()
    }
}

/// Wire a worker with the fake connector factory and default options
pub fn test_worker(
    store: Arc<Store>,
    factory: Arc<FakeFactory>,
    notifier: Arc<CountingNotifier>,
    options: WorkerOptions,
) -> DicomWorker {
    let mut registry = ProcessorRegistry::new();
    for kind in [JobKind::Selective, JobKind::Batch, JobKind::Continuous] {
        let factory = factory.clone();
        registry.register(
            kind,
            Box::new(move |_job, _task| {
                Ok(Box::new(TransferProcessor::new(factory.clone(), vec![])))
            }),
        );
    }
    {
        let factory = factory.clone();
        registry.register(
            JobKind::Query,
            Box::new(move |_job, _task| Ok(Box::new(QueryProcessor::new(factory.clone())))),
        );
    }

    DicomWorker::new(
        store,
        Arc::new(registry),
        notifier,
        Arc::new(DispatchLock::new()),
        options,
        Arc::new(AtomicBool::new(false)),
    )
}
