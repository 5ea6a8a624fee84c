//! DIMSE protocol connector for DICOM Query/Retrieve and Storage services
//!
//! This crate implements the SCU side of C-FIND, C-GET, C-MOVE and C-STORE
//! over the DICOM upper layer protocol. One connector instance is bound to
//! one remote server; every operation owns its association for its whole
//! lifetime and never shares it across threads.

pub mod association;
pub mod commands;
pub mod config;
pub mod connector;
pub mod dataset;
pub mod error;

pub use association::DimseService;
pub use commands::{StatusCategory, SubOperations, STORAGE_SOP_CLASSES};
pub use config::{Capabilities, ConnectorConfig, ServerNode};
pub use connector::{DimseClient, DimseConnector, Modifier, StoreSink};
pub use dataset::{
    DateRange, LogEntry, LogLevel, QueryDataset, QueryLevel, ResultDataset,
};
pub use error::{DimseError, Result};

/// Well known port for DICOM communication
pub const DEFAULT_DIMSE_PORT: u16 = 104;
