pub mod cleaner;
pub mod datcore_adapter;
pub mod datcore_dsm;
pub mod dsm;
pub mod dsm_provider;
pub mod error;
pub mod simcore_s3_dsm;

pub use cleaner::UploadCleaner;
pub use datcore_dsm::DatCoreDataManager;
pub use dsm::{DataManager, Location};
pub use dsm_provider::DataManagerProvider;
pub use error::{StorageError, StorageResult};
pub use simcore_s3_dsm::{DeepCopyReport, Reconciliation, SimcoreS3DataManager};
