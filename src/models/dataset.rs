use serde::{Deserialize, Serialize};

/// A dataset as seen by a location: a project for simcore.s3, a remote
/// dataset for the external backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatasetMetaData {
    pub dataset_id: String,
    pub display_name: String,
}
