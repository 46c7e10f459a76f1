//! Types exchanged while uploading files.

use serde::{Deserialize, Serialize};

/// How the client intends to move bytes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    /// Time-limited HTTPS links signed by the object store.
    #[default]
    Presigned,
    /// Bare `s3://bucket/key` URI; the client talks to S3 itself.
    S3,
}

/// Links returned to a client starting an upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadLinks {
    /// One URL per part, in part order.
    pub urls: Vec<String>,

    /// Bytes per part (the last part may be smaller).
    pub chunk_size: u64,
}

/// A part reported back by the client once it has been uploaded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based part number.
    pub number: i32,

    /// ETag returned by the object store for this part.
    pub e_tag: String,
}

/// A freshly initiated multipart upload and its presigned part links.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartUploadLinks {
    pub upload_id: String,
    pub chunk_size: u64,
    pub urls: Vec<String>,
}
