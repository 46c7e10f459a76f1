//! Storage-wide constants shared by the managers, the object-store layer and
//! the background cleaner.

use crate::models::LocationId;

pub const SIMCORE_S3_ID: LocationId = 0;
pub const SIMCORE_S3_STR: &str = "simcore.s3";

pub const DATCORE_ID: LocationId = 1;
pub const DATCORE_STR: &str = "datcore";

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Size reported for entries whose size is not known (e.g. pending uploads).
pub const UNDEFINED_SIZE: i64 = -1;

/// Declared sizes at or above this value get multipart upload links.
pub const MULTIPART_UPLOADS_MIN_TOTAL_SIZE: u64 = 100 * MIB;

/// Largest object a single presigned PUT may carry.
pub const MAX_SINGLE_LINK_BYTE_SIZE: u64 = 5 * GIB;

/// Largest object S3 accepts (and therefore the largest upload we plan for).
pub const MAX_OBJECT_BYTE_SIZE: u64 = 5 * TIB;

pub const MULTIPART_MAX_NUMBER_OF_PARTS: u64 = 10_000;

/// Candidate part sizes, smallest first. The first one yielding fewer than
/// `MULTIPART_MAX_NUMBER_OF_PARTS` parts is used.
pub const MULTIPART_PART_SIZE_LADDER: [u64; 12] = [
    10 * MIB,
    50 * MIB,
    100 * MIB,
    200 * MIB,
    400 * MIB,
    600 * MIB,
    800 * MIB,
    GIB,
    2 * GIB,
    3 * GIB,
    4 * GIB,
    5 * GIB,
];

/// Marks rows whose upload is not a multipart upload driven by our presigned
/// links (direct S3 uploads, server-side copies). Never aborted.
pub const S3_UNDEFINED_OR_EXTERNAL_MULTIPART_ID: &str = "UNDEFINED/EXTERNALID";

pub const EXPAND_DIR_MAX_ITEM_COUNT: usize = 1000;

/// Parallel object-store calls issued while expanding directories.
pub const MAX_PARALLEL_S3_CALLS: usize = 10;

/// Parallel calls to the datcore adapter.
pub const MAX_CONCURRENT_REST_CALLS: usize = 10;

/// Parallel copies during a project deep copy.
pub const MAX_CONCURRENT_S3_TASKS: usize = 4;

/// Parallel reconciliation probes in one cleaner pass.
pub const CLEANER_MAX_CONCURRENCY: usize = 2;

/// Rows removed per statement by the metadata synchronisation.
pub const SYNC_PRUNE_CHUNK_SIZE: usize = 20;

pub const DEFAULT_PRESIGNED_LINK_EXPIRATION_SECS: u64 = 3600;

pub const CLEANER_LOCK_NAME: &str = "storage-dsm-cleaner";
