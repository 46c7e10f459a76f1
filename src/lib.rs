//! Data storage manager: a catalog of project files kept in SQLite, whose
//! bytes live in an S3 bucket (`simcore.s3`) or in an external dataset
//! service reached through its adapter (`datcore`).

pub mod config;
pub mod constants;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod s3;
pub mod services;
