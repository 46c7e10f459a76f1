//! Registry of storage locations.
//!
//! Each location is registered with a factory and built on first use; the
//! constructed manager is cached and shared afterwards.

use crate::{
    constants::SIMCORE_S3_ID,
    models::LocationId,
    services::{
        dsm::Location,
        error::{StorageError, StorageResult},
        simcore_s3_dsm::SimcoreS3DataManager,
    },
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

type LocationFactory = Box<dyn Fn() -> StorageResult<Location> + Send + Sync>;

#[derive(Default)]
pub struct DataManagerProvider {
    factories: HashMap<LocationId, LocationFactory>,
    built: RwLock<HashMap<LocationId, Location>>,
}

impl DataManagerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory of a location.
    pub fn register<F>(&mut self, location_id: LocationId, factory: F)
    where
        F: Fn() -> StorageResult<Location> + Send + Sync + 'static,
    {
        self.factories.insert(location_id, Box::new(factory));
        self.built.get_mut().remove(&location_id);
    }

    /// Register an already constructed location.
    pub fn register_location(&mut self, location: Location) {
        let location_id = location.location_id();
        self.register(location_id, move || Ok(location.clone()));
    }

    pub async fn get(&self, location_id: LocationId) -> StorageResult<Location> {
        if let Some(location) = self.built.read().await.get(&location_id) {
            return Ok(location.clone());
        }

        let factory = self
            .factories
            .get(&location_id)
            .ok_or(StorageError::LocationNotFound(location_id))?;
        let mut built = self.built.write().await;
        if let Some(location) = built.get(&location_id) {
            return Ok(location.clone());
        }
        let location = factory()?;
        debug!(location_id, name = location.location_name(), "location constructed");
        built.insert(location_id, location.clone());
        Ok(location)
    }

    /// Registered location ids, ascending.
    pub fn locations(&self) -> Vec<LocationId> {
        let mut ids: Vec<LocationId> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn simcore(&self) -> StorageResult<Arc<SimcoreS3DataManager>> {
        self.get(SIMCORE_S3_ID).await?.as_simcore().cloned()
    }
}
