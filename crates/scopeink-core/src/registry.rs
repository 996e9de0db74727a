//! Project registry.
//!
//! Hands out one `ShapeStore` per project. A store is built when the user
//! enters a project and torn down when they leave it; nothing is global.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::ids::ProjectId;
use crate::shape_store::{Backends, LocalUser, ShapeStore};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

pub struct ProjectRegistry {
    user: LocalUser,
    backends: Backends,
    config: SyncConfig,
    stores: BTreeMap<ProjectId, ShapeStore>,
}

impl ProjectRegistry {
    pub fn new(user: LocalUser, backends: Backends, config: SyncConfig) -> Self {
        Self {
            user,
            backends,
            config,
            stores: BTreeMap::new(),
        }
    }

    /// The store for `project`, opening it if needed.
    ///
    /// Opening loads the persisted offline queue and subscribes to the
    /// project's collections.
    pub fn open(&mut self, project: &ProjectId) -> SyncResult<&mut ShapeStore> {
        match self.stores.entry(project.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let store = ShapeStore::open(
                    project.clone(),
                    self.user.clone(),
                    self.backends.clone(),
                    self.config.clone(),
                )?;
                log::info!("Opened project {}", project);
                Ok(entry.insert(store))
            }
        }
    }

    /// Leave a project: release locks, withdraw presence, unsubscribe and
    /// flush the offline queue. Returns false if it was not open.
    pub fn close(&mut self, project: &ProjectId) -> SyncResult<bool> {
        let Some(mut store) = self.stores.remove(project) else {
            return Ok(false);
        };
        store.close()?;
        log::info!("Closed project {}", project);
        Ok(true)
    }

    /// Close every open project. The first error is returned after all
    /// projects have been closed.
    pub fn close_all(&mut self) -> SyncResult<()> {
        let mut first_error = None;
        let projects: Vec<ProjectId> = self.stores.keys().cloned().collect();
        for project in projects {
            if let Err(e) = self.close(&project) {
                log::error!("Failed to close project {}: {}", project, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn get(&self, project: &ProjectId) -> Option<&ShapeStore> {
        self.stores.get(project)
    }

    pub fn get_mut(&mut self, project: &ProjectId) -> Option<&mut ShapeStore> {
        self.stores.get_mut(project)
    }

    pub fn is_open(&self, project: &ProjectId) -> bool {
        self.stores.contains_key(project)
    }

    pub fn open_projects(&self) -> impl Iterator<Item = &ProjectId> {
        self.stores.keys()
    }

    /// Drive background work of every open store.
    pub fn poll(&mut self) {
        for store in self.stores.values_mut() {
            store.poll();
        }
    }
}
