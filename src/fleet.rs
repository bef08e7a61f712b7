//! Query fleet registry: which index version each query-serving slot has loaded.
//!
//! Each slot keeps its project map behind an `ArcSwap`, so queries read a
//! consistent snapshot without locking and refreshes update slots
//! independently. A slot never moves to an older version than it has.

use crate::error::FleetError;
use crate::model::{FleetSlot, IndexClass};
use crate::{ProjectId, SlotId, Version};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Delivery of load/unload instructions to a query executor.
#[async_trait]
pub trait SlotTransport: Send + Sync + 'static {
    async fn load(
        &self,
        index_class: IndexClass,
        slot_id: SlotId,
        project_id: &str,
        version: Version,
        artifact_location: &str,
    ) -> Result<(), FleetError>;

    async fn unload(
        &self,
        index_class: IndexClass,
        slot_id: SlotId,
        project_id: &str,
    ) -> Result<(), FleetError>;
}

/// Transport for executors that read the registry directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

#[async_trait]
impl SlotTransport for NoopTransport {
    async fn load(
        &self,
        _index_class: IndexClass,
        _slot_id: SlotId,
        _project_id: &str,
        _version: Version,
        _artifact_location: &str,
    ) -> Result<(), FleetError> {
        Ok(())
    }

    async fn unload(
        &self,
        _index_class: IndexClass,
        _slot_id: SlotId,
        _project_id: &str,
    ) -> Result<(), FleetError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedIndex {
    pub version: Version,
    pub artifact_location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub updated: Vec<SlotId>,
    /// Slots already serving this version or a newer one.
    pub skipped: Vec<SlotId>,
    pub failed: Vec<(SlotId, String)>,
}

impl RefreshOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Slot {
    slot_id: SlotId,
    index_class: IndexClass,
    loaded: ArcSwap<HashMap<ProjectId, LoadedIndex>>,
}

impl Slot {
    fn new(slot_id: SlotId, index_class: IndexClass) -> Self {
        Self {
            slot_id,
            index_class,
            loaded: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    fn version_of(&self, project_id: &str) -> Option<Version> {
        self.loaded.load().get(project_id).map(|loaded| loaded.version)
    }

    /// Install `version` unless the slot already holds it or something newer.
    /// Returns whether the slot changed.
    fn install(&self, project_id: &str, version: Version, artifact_location: &str) -> bool {
        let mut changed = false;
        self.loaded.rcu(|current| {
            changed = false;
            if current
                .get(project_id)
                .is_some_and(|loaded| loaded.version >= version)
            {
                return Arc::clone(current);
            }
            changed = true;
            let mut next = HashMap::clone(current);
            next.insert(
                project_id.to_string(),
                LoadedIndex {
                    version,
                    artifact_location: artifact_location.to_string(),
                },
            );
            Arc::new(next)
        });
        changed
    }

    fn remove(&self, project_id: &str) {
        self.loaded.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(project_id);
            next
        });
    }

    fn snapshot(&self) -> FleetSlot {
        let mut loaded: Vec<(ProjectId, Version)> = self
            .loaded
            .load()
            .iter()
            .map(|(project_id, loaded)| (project_id.clone(), loaded.version))
            .collect();
        loaded.sort();
        FleetSlot {
            slot_id: self.slot_id,
            index_class: self.index_class,
            loaded,
        }
    }
}

pub struct FleetRegistry {
    std_slots: Vec<Slot>,
    ia_slots: Vec<Slot>,
    transport: Arc<dyn SlotTransport>,
}

impl std::fmt::Debug for FleetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetRegistry")
            .field("std_slots", &self.std_slots.len())
            .field("ia_slots", &self.ia_slots.len())
            .finish()
    }
}

impl FleetRegistry {
    /// Each class gets at least one slot.
    pub fn new(std_slots: usize, ia_slots: usize, transport: Arc<dyn SlotTransport>) -> Self {
        let build = |class, count: usize| {
            (0..count.max(1))
                .map(|slot_id| Slot::new(slot_id, class))
                .collect::<Vec<_>>()
        };
        Self {
            std_slots: build(IndexClass::Std, std_slots),
            ia_slots: build(IndexClass::Ia, ia_slots),
            transport,
        }
    }

    fn class_slots(&self, index_class: IndexClass) -> &[Slot] {
        match index_class {
            IndexClass::Std => &self.std_slots,
            IndexClass::Ia => &self.ia_slots,
        }
    }

    pub fn slot_count(&self, index_class: IndexClass) -> usize {
        self.class_slots(index_class).len()
    }

    /// Propagate `version` to every slot of the class. Slots succeed or fail
    /// independently; a failed slot keeps its previous version.
    pub async fn refresh(
        &self,
        index_class: IndexClass,
        project_id: &str,
        version: Version,
        artifact_location: &str,
    ) -> RefreshOutcome {
        let attempts = self.class_slots(index_class).iter().map(|slot| async move {
            if slot
                .version_of(project_id)
                .is_some_and(|current| current >= version)
            {
                return (slot.slot_id, Ok(false));
            }
            let result = self
                .transport
                .load(index_class, slot.slot_id, project_id, version, artifact_location)
                .await
                .map(|()| slot.install(project_id, version, artifact_location));
            (slot.slot_id, result)
        });

        let mut outcome = RefreshOutcome::default();
        for (slot_id, result) in join_all(attempts).await {
            match result {
                Ok(true) => outcome.updated.push(slot_id),
                Ok(false) => outcome.skipped.push(slot_id),
                Err(error) => {
                    tracing::warn!(
                        %index_class,
                        slot_id,
                        project_id,
                        version,
                        %error,
                        "slot refresh failed"
                    );
                    outcome.failed.push((slot_id, error.to_string()));
                }
            }
        }

        tracing::info!(
            %index_class,
            project_id,
            version,
            updated = outcome.updated.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "fleet refresh finished"
        );
        outcome
    }

    /// Unload the project from every slot of every class. Returns the number
    /// of slots that dropped it.
    pub async fn evict(&self, project_id: &str) -> Result<usize, FleetError> {
        let holders = self
            .std_slots
            .iter()
            .chain(self.ia_slots.iter())
            .filter(|slot| slot.version_of(project_id).is_some());

        let attempts = holders.map(|slot| async move {
            self.transport
                .unload(slot.index_class, slot.slot_id, project_id)
                .await
                .map(|()| slot.remove(project_id))
        });

        let mut evicted = 0;
        let mut first_error = None;
        for result in join_all(attempts).await {
            match result {
                Ok(()) => evicted += 1,
                Err(error) => {
                    tracing::warn!(project_id, %error, "slot eviction failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                tracing::info!(project_id, evicted, "project evicted from fleet");
                Ok(evicted)
            }
        }
    }

    /// Slot that serves `routing_key` within the class.
    pub fn route(&self, index_class: IndexClass, routing_key: &str) -> SlotId {
        let digest = Sha256::digest(routing_key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.slot_count(index_class) as u64) as SlotId
    }

    pub fn current_version(
        &self,
        index_class: IndexClass,
        slot_id: SlotId,
        project_id: &str,
    ) -> Option<Version> {
        self.class_slots(index_class)
            .get(slot_id)
            .and_then(|slot| slot.version_of(project_id))
    }

    pub fn slots(&self, index_class: IndexClass) -> Vec<FleetSlot> {
        self.class_slots(index_class)
            .iter()
            .map(Slot::snapshot)
            .collect()
    }

    /// Slots of any class that currently hold the project.
    pub fn holders(&self, project_id: &str) -> Vec<(IndexClass, SlotId)> {
        self.std_slots
            .iter()
            .chain(self.ia_slots.iter())
            .filter(|slot| slot.version_of(project_id).is_some())
            .map(|slot| (slot.index_class, slot.slot_id))
            .collect()
    }
}
