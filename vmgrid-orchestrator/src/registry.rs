use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use vmgrid_common::{InstanceRecord, InstanceState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("instance {0} already registered")]
    DuplicateId(Uuid),

    #[error("instance {0} not found")]
    NotFound(Uuid),

    #[error("instance {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance {id}: field {field} is immutable")]
    ImmutableField { id: Uuid, field: &'static str },

    #[error("instance {0}: ssh_string set without public_ip")]
    SshWithoutAddress(Uuid),
}

#[derive(Default)]
struct Index {
    slots: HashMap<Uuid, Arc<Mutex<InstanceRecord>>>,
    order: Vec<Uuid>,
}

/// Authoritative in-memory store of instance records.
///
/// Mutations on one record are serialized by that record's slot lock, so two
/// writers never interleave on the same id while different ids proceed in
/// parallel. Readers always get a full snapshot of a committed revision.
#[derive(Default)]
pub struct InstanceRegistry {
    index: RwLock<Index>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError> {
        if record.ssh_string.is_some() && record.public_ip.is_none() {
            return Err(RegistryError::SshWithoutAddress(record.id));
        }
        let mut index = self.index.write();
        if index.slots.contains_key(&record.id) {
            return Err(RegistryError::DuplicateId(record.id));
        }
        let id = record.id;
        index.slots.insert(id, Arc::new(Mutex::new(record)));
        index.order.push(id);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<InstanceRecord> {
        let slot = self.slot(id)?;
        let record = slot.lock().clone();
        Some(record)
    }

    /// Snapshots of every record, in creation order.
    pub fn list(&self) -> Vec<InstanceRecord> {
        let index = self.index.read();
        index
            .order
            .iter()
            .filter_map(|id| index.slots.get(id))
            .map(|slot| slot.lock().clone())
            .collect()
    }

    /// Applies `apply` to a working copy and commits it only if the result is
    /// a legal successor of the current record.
    ///
    /// The closure may refuse the change by returning `Ok(None)`, in which case
    /// nothing is written. On commit the revision and `updated_at` are bumped
    /// and the new snapshot is returned.
    pub fn update<F>(&self, id: Uuid, apply: F) -> Result<Option<InstanceRecord>, RegistryError>
    where
        F: FnOnce(&mut InstanceRecord) -> Option<()>,
    {
        let slot = self.slot(id).ok_or(RegistryError::NotFound(id))?;
        let mut current = slot.lock();

        let mut draft = current.clone();
        if apply(&mut draft).is_none() {
            return Ok(None);
        }
        check_successor(&current, &draft)?;

        draft.revision = current.revision + 1;
        draft.updated_at = Utc::now().max(current.updated_at);
        *current = draft;
        Ok(Some(current.clone()))
    }

    pub fn remove(&self, id: Uuid) -> Option<InstanceRecord> {
        let mut index = self.index.write();
        let slot = index.slots.remove(&id)?;
        index.order.retain(|other| *other != id);
        let record = slot.lock().clone();
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.index.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: Uuid) -> Option<Arc<Mutex<InstanceRecord>>> {
        self.index.read().slots.get(&id).cloned()
    }
}

fn check_successor(current: &InstanceRecord, next: &InstanceRecord) -> Result<(), RegistryError> {
    let id = current.id;
    let immutable = [
        ("id", current.id == next.id),
        ("name", current.name == next.name),
        ("ami", current.ami == next.ami),
        ("instance_type", current.instance_type == next.instance_type),
        ("storage_gb", current.storage_gb == next.storage_gb),
        ("backend_used", current.backend_used == next.backend_used),
        ("backend_instance_id", current.backend_instance_id == next.backend_instance_id),
        ("created_at", current.created_at == next.created_at),
    ];
    if let Some((field, _)) = immutable.iter().find(|(_, same)| !same) {
        return Err(RegistryError::ImmutableField { id, field });
    }

    if current.state != next.state && !current.state.can_transition_to(next.state) {
        return Err(RegistryError::IllegalTransition {
            id,
            from: current.state,
            to: next.state,
        });
    }

    if next.ssh_string.is_some() && next.public_ip.is_none() {
        return Err(RegistryError::SshWithoutAddress(id));
    }
    Ok(())
}
