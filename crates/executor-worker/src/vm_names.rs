// Names of environments currently owned by a job. Shared between the job
// handlers, which add and remove names, and the janitor, which only reads.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// A lock-protected set of in-use environment names.
#[derive(Debug, Default)]
pub struct VmNameSet {
    names: RwLock<HashSet<String>>,
}

impl VmNameSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str) {
        self.names.write().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.names.write().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Add `name` and return a guard that removes it again when dropped.
    pub fn reserve(self: &Arc<Self>, name: String) -> VmNameReservation {
        self.add(&name);
        VmNameReservation {
            set: Arc::clone(self),
            name,
        }
    }
}

/// Holds an environment name in a [`VmNameSet`] for as long as it lives.
#[derive(Debug)]
pub struct VmNameReservation {
    set: Arc<VmNameSet>,
    name: String,
}

impl VmNameReservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VmNameReservation {
    fn drop(&mut self) {
        self.set.remove(&self.name);
    }
}

/// A fresh environment name: `<prefix>-<uuid>`.
pub fn new_vm_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
