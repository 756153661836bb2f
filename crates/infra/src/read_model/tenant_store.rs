use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use factorops_core::TenantId;

/// Key/value rows partitioned by tenant. A read never crosses partitions.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;

    fn upsert(&self, tenant_id: TenantId, key: K, value: V);

    /// Edit a row in place. Returns false when the row does not exist.
    fn modify(&self, tenant_id: TenantId, key: &K, edit: &mut dyn FnMut(&mut V)) -> bool;

    fn list(&self, tenant_id: TenantId) -> Vec<V>;

    fn clear_tenant(&self, tenant_id: TenantId);
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        (**self).get(tenant_id, key)
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        (**self).upsert(tenant_id, key, value)
    }

    fn modify(&self, tenant_id: TenantId, key: &K, edit: &mut dyn FnMut(&mut V)) -> bool {
        (**self).modify(tenant_id, key, edit)
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        (**self).list(tenant_id)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        (**self).clear_tenant(tenant_id)
    }
}

/// One hash map per tenant; clearing a tenant drops its whole partition.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    partitions: RwLock<HashMap<TenantId, HashMap<K, V>>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        let partitions = self.partitions.read().ok()?;
        partitions.get(&tenant_id)?.get(key).cloned()
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions.entry(tenant_id).or_default().insert(key, value);
        }
    }

    fn modify(&self, tenant_id: TenantId, key: &K, edit: &mut dyn FnMut(&mut V)) -> bool {
        let Ok(mut partitions) = self.partitions.write() else {
            return false;
        };
        match partitions.get_mut(&tenant_id).and_then(|p| p.get_mut(key)) {
            Some(row) => {
                edit(row);
                true
            }
            None => false,
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        self.partitions
            .read()
            .ok()
            .and_then(|partitions| partitions.get(&tenant_id).map(|p| p.values().cloned().collect()))
            .unwrap_or_default()
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions.remove(&tenant_id);
        }
    }
}
