//! Ref-counted flyweights for (tenant, namespace) pairs.
//!
//! Many subscriptions share the same tenant and namespace; storing an
//! `Arc` per subscription dedups the bytes. The factory is shared across
//! workers, so lookups take an interior lock while the handles themselves
//! are plain atomically refcounted pointers.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use conveyor_core::{NamespaceID, TenantID};
use parking_lot::Mutex;

/// The interned value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantAndNamespace {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
}

/// A cheap handle to an interned (tenant, namespace) pair.
#[derive(Debug, Clone)]
pub struct Flyweight(Arc<TenantAndNamespace>);

impl std::ops::Deref for Flyweight {
    type Target = TenantAndNamespace;

    fn deref(&self) -> &TenantAndNamespace {
        &self.0
    }
}

struct FactoryInner {
    map: AHashMap<TenantAndNamespace, Weak<TenantAndNamespace>>,
    /// Purge dead entries when the map grows past this.
    purge_at: usize,
}

/// Interning factory, cloneable and shared between workers.
#[derive(Clone)]
pub struct FlyweightFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl FlyweightFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FactoryInner {
                map: AHashMap::new(),
                purge_at: 64,
            })),
        }
    }

    /// Intern a pair, reusing a live handle when one exists.
    pub fn get(&self, tenant_id: TenantID, namespace_id: NamespaceID) -> Flyweight {
        let key = TenantAndNamespace {
            tenant_id,
            namespace_id,
        };
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.map.get(&key).and_then(Weak::upgrade) {
            return Flyweight(existing);
        }
        let value = Arc::new(key.clone());
        inner.map.insert(key, Arc::downgrade(&value));
        if inner.map.len() > inner.purge_at {
            inner.map.retain(|_, weak| weak.strong_count() > 0);
            inner.purge_at = (inner.map.len() * 2).max(64);
        }
        Flyweight(value)
    }

    #[cfg(test)]
    fn interned_len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

impl Default for FlyweightFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_dedups_live_handles() {
        let factory = FlyweightFactory::new();
        let a = factory.get(1, Bytes::from_static(b"ns"));
        let b = factory.get(1, Bytes::from_static(b"ns"));
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a.tenant_id, 1);
        assert_eq!(&a.namespace_id[..], b"ns");
    }

    #[test]
    fn test_distinct_tenants_do_not_alias() {
        let factory = FlyweightFactory::new();
        let a = factory.get(1, Bytes::from_static(b"ns"));
        let b = factory.get(2, Bytes::from_static(b"ns"));
        assert!(!Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_dead_entries_get_purged() {
        let factory = FlyweightFactory::new();
        for i in 0..200u16 {
            let ns = Bytes::from(format!("ns-{}", i));
            drop(factory.get(i, ns));
        }
        // All handles are dead; the purge keeps the map from growing
        // without bound.
        assert!(factory.interned_len() < 200);
    }
}
