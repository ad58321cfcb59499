//! Address resolution to registered language adapters.
//!
//! The address space is the only place that maps a language id to an
//! adapter instance. Resolution never suspends: it is a read-locked map
//! lookup that hands out a lease on the adapter.

use crate::error::{CoreError, Result};
use crate::language::Language;
use ad4m_types::Address;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct Slot {
    adapter: Arc<dyn Language>,
    generation: u64,
    in_flight: Arc<AtomicUsize>,
}

/// Registry of language adapters keyed by language id.
pub struct AddressSpace {
    slots: RwLock<HashMap<String, Slot>>,
    generation: AtomicU64,
}

/// Marks one in-flight use of an adapter instance.
struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A resolved adapter together with the lease that keeps it registered.
///
/// While any `ResolvedLanguage` for an instance is alive, that instance
/// cannot be replaced.
pub struct ResolvedLanguage {
    language_id: String,
    generation: u64,
    adapter: Arc<dyn Language>,
    _lease: Lease,
}

impl ResolvedLanguage {
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn adapter(&self) -> &Arc<dyn Language> {
        &self.adapter
    }

    /// Whether both handles point at the same adapter instance
    pub fn same_instance(&self, other: &Arc<dyn Language>) -> bool {
        Arc::ptr_eq(&self.adapter, other)
    }
}

impl Deref for ResolvedLanguage {
    type Target = dyn Language;

    fn deref(&self) -> &Self::Target {
        self.adapter.as_ref()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Register an adapter under `language_id`.
    ///
    /// Registering the instance already present is a no-op. A different
    /// instance replaces the old one only if nothing holds a lease on it.
    /// Returns the generation of the registered slot.
    pub fn register(&self, language_id: impl Into<String>, adapter: Arc<dyn Language>) -> Result<u64> {
        let language_id = language_id.into();
        let mut slots = self.slots.write();

        if let Some(slot) = slots.get(&language_id) {
            if Arc::ptr_eq(&slot.adapter, &adapter) {
                return Ok(slot.generation);
            }
            if slot.in_flight.load(Ordering::Acquire) > 0 {
                return Err(CoreError::AdapterBusy(language_id));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replaced = slots
            .insert(
                language_id.clone(),
                Slot {
                    adapter,
                    generation,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                },
            )
            .is_some();

        info!(language = %language_id, generation, replaced, "language registered");
        Ok(generation)
    }

    /// Remove an adapter. Refused while leases are outstanding.
    pub fn unregister(&self, language_id: &str) -> Result<bool> {
        let mut slots = self.slots.write();
        match slots.get(language_id) {
            None => Ok(false),
            Some(slot) if slot.in_flight.load(Ordering::Acquire) > 0 => {
                Err(CoreError::AdapterBusy(language_id.to_string()))
            }
            Some(_) => {
                slots.remove(language_id);
                debug!(language = %language_id, "language unregistered");
                Ok(true)
            }
        }
    }

    /// Resolve the adapter owning `address`.
    pub fn resolve(&self, address: &Address) -> Result<ResolvedLanguage> {
        self.resolve_language(address.language())
    }

    pub fn resolve_language(&self, language_id: &str) -> Result<ResolvedLanguage> {
        let slots = self.slots.read();
        let slot = slots
            .get(language_id)
            .ok_or_else(|| CoreError::AdapterNotFound(language_id.to_string()))?;

        // Taken under the read lock so `register` observes it.
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(ResolvedLanguage {
            language_id: language_id.to_string(),
            generation: slot.generation,
            adapter: slot.adapter.clone(),
            _lease: Lease(slot.in_flight.clone()),
        })
    }

    pub fn contains(&self, language_id: &str) -> bool {
        self.slots.read().contains_key(language_id)
    }

    pub fn generation(&self, language_id: &str) -> Option<u64> {
        self.slots.read().get(language_id).map(|slot| slot.generation)
    }

    pub fn in_flight(&self, language_id: &str) -> usize {
        self.slots
            .read()
            .get(language_id)
            .map_or(0, |slot| slot.in_flight.load(Ordering::Acquire))
    }

    /// Registered ids, sorted.
    pub fn language_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn adapters(&self) -> Vec<(String, Arc<dyn Language>)> {
        let mut adapters: Vec<_> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.adapter.clone()))
            .collect();
        adapters.sort_by(|a, b| a.0.cmp(&b.0));
        adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{AddressScheme, ContentLanguage};

    fn language(id: &str) -> Arc<dyn Language> {
        Arc::new(ContentLanguage::new(id, AddressScheme::Hash))
    }

    #[test]
    fn test_resolve_registered_and_missing() {
        let space = AddressSpace::new();
        let l1 = language("L1");
        let l2 = language("L2");
        space.register("L1", l1.clone()).unwrap();
        space.register("L2", l2.clone()).unwrap();

        let resolved = space.resolve(&Address::parse("L1:xyz").unwrap()).unwrap();
        assert!(resolved.same_instance(&l1));
        assert!(!resolved.same_instance(&l2));

        let missing = space.resolve(&Address::parse("L3:xyz").unwrap());
        assert!(matches!(missing, Err(CoreError::AdapterNotFound(id)) if id == "L3"));
    }

    #[test]
    fn test_register_same_instance_is_noop() {
        let space = AddressSpace::new();
        let l1 = language("L1");
        let first = space.register("L1", l1.clone()).unwrap();
        let second = space.register("L1", l1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_replace_bumps_generation() {
        let space = AddressSpace::new();
        let first = space.register("L1", language("L1")).unwrap();
        let second = space.register("L1", language("L1")).unwrap();
        assert!(second > first);
        assert_eq!(space.generation("L1"), Some(second));
    }

    #[test]
    fn test_replace_refused_while_leased() {
        let space = AddressSpace::new();
        space.register("L1", language("L1")).unwrap();

        let lease = space.resolve_language("L1").unwrap();
        assert_eq!(space.in_flight("L1"), 1);
        assert!(matches!(
            space.register("L1", language("L1")),
            Err(CoreError::AdapterBusy(_))
        ));
        assert!(matches!(space.unregister("L1"), Err(CoreError::AdapterBusy(_))));

        drop(lease);
        assert_eq!(space.in_flight("L1"), 0);
        assert!(space.register("L1", language("L1")).is_ok());
        assert!(space.unregister("L1").unwrap());
        assert!(!space.contains("L1"));
    }
}
