//! Type-keyed service locator.
//!
//! Services look each other up here instead of through process-wide
//! statics. Each type is registered at most once; entries live as long as
//! the host.

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::RegistrationError;

struct ServiceEntry {
    type_name: &'static str,
    // Always an `Arc<T>` for the `T` whose `TypeId` keys the entry.
    instance: Box<dyn Any + Send + Sync>,
}

/// Registry of shared service instances keyed by type.
///
/// `T` may be unsized, so a service can be registered and looked up
/// through a trait object (`Arc<dyn Catalog>`).
#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<TypeId, ServiceEntry>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single instance of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateService`] if `T` is already
    /// registered; the existing instance is kept.
    pub fn register_single<T>(&self, instance: Arc<T>) -> Result<(), RegistrationError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match self.entries.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(RegistrationError::DuplicateService {
                type_name: type_name::<T>(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ServiceEntry {
                    type_name: type_name::<T>(),
                    instance: Box::new(instance),
                });
                tracing::debug!(service = type_name::<T>(), "service registered");
                Ok(())
            }
        }
    }

    /// Returns the instance registered for `T`, if any.
    #[must_use]
    pub fn lookup<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.instance.downcast_ref::<Arc<T>>().cloned())
    }

    /// Returns `true` if `T` is registered.
    #[must_use]
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Type names of every registered service, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.iter().map(|e| e.type_name).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.type_names())
            .finish()
    }
}
