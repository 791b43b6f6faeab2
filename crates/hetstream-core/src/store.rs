//! Typed, token-addressed storage for stage results.
//!
//! Tokens are issued at pipeline-configuration time by a
//! [`TokenRegistry`]; each registered slot gets a matched
//! [`PutToken`]/[`GetToken`] pair carrying the slot's type. The
//! [`ResultStore`] then holds at most one value per slot for the current
//! unit of work.

use std::any::Any;
use std::marker::PhantomData;

use crate::error::{HetstreamError, Result};

/// Write capability for one store slot, typed by the stored value.
pub struct PutToken<T> {
    index: usize,
    _marker: PhantomData<fn(T)>,
}

/// Read capability for one store slot, typed by the stored value.
pub struct GetToken<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PutToken<T> {
    /// Slot index this token addresses.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> GetToken<T> {
    /// Slot index this token addresses.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

// Manual Clone/Copy impls: a derive would needlessly bound T.
impl<T> Clone for PutToken<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PutToken<T> {}

impl<T> Clone for GetToken<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GetToken<T> {}

impl<T> std::fmt::Debug for PutToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PutToken").field(&self.index).finish()
    }
}

impl<T> std::fmt::Debug for GetToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GetToken").field(&self.index).finish()
    }
}

/// Issues matched put/get token pairs at pipeline-configuration time.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    next: usize,
}

impl TokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot of type `T`, returning its token pair.
    pub fn register<T>(&mut self) -> (PutToken<T>, GetToken<T>) {
        let index = self.next;
        self.next += 1;
        (
            PutToken {
                index,
                _marker: PhantomData,
            },
            GetToken {
                index,
                _marker: PhantomData,
            },
        )
    }

    /// Number of slots registered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.next
    }

    /// True when no slots have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}

/// Slot-per-token storage for the results of one unit of work.
///
/// Each slot is written at most once (by the producing stage) and read
/// any number of times afterwards.
pub struct ResultStore {
    slots: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl ResultStore {
    /// Creates a store with one empty slot per token `registry` issued.
    #[must_use]
    pub fn new(registry: &TokenRegistry) -> Self {
        Self {
            slots: (0..registry.len()).map(|_| None).collect(),
        }
    }

    /// Publishes `value` into the slot addressed by `token`.
    pub fn put<T: Send + Sync + 'static>(&mut self, token: PutToken<T>, value: T) -> Result<()> {
        let index = token.index();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(HetstreamError::InvalidState {
                expected: format!("store sized for slot {index}"),
                actual: "token from a different registry".to_string(),
            })?;
        if slot.is_some() {
            return Err(HetstreamError::SlotOccupied { index });
        }
        *slot = Some(Box::new(value));
        Ok(())
    }

    /// Reads the value published under `token`.
    pub fn get<T: Send + Sync + 'static>(&self, token: GetToken<T>) -> Result<&T> {
        let index = token.index();
        let slot = self.slots.get(index).ok_or(HetstreamError::InvalidState {
            expected: format!("store sized for slot {index}"),
            actual: "token from a different registry".to_string(),
        })?;
        let boxed = slot.as_ref().ok_or(HetstreamError::SlotEmpty { index })?;
        boxed
            .downcast_ref::<T>()
            .ok_or(HetstreamError::SlotTypeMismatch { index })
    }

    /// Number of slots (filled or not) in this store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the store has no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filled = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("ResultStore")
            .field("slots", &self.slots.len())
            .field("filled", &filled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut registry = TokenRegistry::new();
        let (put, get) = registry.register::<Vec<f32>>();
        let mut store = ResultStore::new(&registry);

        store.put(put, vec![1.0, 2.0]).unwrap();
        assert_eq!(store.get(get).unwrap(), &vec![1.0, 2.0]);
    }

    #[test]
    fn test_double_put_rejected() {
        let mut registry = TokenRegistry::new();
        let (put, _get) = registry.register::<u32>();
        let mut store = ResultStore::new(&registry);

        store.put(put, 1).unwrap();
        assert_eq!(
            store.put(put, 2),
            Err(HetstreamError::SlotOccupied { index: 0 })
        );
    }

    #[test]
    fn test_get_empty_slot() {
        let mut registry = TokenRegistry::new();
        let (_put, get) = registry.register::<u32>();
        let store = ResultStore::new(&registry);

        assert_eq!(
            store.get(get).unwrap_err(),
            HetstreamError::SlotEmpty { index: 0 }
        );
    }

    #[test]
    fn test_type_mismatch_detected() {
        // Two registries issuing tokens for the same index with
        // different types; mixing them is caught at runtime.
        let mut registry_a = TokenRegistry::new();
        let (put_u32, _) = registry_a.register::<u32>();
        let mut registry_b = TokenRegistry::new();
        let (_, get_string) = registry_b.register::<String>();

        let mut store = ResultStore::new(&registry_a);
        store.put(put_u32, 42).unwrap();
        assert_eq!(
            store.get(get_string).unwrap_err(),
            HetstreamError::SlotTypeMismatch { index: 0 }
        );
    }

    #[test]
    fn test_foreign_token_rejected() {
        let mut small = TokenRegistry::new();
        let _ = small.register::<u32>();
        let store = ResultStore::new(&small);

        let mut big = TokenRegistry::new();
        let _ = big.register::<u32>();
        let (_, get_far) = big.register::<u32>();
        assert!(matches!(
            store.get(get_far).unwrap_err(),
            HetstreamError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_registry_len() {
        let mut registry = TokenRegistry::new();
        assert!(registry.is_empty());
        let _ = registry.register::<u32>();
        let _ = registry.register::<String>();
        assert_eq!(registry.len(), 2);
    }
}
