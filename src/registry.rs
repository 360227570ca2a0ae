//! Ownership tracking of device allocations.
//!
//! Every device-side value is held in a [`Tracked`] wrapper whose [`Lease`]
//! releases the registry entry when dropped, so early returns and `?` release
//! whatever was allocated so far. Results handed to the caller are detached with
//! [`Tracked::into_inner`].

use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::{debug, trace};

use crate::device::DeviceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationKind {
    /// Linear buffer, bounded by the device max allocation size
    Buffer,
    /// 3D image, bounded by image dimensions rather than allocation size
    Image,
}

#[derive(Debug)]
struct Entry {
    label: &'static str,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    live: HashMap<u64, Entry>,
    live_bytes: u64,
    peak_bytes: u64,
    total_allocations: usize,
}

impl Inner {
    fn remove(&mut self, id: u64) -> bool {
        match self.live.remove(&id) {
            Some(entry) => {
                self.live_bytes -= entry.bytes;
                trace!(label = entry.label, bytes = entry.bytes, "released");
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AllocationRegistry {
    inner: Arc<Mutex<Inner>>,
    max_alloc_bytes: u64,
}

impl AllocationRegistry {
    pub fn new(max_alloc_bytes: u64) -> Self {
        Self {
            inner: Arc::default(),
            max_alloc_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate(
        &self,
        label: &'static str,
        kind: AllocationKind,
        bytes: u64,
    ) -> Result<Lease, DeviceError> {
        if kind == AllocationKind::Buffer && bytes > self.max_alloc_bytes {
            return Err(DeviceError::Allocation {
                label,
                requested: bytes,
                max_alloc: self.max_alloc_bytes,
            });
        }

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(id, Entry { label, bytes });
        inner.live_bytes += bytes;
        inner.peak_bytes = inner.peak_bytes.max(inner.live_bytes);
        inner.total_allocations += 1;
        debug!(label, ?kind, bytes, live_bytes = inner.live_bytes, "allocated");

        Ok(Lease {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Allocate and attach the lease to `value`.
    pub fn track<T>(
        &self,
        label: &'static str,
        kind: AllocationKind,
        bytes: u64,
        value: T,
    ) -> Result<Tracked<T>, DeviceError> {
        let lease = self.allocate(label, kind, bytes)?;
        Ok(Tracked { value, lease })
    }

    /// Drop every live entry; leases still held afterwards release nothing.
    pub fn release_all(&self) -> usize {
        let mut inner = self.lock();
        let released = inner.live.len();
        let labels: Vec<&'static str> = inner.live.values().map(|entry| entry.label).collect();
        inner.live.clear();
        inner.live_bytes = 0;
        if released > 0 {
            debug!(released, ?labels, "released all allocations");
        }
        released
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().live.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.lock().live_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.lock().peak_bytes
    }

    pub fn total_allocations(&self) -> usize {
        self.lock().total_allocations
    }
}

/// Registry entry owned by a value; dropping it releases the entry.
#[derive(Debug)]
pub struct Lease {
    id: u64,
    registry: Weak<Mutex<Inner>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.id);
        }
    }
}

/// A device-resident value together with its registry lease.
#[derive(Debug)]
pub struct Tracked<T> {
    value: T,
    lease: Lease,
}

impl<T> Tracked<T> {
    /// Detach the value from the registry, handing ownership to the caller.
    pub fn into_inner(self) -> T {
        let Tracked { value, lease } = self;
        drop(lease);
        value
    }

    /// Transform the value in place, keeping the same registry entry.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tracked<U> {
        let Tracked { value, lease } = self;
        Tracked {
            value: f(value),
            lease,
        }
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
