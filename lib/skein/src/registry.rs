use crate::context::ServiceContext;
use crate::error::LaunchError;
use crate::handle::ServiceHandle;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

const INITIAL_SLOTS: usize = 64;

/// Result of a name registration attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum NameRegistration {
    Registered,
    /// Same name, same handle: idempotent no-op.
    AlreadyOwn,
    /// Name taken by a different live service.
    Duplicate(ServiceHandle),
}

struct Slots {
    table: Vec<Option<Arc<ServiceContext>>>,
    index: u32,
    count: usize,
    local_names: IndexMap<String, ServiceHandle>,
}

impl Slots {
    fn slot_of(&self, serial: u32) -> usize {
        serial as usize & (self.table.len() - 1)
    }
}

/// Service registry: a power-of-two slot table probed by a rolling 24-bit
/// serial. A slot reused after release gets a different serial, so a stale
/// handle can never resolve to the wrong service.
pub struct Registry {
    node: u8,
    slots: RwLock<Slots>,
}

impl Registry {
    pub fn new(node: u8) -> Registry {
        Registry {
            node,
            slots: RwLock::new(Slots {
                table: (0..INITIAL_SLOTS).map(|_| None).collect(),
                index: 1,
                count: 0,
                local_names: IndexMap::new(),
            }),
        }
    }

    #[inline]
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Allocate a handle and install the record built for it. The handle is
    /// resolvable as soon as this returns.
    pub fn allocate<F>(&self, build: F) -> Result<Arc<ServiceContext>, LaunchError>
    where
        F: FnOnce(ServiceHandle) -> ServiceContext,
    {
        let mut slots = self.slots.write();

        loop {
            let len = slots.table.len() as u32;
            for probe in 0..len {
                let serial = slots.index.wrapping_add(probe) & ServiceHandle::SERIAL_MASK;
                if serial == 0 {
                    continue;
                }
                let slot = slots.slot_of(serial);
                if slots.table[slot].is_none() {
                    let handle = ServiceHandle::new(self.node, serial);
                    let ctx = Arc::new(build(handle));
                    slots.table[slot] = Some(ctx.clone());
                    slots.index = serial.wrapping_add(1) & ServiceHandle::SERIAL_MASK;
                    slots.count += 1;
                    return Ok(ctx);
                }
            }

            // Table saturated: double and rehash, up to the 24-bit ceiling.
            let new_len = slots.table.len() * 2;
            if new_len > (ServiceHandle::SERIAL_MASK as usize + 1) {
                return Err(LaunchError::RegistryFull);
            }
            let mut table: Vec<Option<Arc<ServiceContext>>> = (0..new_len).map(|_| None).collect();
            for entry in slots.table.drain(..) {
                if let Some(ctx) = entry {
                    let slot = ctx.handle().serial() as usize & (new_len - 1);
                    debug_assert!(table[slot].is_none());
                    table[slot] = Some(ctx);
                }
            }
            slots.table = table;
        }
    }

    pub fn resolve(&self, handle: ServiceHandle) -> Option<Arc<ServiceContext>> {
        let slots = self.slots.read();
        let slot = slots.slot_of(handle.serial());
        match &slots.table[slot] {
            Some(ctx) if ctx.handle() == handle => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Remove the record from the index. This is not destruction: callers
    /// that still hold the `Arc` finish their work before the record drops.
    pub fn release(&self, handle: ServiceHandle) -> Option<Arc<ServiceContext>> {
        let mut slots = self.slots.write();
        let slot = slots.slot_of(handle.serial());
        match &slots.table[slot] {
            Some(ctx) if ctx.handle() == handle => {
                let ctx = slots.table[slot].take().expect("slot vanished under write lock");
                slots.count -= 1;
                slots.local_names.retain(|_, owner| *owner != handle);
                Some(ctx)
            }
            _ => None,
        }
    }

    /// Register a node-local name (the `.name` scope, passed without the
    /// dot). Re-registering the same handle is a no-op.
    pub fn register_name(&self, name: &str, handle: ServiceHandle) -> NameRegistration {
        let mut slots = self.slots.write();
        match slots.local_names.get(name).copied() {
            Some(owner) if owner == handle => NameRegistration::AlreadyOwn,
            Some(owner) => NameRegistration::Duplicate(owner),
            None => {
                slots.local_names.insert(name.to_owned(), handle);
                if let Some(ctx) = {
                    let slot = slots.slot_of(handle.serial());
                    slots.table[slot].clone()
                } {
                    if ctx.handle() == handle {
                        ctx.set_name(name);
                    }
                }
                NameRegistration::Registered
            }
        }
    }

    pub fn resolve_name(&self, name: &str) -> Option<ServiceHandle> {
        self.slots.read().local_names.get(name).copied()
    }

    /// Number of live services. The runtime shuts down when this hits zero.
    #[inline]
    pub fn count(&self) -> usize {
        self.slots.read().count
    }

    /// Snapshot of live handles, used by STAT-style listings.
    pub fn live_handles(&self) -> Vec<ServiceHandle> {
        self.slots
            .read()
            .table
            .iter()
            .filter_map(|entry| entry.as_ref().map(|ctx| ctx.handle()))
            .collect()
    }
}
