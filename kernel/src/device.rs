//! Generic device manager: opaque records with an info page, a bounded
//! callback-event queue, and a 128-slot vtable unifying kernel- and
//! user-registered callbacks.
//!
//! A device's vtable slot can be invoked synchronously from kernel context
//! (`kernel_fn`) or, for user-registered callbacks, enqueues a `(slot, args)`
//! event onto the device's ring for the owning process to drain via
//! `map_queue`/`poll`. Reserved slots: 124=write(fd,ptr,len), 125=read(fd,ptr,len),
//! 126=open, 127=close; console devices additionally use 4=set-foreground-group,
//! 5=get-foreground-group.

use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;

pub const MAX_DEV_CALLBACKS: usize = 128;
pub const MAX_DEV_CALLBACK_ARGS: usize = 6;
pub const CALLBACK_QUEUE_CAPACITY: usize = 73;

pub const SLOT_SET_FOREGROUND_GROUP: usize = 4;
pub const SLOT_GET_FOREGROUND_GROUP: usize = 5;
pub const SLOT_WRITE: usize = 124;
pub const SLOT_READ: usize = 125;
pub const SLOT_OPEN: usize = 126;
pub const SLOT_CLOSE: usize = 127;

pub type DeviceId = u64;
pub type KernelFn = fn(u64, u64) -> u64;

/// How a single callback argument should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int,
    PtrIn,
    PtrOut,
    PtrInOut,
    None,
}

/// Whether an argument's size is fixed or given at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeType {
    Static(usize),
    Dynamic,
}

#[derive(Debug, Clone, Copy)]
pub struct CallbackArg {
    pub arg_type: ArgType,
    pub size: SizeType,
}

/// A user-registered callback's signature: its argument shapes and the
/// userspace entry point `call` invokes indirectly via the event queue.
#[derive(Debug, Clone)]
pub struct CallbackSignature {
    pub args: [CallbackArg; MAX_DEV_CALLBACK_ARGS],
    pub user_entry: u64,
}

/// One vtable slot: either a synchronous kernel callback or a signature
/// describing a user callback reached through the event queue.
#[derive(Clone)]
pub enum VtableEntry {
    Kernel(KernelFn),
    User(CallbackSignature),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackArgs(pub [u64; MAX_DEV_CALLBACK_ARGS]);

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    fn_id: u64,
    args: CallbackArgs,
}

/// Bounded SPSC-in-practice ring of pending callback events. When full, the
/// oldest entry is dropped rather than blocking the producer (spec's fixed
/// backpressure policy: a non-responsive consumer loses events).
struct CallbackQueue {
    head: usize,
    tail: usize,
    len: usize,
    data: Vec<Option<QueueEntry>>,
}

impl CallbackQueue {
    fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            len: 0,
            data: alloc::vec![None; CALLBACK_QUEUE_CAPACITY],
        }
    }

    fn push(&mut self, fn_id: u64, args: CallbackArgs) {
        self.data[self.head] = Some(QueueEntry { fn_id, args });
        self.head = (self.head + 1) % CALLBACK_QUEUE_CAPACITY;
        if self.len == CALLBACK_QUEUE_CAPACITY {
            // Ring is full: advance tail too, dropping the oldest event.
            self.tail = (self.tail + 1) % CALLBACK_QUEUE_CAPACITY;
        } else {
            self.len += 1;
        }
    }

    fn pop(&mut self) -> Option<(u64, CallbackArgs)> {
        if self.len == 0 {
            return None;
        }
        let entry = self.data[self.tail].take()?;
        self.tail = (self.tail + 1) % CALLBACK_QUEUE_CAPACITY;
        self.len -= 1;
        Some((entry.fn_id, entry.args))
    }
}

/// Per-device access control: a basic-call allow-list and a separate,
/// stricter trust set gating queue mapping.
#[derive(Default)]
struct AccessControl {
    owner_uid: u64,
    allowed_groups: BTreeSet<u64>,
    trusted_groups: BTreeSet<u64>,
}

/// An opaque device record: info page, callback queue, and vtable.
pub struct Device {
    pub id: DeviceId,
    path: Mutex<alloc::string::String>,
    info_page: Vec<u8>,
    queue: Mutex<CallbackQueue>,
    vtable: Mutex<[Option<VtableEntry>; MAX_DEV_CALLBACKS]>,
    access: Mutex<AccessControl>,
}

impl Device {
    fn new(id: DeviceId, path: alloc::string::String, info_page_size: usize) -> Self {
        Self {
            id,
            path: Mutex::new(path),
            info_page: alloc::vec![0u8; info_page_size],
            queue: Mutex::new(CallbackQueue::new()),
            vtable: Mutex::new(core::array::from_fn(|_| None)),
            access: Mutex::new(AccessControl::default()),
        }
    }

    pub fn path(&self) -> alloc::string::String {
        self.path.lock().clone()
    }

    pub fn info_page(&self) -> &[u8] {
        &self.info_page
    }

    pub fn info_page_mut(&mut self) -> &mut [u8] {
        &mut self.info_page
    }

    /// Register a kernel-context callback at `slot`.
    pub fn register_kernel_callback(&self, slot: usize, f: KernelFn) -> Result<(), &'static str> {
        if slot >= MAX_DEV_CALLBACKS {
            return Err("slot out of range");
        }
        self.vtable.lock()[slot] = Some(VtableEntry::Kernel(f));
        Ok(())
    }

    /// Register a user callback's signature at `slot`.
    pub fn register_callback(
        &self,
        slot: usize,
        signature: CallbackSignature,
    ) -> Result<(), &'static str> {
        if slot >= MAX_DEV_CALLBACKS {
            return Err("slot out of range");
        }
        self.vtable.lock()[slot] = Some(VtableEntry::User(signature));
        Ok(())
    }

    pub fn unregister_callback(&self, slot: usize) -> Result<(), &'static str> {
        if slot >= MAX_DEV_CALLBACKS {
            return Err("slot out of range");
        }
        self.vtable.lock()[slot] = None;
        Ok(())
    }

    /// Invoke a kernel callback synchronously; enqueue a user callback's
    /// event instead.
    pub fn call(&self, slot: usize, arg1: u64, arg2: u64) -> Result<u64, &'static str> {
        if slot >= MAX_DEV_CALLBACKS {
            return Err("slot out of range");
        }
        match self.vtable.lock()[slot].clone() {
            Some(VtableEntry::Kernel(f)) => Ok(f(arg1, arg2)),
            Some(VtableEntry::User(_)) => {
                let mut args = CallbackArgs::default();
                args.0[0] = arg1;
                args.0[1] = arg2;
                self.queue.lock().push(slot as u64, args);
                Ok(0)
            }
            None => Err("no callback registered at slot"),
        }
    }

    /// Drain the next pending user-callback event, if any.
    pub fn poll_event(&self) -> Option<(u64, CallbackArgs)> {
        self.queue.lock().pop()
    }

    pub fn grant_access(&self, gid: u64) {
        self.access.lock().allowed_groups.insert(gid);
    }

    pub fn revoke_access(&self, gid: u64) {
        self.access.lock().allowed_groups.remove(&gid);
    }

    pub fn grant_trust(&self, gid: u64) {
        self.access.lock().trusted_groups.insert(gid);
    }

    pub fn revoke_trust(&self, gid: u64) {
        self.access.lock().trusted_groups.remove(&gid);
    }

    pub fn is_accessible_to(&self, gid: u64) -> bool {
        self.access.lock().allowed_groups.contains(&gid)
    }

    pub fn is_trusted(&self, gid: u64) -> bool {
        self.access.lock().trusted_groups.contains(&gid)
    }

    pub fn set_owner(&self, uid: u64) {
        self.access.lock().owner_uid = uid;
    }

    pub fn owner(&self) -> u64 {
        self.access.lock().owner_uid
    }
}

/// Registry of all devices, keyed by id.
pub struct DeviceManager {
    devices: BTreeMap<DeviceId, Arc<Device>>,
    next_id: DeviceId,
}

impl DeviceManager {
    fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn create(&mut self, path: alloc::string::String, info_page_size: usize) -> DeviceId {
        let id = self.next_id;
        self.next_id += 1;
        self.devices.insert(id, Arc::new(Device::new(id, path, info_page_size)));
        id
    }

    pub fn destroy(&mut self, id: DeviceId) -> Result<(), &'static str> {
        self.devices.remove(&id).map(|_| ()).ok_or("no such device")
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.get(&id).cloned()
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), &'static str> {
        let device = self
            .devices
            .values()
            .find(|d| d.path() == old_path)
            .cloned()
            .ok_or("no such device")?;
        *device.path.lock() = alloc::string::String::from(new_path);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn list(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }
}

static DEVICE_MANAGER: OnceCell<Mutex<DeviceManager>> = OnceCell::uninit();

/// Initialize the device manager. Must be called once during boot.
pub fn init() {
    DEVICE_MANAGER.init_once(|| Mutex::new(DeviceManager::new()));
    log::info!("Device manager initialized");
}

pub fn with_manager<R>(f: impl FnOnce(&mut DeviceManager) -> R) -> Option<R> {
    DEVICE_MANAGER.get().map(|m| f(&mut m.lock()))
}
