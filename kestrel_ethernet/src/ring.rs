//! Hardware-shared descriptor rings and the doorbell registers that
//! advertise progress through them.
//!
//! A ring is a power-of-two-sized circular array living in memory that the
//! control plane allocated and mapped for DMA. The driver does not own
//! that memory in the Rust sense: hardware reads and writes it
//! concurrently, so the ring holds a raw base pointer and every element
//! access goes through a reference whose fields are `Volatile`. Safety
//! rests on the queue discipline, not the borrow checker: exactly one
//! software thread touches a given ring, and hardware only touches the
//! slots the validity/doorbell protocol says it may.

use core::fmt;

/// Doorbell key for receive buffer rings.
pub const DB_KEY_RX: u32 = 0x1 << 28;
/// Doorbell key for transmit buffer rings.
pub const DB_KEY_TX: u32 = 0x2 << 28;
/// Doorbell key for completion rings.
pub const DB_KEY_CMPL: u32 = 0x4 << 28;

/// A circular array of hardware-shared `T` slots.
pub struct DescriptorRing<T> {
    base: *mut T,
    size: u16,
    mask: u16,
}

impl<T> DescriptorRing<T> {
    /// Wraps ring memory the control plane set up.
    ///
    /// `size` must be a power of two: index arithmetic is masked, and the
    /// completion-validity protocol derives wrap parity from the `size`
    /// bit of the raw cursor.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` initialized, DMA-reachable slots of
    /// `T`, valid for the life of the ring, and no other software may
    /// access them while the ring exists.
    pub unsafe fn from_raw_parts(base: *mut T, size: u16) -> Result<DescriptorRing<T>, &'static str> {
        if base.is_null() {
            return Err("DescriptorRing::from_raw_parts(): null ring base");
        }
        if size < 2 || !size.is_power_of_two() {
            return Err("DescriptorRing::from_raw_parts(): ring size must be a power of two");
        }
        Ok(DescriptorRing { base, size, mask: size - 1 })
    }

    /// Number of slots in the ring.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// `size - 1`, for masking raw cursors into slot indexes.
    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// The slot at `index`, masked into the ring.
    pub fn get(&self, index: u16) -> &T {
        unsafe { &*self.base.add((index & self.mask) as usize) }
    }

    /// The slot at `index`, masked into the ring, for writing.
    pub fn get_mut(&mut self, index: u16) -> &mut T {
        unsafe { &mut *self.base.add((index & self.mask) as usize) }
    }
}

// The ring is confined to its queue's polling thread; moving the queue
// moves the ring with it.
unsafe impl<T: Send> Send for DescriptorRing<T> {}

impl<T> fmt::Debug for DescriptorRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DescriptorRing {{ base: {:#x}, size: {} }}", self.base as usize, self.size)
    }
}

/// A write-only doorbell register.
///
/// Writing `key | index` tells hardware that software has produced (or
/// consumed) ring entries up through `index`. The write must happen only
/// after every descriptor it advertises is committed to memory.
pub struct DoorbellRegister {
    register: *mut u32,
    key: u32,
}

impl DoorbellRegister {
    /// Wraps a mapped doorbell register.
    ///
    /// # Safety
    ///
    /// `register` must be the mapped, write-safe doorbell location for
    /// the ring this doorbell will be used with.
    pub unsafe fn new(register: *mut u32, key: u32) -> DoorbellRegister {
        DoorbellRegister { register, key }
    }

    /// Notifies hardware of the latest ready index.
    pub fn ring(&self, index: u32) {
        unsafe { core::ptr::write_volatile(self.register, self.key | index) }
    }
}

unsafe impl Send for DoorbellRegister {}
