// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Single-producer single-consumer ring over a shared file mapping.
//!
//! This is how records cross the process boundary between a primary process
//! and a secondary one attached to it. The mapping starts with a header, then
//! `capacity` slots of `T`:
//!
//! ```text
//! +-------+----------+-----------+----------+----------+----------+------
//! | magic | capacity | elem size | producer | consumer | slot 0   | ...
//! +-------+----------+-----------+----------+----------+----------+------
//! ```
//!
//! Producer and consumer positions are free running `u32` counters. Records
//! are copied by value: nothing in the mapping points anywhere.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crossbeam::utils::CachePadded;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::message::BypassMessage;

use tracectl::trace_target;
trace_target!("shm-ring", LevelFilter::INFO, &["bypass"]);

const SHM_MAGIC: u64 = 0x6279_7061_7373_7231; // "bypassr1"
const DATA_ALIGN: usize = 64;

/// Types that can be copied through shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), contain no pointers or
/// references, and accept every bit pattern as a valid value.
pub unsafe trait ShmSafe: Copy + 'static {}

// SAFETY: primitive integers
unsafe impl ShmSafe for u32 {}
unsafe impl ShmSafe for u64 {}
// SAFETY: repr(C) records of integers and byte arrays; the message kind is kept raw
unsafe impl ShmSafe for BypassMessage {}
unsafe impl ShmSafe for pkt_meta::FlowKey {}
unsafe impl ShmSafe for pkt_meta::MetadataEnvelope {}
unsafe impl ShmSafe for pkt_meta::MetadataFromEngine {}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared ring I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("shared ring capacity {0} is not a non-zero power of two")]
    BadCapacity(u32),
    #[error("shared ring has bad magic {0:#x}")]
    BadMagic(u64),
    #[error("shared ring holds {found}-byte elements, expected {expected}")]
    ElementMismatch { expected: usize, found: usize },
    #[error("shared ring mapping is {len} bytes, needs {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("shared ring mapping is misaligned")]
    Misaligned,
}

#[repr(C)]
struct Header {
    magic: u64,
    capacity: u32,
    elem_size: u32,
    producer: CachePadded<AtomicU32>,
    consumer: CachePadded<AtomicU32>,
}

const fn data_offset<T>() -> usize {
    let align = if align_of::<T>() > DATA_ALIGN {
        align_of::<T>()
    } else {
        DATA_ALIGN
    };
    size_of::<Header>().div_ceil(align) * align
}

const fn mapping_len<T>(capacity: u32) -> usize {
    data_offset::<T>() + capacity as usize * size_of::<T>()
}

/// One mapping of a shared ring.
///
/// A ring has one producer and one consumer, each holding its own mapping,
/// typically in different processes. Both `push` and `pop` take `&mut self`
/// so that a mapping serves one role at a time.
pub struct ShmRing<T: ShmSafe> {
    // keeps the mapping alive; all access goes through `base`
    _map: MmapMut,
    base: NonNull<u8>,
    mask: u32,
    _elem: PhantomData<T>,
}

// SAFETY: `base` points into `_map`, owned by this value; shared state is
// only touched through atomics.
unsafe impl<T: ShmSafe + Send> Send for ShmRing<T> {}

impl<T: ShmSafe> ShmRing<T> {
    /// Create (or truncate) the file at `path` and initialize a ring in it.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if `capacity` is not a power of two.
    pub fn create(path: &Path, capacity: u32) -> Result<Self, ShmError> {
        if !capacity.is_power_of_two() {
            return Err(ShmError::BadCapacity(capacity));
        }
        let len = mapping_len::<T>(capacity);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let ring = Self::map(&file, len, capacity)?;
        // SAFETY: the mapping is at least `len` bytes and checked aligned; no
        // peer can use it before the magic is published below.
        unsafe {
            let header = ring.base.cast::<Header>().as_ptr();
            std::ptr::addr_of_mut!((*header).capacity).write(capacity);
            #[allow(clippy::cast_possible_truncation)]
            std::ptr::addr_of_mut!((*header).elem_size).write(size_of::<T>() as u32);
            ring.header().producer.store(0, Ordering::Relaxed);
            ring.header().consumer.store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            std::ptr::addr_of_mut!((*header).magic).write_volatile(SHM_MAGIC);
        }
        debug!("Created shared ring at {} with {capacity} slots", path.display());
        Ok(ring)
    }

    /// Attach to a ring created by another process.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, or if the file does not hold a ring of `T`.
    pub fn attach(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len()).unwrap_or(usize::MAX);
        if len < data_offset::<T>() {
            return Err(ShmError::Truncated {
                len,
                needed: data_offset::<T>(),
            });
        }
        // SAFETY: the file holds at least a header
        let (magic, capacity, elem_size) = unsafe {
            let mut options = MmapOptions::new();
            let head = options.len(size_of::<Header>()).map(&file)?;
            let header = head.as_ptr().cast::<Header>();
            if !header.is_aligned() {
                return Err(ShmError::Misaligned);
            }
            let magic = std::ptr::addr_of!((*header).magic).read_volatile();
            fence(Ordering::Acquire);
            (magic, (*header).capacity, (*header).elem_size as usize)
        };
        if magic != SHM_MAGIC {
            return Err(ShmError::BadMagic(magic));
        }
        if elem_size != size_of::<T>() {
            return Err(ShmError::ElementMismatch {
                expected: size_of::<T>(),
                found: elem_size,
            });
        }
        if !capacity.is_power_of_two() {
            return Err(ShmError::BadCapacity(capacity));
        }
        let needed = mapping_len::<T>(capacity);
        if len < needed {
            return Err(ShmError::Truncated { len, needed });
        }
        let ring = Self::map(&file, needed, capacity)?;
        debug!("Attached to shared ring at {} with {capacity} slots", path.display());
        Ok(ring)
    }

    fn map(file: &File, len: usize, capacity: u32) -> Result<Self, ShmError> {
        // SAFETY: the file is shared with the peer process by contract; every
        // access to shared state goes through atomics or fenced slot copies.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let base = NonNull::new(map.as_mut_ptr()).ok_or(ShmError::Misaligned)?;
        if !base.cast::<Header>().as_ptr().is_aligned()
            || (base.as_ptr() as usize + data_offset::<T>()) % align_of::<T>() != 0
        {
            return Err(ShmError::Misaligned);
        }
        Ok(Self {
            _map: map,
            base,
            mask: capacity - 1,
            _elem: PhantomData,
        })
    }

    fn header(&self) -> &Header {
        // SAFETY: mapping is at least one aligned header long
        unsafe { self.base.cast::<Header>().as_ref() }
    }

    fn slot(&self, position: u32) -> *mut T {
        let offset = data_offset::<T>() + (position & self.mask) as usize * size_of::<T>();
        // SAFETY: offset stays within the mapping: position is masked to capacity
        unsafe { self.base.as_ptr().add(offset).cast::<T>() }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Records written and not yet read.
    #[must_use]
    pub fn len(&self) -> u32 {
        let producer = self.header().producer.load(Ordering::Acquire);
        let consumer = self.header().consumer.load(Ordering::Acquire);
        producer.wrapping_sub(consumer).min(self.capacity())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `value` into the ring.
    ///
    /// # Errors
    ///
    /// Gives `value` back when the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let header = self.header();
        let consumer = header.consumer.load(Ordering::Acquire);
        let producer = header.producer.load(Ordering::Relaxed);
        if producer.wrapping_sub(consumer) >= self.capacity() {
            return Err(value);
        }
        // SAFETY: the slot at `producer` is not visible to the consumer until
        // the producer index is published
        unsafe { self.slot(producer).write_volatile(value) };
        fence(Ordering::Release);
        self.header()
            .producer
            .store(producer.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Copy the oldest record out of the ring.
    pub fn pop(&mut self) -> Option<T> {
        let header = self.header();
        let producer = header.producer.load(Ordering::Acquire);
        let consumer = header.consumer.load(Ordering::Relaxed);
        let available = producer.wrapping_sub(consumer);
        if available == 0 {
            return None;
        }
        if available > self.capacity() {
            warn!("Shared ring indices are inconsistent: producer={producer} consumer={consumer}");
            return None;
        }
        fence(Ordering::Acquire);
        // SAFETY: the producer published this slot before moving its index
        let value = unsafe { self.slot(consumer).read_volatile() };
        self.header()
            .consumer
            .store(consumer.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T: ShmSafe> std::fmt::Debug for ShmRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::MessageKind;
    use pkt_meta::FlowKey;
    use std::net::Ipv6Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(Ipv6Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into(), port, 443, 6)
    }

    #[test]
    fn two_mappings_see_the_same_ring() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut producer = ShmRing::<BypassMessage>::create(file.path(), 4).unwrap();
        let mut consumer = ShmRing::<BypassMessage>::attach(file.path()).unwrap();
        assert_eq!(consumer.capacity(), 4);

        for port in 1..=4 {
            producer
                .push(BypassMessage::new(MessageKind::Add, key(port)))
                .unwrap();
        }
        let overflow = BypassMessage::new(MessageKind::Add, key(5));
        assert_eq!(producer.push(overflow), Err(overflow));
        assert_eq!(consumer.len(), 4);

        for port in 1..=4 {
            let msg = consumer.pop().unwrap();
            assert_eq!(msg.kind(), Ok(MessageKind::Add));
            assert_eq!(msg.key().src_port(), port);
        }
        assert!(consumer.pop().is_none());
        producer.push(overflow).unwrap();
        assert_eq!(consumer.pop().map(|m| m.key().src_port()), Some(5));
    }

    #[test]
    fn wraps_around_in_order_across_threads() {
        const COUNT: u64 = 50_000;
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut producer = ShmRing::<u64>::create(file.path(), 64).unwrap();
        let mut consumer = ShmRing::<u64>::attach(file.path()).unwrap();
        let writer = std::thread::spawn(move || {
            for value in 0..COUNT {
                let mut pending = value;
                while let Err(back) = producer.push(pending) {
                    pending = back;
                    std::thread::yield_now();
                }
            }
        });
        let mut expected = 0;
        while expected < COUNT {
            match consumer.pop() {
                Some(value) => {
                    assert_eq!(value, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn attach_validates_header() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        assert!(matches!(
            ShmRing::<u64>::attach(file.path()),
            Err(ShmError::BadMagic(0))
        ));

        ShmRing::<u64>::create(file.path(), 8).unwrap();
        assert!(matches!(
            ShmRing::<u32>::attach(file.path()),
            Err(ShmError::ElementMismatch {
                expected: 4,
                found: 8
            })
        ));

        let short = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            ShmRing::<u64>::attach(short.path()),
            Err(ShmError::Truncated { len: 0, .. })
        ));
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            ShmRing::<u32>::create(file.path(), 6),
            Err(ShmError::BadCapacity(6))
        ));
        assert!(matches!(
            ShmRing::<u32>::create(file.path(), 0),
            Err(ShmError::BadCapacity(0))
        ));
    }
}
