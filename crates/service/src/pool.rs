use crate::Error;

use std::sync::Arc;

use parking_lot::Mutex;

/// Address of one slot in the buffer pool.
///
/// The generation is bumped every time the slot is returned, a handle
/// from an earlier checkout never matches the slot again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

struct Slot {
    generation: u32,
    checked_out: bool,
    /// Allocated lazily on first checkout, kept for reuse afterwards.
    buffer: Option<Box<[u8]>>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed-size buffer arena shared by every peer connection.
///
/// The pool tracks which slots are checked out, the bytes of a slot are
/// moved into the [`PooledBuffer`] for the duration of the checkout so
/// that exactly one holder can ever touch them.
///
/// ```
/// use restream_service::pool::BufferPool;
///
/// let pool = BufferPool::new(2, 1500);
///
/// let a = pool.checkout(&[1, 2, 3]).unwrap();
/// let b = pool.checkout(&[4, 5]).unwrap();
/// assert_eq!(pool.available(), 0);
/// assert!(pool.checkout(&[6]).is_err());
///
/// let handle = a.handle();
/// drop(a);
/// assert_eq!(pool.available(), 1);
/// assert!(!pool.is_checked_out(handle));
/// assert!(pool.is_checked_out(b.handle()));
/// ```
pub struct BufferPool {
    inner: Mutex<Slots>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                checked_out: false,
                buffer: None,
            })
            .collect();

        Arc::new(Self {
            inner: Mutex::new(Slots {
                free: (0..capacity as u32).rev().collect(),
                slots,
            }),
            buffer_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// number of slots that can be checked out right now.
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn is_checked_out(&self, handle: Handle) -> bool {
        let inner = self.inner.lock();
        inner
            .slots
            .get(handle.index as usize)
            .map(|slot| slot.checked_out && slot.generation == handle.generation)
            .unwrap_or(false)
    }

    /// Check out a slot and copy `bytes` into it.
    pub fn checkout(self: &Arc<Self>, bytes: &[u8]) -> Result<PooledBuffer, Error> {
        if bytes.len() > self.buffer_size {
            return Err(Error::Codec(codec::Error::InvalidInput));
        }

        let (handle, mut buffer) = {
            let mut inner = self.inner.lock();
            let index = inner.free.pop().ok_or(Error::PoolExhausted)?;

            let slot = &mut inner.slots[index as usize];
            slot.checked_out = true;

            let buffer = slot
                .buffer
                .take()
                .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());

            (
                Handle {
                    generation: slot.generation,
                    index,
                },
                buffer,
            )
        };

        buffer[..bytes.len()].copy_from_slice(bytes);

        Ok(PooledBuffer {
            pool: self.clone(),
            len: bytes.len(),
            handle,
            buffer,
        })
    }

    fn restore(&self, handle: Handle, buffer: Box<[u8]>) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(handle.index as usize) else {
            return;
        };

        if !slot.checked_out || slot.generation != handle.generation {
            return;
        }

        slot.generation = slot.generation.wrapping_add(1);
        slot.checked_out = false;
        slot.buffer = Some(buffer);
        inner.free.push(handle.index);
    }
}

/// A checked out slot, returned to the pool when dropped.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    handle: Handle,
    buffer: Box<[u8]>,
    len: usize,
}

impl PooledBuffer {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.restore(self.handle, buffer);
    }
}
