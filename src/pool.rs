use sha1_smol::Sha1;
use std::sync::Mutex;

use crate::frame::Frame;

// Free lists are capped so a burst of large connections does not pin memory
// for the lifetime of the process.
const MAX_POOLED: usize = 64;

/// A concurrency-safe free list of reusable objects.
///
/// Acquire transfers sole ownership to the caller; release resets the object
/// and returns it. Objects never flow back by themselves, so every code path
/// that takes one out is responsible for putting it back.
pub(crate) struct Pool<T> {
    items: Mutex<Vec<T>>,
    new: fn() -> T,
    reset: fn(&mut T),
}

impl<T> Pool<T> {
    pub(crate) const fn new(new: fn() -> T, reset: fn(&mut T)) -> Self {
        Pool {
            items: Mutex::new(Vec::new()),
            new,
            reset,
        }
    }

    pub(crate) fn acquire(&self) -> T {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.pop().unwrap_or_else(self.new)
    }

    pub(crate) fn release(&self, mut item: T) {
        (self.reset)(&mut item);
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() < MAX_POOLED {
            items.push(item);
        }
    }
}

pub(crate) static FRAMES: Pool<Frame> = Pool::new(Frame::pooled, Frame::clear);

pub(crate) static BUFFERS: Pool<Vec<u8>> = Pool::new(Vec::new, Vec::clear);

pub(crate) static SHA1S: Pool<Sha1> = Pool::new(Sha1::new, Sha1::reset);
