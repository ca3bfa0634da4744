//! An intrusive stack of free blocks with one owner and any number of
//! thieves.  The owning thread pushes and pops; the decay timer, on
//! whatever thread it runs, steals the whole stack at once.  The link
//! lives in the first word of the free block itself, the same in-band
//! trick the small buddy representation uses.
//!
//! Every mutation detaches the entire chain with one `swap`, edits it
//! privately, and stores the result back.  A thief that lands between
//! the swap and the store sees an empty stack and simply leaves with
//! nothing (it will try again next tick), so no interleaving can
//! duplicate or lose a block.
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct FreeStack {
    head: AtomicUsize,
}

impl FreeStack {
    pub const EMPTY: FreeStack = FreeStack {
        head: AtomicUsize::new(0),
    };

    /// Pushes a block.  Owner only.
    ///
    /// # Safety
    ///
    /// The caller must own the (committed, writable) block at `addr`,
    /// which must stay untouched until it comes back out of the stack.
    pub unsafe fn push(&self, addr: usize) {
        debug_assert_ne!(addr, 0);

        let chain = self.head.swap(0, Ordering::AcqRel);
        *(addr as *mut usize) = chain;
        self.head.store(addr, Ordering::Release);
    }

    /// Pops the most recently pushed block.  Owner only.
    pub fn pop(&self) -> Option<usize> {
        if self.head.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let chain = self.head.swap(0, Ordering::AcqRel);
        if chain == 0 {
            // A thief got here first.
            return None;
        }

        let next = unsafe { *(chain as *const usize) };
        self.head.store(next, Ordering::Release);
        Some(chain)
    }

    /// Steals every block at once.  Any thread.  On contention with
    /// the owner this may return an empty chain even though a push is
    /// in flight; the caller retries on its next tick.
    pub fn pop_all(&self) -> FreeChain {
        if self.head.load(Ordering::Relaxed) == 0 {
            return FreeChain { cursor: 0 };
        }

        FreeChain {
            cursor: self.head.swap(0, Ordering::Acquire),
        }
    }
}

/// A detached chain of blocks.  Iterating consumes it; the links are
/// read before each block is handed out, after which the block's
/// memory belongs to the caller again.
pub struct FreeChain {
    cursor: usize,
}

impl Iterator for FreeChain {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == 0 {
            return None;
        }

        let addr = self.cursor;
        self.cursor = unsafe { *(addr as *const usize) };
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Leaks word-sized cells to stand in for free blocks.
    fn cell() -> usize {
        Box::leak(Box::new(0usize)) as *mut usize as usize
    }

    #[test]
    fn lifo_order() {
        let stack = FreeStack::EMPTY;
        let (a, b, c) = (cell(), cell(), cell());

        unsafe {
            stack.push(a);
            stack.push(b);
            stack.push(c);
        }

        assert_eq!(stack.pop(), Some(c));
        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.pop(), Some(a));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn pop_all_takes_everything() {
        let stack = FreeStack::EMPTY;
        let cells: Vec<usize> = (0..10).map(|_| cell()).collect();

        for &c in &cells {
            unsafe { stack.push(c) };
        }

        let stolen: Vec<usize> = stack.pop_all().collect();
        let mut expected = cells.clone();
        expected.reverse();
        assert_eq!(stolen, expected);

        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pop_all().count(), 0);
    }

    #[test]
    fn interleaved_push_pop_all() {
        let stack = FreeStack::EMPTY;
        let (a, b) = (cell(), cell());

        unsafe { stack.push(a) };
        assert_eq!(stack.pop_all().collect::<Vec<_>>(), vec![a]);

        unsafe { stack.push(b) };
        assert_eq!(stack.pop(), Some(b));
    }

    #[test]
    fn concurrent_stealing_never_duplicates() {
        use std::collections::HashSet;
        use std::sync::atomic::AtomicBool;
        use std::sync::Mutex;

        let stack: &'static FreeStack = Box::leak(Box::new(FreeStack::EMPTY));
        let stolen: &'static Mutex<Vec<usize>> = Box::leak(Box::new(Mutex::new(Vec::new())));
        let done: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));

        // One thief stealing in a loop while the owner pushes and
        // pops.
        let thief = std::thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let chain: Vec<usize> = stack.pop_all().collect();
                if !chain.is_empty() {
                    stolen.lock().unwrap().extend(chain);
                }
            }
        });

        let mut kept = Vec::new();
        for _ in 0..10_000 {
            unsafe { stack.push(cell()) };
            unsafe { stack.push(cell()) };
            if let Some(addr) = stack.pop() {
                kept.push(addr);
            }
        }
        done.store(true, Ordering::Release);
        thief.join().expect("thief should finish");

        // Whatever is left on the stack, plus what each side took,
        // accounts for every pushed cell exactly once.
        let remaining: Vec<usize> = stack.pop_all().collect();
        let mut seen = HashSet::new();
        let total = kept.len() + stolen.lock().unwrap().len() + remaining.len();
        assert_eq!(total, 20_000);
        for addr in kept
            .into_iter()
            .chain(stolen.lock().unwrap().iter().cloned())
            .chain(remaining)
        {
            assert!(seen.insert(addr), "block {:#x} appeared twice", addr);
        }
    }
}
