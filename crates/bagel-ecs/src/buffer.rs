//! Fixed-capacity buffers shared between the primary world and executors.
//!
//! A [`SharedBuffer`] is an `Arc` over a slice of atomic cells. Cloning the
//! buffer clones the handle, not the contents, so a snapshot handed to an
//! executor observes every write the primary thread makes and vice versa.
//! Resizing produces a *new* allocation with the old contents copied in;
//! holders of the old handle keep the stale buffer until they resync.

use std::fmt;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;

/// Shared, fixed-length buffer of `Copy` values.
pub struct SharedBuffer<T> {
    cells: Arc<[AtomicCell<T>]>,
}

impl<T: Copy + Default> SharedBuffer<T> {
    /// Allocate `len` cells initialised to `T::default()`.
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicCell::new(T::default())).collect(),
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read cell `index`, or `None` if out of range.
    #[inline]
    pub fn get(&self, index: usize) -> Option<T> {
        self.cells.get(index).map(AtomicCell::load)
    }

    /// Write cell `index`. Returns `false` if out of range.
    #[inline]
    pub fn set(&self, index: usize, value: T) -> bool {
        match self.cells.get(index) {
            Some(cell) => {
                cell.store(value);
                true
            }
            None => false,
        }
    }

    /// A new buffer of `len` cells holding a copy of the overlapping prefix.
    pub fn resized(&self, len: usize) -> Self {
        let cells = (0..len)
            .map(|i| AtomicCell::new(self.get(i).unwrap_or_default()))
            .collect();
        Self { cells }
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<T> {
        self.cells.iter().map(AtomicCell::load).collect()
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cells, &other.cells)
    }
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            cells: Arc::clone(&self.cells),
        }
    }
}

impl<T: Copy + Default + fmt::Debug> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_writes() {
        let a = SharedBuffer::<u32>::new(4);
        let b = a.clone();
        assert!(a.set(2, 7));
        assert_eq!(b.get(2), Some(7));
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn out_of_range_access() {
        let a = SharedBuffer::<f64>::new(2);
        assert_eq!(a.get(2), None);
        assert!(!a.set(5, 1.0));
    }

    #[test]
    fn resized_copies_prefix_into_new_allocation() {
        let a = SharedBuffer::<i32>::new(3);
        a.set(0, -1);
        a.set(2, 9);

        let grown = a.resized(5);
        assert_eq!(grown.to_vec(), vec![-1, 0, 9, 0, 0]);
        assert!(!grown.ptr_eq(&a));

        let shrunk = a.resized(1);
        assert_eq!(shrunk.to_vec(), vec![-1]);
    }
}
