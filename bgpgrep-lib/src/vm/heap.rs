//! Two-zone cell arena backing the VM.
//!
//! Permanent allocations are appended while the filter is being built and
//! survive across executions (constant-pool array payloads live here).
//! Transient allocations serve one execution and are wound back wholesale
//! when the next one starts. The zone discipline is enforced at the API:
//! no permanent allocation while a transient one is outstanding, and only
//! the most recent transient allocation may be grown or returned.

use crate::error::VmError;
use crate::vm::Cell;

/// Ceiling on total arena size, in cells.
const HEAP_CEILING: usize = 1 << 20;

pub struct Heap {
    cells: Vec<Cell>,
    /// End of the permanent zone.
    highwater: usize,
    /// Base of the most recent transient allocation, if any.
    last_temp: Option<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            cells: Vec::new(),
            highwater: 0,
            last_temp: None,
        }
    }

    /// Cells currently allocated past the permanent zone.
    pub fn temp_len(&self) -> usize {
        self.cells.len() - self.highwater
    }

    pub fn perm_len(&self) -> usize {
        self.highwater
    }

    /// Append a permanent allocation; returns its base offset.
    pub fn alloc_perm(&mut self, cells: &[Cell]) -> Result<u32, VmError> {
        if self.temp_len() != 0 {
            return Err(VmError::BadHeapPtr);
        }
        if self.cells.len() + cells.len() > HEAP_CEILING {
            return Err(VmError::OutOfMemory);
        }
        let base = self.cells.len();
        self.cells.extend_from_slice(cells);
        self.highwater = self.cells.len();
        Ok(base as u32)
    }

    /// Allocate `n` zeroed transient cells; returns their base offset.
    pub fn alloc_temp(&mut self, n: usize) -> Result<u32, VmError> {
        if self.cells.len() + n > HEAP_CEILING {
            return Err(VmError::OutOfMemory);
        }
        let base = self.cells.len();
        self.cells.resize(base + n, Cell::Val(0));
        self.last_temp = Some(base);
        Ok(base as u32)
    }

    /// Grow the most recent transient allocation to `new_len` cells.
    pub fn grow_temp(&mut self, base: u32, new_len: usize) -> Result<(), VmError> {
        if self.last_temp != Some(base as usize) {
            return Err(VmError::BadHeapPtr);
        }
        let new_end = base as usize + new_len;
        if new_end < self.cells.len() {
            return Err(VmError::BadHeapPtr);
        }
        if new_end > HEAP_CEILING {
            return Err(VmError::OutOfMemory);
        }
        self.cells.resize(new_end, Cell::Val(0));
        Ok(())
    }

    /// Pop `n` cells off the transient zone.
    pub fn return_temp(&mut self, n: usize) -> Result<(), VmError> {
        if n > self.temp_len() {
            return Err(VmError::BadHeapPtr);
        }
        self.cells.truncate(self.cells.len() - n);
        if self.cells.len() == self.highwater {
            self.last_temp = None;
        }
        Ok(())
    }

    /// Wind the transient zone back to empty; called at the start of every
    /// execution.
    pub fn reset_temp(&mut self) {
        self.cells.truncate(self.highwater);
        self.last_temp = None;
    }

    /// Bounds-check an array descriptor before any element access.
    pub fn check_array(&self, base: u32, nels: u32) -> Result<(), VmError> {
        let end = base as usize + nels as usize;
        if end > self.cells.len() {
            return Err(VmError::BadArray);
        }
        Ok(())
    }

    pub fn get(&self, idx: u32) -> Result<Cell, VmError> {
        self.cells.get(idx as usize).copied().ok_or(VmError::BadArray)
    }

    pub fn set(&mut self, idx: u32, cell: Cell) -> Result<(), VmError> {
        match self.cells.get_mut(idx as usize) {
            Some(slot) => {
                *slot = cell;
                Ok(())
            }
            None => Err(VmError::BadArray),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_then_temp() {
        let mut h = Heap::new();
        let base = h.alloc_perm(&[Cell::Val(1), Cell::Val(2)]).unwrap();
        assert_eq!(base, 0);
        assert_eq!(h.get(1).unwrap(), Cell::Val(2));

        let t = h.alloc_temp(3).unwrap();
        assert_eq!(t, 2);
        assert_eq!(h.temp_len(), 3);
    }

    #[test]
    fn test_no_perm_while_temp_outstanding() {
        let mut h = Heap::new();
        h.alloc_temp(1).unwrap();
        assert_eq!(h.alloc_perm(&[Cell::Val(0)]), Err(VmError::BadHeapPtr));
        h.reset_temp();
        assert!(h.alloc_perm(&[Cell::Val(0)]).is_ok());
    }

    #[test]
    fn test_grow_and_return_last_temp_only() {
        let mut h = Heap::new();
        let a = h.alloc_temp(2).unwrap();
        let b = h.alloc_temp(2).unwrap();
        assert_eq!(h.grow_temp(a, 4), Err(VmError::BadHeapPtr));
        h.grow_temp(b, 5).unwrap();
        assert_eq!(h.temp_len(), 7);
        h.return_temp(5).unwrap();
        assert_eq!(h.temp_len(), 2);
    }

    #[test]
    fn test_reset_preserves_permanent() {
        let mut h = Heap::new();
        h.alloc_perm(&[Cell::Val(7)]).unwrap();
        h.alloc_temp(10).unwrap();
        h.reset_temp();
        assert_eq!(h.temp_len(), 0);
        assert_eq!(h.get(0).unwrap(), Cell::Val(7));
    }

    #[test]
    fn test_array_bounds() {
        let mut h = Heap::new();
        h.alloc_perm(&[Cell::Val(0); 4]).unwrap();
        assert!(h.check_array(0, 4).is_ok());
        assert_eq!(h.check_array(2, 3), Err(VmError::BadArray));
        assert_eq!(h.get(4), Err(VmError::BadArray));
    }
}
