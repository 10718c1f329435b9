//! Persistent record that the previous session ended in a fault.

use crate::constants::FAULT_LATCH_ADDRESS;
use crate::error::Result;
use crate::hardware::PersistentStore;

/// Single byte in persistent storage: 1 when a fault was latched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultLatch {
    address: usize,
}

impl Default for FaultLatch {
    fn default() -> Self {
        FaultLatch {
            address: FAULT_LATCH_ADDRESS,
        }
    }
}

impl FaultLatch {
    pub fn at(address: usize) -> Self {
        FaultLatch { address }
    }

    /// Report whether a fault was latched and clear it
    pub fn read_and_clear(&self, store: &mut dyn PersistentStore) -> Result<bool> {
        let latched = store.read_byte(self.address)? == 1;
        if latched {
            store.write_byte(self.address, 0)?;
        }
        Ok(latched)
    }

    pub fn set(&self, store: &mut dyn PersistentStore) -> Result<()> {
        store.write_byte(self.address, 1)
    }
}
