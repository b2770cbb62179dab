#![cfg_attr(not(test), allow(dead_code))]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// RING DATABUF HEADER - Shared Memory Layout
// =============================================================================
//
// This defines the memory layout that every hashpipe ring databuf flavor
// embeds as its first field. A concrete databuf (e.g. the ibvpkt capture
// databuf) appends its own extra header fields immediately after this one
// and then its data blocks, matching the original C convention of a common
// leading struct cast to the more specific flavor.
//
// MEMORY LAYOUT:
//   [0..64]   data_type: [u8; 64] - human readable tag for the block payload
//   [64..72]  header_size: u64    - size of the per-block header in bytes
//   [72..80]  block_size: u64     - size of each data block in bytes
//   [80..84]  n_block: u32        - number of blocks in the ring
//   [84..88]  shmid: i32          - SysV shared memory segment id
//   [88..92]  semid: i32          - SysV semaphore set id
//   [92..96]  _pad: [u8; 4]       - alignment padding to 8 bytes
// =============================================================================

/// Common leading header shared by every ring databuf flavor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DatabufHeader {
    /// Tag describing what kind of data this buffer carries.
    pub data_type: [u8; 64],
    /// Size in bytes of the per-block header that follows this struct.
    pub header_size: u64,
    /// Size in bytes of each data block.
    pub block_size: u64,
    /// Number of blocks in the ring.
    pub n_block: u32,
    /// SysV shared memory segment id backing this buffer.
    pub shmid: i32,
    /// SysV semaphore set id used for block free/filled signaling.
    pub semid: i32,
    pub _pad: [u8; 4],
}

#[cfg(test)]
const _: () = {
    assert!(size_of::<DatabufHeader>() == 96);
};

impl DatabufHeader {
    pub const fn zeroed() -> Self {
        Self {
            data_type: [0; 64],
            header_size: 0,
            block_size: 0,
            n_block: 0,
            shmid: -1,
            semid: -1,
            _pad: [0; 4],
        }
    }
}

/// Per-block state, stored as an `AtomicU8` alongside the SysV semaphore.
pub mod block_state {
    pub const FREE: u8 = 0;
    pub const FILLED: u8 = 1;
}

// =============================================================================
// STATUS BUFFER CARD LAYOUT
// =============================================================================

/// Total size of a status buffer: 2880 fixed-width 80-byte records.
pub const STATUS_TOTAL_SIZE: usize = 2880 * 64;
/// Size of a single status buffer record ("card").
pub const STATUS_RECORD_SIZE: usize = 80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn databuf_header_zeroed_has_no_ids() {
        let h = DatabufHeader::zeroed();
        assert_eq!(h.shmid, -1);
        assert_eq!(h.semid, -1);
        assert_eq!(h.n_block, 0);
    }

    #[test]
    fn status_sizes_match_record_grid() {
        assert_eq!(STATUS_TOTAL_SIZE % STATUS_RECORD_SIZE, 0);
        assert_eq!(STATUS_TOTAL_SIZE / STATUS_RECORD_SIZE, 2880 * 64 / 80);
    }
}
