//! Ring databuf: N fixed-size blocks in a SysV shared memory segment, each
//! guarded by its own semaphore. A block's FREE/FILLED state lives only in
//! that semaphore's value (0 = FREE, 1 = FILLED); there is no separate
//! state byte shadowing it, so nothing can alias the block's own payload.
//!
//! `wait_free` waits for a block's semaphore to reach zero (`sem_op: 0`,
//! a pure "wait for value" semop that never changes it). `wait_filled`
//! needs the opposite: block until the value is at least one *without*
//! consuming it, since the block stays FILLED until its consumer calls
//! `set_free` explicitly. That's the classic "test without consume"
//! pattern: a single `semop` with a `{sem_op: -1}` then `{sem_op: 1}` pair,
//! executed atomically. The first op blocks until the value is positive
//! and decrements it; the second immediately restores it, so the net
//! effect on the semaphore is zero but the call only returns once the
//! block was observed FILLED.

use std::ptr;
use std::time::Duration;

use hashpipe_common::{block_state, DatabufHeader};
use log::warn;

use crate::error::{HpError, Result};
use crate::ipckey;

/// Portability knob: how long a blocking wait sleeps before re-checking
/// shutdown state and retrying. Matches the original's 250ms
/// `semtimedop` timeout.
pub const BLOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(250);

pub struct RingDatabuf {
    header: DatabufHeader,
    shmid: i32,
    semid: i32,
    data: *mut u8,
}

// Safety: all mutable access to shared bytes is serialized by the
// databuf's per-block semaphores.
unsafe impl Send for RingDatabuf {}
unsafe impl Sync for RingDatabuf {}

fn total_size(header_size: usize, block_size: usize, n_block: usize) -> usize {
    header_size + n_block * block_size
}

impl RingDatabuf {
    /// Creates (or attaches to, verifying matching sizes) a ring databuf.
    pub fn create(
        instance_id: i32,
        databuf_id: i32,
        data_type: &str,
        header_size: usize,
        block_size: usize,
        n_block: usize,
    ) -> Result<Self> {
        if header_size < std::mem::size_of::<DatabufHeader>() {
            return Err(HpError::parameter(format!(
                "header_size {header_size} smaller than DatabufHeader ({})",
                std::mem::size_of::<DatabufHeader>()
            )));
        }
        if n_block == 0 {
            return Err(HpError::parameter("n_block must be > 0"));
        }

        let base_key = ipckey::databuf_key(instance_id)?;
        let key = base_key + databuf_id - 1;
        let size = total_size(header_size, block_size, n_block);

        let mut shmid = unsafe {
            libc::shmget(
                key,
                size,
                0o666 | libc::IPC_CREAT | libc::IPC_EXCL,
            )
        };
        let created = shmid != -1;
        if !created {
            let err = crate::error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(HpError::fatal(format!("shmget databuf failed: {err}")));
            }
            shmid = unsafe { libc::shmget(key, 0, 0o666) };
            if shmid == -1 {
                return Err(HpError::fatal(format!(
                    "shmget (attach) databuf failed: {}",
                    crate::error::last_os_error()
                )));
            }
        }

        unsafe {
            libc::shmctl(shmid, libc::SHM_LOCK, ptr::null_mut());
        }

        let data = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if data as isize == -1 {
            return Err(HpError::fatal(format!(
                "shmat databuf failed: {}",
                crate::error::last_os_error()
            )));
        }

        let semid = unsafe {
            libc::semget(
                key,
                n_block as i32,
                0o666 | if created { libc::IPC_CREAT } else { 0 },
            )
        };
        if semid == -1 {
            return Err(HpError::fatal(format!(
                "semget databuf failed: {}",
                crate::error::last_os_error()
            )));
        }

        let header_ptr = data as *mut DatabufHeader;
        if created {
            let mut dt = [0u8; 64];
            let bytes = data_type.as_bytes();
            let n = bytes.len().min(64);
            dt[..n].copy_from_slice(&bytes[..n]);
            let header = DatabufHeader {
                data_type: dt,
                header_size: header_size as u64,
                block_size: block_size as u64,
                n_block: n_block as u32,
                shmid,
                semid,
                _pad: [0; 4],
            };
            unsafe { ptr::write(header_ptr, header) };
            let zeros = vec![0u16; n_block];
            unsafe {
                libc::semctl(
                    semid,
                    0,
                    libc::SETALL,
                    zeros.as_ptr() as *mut libc::c_ushort,
                )
            };
        } else {
            let existing = unsafe { ptr::read(header_ptr) };
            if existing.n_block as usize != n_block || existing.block_size as usize != block_size
            {
                return Err(HpError::parameter(format!(
                    "existing databuf {databuf_id} has n_block={} block_size={}, requested n_block={n_block} block_size={block_size}",
                    existing.n_block, existing.block_size
                )));
            }
        }

        let header = unsafe { ptr::read(header_ptr) };

        Ok(RingDatabuf {
            header,
            shmid,
            semid,
            data: data as *mut u8,
        })
    }

    pub fn n_block(&self) -> usize {
        self.header.n_block as usize
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    /// Returns the byte slice for block `block_id`'s data region.
    pub fn data(&self, block_id: usize) -> Result<&[u8]> {
        if block_id >= self.n_block() {
            return Err(HpError::parameter(format!(
                "block_id {block_id} out of range [0, {})",
                self.n_block()
            )));
        }
        let offset = self.header.header_size as usize + block_id * self.block_size();
        Ok(unsafe { std::slice::from_raw_parts(self.data.add(offset), self.block_size()) })
    }

    /// Returns the mutable byte slice for block `block_id`'s data region.
    ///
    /// Takes `&self` rather than `&mut self`: exclusivity is guaranteed by
    /// the wait_free/set_filled protocol (a caller must hold the block via
    /// `wait_free` before writing and release it via `set_filled`), not by
    /// the borrow checker, the same way `data()` hands out a shared view
    /// into memory this process doesn't uniquely own.
    pub fn data_mut(&self, block_id: usize) -> Result<&mut [u8]> {
        if block_id >= self.n_block() {
            return Err(HpError::parameter(format!(
                "block_id {block_id} out of range [0, {})",
                self.n_block()
            )));
        }
        let offset = self.header.header_size as usize + block_id * self.block_size();
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data.add(offset), self.block_size()) })
    }

    /// Attaches to an existing databuf, reading its sizing from the
    /// segment itself (used by administrative tools that don't know a
    /// databuf's block layout ahead of time).
    pub fn attach(instance_id: i32, databuf_id: i32) -> Result<Self> {
        let base_key = ipckey::databuf_key(instance_id)?;
        let key = base_key + databuf_id - 1;

        let shmid = unsafe { libc::shmget(key, 0, 0o666) };
        if shmid == -1 {
            return Err(HpError::parameter(format!(
                "databuf {databuf_id} does not exist for instance {instance_id}"
            )));
        }
        let data = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if data as isize == -1 {
            return Err(HpError::fatal(format!(
                "shmat databuf failed: {}",
                crate::error::last_os_error()
            )));
        }
        let header = unsafe { ptr::read(data as *const DatabufHeader) };

        Ok(RingDatabuf {
            header,
            shmid,
            semid: header.semid,
            data: data as *mut u8,
        })
    }

    pub fn header(&self) -> &DatabufHeader {
        &self.header
    }

    fn timeout_ts() -> libc::timespec {
        libc::timespec {
            tv_sec: BLOCK_WAIT_TIMEOUT.as_secs() as libc::time_t,
            tv_nsec: BLOCK_WAIT_TIMEOUT.subsec_nanos() as libc::c_long,
        }
    }

    fn semtimedop_result(rc: i32, what: &str) -> Result<()> {
        if rc == 0 {
            return Ok(());
        }
        let err = crate::error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Err(HpError::Transient(format!("{what} timed out"))),
            Some(libc::EINTR) => Err(HpError::Signal(format!("{what} interrupted"))),
            _ => Err(HpError::fatal(format!("semtimedop failed: {err}"))),
        }
    }

    /// Blocks (up to `BLOCK_WAIT_TIMEOUT`) until block `block_id` is FREE
    /// (semaphore value 0), without changing the value.
    pub fn wait_free(&self, block_id: usize) -> Result<()> {
        let tv = Self::timeout_ts();
        let mut sops = [libc::sembuf {
            sem_num: block_id as u16,
            sem_op: 0,
            sem_flg: 0,
        }];
        let rc = unsafe { libc::semtimedop(self.semid, sops.as_mut_ptr(), 1, &tv) };
        Self::semtimedop_result(rc, "wait_free")
    }

    /// Busy-waits (no sleep) until block `block_id` is FREE.
    pub fn busywait_free(&self, block_id: usize) -> Result<()> {
        loop {
            let mut sops = [libc::sembuf {
                sem_num: block_id as u16,
                sem_op: 0,
                sem_flg: libc::IPC_NOWAIT as i16,
            }];
            let rc = unsafe { libc::semop(self.semid, sops.as_mut_ptr(), 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = crate::error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => std::hint::spin_loop(),
                _ => return Err(HpError::fatal(format!("semop failed: {err}"))),
            }
        }
    }

    /// Blocks (up to `BLOCK_WAIT_TIMEOUT` per attempt) until block
    /// `block_id` is FILLED (semaphore value >= 1), without altering it:
    /// a `{sem_op: -1}, {sem_op: 1}` pair applied atomically in one
    /// `semtimedop` call.
    pub fn wait_filled(&self, block_id: usize) -> Result<()> {
        let tv = Self::timeout_ts();
        let mut sops = [
            libc::sembuf {
                sem_num: block_id as u16,
                sem_op: -1,
                sem_flg: 0,
            },
            libc::sembuf {
                sem_num: block_id as u16,
                sem_op: 1,
                sem_flg: 0,
            },
        ];
        let rc = unsafe { libc::semtimedop(self.semid, sops.as_mut_ptr(), 2, &tv) };
        Self::semtimedop_result(rc, "wait_filled")
    }

    /// Busy-waits (no sleep) until block `block_id` is FILLED, using the
    /// same non-consuming decrement/increment pair as `wait_filled` but
    /// with `IPC_NOWAIT` instead of a timeout.
    pub fn busywait_filled(&self, block_id: usize) -> Result<()> {
        loop {
            let mut sops = [
                libc::sembuf {
                    sem_num: block_id as u16,
                    sem_op: -1,
                    sem_flg: libc::IPC_NOWAIT as i16,
                },
                libc::sembuf {
                    sem_num: block_id as u16,
                    sem_op: 1,
                    sem_flg: libc::IPC_NOWAIT as i16,
                },
            ];
            let rc = unsafe { libc::semop(self.semid, sops.as_mut_ptr(), 2) };
            if rc == 0 {
                return Ok(());
            }
            let err = crate::error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => std::hint::spin_loop(),
                _ => return Err(HpError::fatal(format!("semop failed: {err}"))),
            }
        }
    }

    pub fn set_free(&self, block_id: usize) -> Result<()> {
        let rc = unsafe { libc::semctl(self.semid, block_id as i32, libc::SETVAL, 0u32) };
        if rc != 0 {
            return Err(HpError::fatal(format!(
                "semctl(SETVAL, 0) failed: {}",
                crate::error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn set_filled(&self, block_id: usize) -> Result<()> {
        let rc = unsafe { libc::semctl(self.semid, block_id as i32, libc::SETVAL, 1u32) };
        if rc != 0 {
            return Err(HpError::fatal(format!(
                "semctl(SETVAL, 1) failed: {}",
                crate::error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Reads the block's raw semaphore value (0 = FREE, 1 = FILLED).
    pub fn block_status(&self, block_id: usize) -> u8 {
        let val = unsafe { libc::semctl(self.semid, block_id as i32, libc::GETVAL) };
        if val > 0 {
            block_state::FILLED
        } else {
            block_state::FREE
        }
    }

    pub fn total_status(&self) -> usize {
        (0..self.n_block())
            .filter(|&b| self.block_status(b) == block_state::FILLED)
            .count()
    }

    pub fn total_mask(&self) -> u64 {
        let mut mask = 0u64;
        for b in 0..self.n_block().min(64) {
            if self.block_status(b) == block_state::FILLED {
                mask |= 1 << b;
            }
        }
        mask
    }

    pub fn clear(&self) {
        for b in 0..self.n_block() {
            let _ = self.set_free(b);
        }
    }

    pub fn shmid(&self) -> i32 {
        self.shmid
    }

    pub fn semid(&self) -> i32 {
        self.semid
    }

    /// Marks the shared memory segment and semaphore set for destruction:
    /// both are removed once every attached process (including this one,
    /// after `Drop` detaches) has released them. Used by the admin CLI's
    /// `clean-shmem` subcommand to reclaim orphaned buffers after a worker
    /// crash; a running pipeline should never call this on a buffer it
    /// still needs.
    pub fn remove(self) -> Result<()> {
        let shmid = self.shmid;
        let semid = self.semid;
        drop(self);
        let rv = unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
        if rv != 0 {
            return Err(HpError::fatal(format!(
                "shmctl(IPC_RMID) on databuf {shmid} failed: {}",
                crate::error::last_os_error()
            )));
        }
        let rv = unsafe { libc::semctl(semid, 0, libc::IPC_RMID) };
        if rv != 0 {
            return Err(HpError::fatal(format!(
                "semctl(IPC_RMID) on databuf semaphore set {semid} failed: {}",
                crate::error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for RingDatabuf {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                libc::shmdt(self.data as *const libc::c_void);
            }
            self.data = ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for RingDatabuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingDatabuf")
            .field("shmid", &self.shmid)
            .field("semid", &self.semid)
            .field("n_block", &self.n_block())
            .field("block_size", &self.block_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn unique_instance(seed: i32) -> i32 {
        ((std::process::id() as i32).wrapping_add(seed * 7919)) & 0x3f
    }

    #[test]
    fn create_then_set_filled_reflects_in_status() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(10);
        let db = RingDatabuf::create(id, 1, "TEST", 128, 4096, 4).expect("create");
        assert_eq!(db.total_status(), 0);
        db.set_filled(0).unwrap();
        assert_eq!(db.block_status(0), block_state::FILLED);
        assert_eq!(db.total_status(), 1);
        db.set_free(0).unwrap();
        assert_eq!(db.total_status(), 0);
    }

    #[test]
    fn block_id_out_of_range_is_a_parameter_error() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(11);
        let db = RingDatabuf::create(id, 2, "TEST", 128, 4096, 2).expect("create");
        assert!(db.data(5).is_err());
    }

    #[test]
    fn reattach_with_mismatched_sizing_is_rejected() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(12);
        let _db = RingDatabuf::create(id, 3, "TEST", 128, 4096, 2).expect("create");
        let err = RingDatabuf::create(id, 3, "TEST", 128, 4096, 8);
        assert!(err.is_err());
    }

    #[test]
    fn total_mask_reflects_filled_blocks() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(13);
        let db = RingDatabuf::create(id, 4, "TEST", 128, 1024, 3).expect("create");
        db.set_filled(0).unwrap();
        db.set_filled(2).unwrap();
        assert_eq!(db.total_mask(), 0b101);
    }

    #[test]
    fn busywait_free_returns_once_set_free_is_called() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(14);
        let db = RingDatabuf::create(id, 5, "TEST", 128, 1024, 1).expect("create");
        db.set_filled(0).unwrap();
        db.set_free(0).unwrap();
        db.busywait_free(0).expect("already free");
    }

    #[test]
    fn remove_destroys_segment_so_attach_creates_fresh_one() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(15);
        let db = RingDatabuf::create(id, 6, "TEST", 128, 1024, 2).expect("create");
        db.set_filled(0).unwrap();
        db.remove().expect("remove");

        let fresh = RingDatabuf::create(id, 6, "TEST", 128, 1024, 2).expect("recreate");
        assert_eq!(fresh.total_status(), 0);
    }
}
