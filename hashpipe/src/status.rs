//! Status buffer: a fixed-size SysV shared memory segment holding FITS-style
//! keyword records, guarded by a POSIX named semaphore used as a binary
//! mutex.

use std::env;
use std::ffi::CString;
use std::ptr;

use hashpipe_common::STATUS_TOTAL_SIZE;
use log::warn;

use crate::error::{HpError, Result};
use crate::fits;
use crate::ipckey;

/// Derives the POSIX semaphore name used to lock a status buffer.
///
/// `HASHPIPE_STATUS_SEMNAME` is used verbatim if set. Otherwise the base
/// path (`HASHPIPE_KEYFILE`, else `HOME`, else `/tmp`) has every `/` after
/// its first byte replaced with `_` (the leading `/` is preserved) and is
/// suffixed with `_hashpipe_status_<instance_id & 0x3f>`.
pub fn semname(instance_id: i32) -> String {
    if let Ok(envstr) = env::var("HASHPIPE_STATUS_SEMNAME") {
        return envstr;
    }
    let base = env::var("HASHPIPE_KEYFILE")
        .or_else(|_| env::var("HOME"))
        .unwrap_or_else(|_| "/tmp".to_string());
    let mut sanitized: String = base.chars().take(1).collect();
    if base.len() > 1 {
        sanitized.push_str(
            &base[1..]
                .chars()
                .map(|c| if c == '/' { '_' } else { c })
                .collect::<String>(),
        );
    }
    format!("{sanitized}_hashpipe_status_{}", instance_id & 0x3f)
}

pub struct StatusBuffer {
    instance_id: i32,
    shmid: i32,
    lock: *mut libc::sem_t,
    buf: *mut u8,
}

// Safety: access is always mediated by the POSIX semaphore `lock`; the raw
// pointers refer to a SysV shared memory segment and a named semaphore, both
// kernel-managed resources valid for the process's lifetime.
unsafe impl Send for StatusBuffer {}

impl StatusBuffer {
    /// Returns true if a status buffer already exists for `instance_id`
    /// without creating one.
    pub fn exists(instance_id: i32) -> bool {
        let instance_id = instance_id & 0x3f;
        let key = match ipckey::status_key(instance_id) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let shmid = unsafe { libc::shmget(key, STATUS_TOTAL_SIZE, 0o666) };
        shmid != -1
    }

    /// Attaches to (creating if necessary) the status buffer for
    /// `instance_id`, initializing it if it has no `END` record yet.
    pub fn attach(instance_id: i32) -> Result<Self> {
        let instance_id = instance_id & 0x3f;
        let key = ipckey::status_key(instance_id)?;

        let shmid = unsafe { libc::shmget(key, STATUS_TOTAL_SIZE, 0o666 | libc::IPC_CREAT) };
        if shmid == -1 {
            return Err(HpError::fatal(format!(
                "shmget status buffer failed: {}",
                crate::error::last_os_error()
            )));
        }

        let buf = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if buf as isize == -1 {
            return Err(HpError::fatal(format!(
                "shmat status buffer failed: {}",
                crate::error::last_os_error()
            )));
        }

        let semname = semname(instance_id);
        let csemname = CString::new(semname.clone())
            .map_err(|_| HpError::parameter(format!("semaphore name has NUL: {semname:?}")))?;

        let old_umask = unsafe { libc::umask(0) };
        let lock = unsafe { libc::sem_open(csemname.as_ptr(), libc::O_CREAT, 0o666u32, 1u32) };
        unsafe { libc::umask(old_umask) };
        if lock == libc::SEM_FAILED {
            return Err(HpError::fatal(format!(
                "sem_open({semname}) failed: {}",
                crate::error::last_os_error()
            )));
        }

        let s = StatusBuffer {
            instance_id,
            shmid,
            lock: lock as *mut libc::sem_t,
            buf: buf as *mut u8,
        };
        s.chkinit();
        Ok(s)
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf, STATUS_TOTAL_SIZE) }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf, STATUS_TOTAL_SIZE) }
    }

    pub fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::sem_wait(self.lock) };
        if rc != 0 {
            return Err(crate::error::last_os_error().into());
        }
        Ok(())
    }

    pub fn lock_busywait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_trywait(self.lock) };
            if rc == 0 {
                return Ok(());
            }
            let err = crate::error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                return Err(err.into());
            }
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.lock) };
        if rc != 0 {
            return Err(crate::error::last_os_error().into());
        }
        Ok(())
    }

    /// If no `END` record exists yet, zero the buffer, write a blank first
    /// record, an `END` sentinel and an `INSTANCE` key. If `END` already
    /// exists, ensure `INSTANCE` is present and matches this instance id,
    /// overwriting (with a warning) if it mismatches.
    fn chkinit(&self) {
        let _ = self.lock();
        // Safety: exclusive access is held via the semaphore lock above.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.buf, STATUS_TOTAL_SIZE) };
        if fits::find_end(buf).is_none() {
            for b in buf.iter_mut() {
                *b = 0;
            }
            for b in buf[0..hashpipe_common::STATUS_RECORD_SIZE].iter_mut() {
                *b = b' ';
            }
            buf[0..3].copy_from_slice(b"END");
            fits::put_i32(buf, "INSTANCE", self.instance_id);
        } else {
            match fits::get_i32(buf, "INSTANCE") {
                None => fits::put_i32(buf, "INSTANCE", self.instance_id),
                Some(existing) if existing != self.instance_id => {
                    warn!(
                        "Existing INSTANCE value {existing} != desired value {}",
                        self.instance_id
                    );
                    fits::put_i32(buf, "INSTANCE", self.instance_id);
                }
                Some(_) => {}
            }
        }
        let _ = self.unlock();
    }

    /// Unconditionally resets the buffer to a blank state with only `END`
    /// and `INSTANCE` records, regardless of prior content.
    pub fn clear(&mut self) -> Result<()> {
        self.lock()?;
        let instance_id = self.instance_id;
        let buf = self.as_slice_mut();
        for b in buf.iter_mut() {
            *b = 0;
        }
        for b in buf[0..hashpipe_common::STATUS_RECORD_SIZE].iter_mut() {
            *b = b' ';
        }
        buf[0..3].copy_from_slice(b"END");
        fits::put_i32(buf, "INSTANCE", instance_id);
        self.unlock()
    }

    pub fn get_i32(&self, key: &str) -> Result<Option<i32>> {
        self.lock()?;
        let v = fits::get_i32(self.as_slice(), key);
        self.unlock()?;
        Ok(v)
    }

    pub fn get_str(&self, key: &str) -> Result<Option<String>> {
        self.lock()?;
        let v = fits::get_str(self.as_slice(), key).map(str::to_owned);
        self.unlock()?;
        Ok(v)
    }

    pub fn put_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.lock()?;
        fits::put_i32(self.as_slice_mut(), key, value);
        self.unlock()
    }

    pub fn put_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.lock()?;
        fits::put_str(self.as_slice_mut(), key, value);
        self.unlock()
    }

    /// Dumps every key/value pair up to the `END` record.
    pub fn dump(&self) -> Result<Vec<(String, String)>> {
        self.lock()?;
        let buf = self.as_slice();
        let end = fits::find_end(buf).unwrap_or(0);
        let mut out = Vec::new();
        let mut offs = 0;
        while offs < end {
            let card = &buf[offs..offs + hashpipe_common::STATUS_RECORD_SIZE];
            let key = std::str::from_utf8(&card[0..8])
                .unwrap_or("")
                .trim_end()
                .to_string();
            if !key.is_empty() {
                if let Some(v) = fits::get_str(buf, &key) {
                    out.push((key, v.to_string()));
                }
            }
            offs += hashpipe_common::STATUS_RECORD_SIZE;
        }
        self.unlock()?;
        Ok(out)
    }

    /// Marks the shared memory segment for destruction and unlinks the
    /// named semaphore, so both go away once every attached process has
    /// released them. Used by the admin CLI's `clean-shmem` subcommand.
    pub fn remove(self) -> Result<()> {
        let shmid = self.shmid;
        let instance_id = self.instance_id;
        let semname = semname(instance_id);
        drop(self);
        let rv = unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
        if rv != 0 {
            return Err(HpError::fatal(format!(
                "shmctl(IPC_RMID) on status buffer {shmid} failed: {}",
                crate::error::last_os_error()
            )));
        }
        let csemname = CString::new(semname.clone())
            .map_err(|_| HpError::parameter(format!("semaphore name has NUL: {semname:?}")))?;
        let rv = unsafe { libc::sem_unlink(csemname.as_ptr()) };
        if rv != 0 {
            return Err(HpError::fatal(format!(
                "sem_unlink({semname}) failed: {}",
                crate::error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for StatusBuffer {
    fn drop(&mut self) {
        if !self.buf.is_null() {
            unsafe {
                libc::shmdt(self.buf as *const libc::c_void);
            }
            self.buf = ptr::null_mut();
        }
        if !self.lock.is_null() {
            unsafe {
                libc::sem_close(self.lock);
            }
            self.lock = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn unique_instance(seed: i32) -> i32 {
        ((std::process::id() as i32).wrapping_add(seed)) & 0x3f
    }

    #[test]
    fn attach_initializes_instance_key() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(1);
        let s = StatusBuffer::attach(id).expect("attach");
        assert_eq!(s.get_i32("INSTANCE").unwrap(), Some(id));
    }

    #[test]
    fn put_then_get_roundtrips_under_lock() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(2);
        let mut s = StatusBuffer::attach(id).expect("attach");
        s.put_str("DATADIR", "/obs/data").unwrap();
        assert_eq!(s.get_str("DATADIR").unwrap().as_deref(), Some("/obs/data"));
    }

    #[test]
    fn clear_resets_to_blank_with_instance() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(3);
        let mut s = StatusBuffer::attach(id).expect("attach");
        s.put_str("FOO", "bar").unwrap();
        s.clear().unwrap();
        assert_eq!(s.get_str("FOO").unwrap(), None);
        assert_eq!(s.get_i32("INSTANCE").unwrap(), Some(id));
    }

    #[test]
    fn remove_destroys_segment_so_attach_reinitializes() {
        let _g = ENV_LOCK.lock().unwrap();
        let id = unique_instance(4);
        let mut s = StatusBuffer::attach(id).expect("attach");
        s.put_str("DATADIR", "/obs/data").unwrap();
        s.remove().expect("remove");

        let fresh = StatusBuffer::attach(id).expect("reattach");
        assert_eq!(fresh.get_str("DATADIR").unwrap(), None);
    }

    #[test]
    fn semname_preserves_leading_slash_and_replaces_rest() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("HASHPIPE_KEYFILE", "/home/obs/user") };
        unsafe { env::remove_var("HASHPIPE_STATUS_SEMNAME") };
        let name = semname(2);
        assert!(name.starts_with('/'));
        assert!(!name[1..].contains('/'));
        assert!(name.ends_with("_hashpipe_status_2"));
        unsafe { env::remove_var("HASHPIPE_KEYFILE") };
    }
}
