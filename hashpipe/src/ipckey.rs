//! Derives SysV IPC keys for databufs and status buffers.
//!
//! The base keyfile path is `$HASHPIPE_KEYFILE`, falling back to `$HOME`,
//! falling back to `/tmp`. Individual key values can be overridden outright
//! via `$HASHPIPE_DATABUF_KEY`/`$HASHPIPE_STATUS_KEY`.

use std::env;
use std::ffi::CString;

use crate::error::{HpError, Result};

extern "C" {
    fn ftok(pathname: *const libc::c_char, proj_id: libc::c_int) -> libc::key_t;
}

fn keyfile_path() -> String {
    env::var("HASHPIPE_KEYFILE")
        .or_else(|_| env::var("HOME"))
        .unwrap_or_else(|_| "/tmp".to_string())
}

/// Calls `ftok(keyfile, proj_id)`, mapping failure to a `Parameter` error.
pub fn ipckey(proj_id: i32) -> Result<libc::key_t> {
    let path = keyfile_path();
    let cpath = CString::new(path.clone())
        .map_err(|_| HpError::parameter(format!("keyfile path contains NUL: {path:?}")))?;
    let key = unsafe { ftok(cpath.as_ptr(), proj_id) };
    if key == -1 {
        return Err(HpError::parameter(format!(
            "ftok({path:?}, {proj_id}) failed: {}",
            crate::error::last_os_error()
        )));
    }
    Ok(key)
}

/// Key used for instance `instance_id`'s ring databufs.
///
/// proj_id pattern is `10XXXXXX` in binary (0x80 | low 6 bits of instance).
pub fn databuf_key(instance_id: i32) -> Result<libc::key_t> {
    if let Ok(raw) = env::var("HASHPIPE_DATABUF_KEY") {
        return raw
            .parse::<u32>()
            .map(|v| v as libc::key_t)
            .map_err(|_| HpError::parameter(format!("HASHPIPE_DATABUF_KEY not an integer: {raw}")));
    }
    ipckey(((instance_id & 0x3f) | 0x80) as i32)
}

/// Key used for instance `instance_id`'s status buffer.
///
/// proj_id pattern is `01XXXXXX` in binary (0x40 | low 6 bits of instance).
pub fn status_key(instance_id: i32) -> Result<libc::key_t> {
    if let Ok(raw) = env::var("HASHPIPE_STATUS_KEY") {
        return raw
            .parse::<u32>()
            .map(|v| v as libc::key_t)
            .map_err(|_| HpError::parameter(format!("HASHPIPE_STATUS_KEY not an integer: {raw}")));
    }
    ipckey(((instance_id & 0x3f) | 0x40) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn databuf_key_respects_env_override() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("HASHPIPE_DATABUF_KEY", "424242") };
        let k = databuf_key(3).unwrap();
        assert_eq!(k as u32, 424242);
        unsafe { env::remove_var("HASHPIPE_DATABUF_KEY") };
    }

    #[test]
    fn status_key_respects_env_override() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("HASHPIPE_STATUS_KEY", "99") };
        let k = status_key(0).unwrap();
        assert_eq!(k as u32, 99);
        unsafe { env::remove_var("HASHPIPE_STATUS_KEY") };
    }

    #[test]
    fn databuf_key_differs_by_instance_without_override() {
        let _g = ENV_LOCK.lock().unwrap();
        unsafe { env::remove_var("HASHPIPE_DATABUF_KEY") };
        unsafe { env::remove_var("HASHPIPE_KEYFILE") };
        let k0 = databuf_key(0).unwrap();
        let k1 = databuf_key(1).unwrap();
        assert_ne!(k0, k1);
    }
}
