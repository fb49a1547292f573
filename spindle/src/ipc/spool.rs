//! Temp-file spooling for payloads larger than one datagram.
//!
//! A spooled payload travels as `[len: u64 LE][path bytes]` with the
//! [`TaskFlags::TMPFILE`] flag set.

use super::envelope::{IPC_BUFFER_SIZE, TaskFlags};
use crate::error::IpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::warn;

const PREFIX: &str = "spindle-task-";

/// Make `data` fit inline, spooling it to `tmpdir` if it does not.
pub fn pack(data: Bytes, flags: TaskFlags, tmpdir: &Path) -> Result<(Bytes, TaskFlags), IpcError> {
    if data.len() <= IPC_BUFFER_SIZE {
        return Ok((data, flags.without(TaskFlags::TMPFILE)));
    }
    let mut file = tempfile::Builder::new()
        .prefix(PREFIX)
        .tempfile_in(tmpdir)
        .map_err(IpcError::Spool)?;
    file.write_all(&data).map_err(IpcError::Spool)?;
    let (_, path) = file.keep().map_err(|e| IpcError::Spool(e.error))?;

    let path_bytes = path.as_os_str().as_bytes();
    let mut payload = BytesMut::with_capacity(8 + path_bytes.len());
    payload.put_u64_le(data.len() as u64);
    payload.put_slice(path_bytes);
    Ok((payload.freeze(), flags | TaskFlags::TMPFILE))
}

/// Recover the payload packed by [`pack`], returning the caller's flags.
///
/// The spool file is removed unless `PEEK` is set.
pub fn unpack(payload: &Bytes, flags: TaskFlags) -> Result<(Bytes, TaskFlags), IpcError> {
    if !flags.contains(TaskFlags::TMPFILE) {
        return Ok((payload.clone(), flags));
    }
    let (len, path) = spool_ref(payload)?;
    let data = std::fs::read(&path).map_err(IpcError::Spool)?;
    if data.len() as u64 != len {
        return Err(IpcError::Malformed("spool file length mismatch"));
    }
    if !flags.contains(TaskFlags::PEEK)
        && let Err(e) = std::fs::remove_file(&path)
    {
        warn!(path = %path.display(), error = %e, "failed to remove spool file");
    }
    Ok((Bytes::from(data), flags.without(TaskFlags::TMPFILE)))
}

/// Path of the spool file referenced by a packed payload.
pub fn spool_ref(payload: &Bytes) -> Result<(u64, PathBuf), IpcError> {
    if payload.len() <= 8 {
        return Err(IpcError::Malformed("spool reference too short"));
    }
    let mut buf = &payload[..];
    let len = buf.get_u64_le();
    Ok((len, PathBuf::from(OsStr::from_bytes(buf))))
}
