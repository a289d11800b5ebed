//! Flag-byte atomic write protocol for shared-storage files.
//!
//! Cloud-sync daemons commonly propagate a file's bytes partially, and some
//! interpret a rename-based atomic swap as delete-then-create (filling a
//! trash folder). So instead of writing to a temp file and renaming,
//! snapshots/packs/updates are written with byte 0 as a commit flag:
//!
//! - `0x00` ("incomplete") is written first, the payload is flushed, then
//!   byte 0 is overwritten with `0x01` ("complete") and flushed again.
//! - Readers check byte 0 before trusting the rest of the file.

use std::path::Path;

use crate::error::{CoreError, Result};
use crate::fs::FileSystem;

/// Byte 0 value meaning "still being written".
pub const FLAG_INCOMPLETE: u8 = 0x00;

/// Byte 0 value meaning "safe to read".
pub const FLAG_COMPLETE: u8 = 0x01;

/// Write `payload` to `path` using the flag-byte commit protocol.
///
/// On return, `path` either does not exist (if this call failed before the
/// second flush) or is fully readable; it is never observable by a
/// concurrent reader as anything other than "absent" or "fully valid",
/// modulo whatever partial-byte-propagation a sync daemon performs in
/// between (which readers handle via [`read_flagged`]).
pub fn write_flagged(fs: &dyn FileSystem, path: &Path, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(FLAG_INCOMPLETE);
    buf.extend_from_slice(payload);
    fs.write_binary(path, &buf).map_err(|e| CoreError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Flip the flag byte in place. On a real filesystem this is a second
    // write of the same length, not a rename, so sync daemons that treat
    // renames as delete+create never see one.
    buf[0] = FLAG_COMPLETE;
    fs.write_binary(path, &buf).map_err(|e| CoreError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Outcome of reading a flag-byte file.
pub enum FlaggedRead {
    /// Byte 0 was `0x01`; here is the payload (bytes 1..N).
    Complete(Vec<u8>),
    /// Byte 0 was `0x00`: not yet ready. Not an error — schedule a retry.
    Partial,
}

/// Read a flag-byte file, distinguishing "not yet ready" from "corrupt".
///
/// Returns `Ok(FlaggedRead::Partial)` if byte 0 is `0x00` (caller should
/// retry later), `Ok(FlaggedRead::Complete(payload))` if byte 0 is `0x01`,
/// or `Err(CoreError::CorruptFile)` for any other byte-0 value or an empty
/// file.
pub fn read_flagged(fs: &dyn FileSystem, path: &Path) -> Result<FlaggedRead> {
    let bytes = fs.read_binary(path).map_err(|e| CoreError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    match bytes.first() {
        None => Err(CoreError::CorruptFile {
            path: path.to_path_buf(),
            reason: "file is empty, no flag byte".to_string(),
        }),
        Some(&FLAG_INCOMPLETE) => Ok(FlaggedRead::Partial),
        Some(&FLAG_COMPLETE) => Ok(FlaggedRead::Complete(bytes[1..].to_vec())),
        Some(other) => Err(CoreError::CorruptFile {
            path: path.to_path_buf(),
            reason: format!("invalid flag byte 0x{other:02x}"),
        }),
    }
}

/// Append one line (`payload` plus a trailing `\n`) to an append-only log
/// file, creating it if necessary.
///
/// Readers of these logs must tolerate a trailing partial line, since a
/// reader may observe the file mid-append; that tolerance lives in the
/// line-splitting logic of the activity/deletion log readers, not here.
pub fn append_line(fs: &dyn FileSystem, path: &Path, payload: &str) -> Result<()> {
    fs.append_line(path, payload).map_err(|e| CoreError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}
