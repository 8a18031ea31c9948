//! Filesystem state memos.  A memo captures the meta-information of one
//! filesystem object (or its absence) that redo decisions depend on, and has
//! a compact binary encoding for storage in the run-database.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Stat fields a dependency comparison looks at, all as reported by the
/// filesystem without rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSummary {
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
}

/// State of one filesystem object.  `stat: None` models "object is absent".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsObjectMemo {
    pub stat: Option<StatSummary>,
    /// Target of a symbolic link; `None` for everything else.
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Regular,
    Directory,
    Symlink,
    Other,
    Absent,
}

const S_IFMT: u32 = libc::S_IFMT as u32;

pub fn kind_of_mode(mode: u32) -> FsKind {
    match mode & S_IFMT {
        m if m == libc::S_IFREG as u32 => FsKind::Regular,
        m if m == libc::S_IFDIR as u32 => FsKind::Directory,
        m if m == libc::S_IFLNK as u32 => FsKind::Symlink,
        _ => FsKind::Other,
    }
}

impl FsObjectMemo {
    pub fn kind(&self) -> FsKind {
        match &self.stat {
            None => FsKind::Absent,
            Some(s) => kind_of_mode(s.mode),
        }
    }
}

pub fn mtime_ns_of(meta: &std::fs::Metadata) -> i64 {
    meta.mtime()
        .wrapping_mul(1_000_000_000)
        .wrapping_add(meta.mtime_nsec())
}

/// lstat() an on-disk path, producing its memo.  A missing object yields the
/// absent memo; every other error is propagated.
pub fn read_memo(abs_path: &Path) -> std::io::Result<FsObjectMemo> {
    let meta = match std::fs::symlink_metadata(abs_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FsObjectMemo::default())
        }
        Err(err) => return Err(err),
    };
    let stat = StatSummary {
        mode: meta.mode(),
        size: meta.size(),
        mtime_ns: mtime_ns_of(&meta),
        uid: meta.uid(),
        gid: meta.gid(),
    };
    let symlink_target = if kind_of_mode(stat.mode) == FsKind::Symlink {
        let target = std::fs::read_link(abs_path)?;
        Some(target.to_string_lossy().into_owned())
    } else {
        None
    };
    Ok(FsObjectMemo {
        stat: Some(stat),
        symlink_target,
    })
}

const MEMO_ABSENT: u8 = 0;
const MEMO_PRESENT: u8 = 1;

/// Serialize a memo.  The encoding is fixed-layout little-endian; it only
/// ever travels through the run-database of the same machine.
pub fn encode_memo(memo: &FsObjectMemo) -> Vec<u8> {
    let stat = match &memo.stat {
        None => return vec![MEMO_ABSENT],
        Some(stat) => stat,
    };
    let mut out = Vec::with_capacity(32);
    out.push(MEMO_PRESENT);
    out.extend_from_slice(&stat.mode.to_le_bytes());
    out.extend_from_slice(&stat.size.to_le_bytes());
    out.extend_from_slice(&stat.mtime_ns.to_le_bytes());
    out.extend_from_slice(&stat.uid.to_le_bytes());
    out.extend_from_slice(&stat.gid.to_le_bytes());
    if kind_of_mode(stat.mode) == FsKind::Symlink {
        let target = memo.symlink_target.as_deref().unwrap_or("");
        out.extend_from_slice(&(target.len() as u32).to_le_bytes());
        out.extend_from_slice(target.as_bytes());
    }
    out
}

/// Inverse of [`encode_memo`]; rejects truncated or trailing bytes.
pub fn decode_memo(encoded: &[u8]) -> Result<FsObjectMemo, ()> {
    match encoded.split_first() {
        Some((&MEMO_ABSENT, rest)) if rest.is_empty() => Ok(FsObjectMemo::default()),
        Some((&MEMO_PRESENT, rest)) => {
            if rest.len() < 28 {
                return Err(());
            }
            let mode = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            let size = u64::from_le_bytes(rest[4..12].try_into().unwrap());
            let mtime_ns = i64::from_le_bytes(rest[12..20].try_into().unwrap());
            let uid = u32::from_le_bytes(rest[20..24].try_into().unwrap());
            let gid = u32::from_le_bytes(rest[24..28].try_into().unwrap());
            let rest = &rest[28..];
            let symlink_target = if kind_of_mode(mode) == FsKind::Symlink {
                if rest.len() < 4 {
                    return Err(());
                }
                let len = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
                if rest.len() != 4 + len {
                    return Err(());
                }
                Some(String::from_utf8(rest[4..].to_vec()).map_err(|_| ())?)
            } else {
                if !rest.is_empty() {
                    return Err(());
                }
                None
            };
            Ok(FsObjectMemo {
                stat: Some(StatSummary {
                    mode,
                    size,
                    mtime_ns,
                    uid,
                    gid,
                }),
                symlink_target,
            })
        }
        _ => Err(()),
    }
}

/// Compare the present state of an input dependency with its encoded state
/// from before the last successful redo.
///
/// Returns `None` when the states agree (no redo necessary because of this
/// dependency), or a short line describing the change otherwise.
pub fn compare_memo_to_recorded(
    memo: &FsObjectMemo,
    last_encoded: Option<&[u8]>,
    is_explicit: bool,
    ignore_permission: bool,
) -> Option<&'static str> {
    let last_encoded = match last_encoded {
        None if is_explicit => {
            return Some("output dependency of a tool instance potentially changed by a redo")
        }
        None => return Some("was a new dependency or was potentially changed by a redo"),
        Some(e) => e,
    };

    let last = match decode_memo(last_encoded) {
        Ok(last) => last,
        Err(()) => return Some("state before last successful redo is unknown"),
    };

    let (stat, last_stat) = match (&memo.stat, &last.stat) {
        (Some(_), None) if is_explicit => return Some("filesystem object did not exist"),
        (Some(a), Some(b)) => (a, b),
        (None, None) => return None,
        _ => return Some("existence has changed"),
    };

    if stat.mode & S_IFMT != last_stat.mode & S_IFMT {
        return Some("type of filesystem object has changed");
    }
    if kind_of_mode(stat.mode) == FsKind::Symlink && memo.symlink_target != last.symlink_target {
        return Some("symbolic link target has changed");
    }
    if stat.size != last_stat.size {
        return Some("size has changed");
    }
    if stat.mtime_ns != last_stat.mtime_ns {
        return Some("mtime has changed");
    }
    if !ignore_permission
        && (stat.mode, stat.uid, stat.gid) != (last_stat.mode, last_stat.uid, last_stat.gid)
    {
        return Some("permissions or owner have changed");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(mtime_ns: i64, size: u64) -> FsObjectMemo {
        FsObjectMemo {
            stat: Some(StatSummary {
                mode: libc::S_IFREG as u32 | 0o644,
                size,
                mtime_ns,
                uid: 1000,
                gid: 1000,
            }),
            symlink_target: None,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let memo = regular(1_234_567_890_123, 42);
        assert_eq!(decode_memo(&encode_memo(&memo)).unwrap(), memo);

        let absent = FsObjectMemo::default();
        assert_eq!(decode_memo(&encode_memo(&absent)).unwrap(), absent);

        let link = FsObjectMemo {
            stat: Some(StatSummary {
                mode: libc::S_IFLNK as u32 | 0o777,
                size: 3,
                mtime_ns: 7,
                uid: 0,
                gid: 0,
            }),
            symlink_target: Some("abc".to_string()),
        };
        assert_eq!(decode_memo(&encode_memo(&link)).unwrap(), link);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_memo(b"").is_err());
        assert!(decode_memo(&[2]).is_err());
        assert!(decode_memo(&[1, 0, 0]).is_err());
        let mut ok = encode_memo(&regular(1, 1));
        ok.push(0);
        assert!(decode_memo(&ok).is_err());
    }

    #[test]
    fn compare_no_change() {
        let memo = regular(100, 5);
        let enc = encode_memo(&memo);
        assert_eq!(
            compare_memo_to_recorded(&memo, Some(&enc), true, false),
            None
        );
    }

    #[test]
    fn compare_reports_reason() {
        let before = regular(100, 5);
        let enc = encode_memo(&before);

        assert_eq!(
            compare_memo_to_recorded(&regular(101, 5), Some(&enc), true, false),
            Some("mtime has changed")
        );
        assert_eq!(
            compare_memo_to_recorded(&regular(100, 6), Some(&enc), true, false),
            Some("size has changed")
        );

        let mut other_owner = regular(100, 5);
        other_owner.stat.as_mut().unwrap().uid = 1;
        assert_eq!(
            compare_memo_to_recorded(&other_owner, Some(&enc), true, false),
            Some("permissions or owner have changed")
        );
        assert_eq!(
            compare_memo_to_recorded(&other_owner, Some(&enc), true, true),
            None
        );
    }

    #[test]
    fn compare_existence() {
        let memo = regular(100, 5);
        let absent = FsObjectMemo::default();
        let enc_absent = encode_memo(&absent);

        assert_eq!(
            compare_memo_to_recorded(&memo, Some(&enc_absent), true, false),
            Some("filesystem object did not exist")
        );
        assert_eq!(
            compare_memo_to_recorded(&absent, Some(&encode_memo(&memo)), false, false),
            Some("existence has changed")
        );
        // Absent before and after: nothing changed.
        assert_eq!(
            compare_memo_to_recorded(&absent, Some(&enc_absent), false, false),
            None
        );
        // No recorded state at all.
        assert_eq!(
            compare_memo_to_recorded(&memo, None, false, false),
            Some("was a new dependency or was potentially changed by a redo")
        );
    }

    #[test]
    fn compare_undecodable_record() {
        assert_eq!(
            compare_memo_to_recorded(&regular(1, 1), Some(b"xx"), true, false),
            Some("state before last successful redo is unknown")
        );
    }
}
