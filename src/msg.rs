//! Wire messages.
//!
//! Every message travels as a fixed-size frame: a `u32` tag followed by a
//! tag-specific payload at offset 8. Integer fields are host byte order;
//! deployments are homogeneous and a cross-architecture extension would add
//! explicit encoding. Dispatch is a `match` on the decoded [`Msg`], so an
//! unhandled kind is a compile error rather than a missing table entry.

use std::fmt;
use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of every frame on the wire.
pub const FRAME_LEN: usize = 96;

/// Maximum length of a session identifier.
pub const SID_LEN: usize = 32;

/// Capacity of the inline data window carried by `SYNC_INFO`.
///
/// 64 bytes covers the widest x86-64 store operand.
pub const SYNC_DATA_MAX: usize = 64;

const TAG_GET_SESSION: u32 = 1;
const TAG_SET_SESSION: u32 = 2;
const TAG_DEL_SESSION: u32 = 3;
const TAG_ADD_PROC: u32 = 4;
const TAG_SET_GID: u32 = 5;
const TAG_STOP_ALL: u32 = 6;
const TAG_STOP_DONE: u32 = 7;
const TAG_WRITE_OKAY: u32 = 8;
const TAG_SYNC_REQ: u32 = 9;
const TAG_SYNC_INFO: u32 = 10;
const TAG_SYNC_DONE: u32 = 11;
const TAG_CONT_ALL: u32 = 12;
const TAG_WAIT_BARR: u32 = 13;
const TAG_WAIT_DONE: u32 = 14;
const TAG_PRGM_DONE: u32 = 15;

/// Errors produced while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    #[error("sync window of {0} bytes exceeds the inline buffer")]
    Oversize(u32),
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// An opaque session identifier, at most [`SID_LEN`] bytes.
///
/// Stored NUL-padded; two identifiers compare equal iff their padded forms
/// do.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SID_LEN]);

impl SessionId {
    /// Builds an identifier from a string, truncation is refused.
    pub fn new(s: &str) -> Option<SessionId> {
        if s.is_empty() || s.len() > SID_LEN {
            return None;
        }
        let mut buf = [0; SID_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        Some(SessionId(buf))
    }

    pub fn as_bytes(&self) -> &[u8; SID_LEN] {
        &self.0
    }

    fn from_bytes(buf: [u8; SID_LEN]) -> SessionId {
        SessionId(buf)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SID_LEN);
        f.write_str(&String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Payload of a `SYNC_INFO` frame: the window of page bytes a writer
/// published, addressed relative to the start of the shared data region.
#[derive(Clone, Copy)]
pub struct SyncInfo {
    pub offset: u64,
    pub size: u32,
    pub data: [u8; SYNC_DATA_MAX],
}

impl SyncInfo {
    pub fn new(offset: u64, bytes: &[u8]) -> SyncInfo {
        assert!(bytes.len() <= SYNC_DATA_MAX);
        let mut data = [0; SYNC_DATA_MAX];
        data[..bytes.len()].copy_from_slice(bytes);
        SyncInfo {
            offset,
            size: bytes.len() as u32,
            data,
        }
    }

    /// The valid prefix of the inline window.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

// The inline buffer is noise in logs; show the window coordinates only.
impl fmt::Debug for SyncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncInfo")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// All message kinds, tagged by direction in the protocol description:
/// D = daemon, S = session server, A = arbiter, P = participant.
#[derive(Debug, Clone, Copy)]
pub enum Msg {
    /// [A→D] Look up (and lazily create) a session.
    GetSession { sid: SessionId, nproc: u32 },
    /// [S→D, D→A] Announce or relay a session server's port.
    SetSession { sid: SessionId, port: u32 },
    /// [S→D] Drop a session directory entry.
    DelSession { sid: SessionId },
    /// [P→A, A→S] Register a participant process.
    AddProc { pid: i32 },
    /// [S→A, A→P] Assign a global identifier to a registered pid.
    SetGid { pid: i32, gid: i32 },
    /// [S→A] Suspend every local participant.
    StopAll,
    /// [A→S] All local participants are stopped; `count` of them.
    StopDone { count: u32 },
    /// [S→A, A→P] The queued writer may proceed.
    WriteOkay,
    /// [P→A, A→S] Request write permission.
    SyncReq,
    /// [P→A, A→S, S→A] Published bytes of a completed write.
    SyncInfo(SyncInfo),
    /// [A→S] Local cohort has the published bytes; `count` of them.
    SyncDone { count: u32 },
    /// [S→A] Resume suspended participants.
    ContAll,
    /// [P→A, A→S] `count` local participants reached the barrier.
    WaitBarr { count: u32 },
    /// [S→A, A→P] Release the barrier (or the startup gate).
    WaitDone,
    /// [P→A, A→S] Sender is exiting the session.
    PrgmDone,
}

impl Msg {
    /// Serializes into a fixed-size frame.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut f = [0u8; FRAME_LEN];
        match self {
            Msg::GetSession { sid, nproc } => {
                put_u32(&mut f, 0, TAG_GET_SESSION);
                f[8..8 + SID_LEN].copy_from_slice(sid.as_bytes());
                put_u32(&mut f, 40, *nproc);
            }
            Msg::SetSession { sid, port } => {
                put_u32(&mut f, 0, TAG_SET_SESSION);
                f[8..8 + SID_LEN].copy_from_slice(sid.as_bytes());
                put_u32(&mut f, 40, *port);
            }
            Msg::DelSession { sid } => {
                put_u32(&mut f, 0, TAG_DEL_SESSION);
                f[8..8 + SID_LEN].copy_from_slice(sid.as_bytes());
            }
            Msg::AddProc { pid } => {
                put_u32(&mut f, 0, TAG_ADD_PROC);
                put_i32(&mut f, 8, *pid);
            }
            Msg::SetGid { pid, gid } => {
                put_u32(&mut f, 0, TAG_SET_GID);
                put_i32(&mut f, 8, *pid);
                put_i32(&mut f, 12, *gid);
            }
            Msg::StopAll => put_u32(&mut f, 0, TAG_STOP_ALL),
            Msg::StopDone { count } => {
                put_u32(&mut f, 0, TAG_STOP_DONE);
                put_u32(&mut f, 8, *count);
            }
            Msg::WriteOkay => put_u32(&mut f, 0, TAG_WRITE_OKAY),
            Msg::SyncReq => put_u32(&mut f, 0, TAG_SYNC_REQ),
            Msg::SyncInfo(info) => {
                put_u32(&mut f, 0, TAG_SYNC_INFO);
                f[8..16].copy_from_slice(&info.offset.to_ne_bytes());
                put_u32(&mut f, 16, info.size);
                f[20..20 + SYNC_DATA_MAX].copy_from_slice(&info.data);
            }
            Msg::SyncDone { count } => {
                put_u32(&mut f, 0, TAG_SYNC_DONE);
                put_u32(&mut f, 8, *count);
            }
            Msg::ContAll => put_u32(&mut f, 0, TAG_CONT_ALL),
            Msg::WaitBarr { count } => {
                put_u32(&mut f, 0, TAG_WAIT_BARR);
                put_u32(&mut f, 8, *count);
            }
            Msg::WaitDone => put_u32(&mut f, 0, TAG_WAIT_DONE),
            Msg::PrgmDone => put_u32(&mut f, 0, TAG_PRGM_DONE),
        }
        f
    }

    /// Decodes one frame.
    pub fn decode(f: &[u8; FRAME_LEN]) -> Result<Msg, FrameError> {
        let tag = get_u32(f, 0);
        let msg = match tag {
            TAG_GET_SESSION => Msg::GetSession {
                sid: get_sid(f),
                nproc: get_u32(f, 40),
            },
            TAG_SET_SESSION => Msg::SetSession {
                sid: get_sid(f),
                port: get_u32(f, 40),
            },
            TAG_DEL_SESSION => Msg::DelSession { sid: get_sid(f) },
            TAG_ADD_PROC => Msg::AddProc { pid: get_i32(f, 8) },
            TAG_SET_GID => Msg::SetGid {
                pid: get_i32(f, 8),
                gid: get_i32(f, 12),
            },
            TAG_STOP_ALL => Msg::StopAll,
            TAG_STOP_DONE => Msg::StopDone {
                count: get_u32(f, 8),
            },
            TAG_WRITE_OKAY => Msg::WriteOkay,
            TAG_SYNC_REQ => Msg::SyncReq,
            TAG_SYNC_INFO => {
                let size = get_u32(f, 16);
                if size as usize > SYNC_DATA_MAX {
                    return Err(FrameError::Oversize(size));
                }
                let mut data = [0; SYNC_DATA_MAX];
                data.copy_from_slice(&f[20..20 + SYNC_DATA_MAX]);
                Msg::SyncInfo(SyncInfo {
                    offset: u64::from_ne_bytes(f[8..16].try_into().unwrap()),
                    size,
                    data,
                })
            }
            TAG_SYNC_DONE => Msg::SyncDone {
                count: get_u32(f, 8),
            },
            TAG_CONT_ALL => Msg::ContAll,
            TAG_WAIT_BARR => Msg::WaitBarr {
                count: get_u32(f, 8),
            },
            TAG_WAIT_DONE => Msg::WaitDone,
            TAG_PRGM_DONE => Msg::PrgmDone,
            other => return Err(FrameError::UnknownTag(other)),
        };
        Ok(msg)
    }

    /// Reads exactly one frame from a blocking stream.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Msg> {
        let mut frame = [0u8; FRAME_LEN];
        r.read_exact(&mut frame)?;
        Msg::decode(&frame).map_err(Into::into)
    }

    /// Writes one frame to a blocking stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Msg::GetSession { .. } => "GET_SESSION",
            Msg::SetSession { .. } => "SET_SESSION",
            Msg::DelSession { .. } => "DEL_SESSION",
            Msg::AddProc { .. } => "ADD_PROC",
            Msg::SetGid { .. } => "SET_GID",
            Msg::StopAll => "STOP_ALL",
            Msg::StopDone { .. } => "STOP_DONE",
            Msg::WriteOkay => "WRITE_OKAY",
            Msg::SyncReq => "SYNC_REQ",
            Msg::SyncInfo(..) => "SYNC_INFO",
            Msg::SyncDone { .. } => "SYNC_DONE",
            Msg::ContAll => "CONT_ALL",
            Msg::WaitBarr { .. } => "WAIT_BARR",
            Msg::WaitDone => "WAIT_DONE",
            Msg::PrgmDone => "PRGM_DONE",
        }
    }
}

fn put_u32(f: &mut [u8], at: usize, v: u32) {
    f[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_i32(f: &mut [u8], at: usize, v: i32) {
    f[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

fn get_u32(f: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes(f[at..at + 4].try_into().unwrap())
}

fn get_i32(f: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes(f[at..at + 4].try_into().unwrap())
}

fn get_sid(f: &[u8]) -> SessionId {
    SessionId::from_bytes(f[8..8 + SID_LEN].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_bounds() {
        assert!(SessionId::new("").is_none());
        assert!(SessionId::new(&"x".repeat(SID_LEN + 1)).is_none());
        let sid = SessionId::new("arethusa").unwrap();
        assert_eq!(sid.to_string(), "arethusa");
    }

    #[test]
    fn tagged_payloads_survive_decode() {
        let sid = SessionId::new("s1").unwrap();
        let cases = [
            Msg::GetSession { sid, nproc: 4 },
            Msg::SetSession { sid, port: 40913 },
            Msg::SetGid { pid: 812, gid: 2 },
            Msg::SyncInfo(SyncInfo::new(128, &[0xde, 0xad, 0xbe, 0xef])),
            Msg::WaitBarr { count: 3 },
        ];
        for msg in cases {
            let decoded = Msg::decode(&msg.encode()).unwrap();
            assert_eq!(decoded.name(), msg.name());
            match (msg, decoded) {
                (Msg::SyncInfo(a), Msg::SyncInfo(b)) => {
                    assert_eq!(a.offset, b.offset);
                    assert_eq!(a.bytes(), b.bytes());
                }
                (Msg::SetGid { pid, gid }, Msg::SetGid { pid: p, gid: g }) => {
                    assert_eq!((pid, gid), (p, g));
                }
                (Msg::SetSession { port, .. }, Msg::SetSession { port: p, sid: s }) => {
                    assert_eq!(port, p);
                    assert_eq!(s, sid);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut frame = [0u8; FRAME_LEN];
        frame[..4].copy_from_slice(&999u32.to_ne_bytes());
        assert!(matches!(
            Msg::decode(&frame),
            Err(FrameError::UnknownTag(999))
        ));
    }

    #[test]
    fn oversized_sync_window_is_rejected() {
        let mut frame = Msg::SyncInfo(SyncInfo::new(0, &[1])).encode();
        frame[16..20].copy_from_slice(&(SYNC_DATA_MAX as u32 + 1).to_ne_bytes());
        assert!(matches!(
            Msg::decode(&frame),
            Err(FrameError::Oversize(_))
        ));
    }
}
