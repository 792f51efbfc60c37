//! Minimal ONC RPC responder for peers the gate refuses.
//!
//! A refused connection is answered on the wire rather than dropped, so the
//! client reports "access denied" instead of retrying a server it believes
//! is down. MOUNT's NULL ping succeeds and MNT fails with `MNT3ERR_ACCES`;
//! every other call is rejected with `AUTH_ERROR` / `AUTH_TOOWEAK`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// MOUNT program number
pub const MOUNT_PROGRAM: u32 = 100_005;

const MOUNTPROC_NULL: u32 = 0;
const MOUNTPROC_MNT: u32 = 1;
/// `MNT3ERR_ACCES` (also `EACCES` in MOUNT v1 `fhstatus`).
const MNT3ERR_ACCES: u32 = 13;

const RPC_VERSION: u32 = 2;
const AUTH_NONE: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;
const AUTH_TOOWEAK: u32 = 5;

/// Record-marking bit for the final fragment of a record.
const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Largest call a refused peer may send.
const MAX_RECORD_LEN: usize = 64 * 1024;
/// Calls answered before the connection is closed.
const MAX_CALLS: usize = 8;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// RPC message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum MsgType {
    Call = 0,
    Reply = 1,
}

/// RPC reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ReplyStat {
    Accepted = 0,
    Denied = 1,
}

/// The part of an RPC call header needed to answer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl CallHeader {
    /// Parses the fixed words of a call. Returns `None` for replies,
    /// truncated records and foreign RPC versions.
    pub fn parse(record: &[u8]) -> Option<Self> {
        let word = |i: usize| {
            record
                .get(i * 4..i * 4 + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_be_bytes)
        };
        if word(1)? != MsgType::Call as u32 || word(2)? != RPC_VERSION {
            return None;
        }
        Some(Self {
            xid: word(0)?,
            program: word(3)?,
            version: word(4)?,
            procedure: word(5)?,
        })
    }

    fn is_mnt(&self) -> bool {
        self.program == MOUNT_PROGRAM && self.procedure == MOUNTPROC_MNT
    }
}

/// Reply body (without record mark) refusing `call`.
pub fn refusal(call: &CallHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(28);
    buf.put_u32(call.xid);
    buf.put_u32(MsgType::Reply as u32);
    match (call.program, call.procedure) {
        (MOUNT_PROGRAM, MOUNTPROC_NULL) => put_accepted(&mut buf),
        (MOUNT_PROGRAM, MOUNTPROC_MNT) => {
            put_accepted(&mut buf);
            buf.put_u32(MNT3ERR_ACCES);
        }
        _ => {
            buf.put_u32(ReplyStat::Denied as u32);
            buf.put_u32(REJECT_AUTH_ERROR);
            buf.put_u32(AUTH_TOOWEAK);
        }
    }
    buf.freeze()
}

fn put_accepted(buf: &mut BytesMut) {
    buf.put_u32(ReplyStat::Accepted as u32);
    // verifier: AUTH_NONE, empty body
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
    buf.put_u32(ACCEPT_SUCCESS);
}

/// Answers up to a handful of calls from a refused peer, then closes.
///
/// Stops early after the MNT refusal, on a malformed record, or when the
/// peer stays silent.
pub async fn refuse<S>(mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..MAX_CALLS {
        let record = match timeout(READ_TIMEOUT, read_record(&mut stream)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "Refused connection closed");
                return;
            }
            Err(_) => {
                debug!(%peer, "Refused peer went quiet");
                break;
            }
        };
        let Some(call) = CallHeader::parse(&record) else {
            debug!(%peer, "Refused peer sent a non-RPC record");
            break;
        };
        debug!(
            %peer,
            xid = call.xid,
            program = call.program,
            version = call.version,
            procedure = call.procedure,
            "Refusing call"
        );
        if let Err(e) = write_record(&mut stream, &refusal(&call)).await {
            debug!(%peer, error = %e, "Could not send refusal");
            return;
        }
        if call.is_mnt() {
            break;
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!(%peer, error = %e, "Shutdown of refused connection failed");
    }
}

/// Reads one record-marked RPC record, joining fragments.
async fn read_record<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut record = Vec::new();
    loop {
        let marker = reader.read_u32().await?;
        let len = (marker & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "RPC record too large"));
        }
        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..]).await?;
        if marker & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

async fn write_record<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "RPC reply too large"))?;
    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_u32(LAST_FRAGMENT | len);
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await
}
