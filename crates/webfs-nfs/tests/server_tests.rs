//! Integration tests for the admission front of the NFS server.
//!
//! These speak just enough ONC RPC to issue calls to the NFS and MOUNT
//! programs and check the replies, including refusals for denied peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use webfs_nfs::{
    CachingHandler, CidrAuthHandler, FsRef, NfsServer, OsFs, ServerConfig, ServerError,
    build_handler, serve,
};

const NFS_PROGRAM: u32 = 100_003;
const NFS_VERSION: u32 = 3;
const MOUNT_PROGRAM: u32 = 100_005;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts a server for `dir` with the given allowlist and returns its address.
async fn start_server(dir: &TempDir, allow: &[&str]) -> SocketAddr {
    let fs: FsRef = Arc::new(OsFs::new(dir.path()));
    let gate = CidrAuthHandler::new(FsRef::clone(&fs), allow);
    let handler = Arc::new(CachingHandler::new(gate, 16));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, handler, fs));
    addr
}

/// Encodes an RPC call with AUTH_NULL credentials and no arguments,
/// record-marked.
fn call(xid: u32, program: u32, version: u32, procedure: u32) -> Vec<u8> {
    let words = [
        xid,
        0, // CALL
        2, // RPC version
        program,
        version,
        procedure,
        0, 0, // cred: AUTH_NULL, empty body
        0, 0, // verf: AUTH_NULL, empty body
    ];
    let body: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let marker = 0x8000_0000u32 | u32::try_from(body.len()).unwrap();
    let mut frame = marker.to_be_bytes().to_vec();
    frame.extend(body);
    frame
}

fn null_call(xid: u32) -> Vec<u8> {
    call(xid, NFS_PROGRAM, NFS_VERSION, 0)
}

fn words(body: &[u8]) -> Vec<u32> {
    body.chunks(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect()
}

async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut marker = [0u8; 4];
    stream.read_exact(&mut marker).await.unwrap();
    let len = (u32::from_be_bytes(marker) & 0x7fff_ffff) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn admitted_peer_reaches_nfs_program() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir, &["127.0.0.0/8"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&null_call(0x1234_5678)).await.unwrap();

    let reply = timeout(IO_TIMEOUT, read_reply(&mut stream)).await.unwrap();
    assert!(reply.len() >= 8, "reply too short: {reply:?}");
    assert_eq!(&reply[0..4], &0x1234_5678u32.to_be_bytes());
    // REPLY message type
    assert_eq!(&reply[4..8], &1u32.to_be_bytes());
}

#[tokio::test]
async fn empty_allowlist_admits_everyone() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir, &[]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&null_call(7)).await.unwrap();
    let reply = timeout(IO_TIMEOUT, read_reply(&mut stream)).await.unwrap();
    assert_eq!(&reply[0..4], &7u32.to_be_bytes());
}

#[tokio::test]
async fn denied_peer_gets_auth_error() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir, &["10.0.0.0/8"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&null_call(0x0bad_f00d)).await.unwrap();

    let reply = timeout(IO_TIMEOUT, read_reply(&mut stream)).await.unwrap();
    // REPLY, MSG_DENIED, AUTH_ERROR, AUTH_TOOWEAK
    assert_eq!(words(&reply), [0x0bad_f00d, 1, 1, 1, 5]);
}

#[tokio::test]
async fn denied_mount_gets_acces() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir, &["10.0.0.0/8"]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&call(1, MOUNT_PROGRAM, 3, 0)).await.unwrap();
    let ping = timeout(IO_TIMEOUT, read_reply(&mut stream)).await.unwrap();
    assert_eq!(words(&ping), [1, 1, 0, 0, 0, 0]);

    stream.write_all(&call(2, MOUNT_PROGRAM, 3, 1)).await.unwrap();
    let mnt = timeout(IO_TIMEOUT, read_reply(&mut stream)).await.unwrap();
    // MSG_ACCEPTED, SUCCESS, then MNT3ERR_ACCES
    assert_eq!(words(&mnt), [2, 1, 0, 0, 0, 0, 13]);

    // The connection is closed after the MNT refusal
    let mut rest = Vec::new();
    let read = timeout(IO_TIMEOUT, stream.read_to_end(&mut rest)).await.unwrap();
    assert_eq!(read.unwrap(), 0);
}

#[tokio::test]
async fn start_rejects_missing_directory() {
    let config = ServerConfig::new("/definitely/not/a/dir", "127.0.0.1:0");
    let err = NfsServer::new(config).start().await.unwrap_err();
    assert!(matches!(err, ServerError::Config(_)), "got {err:?}");
}

#[tokio::test]
async fn start_reports_bind_failure_as_transport() {
    let dir = TempDir::new().unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let err = NfsServer::new(ServerConfig::new(dir.path(), address))
        .start()
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Transport { .. }), "got {err:?}");
}

#[test]
fn build_handler_applies_allowlist() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new(dir.path(), "127.0.0.1:0");
    config.auth.allow_cidrs = vec!["192.168.0.0/16".into(), "bogus".into()];

    let (handler, _root) = build_handler(&config).unwrap();
    let rules = handler.inner().rules();
    assert_eq!(rules.len(), 2);
    assert!(rules[0].is_valid());
    assert!(!rules[1].is_valid());
}
