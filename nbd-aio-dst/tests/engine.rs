//! End-to-end tests of the client engine against the RAM-disk server over
//! TCP loopback.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use nbd_aio::{connect_tcp, ClientConfig, CommandError, MultiConn};
use nbd_aio_dst::driver::{drive, drive_to_completion};
use nbd_aio_dst::{RamDisk, RamServer};

const EXPORT: &str = "it";
const MIB: u64 = 1024 * 1024;

async fn start_server(size_bytes: u64) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let disk = Arc::new(RamDisk::new(size_bytes));
    let server = RamServer::new(disk, EXPORT);
    server.listen_tcp().await.unwrap()
}

#[tokio::test]
async fn handshake_reports_export_metadata() {
    let (addr, server) = start_server(4 * MIB).await;

    let conn = connect_tcp(addr, EXPORT).await.unwrap();
    let export = conn.export();
    assert_eq!(export.size_bytes, 4 * MIB);
    assert!(export.can_multi_conn());
    assert!(export.supports_flush());
    assert!(export.supports_trim());
    assert!(!export.read_only());

    server.abort();
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    let data = Bytes::from((0..16384).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let h_write = conn.write(4096, data.clone()).unwrap();
    drive_to_completion(&mut conn, h_write)
        .await
        .unwrap()
        .unwrap();

    let h_read = conn.read(4096, 16384).unwrap();
    let got = drive_to_completion(&mut conn, h_read)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, data);

    server.abort();
}

/// Two pipelined writes with coalescing hints active, then read-back:
/// both frames go out in submission order and the data is intact.
#[tokio::test]
async fn pipelined_writes_then_read() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    let d1 = Bytes::from(vec![0xA5u8; 16384]);
    let d2 = Bytes::from(vec![0x5Au8; 16384]);
    let h1 = conn.write(0, d1.clone()).unwrap();
    let h2 = conn.write(16384, d2.clone()).unwrap();

    let mut results = HashMap::new();
    drive(&mut conn, |c| {
        for h in [h1, h2] {
            if let Some(r) = c.command_completed(h) {
                results.insert(h, r);
            }
        }
        results.len() == 2
    })
    .await
    .unwrap();
    assert!(results.values().all(|r| r.is_ok()));

    let h_read = conn.read(0, 16384).unwrap();
    let got = drive_to_completion(&mut conn, h_read)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, d1);

    let h_read2 = conn.read(16384, 16384).unwrap();
    let got2 = drive_to_completion(&mut conn, h_read2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got2, d2);

    server.abort();
}

/// The in-flight window is caller-enforced: with 16 outstanding the caller
/// must hold the 17th until a slot frees.
#[tokio::test]
async fn window_backpressure_is_caller_enforced() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();
    let window = 16;

    let mut handles = Vec::new();
    for i in 0..window {
        handles.push(conn.read(i as u64 * 4096, 4096).unwrap());
    }
    assert_eq!(conn.pending_len() + conn.in_flight_len(), window);

    // Caller-side gate: no submission while the window is full.
    let outstanding = |c: &nbd_aio::Connection<tokio::net::TcpStream>| {
        c.pending_len() + c.in_flight_len()
    };
    assert!(outstanding(&conn) >= window);

    // Drive until one command retires, freeing a slot for the 17th.
    let mut retired = Vec::new();
    drive(&mut conn, |c| {
        handles.retain(|&h| {
            if let Some(r) = c.command_completed(h) {
                r.unwrap();
                retired.push(h);
                false
            } else {
                true
            }
        });
        !retired.is_empty()
    })
    .await
    .unwrap();

    assert!(outstanding(&conn) < window);
    let h17 = conn.read(0, 4096).unwrap();

    let mut remaining: Vec<u64> = handles.clone();
    remaining.push(h17);
    drive(&mut conn, |c| {
        remaining.retain(|&h| c.command_completed(h).is_none());
        remaining.is_empty()
    })
    .await
    .unwrap();

    server.abort();
}

#[tokio::test]
async fn zero_length_read_and_write() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    let h_read = conn.read(0, 0).unwrap();
    let got = drive_to_completion(&mut conn, h_read)
        .await
        .unwrap()
        .unwrap();
    assert!(got.is_empty());

    let h_write = conn.write(0, Bytes::new()).unwrap();
    drive_to_completion(&mut conn, h_write)
        .await
        .unwrap()
        .unwrap();

    server.abort();
}

#[tokio::test]
async fn flush_trim_and_write_zeroes() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    let data = Bytes::from(vec![0xFFu8; 8192]);
    let h = conn.write(0, data).unwrap();
    drive_to_completion(&mut conn, h).await.unwrap().unwrap();

    let h = conn.flush().unwrap();
    drive_to_completion(&mut conn, h).await.unwrap().unwrap();

    let h = conn.write_zeroes(0, 4096).unwrap();
    drive_to_completion(&mut conn, h).await.unwrap().unwrap();

    let h = conn.read(0, 8192).unwrap();
    let got = drive_to_completion(&mut conn, h).await.unwrap().unwrap();
    assert_eq!(&got[..4096], &[0u8; 4096][..]);
    assert!(got[4096..].iter().all(|&b| b == 0xFF));

    let h = conn.trim(0, 8192).unwrap();
    drive_to_completion(&mut conn, h).await.unwrap().unwrap();

    server.abort();
}

/// A server-reported error fails only that command; the connection keeps
/// serving others.
#[tokio::test]
async fn remote_error_does_not_kill_connection() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    // Out-of-bounds read: the server replies with an errno.
    let h_bad = conn.read(MIB - 16, 4096).unwrap();
    let result = drive_to_completion(&mut conn, h_bad).await.unwrap();
    assert!(matches!(result, Err(CommandError::Remote { .. })));
    assert!(!conn.is_dead());

    let h_ok = conn.read(0, 512).unwrap();
    drive_to_completion(&mut conn, h_ok).await.unwrap().unwrap();

    server.abort();
}

/// Once the connection dies, every outstanding command completes with a
/// failure exactly once.
#[tokio::test]
async fn dead_connection_fails_every_outstanding_command() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let disk = Arc::new(RamDisk::new(MIB));
    let server = RamServer::new(disk, EXPORT);
    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::select! {
            _ = server.serve(stream) => {}
            _ = kill_rx => {} // dropping the stream severs the connection
        }
    });

    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();
    let h1 = conn.flush().unwrap();
    let h2 = conn.read(0, 4096).unwrap();
    let h3 = conn.write(0, Bytes::from(vec![1u8; 4096])).unwrap();

    kill_tx.send(()).unwrap();
    let driven = drive(&mut conn, |_| false).await;
    assert!(driven.is_err());
    assert!(conn.is_dead());
    assert!(conn.dead_reason().is_some());

    for h in [h1, h2, h3] {
        assert!(matches!(
            conn.command_completed(h),
            Some(Err(CommandError::Disconnected { .. }))
        ));
        // Completion is observed exactly once.
        assert!(conn.command_completed(h).is_none());
    }

    // Terminal: further submissions are refused.
    assert!(conn.flush().is_err());
    server_task.await.unwrap();
}

#[tokio::test]
async fn disconnect_closes_cleanly() {
    let (addr, server) = start_server(MIB).await;
    let mut conn = connect_tcp(addr, EXPORT).await.unwrap();

    let h = conn.disconnect().unwrap();
    drive(&mut conn, |c| c.is_closed()).await.unwrap();
    assert!(matches!(conn.command_completed(h), Some(Ok(_))));
    assert!(conn.read(0, 512).is_err());

    server.abort();
}

#[tokio::test]
async fn multi_conn_groups_identical_exports() {
    let (addr, server) = start_server(4 * MIB).await;

    let config = ClientConfig {
        export_name: EXPORT.to_string(),
        connections: 4,
        max_in_flight: 16,
    };
    let multi = MultiConn::connect_tcp(addr, &config).await.unwrap();
    assert_eq!(multi.len(), 4);
    assert_eq!(multi.export().size_bytes, 4 * MIB);

    // Each connection is independently usable after handoff.
    let (_, mut conns) = multi.into_connections();
    for (i, conn) in conns.iter_mut().enumerate() {
        let offset = i as u64 * MIB;
        let data = Bytes::from(vec![i as u8 + 1; 4096]);
        let h = conn.write(offset, data.clone()).unwrap();
        drive_to_completion(conn, h).await.unwrap().unwrap();

        let h = conn.read(offset, 4096).unwrap();
        let got = drive_to_completion(conn, h).await.unwrap().unwrap();
        assert_eq!(got, data);
    }

    server.abort();
}
