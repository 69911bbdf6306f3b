use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gamenet::{
    is_temporary_net_error, AppError, AppResult, BinaryConnection, PacketConnection,
    PacketEchoHandler, RawConnection, Server, TcpConnectionHandler,
};
use rand::Rng;
use rstest::{fixture, rstest};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

/// Writes back whatever arrives, like a plain socket echo peer.
struct RawEchoHandler;

impl TcpConnectionHandler for RawEchoHandler {
    async fn serve_tcp_connection(&self, socket: TcpStream) {
        let mut conn = RawConnection::new(socket);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match conn.recv_some(&mut buf).await {
                Ok(n) => {
                    if conn.send_bytes(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(err) if is_temporary_net_error(&err) => continue,
                Err(_) => break,
            }
        }
        let _ = conn.close().await;
    }
}

#[fixture]
fn setup() {
    // every test installs it; only the first one wins
    let _ = gamenet::setup_local_tracing();
}

async fn start_server<H: TcpConnectionHandler>(handler: H) -> AppResult<SocketAddr> {
    let server = Server::bind("127.0.0.1:0", Arc::new(handler)).await?;
    let addr = server.local_addr()?;
    tokio::spawn(async move { server.run().await });
    Ok(addr)
}

struct EchoServer {
    addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_rx: mpsc::Receiver<()>,
}

async fn start_packet_echo_server() -> AppResult<EchoServer> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let addr = start_server(PacketEchoHandler::new(
        notify_shutdown.clone(),
        shutdown_complete_tx,
    ))
    .await?;
    Ok(EchoServer {
        addr,
        notify_shutdown,
        _shutdown_complete_rx: shutdown_complete_rx,
    })
}

#[rstest]
#[tokio::test]
async fn test_raw_connection_every_byte(_setup: ()) -> AppResult<()> {
    let addr = start_server(RawEchoHandler).await?;
    let mut conn = RawConnection::new(TcpStream::connect(addr).await?);
    for b in 0..=255u8 {
        conn.send_byte(b).await?;
        assert_eq!(conn.recv_byte().await?, b);
    }
    conn.close().await?;
    assert!(matches!(conn.close().await, Err(AppError::ConnectionClosed)));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_binary_connection_random_u64(_setup: ()) -> AppResult<()> {
    let addr = start_server(RawEchoHandler).await?;
    let mut conn = BinaryConnection::new(TcpStream::connect(addr).await?);
    let values: Vec<u64> = {
        let mut rng = rand::thread_rng();
        (0..100).map(|_| rng.gen()).collect()
    };
    for v in values {
        conn.send_u64(v).await?;
        assert_eq!(conn.recv_u64().await?, v);
    }
    conn.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_packet_connection_random_payloads(_setup: ()) -> AppResult<()> {
    let addr = start_server(RawEchoHandler).await?;
    let mut conn = PacketConnection::new(TcpStream::connect(addr).await?);
    for _ in 0..100 {
        let payload: Vec<u8> = {
            let mut rng = rand::thread_rng();
            let len = rng.gen_range(0..=4096);
            (0..len).map(|_| rng.gen()).collect()
        };
        let mut packet = conn.new_packet();
        for b in &payload {
            packet.append_byte(*b);
        }
        assert_eq!(packet.payload_len(), payload.len());

        conn.send_packet(&packet).await?;
        let received = conn.recv_packet().await?;
        assert_eq!(received.payload_len(), packet.payload_len());
        assert_eq!(received.payload(), &payload[..]);
        received.release();
        packet.release();
    }
    conn.close().await?;
    Ok(())
}

#[rstest]
#[case(4096)]
#[case(0)]
#[case(1)]
#[tokio::test]
async fn test_packet_echo_server(_setup: (), #[case] payload_len: usize) -> AppResult<()> {
    let server = start_packet_echo_server().await?;
    let mut conn = PacketConnection::new(TcpStream::connect(server.addr).await?);

    let mut packet = conn.new_packet();
    let payload: Vec<u8> = {
        let mut rng = rand::thread_rng();
        (0..payload_len).map(|_| rng.gen()).collect()
    };
    packet.append_bytes(&payload);
    conn.send_packet(&packet).await?;

    let echoed = conn.recv_packet().await?;
    assert_eq!(echoed.payload_len(), payload_len);
    assert_eq!(echoed.payload(), &payload[..]);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_packet_echo_server_mixed_sizes_on_one_connection(_setup: ()) -> AppResult<()> {
    let server = start_packet_echo_server().await?;
    let mut conn = PacketConnection::new(TcpStream::connect(server.addr).await?);

    for payload_len in [4096, 0, 1, 0, 4096] {
        let payload: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..payload_len).map(|_| rng.gen()).collect()
        };
        let mut packet = conn.new_packet();
        packet.append_bytes(&payload);
        conn.send_packet(&packet).await?;
        packet.release();

        let echoed = conn.recv_packet().await?;
        assert_eq!(echoed.payload_len(), payload_len);
        assert_eq!(echoed.payload(), &payload[..]);
        echoed.release();
    }
    conn.close().await?;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_bad_connection_does_not_affect_others(_setup: ()) -> AppResult<()> {
    let server = start_packet_echo_server().await?;
    let mut good = PacketConnection::new(TcpStream::connect(server.addr).await?);

    // a header far above the default 32 MiB limit
    let mut bad = TcpStream::connect(server.addr).await?;
    bad.write_all(&u32::MAX.to_be_bytes()).await?;
    let mut bad = RawConnection::new(bad);
    bad.set_read_timeout(Some(Duration::from_secs(5)));
    let err = bad.recv_byte().await.unwrap_err();
    assert!(!is_temporary_net_error(&err), "server should close: {}", err);

    let mut packet = good.new_packet();
    packet.append_var_str("still here")?;
    good.send_packet(&packet).await?;
    let echoed = good.recv_packet().await?;
    assert_eq!(echoed.reader().read_var_str()?, "still here");
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_shutdown_closes_connections(_setup: ()) -> AppResult<()> {
    let server = start_packet_echo_server().await?;
    let mut conn = PacketConnection::new(TcpStream::connect(server.addr).await?);

    // make sure the handler is running before signalling
    let mut packet = conn.new_packet();
    packet.append_u64(1);
    conn.send_packet(&packet).await?;
    conn.recv_packet().await?;

    server.notify_shutdown.send(()).ok();
    conn.set_read_timeout(Some(Duration::from_secs(5)));
    let err = conn.recv_packet().await.unwrap_err();
    assert!(matches!(err, AppError::PeerClosed(_)), "got {}", err);
    assert!(conn.is_closed());
    Ok(())
}
