mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use common::{
    creds::Account,
    server::{Auth, MockServer, Router},
    utils::{next_within, wait_for},
};
use futures::StreamExt;
use nats_client::{Client, ClientError, ConnectOptions, ConnectionState, ErrorLog};
use tracing_test::traced_test;

/// A client on `url` answering `svc.echo` with the request payload.
async fn echo_responder(url: String, creds: &std::path::Path) -> Result<Client> {
    let responder = ConnectOptions::new()
        .servers([url])
        .user_credentials(creds)
        .connect()
        .await?;
    let mut requests = responder.subscribe("svc.echo").await?;
    responder.flush().await?;
    let replier = responder.clone();
    tokio::spawn(async move {
        while let Some(msg) = requests.next().await {
            if let Some(reply) = msg.reply {
                let _ = replier.publish(reply, msg.payload).await;
            }
        }
    });
    Ok(responder)
}

#[tokio::test]
#[traced_test]
async fn test_failover_to_next_server() -> Result<()> {
    let account = Account::new();
    let user = account.issue_user("failover");
    let auth = Auth::accounts([account.public_key()]);
    let router = Router::new();
    let s1 = MockServer::start_in(&router, auth.clone()).await;
    let s2 = MockServer::start_in(&router, auth).await;
    let _responder = echo_responder(s2.url(), user.creds()).await?;

    let reconnects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (on_reconnect, on_disconnect) = (reconnects.clone(), disconnects.clone());
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([s1.url(), s2.url()])
        .no_randomize(true)
        .reconnect_time_wait(Duration::from_millis(100))
        .user_credentials(user.creds())
        .error_observer(errors.clone())
        .on_reconnect(move || {
            on_reconnect.fetch_add(1, Ordering::SeqCst);
        })
        .on_disconnect(move || {
            on_disconnect.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await?;

    let killed = s1.addr();
    assert_eq!(client.connected_server().unwrap().port, killed.port());
    let reply = client.request("svc.echo", "before").await?;
    assert_eq!(&reply.payload[..], b"before");

    s1.kill().await;
    assert!(
        wait_for(Duration::from_secs(5), || reconnects.load(Ordering::SeqCst) >= 1).await,
        "on_reconnect never fired"
    );
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    let now = client.connected_server().expect("connected after reconnect");
    assert_ne!(now.port, killed.port());
    assert_eq!(now.port, s2.addr().port());

    let reply = client.request("svc.echo", "after").await?;
    assert_eq!(&reply.payload[..], b"after");
    assert_eq!(client.stats().reconnects, 1);
    // the dropped socket is the only thing worth reporting
    assert!(errors.errors().iter().all(|e| e.is_transient()));

    client.close().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_total_outage_does_not_spin() -> Result<()> {
    let s1 = MockServer::start(Auth::Open).await;
    let s2 = MockServer::start(Auth::Open).await;
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([s1.url(), s2.url()])
        .reconnect_time_wait(Duration::from_millis(200))
        .max_reconnect_attempts(None)
        .error_observer(errors.clone())
        .connect()
        .await?;

    s1.kill().await;
    s2.kill().await;
    assert!(
        wait_for(Duration::from_secs(2), || {
            client.connection_state() != ConnectionState::Ready
        })
        .await
    );

    errors.clear();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let seen = errors.len();
    assert!(seen >= 1, "reconnection stopped trying");
    assert!(seen < 10, "{seen} errors in one second, reconnect is spinning");
    assert!(errors.errors().iter().all(|e| e.is_transient()));
    assert!(!client.is_closed());

    client.close().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_revoked_account_only_auth_errors() -> Result<()> {
    let account = Account::new();
    let user = account.issue_user("revoked");
    let s1 = MockServer::start(Auth::accounts([account.public_key()])).await;
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([s1.url()])
        .reconnect_time_wait(Duration::from_millis(100))
        .max_reconnect_attempts(None)
        .user_credentials(user.creds())
        .error_observer(errors.clone())
        .connect()
        .await?;

    // bring the server back without the account
    let addr = s1.kill().await;
    let _s1 = MockServer::start_on(addr, Router::new(), Auth::accounts(Vec::<String>::new()), vec![]).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    errors.clear();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let seen = errors.errors();
    assert!(!seen.is_empty(), "no reconnect attempts observed");
    assert!(seen.len() < 20, "{} auth errors in one second", seen.len());
    assert!(seen.iter().all(ClientError::is_auth), "errors: {seen:?}");
    assert_ne!(client.connection_state(), ConnectionState::Ready);
    assert_eq!(client.stats().reconnects, 0);

    client.close().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_reconnect_disabled_closes() -> Result<()> {
    let server = MockServer::start(Auth::Open).await;
    let errors = ErrorLog::new();
    let closed = Arc::new(AtomicBool::new(false));
    let on_close = closed.clone();
    let client = ConnectOptions::new()
        .servers([server.url()])
        .reconnect(false)
        .error_observer(errors.clone())
        .on_close(move || on_close.store(true, Ordering::SeqCst))
        .connect()
        .await?;

    server.kill().await;
    assert!(wait_for(Duration::from_secs(2), || client.is_closed()).await);
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(errors.len(), 1, "errors: {:?}", errors.errors());
    assert!(errors.errors()[0].is_transient());

    let err = client.publish("x", "y").await.unwrap_err();
    assert!(matches!(err, ClientError::Closed));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_pool_exhaustion_closes() -> Result<()> {
    let server = MockServer::start(Auth::Open).await;
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([server.url()])
        .reconnect_time_wait(Duration::from_millis(20))
        .max_reconnect_attempts(Some(3))
        .error_observer(errors.clone())
        .connect()
        .await?;

    server.kill().await;
    assert!(wait_for(Duration::from_secs(3), || client.is_closed()).await);
    // the disconnect plus one per attempt
    assert_eq!(errors.len(), 4, "errors: {:?}", errors.errors());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_resubscribe_and_buffer_while_reconnecting() -> Result<()> {
    let router = Router::new();
    let s1 = MockServer::start_in(&router, Auth::Open).await;
    let s2 = MockServer::start_in(&router, Auth::Open).await;
    let client = ConnectOptions::new()
        .servers([s1.url(), s2.url()])
        .no_randomize(true)
        .reconnect_time_wait(Duration::from_millis(300))
        .connect()
        .await?;
    let mut events = client.subscribe("events.>").await?;
    client.flush().await?;

    s1.kill().await;
    assert!(
        wait_for(Duration::from_secs(2), || {
            client.connection_state() == ConnectionState::Reconnecting
        })
        .await
    );

    // queued for the next socket
    client.publish("events.buffered", "queued").await?;
    // requests never queue
    let err = client.request("svc.echo", "nope").await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected(_)), "got {err:?}");

    let msg = next_within(&mut events, Duration::from_secs(3))
        .await
        .expect("buffered publish not delivered after reconnect");
    assert_eq!(msg.subject, "events.buffered");
    assert_eq!(&msg.payload[..], b"queued");
    assert_eq!(client.connected_server().unwrap().port, s2.addr().port());

    // and the resubscription keeps working for new traffic
    let other = ConnectOptions::new().servers([s2.url()]).connect().await?;
    other.publish("events.live", "fresh").await?;
    other.flush().await?;
    let msg = next_within(&mut events, Duration::from_secs(2))
        .await
        .expect("subscription not restored");
    assert_eq!(msg.subject, "events.live");

    other.close().await;
    client.close().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_discovered_servers_join_pool() -> Result<()> {
    let router = Router::new();
    let s2 = MockServer::start_in(&router, Auth::Open).await;
    let s1 = MockServer::start_on(
        "127.0.0.1:0".parse()?,
        router.clone(),
        Auth::Open,
        vec![s2.addr().to_string()],
    )
    .await;

    let reconnects = Arc::new(AtomicUsize::new(0));
    let on_reconnect = reconnects.clone();
    let client = ConnectOptions::new()
        .servers([s1.url()])
        .reconnect_time_wait(Duration::from_millis(50))
        .on_reconnect(move || {
            on_reconnect.fetch_add(1, Ordering::SeqCst);
        })
        .connect()
        .await?;

    let servers = client.servers();
    assert_eq!(servers.len(), 2);
    let discovered = servers
        .iter()
        .find(|s| s.port == s2.addr().port())
        .expect("connect_urls not added to the pool");
    assert!(discovered.discovered);
    assert_eq!(
        client.server_info().map(|i| i.connect_urls),
        Some(vec![s2.addr().to_string()])
    );

    s1.kill().await;
    assert!(wait_for(Duration::from_secs(3), || reconnects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(client.connected_server().unwrap().port, s2.addr().port());
    client.close().await;
    Ok(())
}

/// A single-connection server that finishes the handshake, then writes
/// `-ERR '<verdict>'`. It hangs up right after when `close` is set,
/// otherwise it holds the socket until the client leaves.
async fn erroring_server(verdict: &'static str, close: bool) -> Result<String> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("nats://{}", listener.local_addr()?);
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let (rd, mut wr) = socket.into_split();
        wr.write_all(b"INFO {\"server_id\":\"NERR\",\"max_payload\":1048576}\r\n")
            .await?;
        let mut lines = BufReader::new(rd).lines();
        while let Some(line) = lines.next_line().await? {
            if line.starts_with("PING") {
                break;
            }
        }
        wr.write_all(b"PONG\r\n").await?;
        wr.write_all(format!("-ERR '{verdict}'\r\n").as_bytes())
            .await?;
        if close {
            wr.shutdown().await?;
            return Ok(());
        }
        while lines.next_line().await?.is_some() {}
        anyhow::Ok(())
    });
    Ok(url)
}

#[tokio::test]
#[traced_test]
async fn test_closing_server_error_reported_once() -> Result<()> {
    let url = erroring_server("Stale Connection", true).await?;
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([url])
        .reconnect(false)
        .error_observer(errors.clone())
        .connect()
        .await?;

    assert!(
        wait_for(Duration::from_secs(5), || client.is_closed()).await,
        "client never closed"
    );
    let seen = errors.errors();
    assert_eq!(seen.len(), 1, "{seen:?}");
    assert!(matches!(&seen[0], ClientError::Server(msg) if msg == "Stale Connection"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_permission_error_keeps_connection() -> Result<()> {
    let url = erroring_server("Permissions Violation for Publish to \"secret\"", false).await?;
    let errors = ErrorLog::new();
    let client = ConnectOptions::new()
        .servers([url])
        .reconnect(false)
        .error_observer(errors.clone())
        .connect()
        .await?;

    assert!(
        wait_for(Duration::from_secs(5), || !errors.is_empty()).await,
        "permission error never surfaced"
    );
    assert!(matches!(
        &errors.errors()[0],
        ClientError::Server(msg) if msg.starts_with("Permissions Violation")
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Ready);
    client.close().await;
    Ok(())
}
