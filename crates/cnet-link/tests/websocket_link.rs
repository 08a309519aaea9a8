use cnet_link::{
    BrokerLink, ConnectionState, ConnectivityStatus, Connector, EventSink, LinkConfig, LinkEvent, TransportEvent,
    TransportHandle, WsConnector,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

async fn local_listener() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
    (listener, url)
}

fn fast_config(url: Url) -> LinkConfig {
    LinkConfig::new(url)
        .with_reconnect_delay(Duration::from_millis(50))
        .with_poll_interval(Duration::from_millis(50))
}

async fn next_event(events: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
    loop {
        match timeout(WAIT, events.recv()).await.expect("event timeout") {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}

async fn wait_for(events: &mut broadcast::Receiver<LinkEvent>, wanted: LinkEvent) {
    loop {
        if next_event(events).await == wanted {
            return;
        }
    }
}

#[tokio::test]
async fn session_carries_status_submissions_and_acceptance() {
    let (listener, url) = local_listener().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        ws.send(Message::Text(
            r#"{"type":"STATUS_UPDATE","data":{"activeWorkers":3,"pendingTasks":1}}"#.to_string(),
        ))
        .await
        .expect("send status");
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).expect("client json");
                if value["type"] == "SUBMIT_TASK" {
                    ws.send(Message::Text(r#"{"type":"TASK_ACCEPTED","taskId":1}"#.to_string()))
                        .await
                        .expect("send accepted");
                }
                let _ = seen_tx.send(text);
            }
        }
    });

    let link = BrokerLink::connect(fast_config(url));
    let mut events = link.subscribe();
    timeout(WAIT, link.wait_for_state(ConnectionState::Connected))
        .await
        .expect("connect timeout")
        .expect("link alive");

    loop {
        if let LinkEvent::Dashboard(snapshot) = next_event(&mut events).await {
            assert_eq!(snapshot.active_workers, Some(3));
            assert_eq!(snapshot.pending_tasks, Some(1));
            assert_eq!(snapshot.completed_tasks, None);
            break;
        }
    }

    link.submit_task("render", "frame-12").await.expect("submit");
    let sent = timeout(WAIT, seen_rx.recv()).await.expect("server timeout").expect("frame");
    let value: Value = serde_json::from_str(&sent).expect("json");
    assert_eq!(value["type"], "SUBMIT_TASK");
    assert_eq!(value["name"], "render");
    assert_eq!(value["data"], "frame-12");
    assert!(value["timestamp"].is_string());

    wait_for(
        &mut events,
        LinkEvent::TaskAccepted {
            task_id: "1".to_string(),
        },
    )
    .await;

    link.shutdown().await;
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_session_is_reestablished() {
    let (listener, url) = local_listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept first");
        let mut first = accept_async(stream).await.expect("handshake first");
        first.close(None).await.expect("close first");
        drop(first);

        let (stream, _) = listener.accept().await.expect("accept second");
        let mut second = accept_async(stream).await.expect("handshake second");
        second
            .send(Message::Text(r#"{"type":"TASK_COMPLETED","taskId":"t-9"}"#.to_string()))
            .await
            .expect("send completed");
        while let Some(Ok(_)) = second.next().await {}
    });

    let link = BrokerLink::connect(fast_config(url));
    let mut events = link.subscribe();

    wait_for(&mut events, LinkEvent::Connectivity(ConnectivityStatus::Connected)).await;
    wait_for(&mut events, LinkEvent::Connectivity(ConnectivityStatus::Disconnected)).await;
    wait_for(&mut events, LinkEvent::Connectivity(ConnectivityStatus::Connected)).await;
    wait_for(
        &mut events,
        LinkEvent::TaskCompleted {
            task_id: "t-9".to_string(),
        },
    )
    .await;

    link.shutdown().await;
}

#[tokio::test]
async fn close_during_handshake_fires_single_close() {
    // Bound but never accepted: the TCP connect succeeds, the upgrade hangs.
    let (listener, url) = local_listener().await;
    let (sink, mut rx) = EventSink::channel(3);
    let mut handle = WsConnector.open(&url, sink);

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.close();
    handle.close();

    let (attempt, event) = timeout(WAIT, rx.recv()).await.expect("close timeout").expect("event");
    assert_eq!(attempt, 3);
    assert_eq!(event, TransportEvent::Closed(None));
    assert!(timeout(WAIT, rx.recv()).await.expect("channel end").is_none());
    drop(listener);
}
