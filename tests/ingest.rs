use std::{net::SocketAddr, sync::Arc, time::Duration};

use fanout::{
    config::{Mode, Topic},
    error::Error,
    ingest::StreamIngestor,
    telemetry::REPORT_PREFIX,
    worker::ProcessedCounter,
    Config, Supervisor,
};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_tungstenite::{accept_async, tungstenite::Message};

fn envelope(topic: &str, text: &str) -> String {
    let inner = serde_json::json!({ "reviewText": text, "overall": 5.0 }).to_string();
    let mut outer = serde_json::Map::new();
    outer.insert(topic.to_string(), serde_json::Value::String(inner));
    serde_json::Value::Object(outer).to_string()
}

/// Serves one connection: checks the subscription, sends `frames`, then
/// either closes or holds the connection open until told to stop.
async fn serve(
    frames: Vec<Message>,
    close: bool,
) -> (SocketAddr, oneshot::Receiver<String>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (subscribed_tx, subscribed_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let subscription = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let _ = subscribed_tx.send(subscription);
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        if close {
            ws.close(None).await.unwrap();
        } else {
            let _ = stop_rx.await;
        }
    });
    (addr, subscribed_rx, stop_tx)
}

#[tokio::test]
async fn decodes_what_it_can_and_reports_the_close() {
    let frames = vec![
        Message::Text(envelope("music", "great")),
        Message::Ping(vec![1, 2, 3]),
        Message::Text(envelope("toys", "wrong topic")),
        Message::Text("not json".into()),
        Message::Binary(envelope("music", "works fine").into_bytes()),
        Message::Text(envelope("music", "great")),
    ];
    let (addr, subscribed, _stop) = serve(frames, true).await;
    let topic: Topic = "Music".parse().unwrap();
    let mut ingestor = StreamIngestor::connect(&format!("ws://{}", addr), topic)
        .await
        .unwrap();
    assert_eq!(subscribed.await.unwrap(), "topic: music");

    let mut items = Vec::new();
    let closed = loop {
        match ingestor.next_item().await {
            Ok(item) => items.push((item.seq, item.text)),
            Err(e) => break e,
        }
    };
    assert!(matches!(closed, Error::StreamClosed));
    // repeats are still items here; dedup happens downstream
    assert_eq!(
        items,
        vec![
            (0, "great".to_string()),
            (1, "works fine".to_string()),
            (2, "great".to_string()),
        ]
    );
    assert_eq!(ingestor.decode_errors(), 2);
}

#[tokio::test]
async fn in_process_cluster_reports_every_novel_item() {
    let frames = ["great", "awful", "great", "fine", "awful", "love it"]
        .into_iter()
        .map(|text| Message::Text(envelope("music", text)))
        .collect();
    let (addr, _subscribed, stop) = serve(frames, false).await;
    let dir = tempfile::tempdir().unwrap();

    let config = Config::builder()
        .topic("music".parse().unwrap())
        .mode(Mode::Distributed)
        .size(Some(3))
        .stream_url(format!("ws://{}", addr))
        .interval(Duration::from_millis(200))
        .run_for(Duration::from_secs(2))
        .output_dir(dir.path())
        .build();
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.run().await.unwrap();
    let _ = stop.send(());

    let report =
        std::fs::read_to_string(dir.path().join("distributed_review_counts.txt")).unwrap();
    let counts: Vec<u64> = report
        .lines()
        .map(|line| line.strip_prefix(REPORT_PREFIX).unwrap().parse().unwrap())
        .collect();
    assert!(counts.len() >= 3, "too few reports: {:?}", counts);
    assert_eq!(counts.iter().sum::<u64>(), 4);
}

#[tokio::test]
async fn sequential_mode_writes_its_own_report() {
    let frames = vec![Message::Text(envelope("sport", "fast shoes"))];
    let (addr, _subscribed, stop) = serve(frames, false).await;
    let dir = tempfile::tempdir().unwrap();

    let config = Config::builder()
        .topic("sport".parse().unwrap())
        .mode(Mode::Sequential)
        .stream_url(format!("ws://{}", addr))
        .interval(Duration::from_millis(200))
        .run_for(Duration::from_secs(1))
        .output_dir(dir.path())
        .build();
    Supervisor::new(config).unwrap().run().await.unwrap();
    let _ = stop.send(());

    let report =
        std::fs::read_to_string(dir.path().join("sequential_review_counts.txt")).unwrap();
    assert!(report.lines().all(|line| line.starts_with(REPORT_PREFIX)));
    assert!(report.contains(&format!("{}1\n", REPORT_PREFIX)));
}

#[test]
fn counter_is_shared_between_handles() {
    let counter = Arc::new(ProcessedCounter::default());
    let other = counter.clone();
    other.increment();
    assert_eq!(counter.take(), 1);
}
