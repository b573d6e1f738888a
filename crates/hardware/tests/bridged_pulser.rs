//! BridgedPulser against an in-process bridge worker.

use async_trait::async_trait;
use bridge::{BridgeHandler, BridgeSession};
use hardware::BridgedPulser;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every command the worker is asked to run.
struct RecordingHandler {
    log: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
}

#[async_trait]
impl BridgeHandler for RecordingHandler {
    async fn handle(
        &mut self,
        command: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        if let Ok(mut log) = self.log.lock() {
            log.push((command.to_string(), params.clone()));
        }
        Ok(Value::from(1))
    }
}

async fn pulser_with_worker() -> (BridgedPulser, Arc<Mutex<Vec<(String, Map<String, Value>)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (worker_w, session_r) = tokio::io::duplex(1024);
    let (session_w, worker_r) = tokio::io::duplex(1024);

    let handler = RecordingHandler { log: log.clone() };
    tokio::spawn(async move {
        let _ = bridge::serve(worker_r, worker_w, handler).await;
    });

    let session = BridgeSession::attach(
        session_r,
        session_w,
        Duration::from_secs(1),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let pulser = BridgedPulser::new(session, 1000, 2250, false, 16)
        .await
        .unwrap();
    (pulser, log)
}

#[tokio::test]
async fn construction_configures_the_burst() {
    let (_pulser, log) = pulser_with_worker().await;

    let log = log.lock().unwrap();
    let commands: Vec<&str> = log.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(commands, vec!["set_burst", "set_half_cycles", "set_voltage"]);

    let (_, burst_params) = &log[0];
    assert_eq!(burst_params["frequency_khz"], Value::from(2250));
    assert_eq!(burst_params["negative_polarity"], Value::from(false));
    let (_, half_cycle_params) = &log[1];
    assert_eq!(half_cycle_params["count"], Value::from(16));
}

#[tokio::test]
async fn rate_and_arm_go_through_the_bridge() {
    use common::capabilities::PulseSource;

    let (pulser, log) = pulser_with_worker().await;

    pulser.enable().await.unwrap();
    pulser.arm().await.unwrap();
    pulser.disable().await.unwrap();

    let log = log.lock().unwrap();
    let tail: Vec<(&str, Option<u64>)> = log
        .iter()
        .skip(3)
        .map(|(c, p)| (c.as_str(), p.get("hz").and_then(Value::as_u64)))
        .collect();
    assert_eq!(
        tail,
        vec![("set_prf", Some(1000)), ("arm", None), ("set_prf", Some(0))]
    );
}
