//! End to end over the in-memory engine and broker: outbound publish, local
//! responder, inbound resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

use flowbridge_api::app::AppServices;
use flowbridge_core::{JobKey, RequestId, Variables};
use flowbridge_infra::config::BridgeConfig;
use flowbridge_infra::engine::InMemoryWorkflowEngine;
use flowbridge_infra::workers::{WorkerHandle, shutdown_all};
use flowbridge_messaging::{InMemoryBroker, MessageBroker};

struct Harness {
    engine: InMemoryWorkflowEngine,
    broker: InMemoryBroker,
    services: AppServices,
    token: CancellationToken,
    handles: Vec<WorkerHandle>,
}

impl Harness {
    fn start(responder: bool) -> Self {
        let env: HashMap<&str, String> = HashMap::from([
            ("ENGINE_MODE", "memory".to_string()),
            ("BROKER_MODE", "memory".to_string()),
            ("WORKER_POLL_INTERVAL_MS", "10".to_string()),
            ("WORKER_JOB_TIMEOUT_MS", "2000".to_string()),
            ("BRIDGE_RESPONDER_ENABLED", responder.to_string()),
        ]);
        let config = BridgeConfig::from_lookup(|key| env.get(key).cloned()).unwrap();

        let engine = InMemoryWorkflowEngine::new();
        let broker = InMemoryBroker::new();
        let services = AppServices::new(Arc::new(engine.clone()), Arc::new(broker.clone()));
        let token = CancellationToken::new();
        let handles = services.start_workers(&config, &token).unwrap();

        Self {
            engine,
            broker,
            services,
            token,
            handles,
        }
    }

    async fn stop(self) {
        self.token.cancel();
        let aborted = shutdown_all(self.handles, Duration::from_secs(2)).await;
        assert_eq!(aborted, 0, "every loop should stop within the grace period");
    }

    fn completion_of(&self, key: JobKey) -> Option<Variables> {
        self.engine
            .completions()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, vars)| vars)
    }
}

async fn eventually<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn vars(value: JsonValue) -> Variables {
    match value {
        JsonValue::Object(map) => map,
        _ => Variables::new(),
    }
}

#[tokio::test]
async fn request_round_trip_resumes_the_waiting_instance() {
    let h = Harness::start(true);
    let pi = h
        .engine
        .start_instance(vars(json!({"target": "a@example.com", "subject": "hi"})));

    let mint = h.engine.create_job(pi, "generate-request-id", "mint", Variables::new(), 3);
    let minted = eventually(|| h.completion_of(mint)).await;
    let request_id = minted["requestId"].as_str().unwrap().to_string();

    h.engine.await_message(pi, "ResponseMessage", &request_id);
    let publish = h.engine.create_job(pi, "bridge", "publish", Variables::new(), 3);

    let published = eventually(|| h.completion_of(publish)).await;
    assert_eq!(published["status"], "success");
    assert_eq!(published["requestId"], request_id.as_str());

    eventually(|| h.engine.correlations().into_iter().find(|(k, _)| *k == pi)).await;
    assert!(!h.engine.is_waiting(pi));

    let resumed = h.engine.instance_variables(pi).unwrap();
    assert_eq!(resumed["status"], "success");
    assert_eq!(resumed["response"]["payload"]["deliveredTo"], "a@example.com");
    assert_eq!(resumed["response"]["payload"]["echo"]["subject"], "hi");

    let record = h
        .services
        .registry
        .lookup(&RequestId::parse(request_id.as_str()).unwrap())
        .unwrap();
    assert!(record.status.is_terminal());

    let after = h.engine.create_job(pi, "success-handler", "log", Variables::new(), 3);
    let logged = eventually(|| h.completion_of(after)).await;
    assert_eq!(logged["handled"], true);

    h.stop().await;
}

#[tokio::test]
async fn response_without_request_id_is_skipped_and_loop_keeps_going() {
    let h = Harness::start(false);
    let pi = h.engine.start_instance(Variables::new());
    h.engine.await_message(pi, "ResponseMessage", "r1");
    h.services
        .registry
        .register(RequestId::parse("r1").unwrap(), JobKey::new(1), pi);

    h.broker
        .produce("bridge.responses", "", r#"{"status":"success"}"#)
        .await
        .unwrap();
    h.broker
        .produce("bridge.responses", "r1", r#"{"requestId":"r1","status":"success"}"#)
        .await
        .unwrap();

    eventually(|| h.engine.correlations().into_iter().find(|(k, _)| *k == pi)).await;
    assert_eq!(h.engine.publications().len(), 1);
    eventually(|| (h.broker.committed_offset("bridge.responses", "bridge.inbound") == 2).then_some(())).await;

    h.stop().await;
}

#[tokio::test]
async fn error_response_resumes_with_error_status() {
    let h = Harness::start(false);
    let pi = h.engine.start_instance(Variables::new());
    h.engine.await_message(pi, "ResponseMessage", "r2");
    h.services
        .registry
        .register(RequestId::parse("r2").unwrap(), JobKey::new(1), pi);

    h.broker
        .produce(
            "bridge.responses",
            "r2",
            r#"{"RequestId":"r2","Status":"error","ErrorMessage":"Failed to send email"}"#,
        )
        .await
        .unwrap();

    eventually(|| h.engine.correlations().into_iter().find(|(k, _)| *k == pi)).await;
    let resumed = h.engine.instance_variables(pi).unwrap();
    assert_eq!(resumed["status"], "error");
    assert_eq!(resumed["detail"], "Failed to send email");

    h.stop().await;
}

#[tokio::test]
async fn bridge_job_without_target_fails_with_decremented_retries() {
    let h = Harness::start(false);
    let pi = h.engine.start_instance(Variables::new());
    let job = h.engine.create_job(pi, "bridge", "publish", Variables::new(), 3);

    let failure = eventually(|| h.engine.failures().into_iter().find(|f| f.job_key == job)).await;

    assert_eq!(failure.retries, 2);
    assert!(h.broker.published("bridge.requests").is_empty());
    h.stop().await;
}
