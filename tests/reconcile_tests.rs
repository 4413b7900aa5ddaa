//! Tests for the reconciliation loop: bootstrap, bus cycles, recovery

use lumi_gateway_rust::catalog::{ParamSpec, StaticCatalog};
use lumi_gateway_rust::mock::{
    MockBleDecoder, MockBlobReader, MockBus, MockShellConnector, MockTransport,
};
use lumi_gateway_rust::{verify_gateway, GatewayConfig, LumiGateway, NormalizedUpdate};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const DB_CMD: &str = "cat /data/zigbee_gw/zigbee_gw.db | base64";
const COORDINATOR_CMD: &str = "cat /data/zigbee/coordinator.info";

fn test_catalog() -> Arc<StaticCatalog> {
    Arc::new(
        StaticCatalog::new()
            .with_model(
                "lumi.sensor_ht",
                vec![ParamSpec::new(
                    "0.1.85",
                    Some("temperature"),
                    "temperature",
                    Some("sensor"),
                )],
            )
            .with_model("lumi.gateway.mgl03", vec![]),
    )
}

fn populated_shell() -> Arc<MockShellConnector> {
    let shell = MockShellConnector::new();
    shell.set_output(DB_CMD, b"ZGI=\r\n");
    shell.set_output(COORDINATOR_CMD, br#"{"mac":"0x04cf8c123456"}"#);
    Arc::new(shell)
}

fn db_entries() -> HashMap<String, String> {
    HashMap::from([
        ("dev_list".to_string(), r#"["lumi.1"]"#.to_string()),
        ("lumi.1.model".to_string(), "lumi.sensor_ht".to_string()),
        ("lumi.1.mac".to_string(), "158d0002c81234".to_string()),
        ("lumi.1.version".to_string(), "2".to_string()),
        ("lumi.1.prop".to_string(), r#"{"props":{"temperature":2000}}"#.to_string()),
    ])
}

fn report_payload() -> Vec<u8> {
    json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [{"res_name": "0.1.85", "value": 2350}],
    })
    .to_string()
    .into_bytes()
}

fn build_gateway(
    transport: Arc<MockTransport>,
    shell: Arc<MockShellConnector>,
    bus: MockBus,
) -> LumiGateway {
    LumiGateway::with_channels(
        GatewayConfig::new("192.168.1.50"),
        transport,
        test_catalog(),
        Arc::new(MockBlobReader::new(db_entries())),
        Arc::new(MockBleDecoder::unsupported()),
        Box::new(bus),
        shell,
    )
    .unwrap()
}

fn collect_updates(
    handle: &lumi_gateway_rust::GatewayHandle,
    did: &str,
) -> Arc<Mutex<Vec<NormalizedUpdate>>> {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    handle.add_update(did, Arc::new(move |update| sink.lock().unwrap().push(update.clone())));
    updates
}

#[tokio::test(start_paused = true)]
async fn disconnect_unblocks_the_receive_loop() {
    let bus = MockBus::new();
    // two receive-loop cycles, each ending in a simulated disconnect
    bus.enqueue_batch(vec![("zigbee/send".to_string(), report_payload())]);
    bus.enqueue_batch(vec![("zigbee/send".to_string(), report_payload())]);

    let gateway = build_gateway(Arc::new(MockTransport::new()), populated_shell(), bus);
    let handle = gateway.handle();
    handle.add_setup("sensor", Arc::new(|_, _| {}));
    let updates = collect_updates(&handle, "lumi.1");

    let _ = timeout(Duration::from_secs(300), gateway.run()).await;

    // both batches arrived, so the first disconnect returned control to the
    // loop and the bus reconnected
    assert_eq!(updates.lock().unwrap().len(), 2);
    assert!(handle.hub().is_some());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_registers_discovered_devices() {
    let gateway = build_gateway(
        Arc::new(MockTransport::new()),
        populated_shell(),
        MockBus::new(),
    );
    let handle = gateway.handle();
    handle.add_setup("sensor", Arc::new(|_, _| {}));

    let _ = timeout(Duration::from_secs(60), gateway.run()).await;

    assert!(handle.hub().is_some());
    let sensor = handle.device("lumi.1").unwrap();
    assert_eq!(sensor.properties["temperature"], json!(20.0));
}

#[tokio::test(start_paused = true)]
async fn failed_bus_connect_recovers_through_the_shell() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_response("enable_telnet_service", json!(["ok"]));

    let bus = MockBus::new();
    bus.fail_next_connects(1);
    bus.enqueue_batch(vec![("zigbee/send".to_string(), report_payload())]);

    let shell = populated_shell();
    let gateway = build_gateway(transport, shell.clone(), bus);
    let handle = gateway.handle();
    handle.add_setup("sensor", Arc::new(|_, _| {}));
    let updates = collect_updates(&handle, "lumi.1");

    let _ = timeout(Duration::from_secs(300), gateway.run()).await;

    // the broker restart sequence ran over the shell
    let commands = shell.commands.lock().unwrap();
    assert!(commands.iter().any(|cmd| cmd == "killall mosquitto"));
    assert!(commands.iter().any(|cmd| cmd.starts_with("tail -F /var/log/messages")));
    drop(commands);

    // and the bus came back afterwards
    assert_eq!(updates.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_gateway_keeps_backing_off() {
    let transport = Arc::new(MockTransport::new());
    transport.set_reachable(false);

    let gateway = build_gateway(transport, populated_shell(), MockBus::new());
    let handle = gateway.handle();

    let _ = timeout(Duration::from_secs(100), gateway.run()).await;

    // still bootstrapping: nothing registered, no crash
    assert!(handle.hub().is_none());
}

#[tokio::test]
async fn verify_accepts_only_the_supported_gateway_model() {
    let supported = MockTransport::new();
    assert!(verify_gateway(&supported).await.is_ok());

    let other = MockTransport::with_identity("lumi.camera.gwagl01", "aa:bb:cc:dd:ee:ff");
    assert!(verify_gateway(&other).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn setup_blocks_until_the_domain_handler_registers() {
    let gateway = build_gateway(
        Arc::new(MockTransport::new()),
        populated_shell(),
        MockBus::new(),
    );
    let handle = gateway.handle();

    let setups = Arc::new(Mutex::new(Vec::new()));
    let seen = setups.clone();
    let late_handle = handle.clone();
    tokio::spawn(async move {
        // the host registers its domain well after discovery started
        sleep(Duration::from_secs(5)).await;
        late_handle.add_setup(
            "sensor",
            Arc::new(move |device, attr| {
                seen.lock().unwrap().push((device.did.clone(), attr.to_string()));
            }),
        );
    });

    let _ = timeout(Duration::from_secs(60), gateway.run()).await;

    assert_eq!(
        *setups.lock().unwrap(),
        vec![("lumi.1".to_string(), "temperature".to_string())],
    );
    assert!(handle.hub().is_some());
}
