//! Tests for inbound normalization and the outbound write path

use lumi_gateway_rust::catalog::{ParamSpec, StaticCatalog};
use lumi_gateway_rust::client::BusHandler;
use lumi_gateway_rust::config::DebugFlags;
use lumi_gateway_rust::mock::{MockBleDecoder, RecordingPublisher};
use lumi_gateway_rust::services::device_registry::{DeviceDescriptor, DeviceRegistry};
use lumi_gateway_rust::services::pipeline::EventPipeline;
use lumi_gateway_rust::{GatewayError, NormalizedUpdate};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn test_catalog() -> Arc<StaticCatalog> {
    Arc::new(
        StaticCatalog::new()
            .with_model(
                "lumi.sensor_ht",
                vec![
                    ParamSpec::new("0.1.85", Some("temperature"), "temperature", None),
                    ParamSpec::new("0.2.85", Some("humidity"), "humidity", None),
                    ParamSpec::new("8.0.2002", Some("battery"), "battery", None),
                ],
            )
            .with_model(
                "lumi.ctrl_ln1",
                vec![ParamSpec::new("4.1.85", None, "channel_0", None)],
            )
            .with_ble_domain("temperature", "sensor"),
    )
}

struct Fixture {
    registry: Arc<DeviceRegistry>,
    pipeline: EventPipeline,
    publisher: Arc<RecordingPublisher>,
}

async fn fixture_with_decoder(decoder: MockBleDecoder) -> Fixture {
    let catalog = test_catalog();
    let registry = Arc::new(DeviceRegistry::new(catalog.clone(), HashMap::new()));
    let publisher = Arc::new(RecordingPublisher::new());

    registry
        .setup_device(DeviceDescriptor::bare(
            "lumi.1",
            "0x158d0001",
            "lumi.sensor_ht",
        ))
        .await;
    registry
        .setup_device(DeviceDescriptor::bare("lumi.2", "0x158d0002", "lumi.ctrl_ln1"))
        .await;

    let pipeline = EventPipeline::new(
        registry.clone(),
        catalog,
        Arc::new(decoder),
        publisher.clone(),
        DebugFlags::default(),
    );

    Fixture {
        registry,
        pipeline,
        publisher,
    }
}

async fn fixture() -> Fixture {
    fixture_with_decoder(MockBleDecoder::unsupported()).await
}

fn collect_updates(fixture: &Fixture, did: &str) -> Arc<Mutex<Vec<NormalizedUpdate>>> {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    fixture
        .registry
        .add_update(did, Arc::new(move |update| sink.lock().unwrap().push(update.clone())));
    updates
}

#[tokio::test]
async fn report_resolves_names_and_scales_values() {
    let fixture = fixture().await;
    let updates = collect_updates(&fixture, "lumi.1");

    let payload = json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [
            {"res_name": "0.1.85", "value": 2350},
            {"res_name": "0.2.85", "value": 4500},
        ],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].properties["temperature"], json!(23.5));
    assert_eq!(updates[0].properties["humidity"], json!(45.0));

    // the device record tracks the latest values
    let record = fixture.registry.get("lumi.1").unwrap();
    assert_eq!(record.properties["temperature"], json!(23.5));
}

#[tokio::test]
async fn low_battery_millivolts_clamp_to_zero() {
    let fixture = fixture().await;
    let updates = collect_updates(&fixture, "lumi.1");

    let payload = json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [{"res_name": "8.0.2002", "value": 1500}],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(updates.lock().unwrap()[0].properties["battery"], json!(0));
}

#[tokio::test]
async fn heartbeat_reads_nested_resource_list() {
    let fixture = fixture().await;
    let updates = collect_updates(&fixture, "lumi.1");

    let payload = json!({
        "cmd": "heartbeat",
        "params": [{
            "did": "lumi.1",
            "time": 1234,
            "res_list": [{"res_name": "8.0.2008", "value": 3005}],
        }],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(updates.lock().unwrap()[0].properties["voltage"], json!(3005));
}

#[tokio::test]
async fn multi_element_heartbeat_is_a_protocol_violation() {
    let fixture = fixture().await;

    let payload = json!({
        "cmd": "heartbeat",
        "params": [
            {"did": "lumi.1", "res_list": []},
            {"did": "lumi.2", "res_list": []},
        ],
    });
    let err = fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Protocol(_)));
}

#[tokio::test]
async fn write_rsp_skips_failed_entries() {
    let fixture = fixture().await;
    let updates = collect_updates(&fixture, "lumi.2");

    let payload = json!({
        "cmd": "write_rsp",
        "did": "lumi.2",
        "results": [
            {"res_name": "4.1.85", "value": "on", "error_code": 0},
            {"res_name": "4.2.85", "error_code": -1},
        ],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    let updates = updates.lock().unwrap();
    assert_eq!(updates[0].properties, HashMap::from([("channel_0".to_string(), json!(1))]));
}

#[tokio::test]
async fn unknown_command_is_rejected_and_registry_untouched() {
    let fixture = fixture().await;
    let before = fixture.registry.get("lumi.1").unwrap().properties.clone();

    let payload = json!({"cmd": "mystery", "did": "lumi.1", "params": []});
    let err = fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Protocol(_)));
    assert_eq!(fixture.registry.get("lumi.1").unwrap().properties, before);
}

#[tokio::test]
async fn updates_without_subscribers_are_dropped_silently() {
    let fixture = fixture().await;

    let payload = json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [{"res_name": "0.1.85", "value": 2000}],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    // no subscriber, no processing: the record keeps its old state
    let record = fixture.registry.get("lumi.1").unwrap();
    assert!(!record.properties.contains_key("temperature"));
}

#[tokio::test]
async fn subscribers_run_in_registration_order() {
    let fixture = fixture().await;

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let seen = order.clone();
        fixture
            .registry
            .add_update("lumi.1", Arc::new(move |_| seen.lock().unwrap().push(tag)));
    }

    let payload = json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [{"res_name": "0.1.85", "value": 100}],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[tokio::test]
async fn outbound_write_round_trips_through_inbound_report() {
    let fixture = fixture().await;
    let updates = collect_updates(&fixture, "lumi.2");

    fixture.pipeline.send_write("lumi.2", "channel_0", json!(1)).unwrap();

    let published = fixture.publisher.payloads("zigbee/recv");
    assert_eq!(published.len(), 1);
    assert_eq!(
        String::from_utf8(published[0].clone()).unwrap(),
        r#"{"cmd":"write","did":"lumi.2","params":[{"res_name":"4.1.85","value":1}]}"#,
    );

    // the acknowledgement uses the same wire name and resolves back to the
    // canonical property
    let response: Value = serde_json::from_slice(&published[0]).unwrap();
    let wire = response["params"][0]["res_name"].as_str().unwrap();
    let payload = json!({
        "cmd": "report",
        "did": "lumi.2",
        "params": [{"res_name": wire, "value": "on"}],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(updates.lock().unwrap()[0].properties["channel_0"], json!(1));
}

#[tokio::test]
async fn write_to_unmapped_property_fails_synchronously() {
    let fixture = fixture().await;

    let err = fixture
        .pipeline
        .send_write("lumi.2", "brightness", json!(50))
        .unwrap_err();

    assert!(matches!(err, GatewayError::UnknownParameter(_)));
    assert!(fixture.publisher.payloads("zigbee/recv").is_empty());
}

#[tokio::test]
async fn added_device_report_registers_the_new_device() {
    let fixture = fixture().await;
    collect_updates(&fixture, "lumi.1");

    let payload = json!({
        "cmd": "report",
        "did": "lumi.1",
        "params": [{
            "res_name": "8.0.2084",
            "value": {
                "did": "lumi.9",
                "mac": "158d0009",
                "model": "lumi.sensor_ht",
                "version": "21",
                "zb_ver": "3.0",
            },
        }],
    });
    fixture
        .pipeline
        .handle_command(payload.to_string().as_bytes())
        .await
        .unwrap();

    let added = fixture.registry.get("lumi.9").unwrap();
    assert_eq!(added.mac, "0x158d0009");
    assert_eq!(added.model, "lumi.sensor_ht");
    assert_eq!(added.zb_version.as_deref(), Some("3.0"));
}

#[tokio::test]
async fn bluetooth_sighting_creates_record_and_runs_setup_once() {
    let fixture = fixture_with_decoder(MockBleDecoder::new(Some(HashMap::from([(
        "temperature".to_string(),
        json!(21.5),
    )]))))
    .await;

    let setups = Arc::new(Mutex::new(Vec::new()));
    let seen = setups.clone();
    fixture.registry.add_setup(
        "sensor",
        Arc::new(move |device, attr| {
            seen.lock().unwrap().push((device.did.clone(), attr.to_string()));
        }),
    );

    let line = format!(
        "asap_recv: {}",
        json!({
            "method": "_async.ble_event",
            "params": {
                "dev": {"did": "blt.3.abc", "mac": "A4:C1:38:00:11:22"},
                "evt": [{"eid": 4100, "edata": "d20200"}],
            },
        })
    );

    fixture.pipeline.handle_bluetooth(line.as_bytes()).await.unwrap();
    // a second advertisement for the same property must not re-run setup
    fixture.pipeline.handle_bluetooth(line.as_bytes()).await.unwrap();

    assert_eq!(
        *setups.lock().unwrap(),
        vec![("blt.3.abc".to_string(), "temperature".to_string())],
    );

    let record = fixture.registry.get("blt.3.abc").unwrap();
    assert_eq!(record.mac, "a4c138001122");
    assert_eq!(record.device_name.as_deref(), Some("BLE"));
    assert_eq!(record.properties["temperature"], json!(21.5));
}

#[tokio::test]
async fn bluetooth_event_with_multiple_entries_is_rejected() {
    let fixture = fixture_with_decoder(MockBleDecoder::new(Some(HashMap::new()))).await;

    let line = format!(
        "asap_recv: {}",
        json!({
            "method": "_async.ble_event",
            "params": {
                "dev": {"did": "blt.3.abc", "mac": "A4:C1:38:00:11:22"},
                "evt": [{"eid": 4100}, {"eid": 4102}],
            },
        })
    );

    let err = fixture.pipeline.handle_bluetooth(line.as_bytes()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Protocol(_)));
}

#[tokio::test]
async fn undecodable_bluetooth_events_are_dropped() {
    let fixture = fixture_with_decoder(MockBleDecoder::unsupported()).await;

    let line = format!(
        "asap_recv: {}",
        json!({
            "method": "_async.ble_event",
            "params": {
                "dev": {"did": "blt.3.abc", "mac": "A4:C1:38:00:11:22"},
                "evt": [{"eid": 9999}],
            },
        })
    );

    fixture.pipeline.handle_bluetooth(line.as_bytes()).await.unwrap();

    // the record exists from the sighting, but carries no properties
    let record = fixture.registry.get("blt.3.abc").unwrap();
    assert!(record.properties.is_empty());
}

#[tokio::test]
async fn unrelated_log_lines_are_ignored() {
    let fixture = fixture().await;

    let handler: &dyn BusHandler = &fixture.pipeline;
    handler.handle("log/bt", b"[D] BT some unrelated chatter").await;
    handler.handle("homeassistant/status", b"online").await;

    assert!(fixture.registry.get("blt.3.abc").is_none());
}
