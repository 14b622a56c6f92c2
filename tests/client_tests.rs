mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use asynca::{
    Callback, ClientError,
    callback::{ConnectionChange, GetResult, PutResult},
    messages::ErrorCondition,
    server::ReadRequest,
    value::{ConversionError, Value},
};
use common::{TIMEOUT, connect, connected_client_server, recorder, wait_for};

#[tokio::test]
async fn test_put_then_get_every_type() {
    let (context, server, _fabric) = connected_client_server();
    let cases = [
        ("int8", Value::Int(-5), Value::Int(-5)),
        ("uint8", Value::Int(200), Value::Int(200)),
        ("int16", Value::Int(-300), Value::Int(-300)),
        ("uint16", Value::Int(60000), Value::Int(60000)),
        ("int32", Value::Int(-70000), Value::Int(-70000)),
        (
            "uint32",
            Value::Int(4_000_000_000),
            Value::Double(4_000_000_000.0),
        ),
        ("float", Value::Double(1.5), Value::Double(1.5)),
        ("double", Value::Double(3.25), Value::Double(3.25)),
        ("enum", Value::from("On"), Value::from("On")),
        ("string", Value::from("hello"), Value::from("hello")),
    ];
    for (scalar_type, written, expected) in cases {
        let name = format!("roundtrip:{scalar_type}");
        let variable = server.publish(&name, Some(scalar_type), None).unwrap();
        if scalar_type == "enum" {
            variable.set_enum_labels(&["Off", "On"]).unwrap();
        }
        let pv = connect(&context, &name).await;

        let (on_put, puts) = recorder::<PutResult>();
        context.put(pv, &written, Some(on_put)).unwrap();
        assert!(wait_for(&context, &puts, 1).await, "{name}: no put result");
        assert!(puts.lock().unwrap()[0].is_success(), "{name}: put failed");

        let (on_get, gets) = recorder::<GetResult>();
        context.get(pv, on_get).unwrap();
        assert!(wait_for(&context, &gets, 1).await, "{name}: no get result");
        let result = gets.lock().unwrap().remove(0);
        assert_eq!(result.value, expected, "{name}");
        assert_eq!(result.metadata.request_status, ErrorCondition::Normal);
        assert!(result.metadata.time.is_some());
        context.destroy(pv).unwrap();
    }
}

#[tokio::test]
async fn test_out_of_range_put_is_refused_before_sending() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("small", Some("int8"), None).unwrap();
    variable.write(&Value::Int(12)).unwrap();
    let pv = connect(&context, "small").await;

    let (on_put, puts) = recorder::<PutResult>();
    let err = context.put(pv, &Value::Int(300), Some(on_put)).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Conversion(ConversionError::OutOfRange { value: 300, .. })
    ));
    assert_eq!(err.to_string(), "Value outside range for type DBR_CHAR");
    context
        .run_until(Duration::from_millis(100), |_| false)
        .await;
    assert!(puts.lock().unwrap().is_empty());
    assert_eq!(variable.read(), Value::Int(12));
}

#[tokio::test]
async fn test_handle_accessors() {
    let (context, server, _fabric) = connected_client_server();
    server.publish("accessors", None, Some(1)).unwrap();
    let pv = context.connect("accessors", None).unwrap();
    assert_eq!(context.native_type_name(pv).unwrap(), "TYPENOTCONN");
    assert_eq!(context.element_count(pv).unwrap(), 0);
    assert!(
        context
            .run_until(TIMEOUT, |c| c.connected(pv).unwrap())
            .await
    );
    assert_eq!(context.pv_name(pv).unwrap(), "accessors");
    assert_eq!(context.native_type_name(pv).unwrap(), "DBR_DOUBLE");
    assert_eq!(context.element_count(pv).unwrap(), 1);
    assert!(context.channel_id(pv).is_ok());
    assert_eq!(context.pvs(), vec![pv]);

    context.destroy(pv).unwrap();
    assert!(matches!(
        context.connected(pv),
        Err(ClientError::UnknownPv(_))
    ));
    assert!(context.pvs().is_empty());
}

#[tokio::test]
async fn test_connection_callback_follows_variable() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("coming:going", None, None).unwrap();
    let (on_connection, changes) = recorder::<ConnectionChange>();
    let pv = context.connect("coming:going", Some(on_connection)).unwrap();
    assert!(wait_for(&context, &changes, 1).await);
    assert_eq!(
        changes.lock().unwrap()[0],
        ConnectionChange {
            name: "coming:going".to_string(),
            connected: true
        }
    );

    variable.destroy();
    assert!(wait_for(&context, &changes, 2).await);
    assert!(!changes.lock().unwrap()[1].connected);
    assert!(!context.connected(pv).unwrap());
    assert_eq!(context.native_type_name(pv).unwrap(), "DBR_DOUBLE");

    // Publishing the name again reconnects the same handle
    server.publish("coming:going", None, None).unwrap();
    assert!(wait_for(&context, &changes, 3).await);
    assert!(changes.lock().unwrap()[2].connected);
}

#[tokio::test]
async fn test_monitor_replacement() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("monitored", None, None).unwrap();
    let pv = connect(&context, "monitored").await;

    let (first, first_seen) = recorder::<GetResult>();
    context.monitor(pv, Some(first)).unwrap();
    assert!(context.has_monitor(pv).unwrap());
    assert!(wait_for(&context, &first_seen, 1).await);

    let (second, second_seen) = recorder::<GetResult>();
    context.monitor(pv, Some(second)).unwrap();
    let replaced_at = first_seen.lock().unwrap().len();
    assert!(wait_for(&context, &second_seen, 1).await);

    variable.write(&Value::Double(1.0)).unwrap();
    assert!(
        context
            .run_until(TIMEOUT, |_| second_seen
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.value == Value::Double(1.0)))
            .await
    );
    assert_eq!(first_seen.lock().unwrap().len(), replaced_at);

    context.monitor(pv, None).unwrap();
    assert!(!context.has_monitor(pv).unwrap());
    let before = second_seen.lock().unwrap().len();
    variable.write(&Value::Double(2.0)).unwrap();
    context
        .run_until(Duration::from_millis(200), |_| false)
        .await;
    assert_eq!(second_seen.lock().unwrap().len(), before);
}

#[tokio::test]
async fn test_destroy_with_queued_events() {
    let (context, server, _fabric) = connected_client_server();
    server.publish("busy", None, None).unwrap();
    let pv = connect(&context, "busy").await;

    let called = Arc::new(Mutex::new(false));
    let flag = called.clone();
    let callback = Callback::new(move |_, _: GetResult| {
        *flag.lock().unwrap() = true;
        Ok(())
    });
    context.get(pv, callback.clone()).unwrap();
    context.monitor(pv, Some(callback)).unwrap();
    tokio::time::timeout(TIMEOUT, context.wait_for_event())
        .await
        .expect("no event was queued");

    context.destroy(pv).unwrap();
    assert_eq!(context.process_events(), 0);
    context
        .run_until(Duration::from_millis(200), |_| false)
        .await;
    assert!(!*called.lock().unwrap());
}

#[tokio::test]
async fn test_unresolved_connect_then_destroy() {
    let (context, _server, _fabric) = connected_client_server();
    let (on_connection, changes) = recorder::<ConnectionChange>();
    let pv = context.connect("nobody:serves:this", Some(on_connection)).unwrap();
    let (on_update, updates) = recorder::<GetResult>();
    assert!(matches!(
        context.monitor(pv, Some(on_update)),
        Err(ClientError::NotConnected(_))
    ));
    assert!(
        !context
            .run_until(Duration::from_millis(200), |c| c.connected(pv).unwrap())
            .await
    );
    assert!(matches!(
        context.get(pv, recorder::<GetResult>().0),
        Err(ClientError::NotConnected(_))
    ));
    context.destroy(pv).unwrap();
    context
        .run_until(Duration::from_millis(100), |_| false)
        .await;
    assert!(changes.lock().unwrap().is_empty());
    assert!(updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_get_then_destroy_before_completion() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("slow", None, None).unwrap();
    let parked = Arc::new(Mutex::new(Vec::<ReadRequest>::new()));
    let stash = parked.clone();
    variable.on_read_request(Some(Callback::new(move |_, request| {
        stash.lock().unwrap().push(request);
        Ok(())
    })));
    let pv = connect(&context, "slow").await;

    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(
        context
            .run_until(TIMEOUT, |_| !parked.lock().unwrap().is_empty())
            .await
    );
    context.destroy(pv).unwrap();

    // The client's channel is gone, so the library abandons the request
    assert!(
        context
            .run_until(TIMEOUT, |_| !parked.lock().unwrap()[0].is_pending())
            .await
    );
    let request = parked.lock().unwrap().remove(0);
    assert!(request.complete(&Value::Double(1.0)).is_err());
    context
        .run_until(Duration::from_millis(200), |_| false)
        .await;
    assert!(gets.lock().unwrap().is_empty());
    assert_eq!(variable.read(), Value::Double(0.0));
}

#[tokio::test]
async fn test_callback_errors_are_reported_and_pumping_continues() {
    let (context, server, _fabric) = connected_client_server();
    server.publish("noisy", None, None).unwrap();
    let pv = connect(&context, "noisy").await;
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    context.set_background_error_handler(move |where_, err| {
        sink.lock().unwrap().push(format!("{where_}: {err}"));
    });

    context
        .get(pv, Callback::new(|_, _| Err("get script failed".into())))
        .unwrap();
    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(wait_for(&context, &gets, 1).await);
    assert_eq!(
        reported.lock().unwrap().as_slice(),
        ["epics get callback script: get script failed"]
    );
}
