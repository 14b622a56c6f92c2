mod common;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use asynca::{
    Callback, Context, ServerBuilder, ServerError,
    callback::{GetResult, PutResult},
    loopback::LoopbackBuilder,
    messages::ErrorCondition,
    server::{LoopPolicy, ReadRequest, WriteRequest},
    value::Value,
};
use common::{
    client_server_with_loop_period, connect, connected_client_server, init_tracing, recorder,
    wait_for,
};

#[tokio::test]
async fn test_events() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:value", Some("double"), None).unwrap();
    variable.write(&Value::Double(3.14)).unwrap();
    let pv = connect(&context, "test:value").await;

    let (on_update, updates) = recorder::<GetResult>();
    context.monitor(pv, Some(on_update)).unwrap();
    assert!(wait_for(&context, &updates, 1).await);
    assert_eq!(updates.lock().unwrap()[0].value, Value::Double(3.14));

    variable.write(&Value::Double(2.5)).unwrap();
    assert!(wait_for(&context, &updates, 2).await);
    assert_eq!(updates.lock().unwrap()[1].value, Value::Double(2.5));

    // Client writes are posted to monitors too
    context.put(pv, &Value::Double(-1.0), None).unwrap();
    assert!(wait_for(&context, &updates, 3).await);
    assert_eq!(updates.lock().unwrap()[2].value, Value::Double(-1.0));
    assert_eq!(variable.read(), Value::Double(-1.0));
}

#[tokio::test]
async fn test_enum_states() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:switch", Some("enum"), None).unwrap();
    variable.set_enum_labels(&["Off", "On"]).unwrap();

    variable.write(&Value::from("On")).unwrap();
    assert_eq!(variable.read_as_enum_label().unwrap(), "On");
    assert!(matches!(
        variable.write(&Value::from("Unknown")),
        Err(ServerError::Conversion(_))
    ));
    assert_eq!(variable.read_as_enum_label().unwrap(), "On");

    variable.write(&Value::Int(5)).unwrap();
    assert_eq!(variable.read_as_enum_label().unwrap(), "5");

    let pv = connect(&context, "test:switch").await;
    assert_eq!(context.native_type_name(pv).unwrap(), "DBR_ENUM");
    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(wait_for(&context, &gets, 1).await);
    assert_eq!(gets.lock().unwrap()[0].value, Value::from("5"));

    // Clients may put either an index or a label
    let (on_put, puts) = recorder::<PutResult>();
    context.put(pv, &Value::Int(0), Some(on_put.clone())).unwrap();
    context.put(pv, &Value::from("On"), Some(on_put)).unwrap();
    assert!(wait_for(&context, &puts, 2).await);
    assert!(puts.lock().unwrap().iter().all(PutResult::is_success));
    assert_eq!(variable.read_as_enum_label().unwrap(), "On");
}

#[tokio::test]
async fn test_deferred_read_answers_without_storing() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:deferred", None, None).unwrap();
    variable.write(&Value::Double(1.0)).unwrap();
    variable.on_read_request(Some(Callback::new(|_, request: ReadRequest| {
        request.complete(&Value::Double(42.0))?;
        Ok(())
    })));
    let pv = connect(&context, "test:deferred").await;

    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(wait_for(&context, &gets, 1).await);
    let result = gets.lock().unwrap().remove(0);
    assert_eq!(result.value, Value::Double(42.0));
    assert_eq!(result.metadata.request_status, ErrorCondition::Normal);
    assert_eq!(variable.read(), Value::Double(1.0));
}

#[tokio::test]
async fn test_deferred_write_is_stored_on_completion() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:guarded", Some("int32"), None).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    variable.on_write_request(Some(Callback::new(move |_, request: WriteRequest| {
        sink.lock().unwrap().push(request.incoming_value().clone());
        request.complete()?;
        Ok(())
    })));
    let pv = connect(&context, "test:guarded").await;

    let (on_put, puts) = recorder::<PutResult>();
    context.put(pv, &Value::Int(17), Some(on_put)).unwrap();
    assert!(wait_for(&context, &puts, 1).await);
    assert!(puts.lock().unwrap()[0].is_success());
    assert_eq!(seen.lock().unwrap().as_slice(), [Value::Int(17)]);
    assert_eq!(variable.read(), Value::Int(17));
}

#[tokio::test]
async fn test_deferred_write_can_be_refused() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:readonly", None, None).unwrap();
    variable.on_write_request(Some(Callback::new(|_, request: WriteRequest| {
        request.fail(ErrorCondition::NoWtAccess)?;
        Ok(())
    })));
    let pv = connect(&context, "test:readonly").await;

    let (on_put, puts) = recorder::<PutResult>();
    context.put(pv, &Value::Double(9.0), Some(on_put)).unwrap();
    assert!(wait_for(&context, &puts, 1).await);
    assert_eq!(puts.lock().unwrap()[0].code, ErrorCondition::NoWtAccess);
    assert_eq!(variable.read(), Value::Double(0.0));
}

#[tokio::test]
async fn test_destroyed_variable_fails_pending_read_once() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:vanishing", None, None).unwrap();
    let parked = Arc::new(Mutex::new(Vec::<ReadRequest>::new()));
    let stash = parked.clone();
    variable.on_read_request(Some(Callback::new(move |_, request| {
        stash.lock().unwrap().push(request);
        Ok(())
    })));
    let pv = connect(&context, "test:vanishing").await;

    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(
        context
            .run_until(common::TIMEOUT, |_| !parked.lock().unwrap().is_empty())
            .await
    );
    variable.destroy();
    assert!(variable.is_destroyed());
    assert!(server.find("test:vanishing").is_none());

    let request = parked.lock().unwrap().remove(0);
    assert!(!request.is_pending());
    assert!(matches!(
        request.complete(&Value::Double(1.0)),
        Err(ServerError::NotPending)
    ));
    drop(request);

    assert!(wait_for(&context, &gets, 1).await);
    context
        .run_until(Duration::from_millis(200), |_| false)
        .await;
    let gets = gets.lock().unwrap();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].value, Value::Empty);
    assert_eq!(gets[0].metadata.request_status, ErrorCondition::Disconn);
}

#[tokio::test]
async fn test_failing_read_callback_fails_the_get() {
    let (context, server, _fabric) = connected_client_server();
    let variable = server.publish("test:broken", None, None).unwrap();
    variable.on_read_request(Some(Callback::new(|_, _| Err("no value today".into()))));
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    context.set_background_error_handler(move |where_, err| {
        sink.lock().unwrap().push(format!("{where_}: {err}"));
    });
    let pv = connect(&context, "test:broken").await;

    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(wait_for(&context, &gets, 1).await);
    assert_eq!(
        gets.lock().unwrap()[0].metadata.request_status,
        ErrorCondition::GetFail
    );
    assert_eq!(
        reported.lock().unwrap().as_slice(),
        ["epics read request callback script: no value today"]
    );
}

#[tokio::test]
async fn test_idle_loop_is_woken_by_completions_and_writes() {
    let (context, server, _fabric) = client_server_with_loop_period(Duration::from_secs(100));
    let prompt = Duration::from_secs(1);

    let deferred = server.publish("test:deferred", None, None).unwrap();
    deferred.on_read_request(Some(Callback::new(|_, request: ReadRequest| {
        request.complete(&Value::Double(7.0))?;
        Ok(())
    })));
    let monitored = server.publish("test:monitored", None, None).unwrap();
    let deferred_pv = connect(&context, "test:deferred").await;
    let monitored_pv = connect(&context, "test:monitored").await;
    let (on_update, updates) = recorder::<GetResult>();
    context.monitor(monitored_pv, Some(on_update)).unwrap();
    assert!(wait_for(&context, &updates, 1).await);

    let (on_get, gets) = recorder::<GetResult>();
    let started = Instant::now();
    context.get(deferred_pv, on_get).unwrap();
    assert!(
        context
            .run_until(prompt, |_| !gets.lock().unwrap().is_empty())
            .await,
        "deferred read took longer than {prompt:?}"
    );
    assert!(started.elapsed() < prompt);
    assert_eq!(gets.lock().unwrap()[0].value, Value::Double(7.0));

    let started = Instant::now();
    monitored.write(&Value::Double(8.0)).unwrap();
    assert!(
        context
            .run_until(prompt, |_| updates.lock().unwrap().len() >= 2)
            .await,
        "monitor update took longer than {prompt:?}"
    );
    assert!(started.elapsed() < prompt);
    assert_eq!(updates.lock().unwrap()[1].value, Value::Double(8.0));
}

#[tokio::test]
async fn test_servers_sharing_a_loop() {
    init_tracing();
    let fabric = LoopbackBuilder::new()
        .search_period(Duration::from_millis(10))
        .build()
        .unwrap();
    let context = Context::new(fabric.clone());
    let start = || {
        ServerBuilder::new(fabric.clone())
            .loop_policy(LoopPolicy::Shared)
            .loop_period(Duration::from_millis(500))
            .start(&context)
            .unwrap()
    };
    let first = start();
    let second = start();
    first.publish("first:value", None, None).unwrap();
    let survivor = second.publish("second:value", None, None).unwrap();
    assert!(matches!(
        first.publish("first:value", None, None),
        Err(ServerError::AlreadyExists(_))
    ));

    let pv = connect(&context, "second:value").await;
    first.destroy();

    survivor.write(&Value::Double(6.0)).unwrap();
    let (on_get, gets) = recorder::<GetResult>();
    context.get(pv, on_get).unwrap();
    assert!(wait_for(&context, &gets, 1).await);
    assert_eq!(gets.lock().unwrap()[0].value, Value::Double(6.0));
}

#[tokio::test]
async fn test_registry_lookup() {
    let (_context, server, _fabric) = connected_client_server();
    server.publish("b", Some("string"), None).unwrap();
    server.publish("a", Some("uint16"), None).unwrap();
    assert!(matches!(
        server.publish("c", Some("complex"), None),
        Err(ServerError::UnknownType(_))
    ));
    assert!(matches!(
        server.publish("c", None, Some(0)),
        Err(ServerError::InvalidCount(0))
    ));

    let all = server.list_all();
    assert_eq!(all.keys().collect::<Vec<_>>(), ["a", "b"]);
    let found = server.find("a").unwrap();
    assert_eq!(found, all["a"]);
    assert_eq!(found.scalar_type().name(), "uint16");
    assert!(server.find("c").is_none());

    found.destroy();
    assert_eq!(server.list_all().len(), 1);
}
