#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use asynca::{
    Callback, Context, PvId, Server, ServerBuilder,
    loopback::{Loopback, LoopbackBuilder},
    server::LoopPolicy,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// A context and a started server, talking over one loopback fabric
pub fn connected_client_server() -> (Context, Server, Arc<Loopback>) {
    client_server_with_loop_period(Duration::from_millis(500))
}

/// As [`connected_client_server`], with the server loop sleeping up to `period`
pub fn client_server_with_loop_period(period: Duration) -> (Context, Server, Arc<Loopback>) {
    init_tracing();
    let fabric = LoopbackBuilder::new()
        .search_period(Duration::from_millis(10))
        .build()
        .unwrap();
    let context = Context::new(fabric.clone());
    let server = ServerBuilder::new(fabric.clone())
        .loop_policy(LoopPolicy::PerServer)
        .loop_period(period)
        .start(&context)
        .unwrap();
    (context, server, fabric)
}

/// Connect to a PV and wait until the connection is up
pub async fn connect(context: &Context, name: &str) -> PvId {
    let pv = context.connect(name, None).unwrap();
    assert!(
        context
            .run_until(TIMEOUT, |c| c.connected(pv).unwrap())
            .await,
        "{name} never connected"
    );
    pv
}

/// A callback that stores every argument it is called with
pub fn recorder<A: Send + 'static>() -> (Callback<A>, Arc<Mutex<Vec<A>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = Callback::new(move |_, argument| {
        sink.lock().unwrap().push(argument);
        Ok(())
    });
    (callback, seen)
}

/// Pump events until `seen` holds at least `count` entries
pub async fn wait_for<A>(context: &Context, seen: &Arc<Mutex<Vec<A>>>, count: usize) -> bool {
    context
        .run_until(TIMEOUT, |_| seen.lock().unwrap().len() >= count)
        .await
}
