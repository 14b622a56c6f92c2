use std::time::Duration;

use asynca::{
    Callback, Context, ServerBuilder,
    callback::{ConnectionChange, GetResult, PutResult},
    loopback::Loopback,
    server::ReadRequest,
    value::Value,
};
use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// Prefix for the published PV names
    #[clap(default_value = "demo")]
    prefix: String,
    /// Number of updates to post to the monitored PV
    #[clap(short, long, default_value_t = 5)]
    updates: u32,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let fabric = Loopback::new().unwrap();
    let context = Context::new(fabric.clone());
    let server = context.start_server(ServerBuilder::new(fabric)).unwrap();

    let counter_name = format!("{}:counter", opts.prefix);
    let mode_name = format!("{}:mode", opts.prefix);
    let clock_name = format!("{}:clock", opts.prefix);

    let counter = server.publish(&counter_name, Some("int32"), None).unwrap();
    let mode = server.publish(&mode_name, Some("enum"), None).unwrap();
    mode.set_enum_labels(&["Idle", "Running", "Fault"]).unwrap();
    let clock = server.publish(&clock_name, Some("string"), None).unwrap();
    clock.on_read_request(Some(Callback::new(|_, request: ReadRequest| {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        request.complete(&Value::from(format!("{:.3}", now.as_secs_f64())))?;
        Ok(())
    })));
    for (name, variable) in server.list_all() {
        println!("Serving {name} ({})", variable.scalar_type());
    }

    let on_connection = Callback::new(|_, change: ConnectionChange| {
        println!(
            "{} {}",
            change.name,
            if change.connected { "connected" } else { "disconnected" }
        );
        Ok(())
    });
    let counter_pv = context
        .connect(&counter_name, Some(on_connection.clone()))
        .unwrap();
    let mode_pv = context.connect(&mode_name, Some(on_connection.clone())).unwrap();
    let clock_pv = context.connect(&clock_name, Some(on_connection)).unwrap();
    let all_up = context
        .run_until(Duration::from_secs(5), |c| {
            [counter_pv, mode_pv, clock_pv]
                .iter()
                .all(|pv| c.connected(*pv).unwrap_or(false))
        })
        .await;
    if !all_up {
        eprintln!("Timed out waiting for connections");
        std::process::exit(1);
    }

    context
        .monitor(
            counter_pv,
            Some(Callback::new(|_, update: GetResult| {
                println!("    counter = {} ({})", update.value, update.metadata.message());
                Ok(())
            })),
        )
        .unwrap();
    context
        .put(
            mode_pv,
            &Value::from("Running"),
            Some(Callback::new(|_, result: PutResult| {
                println!("    put mode: {}", result.message());
                Ok(())
            })),
        )
        .unwrap();
    context
        .get(
            clock_pv,
            Callback::new(|_, result: GetResult| {
                println!("    clock = {}", result.value);
                Ok(())
            }),
        )
        .unwrap();

    for i in 1..=opts.updates {
        counter.write(&Value::Int(i64::from(i))).unwrap();
        context
            .run_until(Duration::from_millis(200), |_| false)
            .await;
    }
    println!("{mode_name} is {}", mode.read_as_enum_label().unwrap());

    for pv in context.pvs() {
        context.destroy(pv).unwrap();
    }
    server.destroy();
}
