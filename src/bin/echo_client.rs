//! Minimal runnable client: connects to a local server with a random id and
//! prints every message it receives, until interrupted or the server shuts
//! down.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use commlink::{Client, ClientEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let client = Client::new(true);
    client.set_address("127.0.0.1")?;
    client.set_port(30000)?;
    client.set_client_id(Client::generate_new_id())?;

    let should_run = Arc::new(AtomicBool::new(true));

    client.subscribe("message", |event| {
        if let ClientEvent::Message { message } = event {
            println!("got message: {:?}", message.payload());
        }
    })?;
    let stop = should_run.clone();
    client.subscribe("servershutdown", move |_| {
        println!("server shutting down");
        stop.store(false, Ordering::SeqCst);
    })?;

    client.connect().await?;
    info!("ready");

    while should_run.load(Ordering::SeqCst) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    if client.status().connected {
        client.disconnect().await?;
    }
    Ok(())
}
