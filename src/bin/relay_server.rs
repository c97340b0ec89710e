//! Minimal runnable server: binds all interfaces on port 30000 and
//! broadcasts every line typed on stdin as an `echo` message.

use std::error::Error;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use commlink::{Message, Payload, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let server = Server::new();
    server.set_interface("*")?;
    server.set_port(30000)?;
    server.subscribe_to_state_update(|was, now| {
        info!("server running: {} -> {}", was, now);
    });

    server.start().await?;
    info!("server ready; type a message and press enter to broadcast");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut payload = Payload::new();
        payload.insert("message".to_string(), json!(line));
        server.send("*", Message::new("echo", payload));
    }

    server.stop().await?;
    Ok(())
}
