//! Echo - server and client in one process.
//!
//! This example demonstrates:
//! - Routing a raw command and a MsgPack-typed command on a [`Server`]
//! - Calling both through a pooled [`Client`]
//! - Pushing from the server to every connected client
//!
//! ```sh
//! RUST_LOG=rawrpc=debug cargo run --example echo
//! ```

use std::time::Duration;

use rawrpc::{ClientBuilder, Message, Router, Server, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CMD_ECHO: u32 = 1;
const CMD_GREET: u32 = 2;
const CMD_NEWS: u32 = 3;

#[derive(Serialize, Deserialize, Debug)]
struct GreetInput {
    name: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct GreetOutput {
    greeting: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut router = Router::new();
    router.register(CMD_ECHO, |msg, done| async move { done.reply(msg.body).await });
    router.register_msgpack(CMD_GREET, |input: GreetInput, done| async move {
        done.reply_msgpack(&GreetOutput {
            greeting: format!("hello, {}", input.name),
        })
        .await
    });

    let server = Server::bind("127.0.0.1:0", router, ServerConfig::default()).await?;
    let addr = server.local_addr().to_string();
    let conns = server.connections();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    let (push_tx, mut push_rx) = mpsc::channel(16);
    let client = ClientBuilder::new(addr)
        .max_conn(4)
        .idle_conn(1)
        .timeout(Duration::from_secs(1))
        .push_channel(push_tx)
        .build()
        .await?;

    let cancel = CancellationToken::new();
    if let Some(reply) = client.call(&cancel, Message::request(CMD_ECHO, "ping")).await? {
        println!("echo: {}", String::from_utf8_lossy(&reply.body));
    }

    let out: GreetOutput = client
        .call_msgpack(&cancel, CMD_GREET, &GreetInput { name: "world".into() })
        .await?;
    println!("greet: {}", out.greeting);

    conns.broadcast(Message::push(CMD_NEWS, "server says hi")).await?;
    if let Ok(Some(push)) = tokio::time::timeout(Duration::from_secs(1), push_rx.recv()).await {
        println!("push {}: {}", push.command, String::from_utf8_lossy(&push.body));
    }

    client.close();
    shutdown.cancel();
    serving.await??;
    Ok(())
}
