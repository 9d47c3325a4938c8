use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use wulfenite::{Conn, Handler, HandlerFuture, Server};

#[derive(argh::FromArgs)]
#[argh(description = "echo server")]
struct Args {
    #[argh(option, description = "address to bind to", default = "String::from(\"127.0.0.1:8081\")")]
    bind: String,
}

struct Echo;

impl Handler for Echo {
    fn on_message<'a>(
        &'a self,
        conn: &'a Arc<Conn>,
        is_binary: bool,
        data: &'a [u8],
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let result = if is_binary {
                conn.write_binary(data).await
            } else {
                conn.write(data).await
            };
            if let Err(err) = result {
                tracing::warn!(id = conn.id(), error = %err, "echo failed");
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Args = argh::from_env();
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening");

    let server = Arc::new(Server::new().handler(Echo));

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept")?;
        tracing::debug!(%peer_addr, "new client");

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = server.upgrade(stream).await {
                tracing::warn!(%peer_addr, error = %err, "upgrade failed");
            }
        });
    }
}
