use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use wulfenite::{Conn, Error, Handler, HandlerFuture, Server};

#[derive(argh::FromArgs)]
#[argh(description = "broadcast server")]
struct Args {
    #[argh(option, description = "address to bind to", default = "String::from(\"127.0.0.1:8080\")")]
    bind: String,
}

#[derive(Clone, Default)]
struct Broadcaster {
    conns: Arc<Mutex<HashMap<u64, Arc<Conn>>>>,
}

impl Broadcaster {
    async fn send_data(&self) {
        for i in 0.. {
            let conns: Vec<Arc<Conn>> = self
                .conns
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for conn in conns {
                let _ = conn.write(format!("Sending message number {}\n", i)).await;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

impl Handler for Broadcaster {
    fn on_open<'a>(&'a self, conn: &'a Arc<Conn>) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.conns.lock().unwrap().insert(conn.id(), Arc::clone(conn));
            tracing::info!(id = conn.id(), "connected");
        })
    }

    fn on_close<'a>(&'a self, conn: &'a Arc<Conn>, err: Option<&'a Error>) -> HandlerFuture<'a> {
        Box::pin(async move {
            match err {
                Some(err) => tracing::info!(id = conn.id(), error = %err, "closed with error"),
                None => tracing::info!(id = conn.id(), "closed the connection"),
            }

            self.conns.lock().unwrap().remove(&conn.id());
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

    let broadcaster = Broadcaster::default();
    let server = Arc::new(Server::new().handler(broadcaster.clone()));

    tokio::spawn(async move { broadcaster.send_data().await });

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept")?;

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = server.upgrade(stream).await {
                tracing::warn!(%peer_addr, error = %err, "upgrade failed");
            }
        });
    }
}
