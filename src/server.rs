use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{Backend, MemoryBackend, UpstreamBackend};
use crate::codec::RequestCodec;
use crate::config::Config;
use crate::proxy::{Flow, Proxy};
use crate::Error;

/// Per connection settings that are fixed at startup.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_bulk_len: usize,
    max_multibulk_len: usize,
    shutdown_grace: Duration,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Limits {
            max_bulk_len: config.max_bulk_len,
            max_multibulk_len: config.max_multibulk_len,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

pub async fn run(config: Config) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let backend: Arc<dyn Backend> = match &config.upstream {
        Some(address) => Arc::new(UpstreamBackend::new(
            address.clone(),
            config.upstream_pool_size,
        )),
        None => Arc::new(MemoryBackend::new()),
    };
    let proxy = Proxy::new(&config, backend)?;

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    match &config.upstream {
        Some(upstream) => info!(
            "Proxy listening on {}, forwarding to {}",
            listener.local_addr()?,
            upstream
        ),
        None => info!(
            "Proxy listening on {}, serving from memory",
            listener.local_addr()?
        ),
    }

    serve(listener, proxy, &config).await
}

/// Accepts connections on `listener` until accepting fails.
pub async fn serve(listener: TcpListener, proxy: Arc<Proxy>, config: &Config) -> Result<(), Error> {
    let limits = Limits::from(config);

    loop {
        let (socket, client_address) = listener.accept().await?;
        let proxy = proxy.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, proxy, limits).await {
                error!(e);
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, proxy, limits),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    proxy: Arc<Proxy>,
    limits: Limits,
) -> Result<(), Error> {
    let _ = stream.set_nodelay(true);
    let connection = proxy.clients().register(client_address);
    let id = connection.id();
    proxy.connection_opened();

    tracing::Span::current()
        .record("connection_id", id.to_string())
        .record("client_address", client_address.to_string());

    let (reader, mut writer) = stream.into_split();

    // Replies reach the socket through the ordering queue only.
    let (sink, mut replies) = mpsc::unbounded_channel::<Bytes>();
    proxy.queue().on_connection_open(id, sink);

    let mut writer = tokio::spawn(async move {
        while let Some(bytes) = replies.recv().await {
            writer.write_all(&bytes).await?;
        }
        writer.shutdown().await
    });

    let codec = RequestCodec::with_limits(limits.max_bulk_len, limits.max_multibulk_len);
    let mut requests = FramedRead::new(reader, codec);
    // A read error drops the queued replies instead of flushing them.
    let mut flush = true;

    while let Some(request) = requests.next().await {
        let request = match request {
            Ok(request) => request.with_client_address(client_address),
            Err(e) => {
                warn!("Failed to read from client: {}", e);
                flush = false;
                break;
            }
        };
        debug!("Received request: {:?}", request.tokens());

        if proxy.handle(&connection, request) == Flow::Close {
            break;
        }
    }

    // Every request read before a clean end of stream, QUIT or a protocol error gets its reply,
    // unless the writer fails first.
    let mut written = None;
    if flush {
        tokio::select! {
            drained = time::timeout(limits.shutdown_grace, proxy.queue().drained(id)) => {
                if drained.is_err() {
                    warn!(
                        "Closing with replies still queued after {:?}",
                        limits.shutdown_grace
                    );
                }
            }
            result = &mut writer => written = Some(result),
        }
    }

    proxy.queue().on_connection_close(id);
    proxy.clients().unregister(id);

    let written = match written {
        Some(result) => result,
        None => writer.await,
    };
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to write to client: {}", e),
        Err(e) => error!("Writer task failed: {}", e),
    }

    info!("Connection closed");
    Ok(())
}
