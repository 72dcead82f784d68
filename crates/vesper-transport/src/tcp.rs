//! TCP connection loop driving the protocol engine.
//!
//! One task per connection reads the byte stream, reassembles session
//! service records, and feeds complete payloads into the engine in
//! arrival order. Dispatched operations run concurrently; each completed
//! response is framed and written through a shared writer task, so
//! responses go out in whatever order they finish. A fatal engine error
//! or EOF tears the connection down, which invalidates all of its
//! in-flight operations without disturbing other connections.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vesper_core::{Action, AuthProvider, DispatchReply, DispatchRequest, Engine};

use crate::framing::{Framer, Record};
use crate::{Error, Result};

/// Application layer answering the commands the engine does not
/// interpret. May suspend for as long as it likes; the connection keeps
/// processing other messages meanwhile.
#[async_trait]
pub trait AppHandler: Send + Sync {
    /// Handle one dispatched request and produce its reply.
    async fn dispatch(&self, request: DispatchRequest) -> DispatchReply;
}

/// Factory producing one authentication provider per connection.
pub trait ProviderFactory: Send + Sync {
    /// Create a provider for a newly accepted connection.
    fn create(&self) -> Box<dyn AuthProvider>;
}

impl<F> ProviderFactory for F
where
    F: Fn() -> Box<dyn AuthProvider> + Send + Sync,
{
    fn create(&self) -> Box<dyn AuthProvider> {
        self()
    }
}

/// Accept connections forever, spawning one task per connection.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    handler: Arc<dyn AppHandler>,
    providers: Arc<dyn ProviderFactory>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "connection accepted");
        let engine = Arc::clone(&engine);
        let handler = Arc::clone(&handler);
        let provider = providers.create();
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, engine, handler, provider).await {
                warn!(%error, "connection terminated");
            }
        });
    }
}

/// Drive one connection until EOF or a fatal protocol error. Public so
/// tests and alternative acceptors can run the loop over any duplex
/// stream.
pub async fn serve_connection<S>(
    stream: S,
    engine: Arc<Engine>,
    handler: Arc<dyn AppHandler>,
    mut provider: Box<dyn AuthProvider>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection_id = engine.open_connection();
    debug!(connection_id, "connection registered");

    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Record>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let wire = match record.encode() {
                Ok(wire) => wire,
                Err(error) => {
                    warn!(%error, "dropping unencodable record");
                    continue;
                }
            };
            if let Err(error) = writer.write_all(&wire).await {
                debug!(%error, "write side closed");
                break;
            }
        }
    });

    let result = read_loop(
        &mut reader,
        connection_id,
        &engine,
        &handler,
        provider.as_mut(),
        &tx,
    )
    .await;

    // Closing the engine connection invalidates every in-flight
    // operation; their completions will fail and be dropped.
    engine.close_connection(connection_id);
    drop(tx);
    let _ = writer_task.await;
    debug!(connection_id, "connection closed");
    result
}

async fn read_loop<R>(
    reader: &mut R,
    connection_id: u64,
    engine: &Arc<Engine>,
    handler: &Arc<dyn AppHandler>,
    provider: &mut dyn AuthProvider,
    tx: &mpsc::Sender<Record>,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut framer = Framer::new(engine.config().max_transact_size as usize);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        framer.feed(&chunk[..n]);

        while let Some(record) = framer.next_record()? {
            match record {
                Record::Message(payload) => {
                    let actions = engine.receive(connection_id, &payload, provider)?;
                    for action in actions {
                        match action {
                            Action::Reply(bytes) => {
                                if tx.send(Record::Message(bytes)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Action::Dispatch(request) => {
                                spawn_dispatch(engine, handler, tx, request);
                            }
                        }
                    }
                }
                Record::SessionRequest { .. } => {
                    // Names are not policy here; any caller is accepted.
                    if tx.send(Record::PositiveResponse).await.is_err() {
                        return Ok(());
                    }
                }
                Record::Keepalive => debug!(connection_id, "keepalive"),
                other => {
                    warn!(connection_id, ?other, "unexpected session service record");
                }
            }
        }
    }
}

/// Run one application dispatch concurrently with the read loop. The
/// response is built (signed, sealed, credit-granting) by the engine
/// when the handler finishes, then queued for the writer.
fn spawn_dispatch(
    engine: &Arc<Engine>,
    handler: &Arc<dyn AppHandler>,
    tx: &mpsc::Sender<Record>,
    request: DispatchRequest,
) {
    let engine = Arc::clone(engine);
    let handler = Arc::clone(handler);
    let tx = tx.clone();
    let expects_reply = request.command != vesper_core::Command::Cancel;
    tokio::spawn(async move {
        let reply = handler.dispatch(request).await;
        if !expects_reply {
            return;
        }
        match engine.complete(reply) {
            Ok(bytes) => {
                let _ = tx.send(Record::Message(bytes)).await;
            }
            Err(error) => debug!(%error, "completion dropped"),
        }
    });
}
