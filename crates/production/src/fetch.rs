//! Fragment fetch service: answers peers' requests for local state.
//!
//! Requests arrive on a queue and are served one at a time by a dedicated
//! task. Each request names an encoded [`StateToken`]; the service reads the
//! exact byte range it describes and hands the bytes back through the
//! transport without checking them. The requester validates against the
//! digest it asked for.
//!
//! A file or range that is not held locally is answered with an explicit
//! [`FragmentResponse::NotAvailable`], never with some other range.

use crate::metrics;
use bulwark_core::{DurableStorage, FragmentResponse, FragmentTransport, StorageError};
use bulwark_types::{ReplicaId, StateToken};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One peer request.
#[derive(Debug)]
struct FetchRequest {
    from: ReplicaId,
    token: Vec<u8>,
}

/// Counters reported when the service stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchServiceStats {
    pub served: u64,
    pub denied: u64,
    pub dropped: u64,
}

/// Look up the range an encoded token describes.
///
/// Returns `Ok(None)` for a token that does not decode; such requests are
/// dropped without a reply.
pub fn serve_fragment(
    storage: &dyn DurableStorage,
    token_bytes: &[u8],
) -> Result<Option<FragmentResponse>, StorageError> {
    let token = match StateToken::decode(token_bytes) {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, len = token_bytes.len(), "Dropping undecodable fragment request");
            return Ok(None);
        }
    };

    let response = match storage.read_range(
        token.kind(),
        &token.file_name(),
        token.offset(),
        token.length(),
    )? {
        Some(data) => FragmentResponse::Data(data),
        None => FragmentResponse::NotAvailable,
    };
    Ok(Some(response))
}

/// Handle to the running fetch service.
pub struct FragmentFetchService {
    requests: mpsc::UnboundedSender<FetchRequest>,
    cancel: CancellationToken,
    worker: JoinHandle<FetchServiceStats>,
}

impl FragmentFetchService {
    /// Spawn the service on the current tokio runtime.
    pub fn spawn(storage: Arc<dyn DurableStorage>, transport: Arc<dyn FragmentTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(storage, transport, rx, cancel.clone()));
        Self {
            requests: tx,
            cancel,
            worker,
        }
    }

    /// Queue a peer's request. Returns `false` once the service has stopped.
    pub fn request(&self, from: ReplicaId, token: Vec<u8>) -> bool {
        self.requests.send(FetchRequest { from, token }).is_ok()
    }

    /// Stop the service, abandoning queued requests.
    pub async fn shutdown(self) -> FetchServiceStats {
        self.cancel.cancel();
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Fetch service task failed");
                FetchServiceStats::default()
            }
        }
    }
}

async fn run(
    storage: Arc<dyn DurableStorage>,
    transport: Arc<dyn FragmentTransport>,
    mut requests: mpsc::UnboundedReceiver<FetchRequest>,
    cancel: CancellationToken,
) -> FetchServiceStats {
    let mut stats = FetchServiceStats::default();
    info!("Fragment fetch service started");

    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let FetchRequest { from, token } = request;
        let lookup = {
            let storage = storage.clone();
            let token = token.clone();
            tokio::task::spawn_blocking(move || serve_fragment(storage.as_ref(), &token)).await
        };

        let response = match lookup {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => {
                stats.dropped += 1;
                continue;
            }
            // A read error here only affects this peer's request.
            Ok(Err(e)) => {
                warn!(from = from.0, error = %e, "Storage error serving fragment");
                FragmentResponse::NotAvailable
            }
            Err(e) => {
                warn!(from = from.0, error = %e, "Fragment read task failed");
                FragmentResponse::NotAvailable
            }
        };

        match &response {
            FragmentResponse::Data(data) => {
                trace!(from = from.0, len = data.len(), "Serving fragment");
                stats.served += 1;
                metrics::record_fragment_served();
            }
            FragmentResponse::NotAvailable => {
                debug!(from = from.0, "Fragment not available locally");
                stats.denied += 1;
                metrics::record_fragment_denied();
            }
        }
        transport.return_fragment(from, token, response);
    }

    info!(
        served = stats.served,
        denied = stats.denied,
        dropped = stats.dropped,
        "Fragment fetch service stopped"
    );
    stats
}
