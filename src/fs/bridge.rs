//! Async bridge layer: delegates reads that miss the upstream layers to
//! an external file resolver (the host frame).

use futures::future::LocalBoxFuture;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// External source of file contents. `None` means the host does not know
/// the file either; the miss surfaces as not-found.
pub trait FileResolver {
    fn resolve_file(&self, path: &str) -> LocalBoxFuture<'static, Option<String>>;
}

/// Layer that asks a [`FileResolver`] about paths no other layer knows.
/// Answers are cached until `reset_cache`, so the host is asked at most
/// once per path per compile. Synchronous reads are unsupported here.
pub struct BridgeLayer {
    resolver: Rc<dyn FileResolver>,
    answers: RefCell<FxHashMap<String, Option<String>>>,
}

impl BridgeLayer {
    pub fn new(resolver: Rc<dyn FileResolver>) -> Self {
        Self {
            resolver,
            answers: RefCell::new(FxHashMap::default()),
        }
    }

    pub async fn read(&self, path: &str) -> Option<String> {
        if let Some(answer) = self.answers.borrow().get(path) {
            return answer.clone();
        }
        let answer = self.resolver.resolve_file(path).await;
        self.answers
            .borrow_mut()
            .insert(path.to_string(), answer.clone());
        answer
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.read(path).await.is_some()
    }

    pub fn reset_cache(&self) {
        self.answers.borrow_mut().clear();
    }
}

/// A pending file request sent to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsRequest {
    pub request_id: u64,
    pub path: String,
}

/// [`FileResolver`] backed by the host message protocol: every lookup
/// sends an `fs-request` and suspends until the matching `fs-response`
/// arrives via [`ProtocolFileResolver::respond`].
pub struct ProtocolFileResolver {
    next_id: Cell<u64>,
    outgoing: mpsc::UnboundedSender<FsRequest>,
    pending: Rc<RefCell<FxHashMap<u64, oneshot::Sender<Option<String>>>>>,
}

impl ProtocolFileResolver {
    /// Returns the resolver plus the stream of requests the transport
    /// must forward to the host.
    pub fn new() -> (Rc<Self>, mpsc::UnboundedReceiver<FsRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = Rc::new(Self {
            next_id: Cell::new(0),
            outgoing: tx,
            pending: Rc::new(RefCell::new(FxHashMap::default())),
        });
        (resolver, rx)
    }

    /// Deliver the host's answer for `request_id`. Unknown ids are
    /// ignored (a superseded compile may already have dropped them).
    pub fn respond(&self, request_id: u64, result: Option<String>) {
        if let Some(tx) = self.pending.borrow_mut().remove(&request_id) {
            let _ = tx.send(result);
        }
    }
}

impl FileResolver for ProtocolFileResolver {
    fn resolve_file(&self, path: &str) -> LocalBoxFuture<'static, Option<String>> {
        let request_id = self.next_id.get();
        self.next_id.set(request_id + 1);

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(request_id, tx);

        debug!(request_id, path, "forwarding read to host file resolver");
        let sent = self
            .outgoing
            .send(FsRequest {
                request_id,
                path: path.to_string(),
            })
            .is_ok();

        Box::pin(async move {
            if !sent {
                return None;
            }
            rx.await.unwrap_or(None)
        })
    }
}
