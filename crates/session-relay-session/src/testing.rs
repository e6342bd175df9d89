//! Test doubles shared by the relay tests.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use session_relay_core::{
    EngineError, EngineInit, HeaderValue, Headers, ProtocolEngine, RelayRequest, RequestEnvelope,
    ResponseSink, SessionId, Transport, TransportError, http::read_body,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::events::SessionEvent;

/// Transport that forwards pushed messages into a channel.
pub struct ChannelTransport {
    session_id: SessionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    started: AtomicBool,
    close_calls: AtomicUsize,
    hang_up: CancellationToken,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn new(id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            session_id: SessionId::from(id),
            outbound: Mutex::new(Some(tx)),
            started: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            hang_up: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        (transport, rx)
    }

    /// Simulate the client going away.
    pub fn hang_up_now(&self) {
        self.hang_up.cancel();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();
    }

    fn hang_up(&self) -> CancellationToken {
        self.hang_up.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[derive(Default)]
struct EngineStats {
    connections: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Scripted engine. The request body selects the behaviour:
///
/// - `fail`: error without writing
/// - `panic`: panic mid-handling
/// - `silent`: succeed without writing
/// - `reject`: write 400, then error
/// - `close`: close the transport, then accept
/// - `slow:*`: take 50ms, then echo
/// - `stall`: take a minute, then echo
/// - anything else: echo with 200
pub struct TestEngine {
    concurrent: bool,
    stats: Arc<EngineStats>,
}

impl TestEngine {
    pub fn new(concurrent: bool) -> Self {
        Self {
            concurrent,
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Factory handing out one engine per session, all sharing these stats.
    pub fn init(&self) -> EngineInit {
        let concurrent = self.concurrent;
        let stats = Arc::clone(&self.stats);
        Arc::new(move || {
            Arc::new(ScriptedEngine {
                concurrent,
                stats: Arc::clone(&stats),
                transport: Mutex::new(None),
            }) as Arc<dyn ProtocolEngine>
        })
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.stats.max_active.load(Ordering::SeqCst)
    }
}

struct ScriptedEngine {
    concurrent: bool,
    stats: Arc<EngineStats>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl ScriptedEngine {
    fn transport(&self) -> Result<Arc<dyn Transport>, EngineError> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::NotConnected)
    }
}

#[async_trait]
impl ProtocolEngine for ScriptedEngine {
    async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), EngineError> {
        self.stats.connections.fetch_add(1, Ordering::SeqCst);
        *self.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        Ok(())
    }

    async fn handle_post_message(
        &self,
        request: &mut dyn RelayRequest,
        response: &mut dyn ResponseSink,
    ) -> Result<(), EngineError> {
        let body = read_body(request).await?;
        let text = String::from_utf8_lossy(&body).into_owned();

        match text.as_str() {
            "fail" => return Err(EngineError::Other("boom".into())),
            "panic" => panic!("engine exploded"),
            "silent" => {}
            "reject" => {
                response.write(400, Bytes::from_static(b"rejected"));
                return Err(EngineError::InvalidMessage("rejected".into()));
            }
            "close" => {
                self.transport()?.close();
                response.write(202, Bytes::from_static(b"Accepted"));
            }
            slow if slow.starts_with("slow:") => {
                let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.max_active.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.stats.active.fetch_sub(1, Ordering::SeqCst);
                response.write(200, Bytes::from(format!("echo: {slow}")));
            }
            "stall" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                response.write(200, Bytes::from_static(b"echo: stall"));
            }
            _ => response.write(200, Bytes::from(format!("echo: {text}"))),
        }
        Ok(())
    }

    fn concurrent(&self) -> bool {
        self.concurrent
    }
}

/// Encoded request envelope as a dispatcher would publish it.
pub fn request_payload(request_id: &str, body: &str) -> Bytes {
    let mut headers = Headers::new();
    headers.insert(
        "content-type".into(),
        HeaderValue::One("application/json".into()),
    );
    RequestEnvelope {
        request_id: request_id.into(),
        url: "/message".into(),
        method: "POST".into(),
        body: Bytes::from(body.to_string()),
        headers,
    }
    .encode()
    .unwrap()
}

/// Wait until an event matching `pred` is emitted.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap()
}
