//! # Stream pool
//!
//! Topology: an unbounded queue feeds a fixed identity head stage, then the
//! user-supplied stages in order, then an identity tail whose output is
//! fanned out on two broadcast buses (responses and errors). Each
//! stage runs `workers` tasks over a single shared input queue; order across
//! workers is not preserved, correlation is by `rid`.
//!
//! `handle` drives one pipeline: inject request *i*, wait for its correlated
//! reply within the wait budget, thread the reply into request *i+1*, and
//! write only the final reply to the outbound writer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use qr_core::error::ErrorKind;
use qr_core::{Request, Response, ResponseError, ResponseWriter};

use crate::stage::{Identity, Stage, StreamItem};

/// Capacity of each observer bus. A subscriber that falls further behind
/// than this lags and loses the oldest copies.
const OBSERVER_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker tasks per stage.
    pub workers: usize,
    /// Default wait budget per request; individual requests may override.
    pub wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            wait: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// What flows between stages: a live item, or a fault skipping the rest of
/// the chain on its way to the error bus.
enum Flow {
    Item(StreamItem),
    Fault(ResponseError),
}

pub struct PoolBuilder {
    config: PoolConfig,
    stages: Vec<Arc<dyn Stage>>,
}

impl PoolBuilder {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
        }
    }

    /// Append a stage to the chain.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Arc<StreamPool> {
        let workers = self.config.workers.max(1);
        let (responses, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (errors, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (closed, _) = watch::channel(false);

        let mut chain: Vec<Arc<dyn Stage>> = Vec::with_capacity(self.stages.len() + 2);
        chain.push(Arc::new(Identity));
        chain.extend(self.stages);
        chain.push(Arc::new(Identity));

        let (head, mut rx) = mpsc::unbounded_channel();
        for stage in chain {
            let (tx, next_rx) = mpsc::unbounded_channel();
            spawn_stage(stage, rx, tx, workers);
            rx = next_rx;
        }

        // Tail pump: fan the chain's output onto the observer buses.
        let res_bus = responses.clone();
        let err_bus = errors.clone();
        tokio::spawn(async move {
            while let Some(flow) = rx.recv().await {
                match flow {
                    Flow::Item(StreamItem::Response(res)) => {
                        let _ = res_bus.send(res);
                    }
                    Flow::Item(StreamItem::Request(req)) => {
                        // a request survived the whole chain unclaimed
                        tracing::warn!(
                            rid = req.rid(),
                            name = req.record.name(),
                            "request reached pool tail unhandled"
                        );
                        let _ = err_bus.send(ResponseError::new(
                            ErrorKind::Internal,
                            req.rid(),
                            format!("no stage handles '{}' requests", req.record.name()),
                        ));
                    }
                    Flow::Fault(err) => {
                        let _ = err_bus.send(err);
                    }
                }
            }
        });

        Arc::new(StreamPool {
            config: self.config,
            head: Mutex::new(Some(head)),
            responses,
            errors,
            closed,
        })
    }
}

/// Spawn `workers` tasks draining one shared queue through a stage.
fn spawn_stage(
    stage: Arc<dyn Stage>,
    rx: mpsc::UnboundedReceiver<Flow>,
    tx: mpsc::UnboundedSender<Flow>,
    workers: usize,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..workers {
        let stage = stage.clone();
        let rx = rx.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let flow = { rx.lock().await.recv().await };
                let Some(flow) = flow else { break };

                let out = match flow {
                    // faults skip the remaining stages untouched
                    Flow::Fault(err) => Flow::Fault(err),
                    Flow::Item(item) => match stage.process(item).await {
                        Ok(item) => Flow::Item(item),
                        Err(err) => {
                            tracing::warn!(rid = err.rid.as_str(), "stage fault: {err}");
                            Flow::Fault(err)
                        }
                    },
                };

                if tx.send(out).is_err() {
                    break;
                }
            }
        });
    }
}

// =============================================================================
// Pool
// =============================================================================

/// A subscription to the pool's tail: a copy of every response and error.
pub struct Observer {
    pub responses: broadcast::Receiver<Response>,
    pub errors: broadcast::Receiver<ResponseError>,
}

pub struct StreamPool {
    config: PoolConfig,
    head: Mutex<Option<mpsc::UnboundedSender<Flow>>>,
    responses: broadcast::Sender<Response>,
    errors: broadcast::Sender<ResponseError>,
    closed: watch::Sender<bool>,
}

impl StreamPool {
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribe to the pool's output. Dropping the observer reclaims its
    /// slot.
    pub fn observe(&self) -> Observer {
        Observer {
            responses: self.responses.subscribe(),
            errors: self.errors.subscribe(),
        }
    }

    /// Inject a request at the pool's head.
    pub fn inject(&self, req: Request) -> Result<(), ResponseError> {
        let rid = req.rid().to_string();
        let head = self.head.lock().expect("pool head lock poisoned");
        match head.as_ref() {
            Some(tx) => tx
                .send(Flow::Item(StreamItem::Request(req)))
                .map_err(|_| shutdown_error(&rid)),
            None => Err(shutdown_error(&rid)),
        }
    }

    /// Push an error straight onto the error bus so observers see it.
    pub fn inject_error(&self, err: ResponseError) {
        let _ = self.errors.send(err);
    }

    /// Close the pool: stage queues close, workers drain out, and every
    /// outstanding waiter is released with a `Shutdown` error.
    pub fn close(&self) {
        let _ = self.closed.send(true);
        self.head.lock().expect("pool head lock poisoned").take();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait on an observer for the reply correlated to `rid`, bounded by
    /// `wait`. Late replies after expiry are left for the bus to discard.
    pub async fn read_response(
        &self,
        observer: &mut Observer,
        rid: &str,
        wait: Duration,
    ) -> Result<Response, ResponseError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(shutdown_error(rid));
        }

        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = observer.responses.recv() => match result {
                    Ok(res) if res.request_id() == rid => return Ok(res),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "response observer lagged, copies dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(shutdown_error(rid)),
                },
                result = observer.errors.recv() => match result {
                    Ok(err) if err.request_id() == rid => return Err(err),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "error observer lagged, copies dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(shutdown_error(rid)),
                },
                _ = closed.changed() => return Err(shutdown_error(rid)),
                _ = &mut deadline => {
                    return Err(ResponseError::new(ErrorKind::Timeout, rid, "request timed out"))
                }
            }
        }
    }

    /// Run one pipeline of requests through the pool, sequentially, writing
    /// only the final reply. Any error aborts the remaining stages, is
    /// written once, and is re-injected for observers.
    pub async fn handle(&self, requests: Vec<Request>, writer: Arc<dyn ResponseWriter>) {
        let total = requests.len();
        if total == 0 {
            return;
        }

        let mut last: Option<Response> = None;

        for (index, mut req) in requests.into_iter().enumerate() {
            let rid = req.rid().to_string();
            let name = req.record.name();
            let wait = req.wait.unwrap_or(self.config.wait);
            req.last_response = last.take();

            tracing::debug!(rid = rid.as_str(), name, ?wait, "injecting pipeline request");

            // subscribe before injecting so the reply cannot slip past
            let mut observer = self.observe();
            if let Err(err) = self.inject(req) {
                writer.write(Err(err.clone())).await;
                self.inject_error(err);
                return;
            }

            match self.read_response(&mut observer, &rid, wait).await {
                Err(err) => {
                    writer.write(Err(err.clone())).await;
                    self.inject_error(err);
                    return;
                }
                Ok(res) => {
                    if index + 1 == total {
                        writer.write(Ok(res.clone())).await;
                    }
                    last = Some(res);
                }
            }
        }
    }
}

fn shutdown_error(rid: &str) -> ResponseError {
    ResponseError::new(ErrorKind::Shutdown, rid, "stream pool closed")
}
