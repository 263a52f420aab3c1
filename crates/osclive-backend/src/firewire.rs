//! FireWire register bus over the Linux firewire character devices
//!
//! Block transactions go through `hinawa`. Responses are delivered by the node's event
//! source, so a dispatcher thread iterates a GLib main context for it while a worker thread owns
//! the node and performs the blocking transactions.

use glib::MainContext;
use hinawa::prelude::*;
use hinawa::{FwNode, FwReq, FwTcode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, info};

use crate::register::{RegisterAdapterFactory, RegisterBus};
use crate::{BackendError, Result};

/// FireWire bus configuration
#[derive(Debug, Clone)]
pub struct FirewireConfig {
    /// Character device of the mixer's node
    pub device: String,
    /// Timeout of one block transaction
    pub timeout: Duration,
}

impl Default for FirewireConfig {
    fn default() -> Self {
        Self {
            device: "/dev/fw1".to_string(),
            timeout: Duration::from_millis(100),
        }
    }
}

enum Request {
    Read {
        address: u64,
        len: usize,
        reply: mpsc::Sender<Result<Vec<u8>>>,
    },
    Write {
        address: u64,
        data: Vec<u8>,
        reply: mpsc::Sender<Result<()>>,
    },
}

/// [`RegisterBus`] backed by a FireWire node
pub struct FirewireBus {
    requests: mpsc::Sender<Request>,
    _worker: std::thread::JoinHandle<()>,
}

impl FirewireBus {
    pub fn open(config: FirewireConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (requests, request_rx) = mpsc::channel::<Request>();

        let worker = std::thread::Builder::new()
            .name("osclive-firewire".to_string())
            .spawn(move || {
                let node = FwNode::new();
                let dispatcher = match start_dispatcher(&node, &config.device) {
                    Ok(dispatcher) => dispatcher,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let req = FwReq::new();
                let timeout_ms = config.timeout.as_millis() as u32;
                while let Ok(request) = request_rx.recv() {
                    match request {
                        Request::Read {
                            address,
                            len,
                            reply,
                        } => {
                            let mut frame = vec![0u8; len];
                            let result = req
                                .transaction_sync(
                                    &node,
                                    FwTcode::ReadBlockRequest,
                                    address,
                                    len,
                                    &mut frame,
                                    timeout_ms,
                                )
                                .map(|_| frame)
                                .map_err(transaction_error);
                            let _ = reply.send(result);
                        }
                        Request::Write {
                            address,
                            mut data,
                            reply,
                        } => {
                            let len = data.len();
                            let result = req
                                .transaction_sync(
                                    &node,
                                    FwTcode::WriteBlockRequest,
                                    address,
                                    len,
                                    &mut data,
                                    timeout_ms,
                                )
                                .map_err(transaction_error);
                            let _ = reply.send(result);
                        }
                    }
                }

                drop(dispatcher);
                debug!("FireWire worker exiting");
            })?;

        ready_rx
            .recv()
            .map_err(|_| BackendError::ConnectionLost("FireWire worker exited".to_string()))??;
        Ok(Self {
            requests,
            _worker: worker,
        })
    }

    fn call<T>(&self, make: impl FnOnce(mpsc::Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply, reply_rx) = mpsc::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| BackendError::ConnectionLost("FireWire worker exited".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| BackendError::ConnectionLost("FireWire worker exited".to_string()))?
    }
}

impl RegisterBus for FirewireBus {
    fn read_block(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.call(|reply| Request::Read {
            address,
            len,
            reply,
        })
    }

    fn write_block(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.call(|reply| Request::Write {
            address,
            data,
            reply,
        })
    }
}

/// Stops the dispatcher thread when dropped
struct Dispatcher {
    context: MainContext,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.context.wakeup();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn start_dispatcher(node: &FwNode, device: &str) -> Result<Dispatcher> {
    node.open(device, 0)
        .map_err(|e| BackendError::PortNotFound(format!("{}: {}", device, e)))?;
    info!("Opened FireWire node {}", device);

    let source = node
        .create_source()
        .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
    let context = MainContext::new();
    source.attach(Some(&context));

    let stop = Arc::new(AtomicBool::new(false));
    let running = context.clone();
    let stopped = stop.clone();
    let thread = std::thread::Builder::new()
        .name("osclive-fw-dispatch".to_string())
        .spawn(move || {
            while !stopped.load(Ordering::SeqCst) {
                running.iteration(true);
            }
        })?;
    Ok(Dispatcher {
        context,
        stop,
        thread: Some(thread),
    })
}

fn transaction_error(e: glib::Error) -> BackendError {
    BackendError::ConnectionLost(format!("FireWire transaction failed: {}", e))
}

/// Factory reopening the node on every connect attempt
pub fn firewire_factory(
    config: FirewireConfig,
) -> RegisterAdapterFactory<impl Fn() -> Result<FirewireBus> + Send + Sync> {
    RegisterAdapterFactory::new(move || FirewireBus::open(config.clone()))
}
