//! Per-connection message routing.
//!
//! A [`Router`] maps each [`MessageCommand`] to the bounded queue of the
//! one flow that consumes it. The connection's reader task calls
//! [`Router::route_incoming`]; flows read their [`IncomingRoute`] and write
//! to the shared [`OutgoingRoute`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::error::FlowError;
use crate::protocol::{Message, MessageCommand};
use crate::shutdown::ShutdownSignal;

/// Routes incoming messages of one connection to its flows.
pub struct Router {
    routes: RwLock<HashMap<MessageCommand, mpsc::Sender<Message>>>,
    outgoing: OutgoingRoute,
    shutdown: ShutdownSignal,
    default_capacity: usize,
}

impl Router {
    pub fn new(outgoing: mpsc::Sender<Message>, shutdown: ShutdownSignal, default_capacity: usize) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            outgoing: OutgoingRoute { tx: outgoing },
            shutdown,
            default_capacity,
        }
    }

    /// Register a route receiving every command in `commands`.
    ///
    /// `capacity` overrides the default queue bound. Registering a command
    /// twice is a local bug and yields `Fatal`.
    pub fn register(
        &self,
        name: &'static str,
        commands: &[MessageCommand],
        capacity: Option<usize>,
    ) -> Result<IncomingRoute, FlowError> {
        let mut routes = self.routes.write();
        if let Some(taken) = commands.iter().find(|c| routes.contains_key(c)) {
            return Err(FlowError::fatal(format!(
                "route {name}: command {taken} is already routed"
            )));
        }
        let (tx, rx) = mpsc::channel(capacity.unwrap_or(self.default_capacity).max(1));
        for command in commands {
            routes.insert(*command, tx.clone());
        }
        Ok(IncomingRoute {
            name,
            commands: commands.to_vec(),
            rx,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Stop routing the commands of `route`. Its queue closes once drained.
    pub fn unregister(&self, route: &IncomingRoute) {
        let mut routes = self.routes.write();
        for command in &route.commands {
            routes.remove(command);
        }
    }

    /// Validate `message` and enqueue it on its route without blocking.
    ///
    /// Unknown commands are ban-worthy. A full route means the peer floods
    /// us faster than we process and disconnects without a ban.
    pub fn route_incoming(&self, message: Message) -> Result<(), FlowError> {
        message.validate()?;
        let command = message.command();
        let sender = self
            .routes
            .read()
            .get(&command)
            .cloned()
            .ok_or_else(|| FlowError::ban(format!("no route for {command}")))?;
        trace!(%command, "router: routing incoming message");
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FlowError::protocol(format!(
                "route for {command} reached capacity"
            ))),
            Err(TrySendError::Closed(_)) => Err(FlowError::RouteClosed),
        }
    }

    pub fn outgoing(&self) -> OutgoingRoute {
        self.outgoing.clone()
    }

    /// Drop every route. Flows blocked on a read end with `RouteClosed`.
    pub fn close(&self) {
        self.routes.write().clear();
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }
}

/// Receiving end of a route, owned by exactly one flow.
pub struct IncomingRoute {
    name: &'static str,
    commands: Vec<MessageCommand>,
    rx: mpsc::Receiver<Message>,
    shutdown: ShutdownSignal,
}

impl IncomingRoute {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the next message.
    ///
    /// Returns `RouteClosed` when the route is closed or shutdown is triggered.
    pub async fn dequeue(&mut self) -> Result<Message, FlowError> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(FlowError::RouteClosed),
            message = self.rx.recv() => message.ok_or(FlowError::RouteClosed),
        }
    }

    /// Like [`dequeue`](Self::dequeue) but fails with `Timeout` after `timeout`.
    pub async fn dequeue_with_timeout(&mut self, timeout: Duration) -> Result<Message, FlowError> {
        let name = self.name;
        match tokio::time::timeout(timeout, self.dequeue()).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::timeout(format!(
                "no message on route {name} within {timeout:?}"
            ))),
        }
    }
}

/// Failure of a non-blocking enqueue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryEnqueueError {
    #[error("outgoing queue is full")] Full,
    #[error("outgoing queue is closed")] Closed,
}

/// Sending end shared by every flow of a connection.
#[derive(Clone, Debug)]
pub struct OutgoingRoute {
    tx: mpsc::Sender<Message>,
}

impl OutgoingRoute {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Enqueue, waiting for room when the queue is full.
    pub async fn enqueue(&self, message: Message) -> Result<(), FlowError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| FlowError::RouteClosed)
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, message: Message) -> Result<(), TryEnqueueError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TryEnqueueError::Full,
            TrySendError::Closed(_) => TryEnqueueError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
