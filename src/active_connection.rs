//! Runs a [Node] on a tokio task over UDP connections.
//!
//! The task owns the node. Requests arrive over a command channel, datagrams from one
//! forwarder task per connection, and timers are served by sleeping until the node's
//! next deadline. Results are routed back to the [Interaction] that started them.

use anyhow::{Context, Result};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{InteractionId, InvokeResult, WriteItem},
    codec::Value,
    datamodel::DataModel,
    error::ImResult,
    messages::{ReadRequest, SubscribeRequest},
    node::{Node, NodeEvent},
    report::{AttributeStatus, Chunk, ConcreteCommandPath, Report},
    transport,
};

enum Request {
    Read {
        session_id: u16,
        request: ReadRequest,
    },
    Subscribe {
        session_id: u16,
        request: SubscribeRequest,
    },
    Write {
        session_id: u16,
        items: Vec<WriteItem>,
        atomic: bool,
        timed: Option<u16>,
    },
    Invoke {
        session_id: u16,
        path: ConcreteCommandPath,
        payload: Value,
        timed: Option<u16>,
    },
}

type Started = ImResult<(InteractionId, mpsc::UnboundedReceiver<NodeEvent>)>;

enum Command<D> {
    Start {
        request: Request,
        reply: oneshot::Sender<Started>,
    },
    Data(Box<dyn FnOnce(&mut D) + Send>),
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pull(InteractionId),
    Cancel(InteractionId),
}

/// Node running on a background task.
pub struct ActiveNode<D: DataModel + 'static> {
    commands: mpsc::Sender<Command<D>>,
    control: mpsc::UnboundedSender<Control>,
    events: Mutex<mpsc::UnboundedReceiver<NodeEvent>>,
    cancel: CancellationToken,
}

/// Events of one client interaction. Dropping it cancels the interaction.
pub struct Interaction {
    id: InteractionId,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    control: mpsc::UnboundedSender<Control>,
    pull_pending: bool,
    finished: bool,
}

/// Established subscription on the client side.
pub struct Subscription {
    interaction: Interaction,
    pub subscription_id: u32,
    pub max_interval: u16,
}

impl<D: DataModel + 'static> ActiveNode<D> {
    /// Starts the node task. `connections` maps local session ids to the peer connection.
    pub fn new(node: Node<D>, connections: HashMap<u16, Arc<transport::Connection>>) -> Self {
        let (commands, commands_rx) = mpsc::channel(32);
        let (control, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        for conn in connections.values() {
            let conn = conn.clone();
            let tx = incoming_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        data = conn.recv() => match data {
                            Some(data) => {
                                if tx.send(data).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            });
        }

        let task = NodeTask {
            node,
            connections,
            routes: HashMap::new(),
            events: events_tx,
        };
        tokio::spawn(task.run(incoming, commands_rx, control_rx, cancel.clone()));

        Self {
            commands,
            control,
            events: Mutex::new(events),
            cancel,
        }
    }

    async fn start(&self, request: Request) -> Result<Interaction> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { request, reply })
            .await
            .map_err(|_| anyhow::anyhow!("node task stopped"))?;
        let (id, events) = rx.await.context("node task stopped")??;
        Ok(Interaction {
            id,
            events,
            control: self.control.clone(),
            pull_pending: false,
            finished: false,
        })
    }

    /// Read delivering chunks as they are pulled with [Interaction::next_chunk].
    pub async fn read_chunked(&self, session_id: u16, request: ReadRequest) -> Result<Interaction> {
        self.start(Request::Read { session_id, request }).await
    }

    /// Read collecting every chunk.
    pub async fn read(&self, session_id: u16, request: ReadRequest) -> Result<Vec<Report>> {
        let mut interaction = self.read_chunked(session_id, request).await?;
        let mut reports = Vec::new();
        while let Some(chunk) = interaction.next_chunk().await? {
            reports.extend(chunk);
        }
        Ok(reports)
    }

    /// Subscribes and waits for the subscription to be established. Priming reports are
    /// returned along with the handle.
    pub async fn subscribe(&self, session_id: u16, request: SubscribeRequest) -> Result<(Subscription, Vec<Report>)> {
        let mut interaction = self.start(Request::Subscribe { session_id, request }).await?;
        let mut priming = Vec::new();
        loop {
            match interaction.next().await {
                Some(NodeEvent::Chunk { chunk, .. }) => priming.extend(chunk),
                Some(NodeEvent::SubscriptionEstablished {
                    subscription_id,
                    max_interval,
                    ..
                }) => {
                    let subscription = Subscription {
                        interaction,
                        subscription_id,
                        max_interval,
                    };
                    return Ok((subscription, priming));
                }
                Some(NodeEvent::Failed { error, .. }) => return Err(error.into()),
                Some(other) => log::debug!("unexpected event while subscribing: {:?}", other),
                None => anyhow::bail!("node task stopped"),
            }
        }
    }

    pub async fn write(
        &self,
        session_id: u16,
        items: Vec<WriteItem>,
        atomic: bool,
        timed: Option<u16>,
    ) -> Result<Vec<AttributeStatus>> {
        let mut interaction = self
            .start(Request::Write {
                session_id,
                items,
                atomic,
                timed,
            })
            .await?;
        match interaction.next().await {
            Some(NodeEvent::WriteCompleted { statuses, .. }) => Ok(statuses),
            Some(NodeEvent::Failed { error, .. }) => Err(error.into()),
            other => anyhow::bail!("unexpected write outcome {:?}", other),
        }
    }

    pub async fn invoke(
        &self,
        session_id: u16,
        path: ConcreteCommandPath,
        payload: Value,
        timed: Option<u16>,
    ) -> Result<Vec<InvokeResult>> {
        let mut interaction = self
            .start(Request::Invoke {
                session_id,
                path,
                payload,
                timed,
            })
            .await?;
        match interaction.next().await {
            Some(NodeEvent::InvokeCompleted { results, .. }) => Ok(results),
            Some(NodeEvent::Failed { error, .. }) => Err(error.into()),
            other => anyhow::bail!("unexpected invoke outcome {:?}", other),
        }
    }

    /// Runs `f` on the node's data model; resulting changes are reported to subscribers.
    pub async fn with_data<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut D) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Box<dyn FnOnce(&mut D) + Send> = Box::new(move |data| {
            _ = tx.send(f(data));
        });
        self.commands
            .send(Command::Data(job))
            .await
            .map_err(|_| anyhow::anyhow!("node task stopped"))?;
        rx.await.context("node task stopped")
    }

    /// Publisher side events, such as terminated subscriptions.
    pub async fn recv_event(&self) -> Option<NodeEvent> {
        self.events.lock().await.recv().await
    }
}

impl<D: DataModel + 'static> Drop for ActiveNode<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Interaction {
    pub fn id(&self) -> InteractionId {
        self.id
    }

    /// Next event of the interaction; asks for the following chunk first when the last
    /// one announced more.
    pub async fn next(&mut self) -> Option<NodeEvent> {
        if self.pull_pending {
            self.pull_pending = false;
            _ = self.control.send(Control::Pull(self.id));
        }
        let event = self.events.recv().await?;
        if let NodeEvent::Chunk { more: true, .. } = event {
            self.pull_pending = true;
        }
        Some(event)
    }

    /// Next chunk of a read, None after the last one.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }
        match self.next().await {
            Some(NodeEvent::Chunk { chunk, more, .. }) => {
                self.finished = !more;
                Ok(Some(chunk))
            }
            Some(NodeEvent::Failed { error, .. }) => {
                self.finished = true;
                Err(error.into())
            }
            Some(other) => anyhow::bail!("unexpected read event {:?}", other),
            None => anyhow::bail!("node task stopped"),
        }
    }
}

impl Drop for Interaction {
    fn drop(&mut self) {
        _ = self.control.send(Control::Cancel(self.id));
    }
}

impl Subscription {
    /// Next data report; empty chunks are keep-alives.
    pub async fn next_report(&mut self) -> Result<Chunk> {
        let mut reports = Vec::new();
        loop {
            match self.interaction.next().await {
                Some(NodeEvent::Chunk { chunk, more, .. }) => {
                    reports.extend(chunk);
                    if !more {
                        return Ok(reports);
                    }
                }
                Some(NodeEvent::Failed { error, .. }) => return Err(error.into()),
                Some(other) => log::debug!("unexpected subscription event {:?}", other),
                None => anyhow::bail!("node task stopped"),
            }
        }
    }
}

struct NodeTask<D: DataModel> {
    node: Node<D>,
    connections: HashMap<u16, Arc<transport::Connection>>,
    routes: HashMap<InteractionId, mpsc::UnboundedSender<NodeEvent>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

impl<D: DataModel> NodeTask<D> {
    async fn run(
        mut self,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        mut commands: mpsc::Receiver<Command<D>>,
        mut control: mpsc::UnboundedReceiver<Control>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.node.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                data = incoming.recv() => match data {
                    Some(data) => {
                        if let Err(e) = self.node.handle_datagram(&data, Instant::now()) {
                            log::debug!("dropping datagram: {}", e);
                        }
                    }
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.command(command),
                    None => break,
                },
                Some(c) = control.recv() => self.control(c),
                _ = sleep_until(deadline) => {}
            }
            self.node.poll(Instant::now());
            self.flush().await;
            self.deliver();
        }
        log::debug!("node task stopped");
    }

    fn command(&mut self, command: Command<D>) {
        match command {
            Command::Start { request, reply } => {
                let now = Instant::now();
                let started = match request {
                    Request::Read { session_id, request } => self.node.read(session_id, request, now),
                    Request::Subscribe { session_id, request } => self.node.subscribe(session_id, request, now),
                    Request::Write {
                        session_id,
                        items,
                        atomic,
                        timed,
                    } => self.node.write(session_id, &items, atomic, timed, now),
                    Request::Invoke {
                        session_id,
                        path,
                        payload,
                        timed,
                    } => self.node.invoke(session_id, path, &payload, timed, now),
                };
                let started = started.map(|id| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.routes.insert(id, tx);
                    (id, rx)
                });
                _ = reply.send(started);
            }
            Command::Data(job) => job(self.node.data_mut()),
        }
    }

    fn control(&mut self, control: Control) {
        let now = Instant::now();
        match control {
            Control::Pull(id) => {
                if let Err(e) = self.node.pull(id, now) {
                    log::debug!("pull of interaction {} failed: {}", id, e);
                }
            }
            Control::Cancel(id) => {
                self.routes.remove(&id);
                self.node.cancel(id, now);
            }
        }
    }

    async fn flush(&mut self) {
        for out in self.node.drain_outgoing() {
            match self.connections.get(&out.session_id) {
                Some(conn) => {
                    if let Err(e) = conn.send(&out.data).await {
                        log::debug!("send on session {} failed: {:?}", out.session_id, e);
                    }
                }
                None => log::debug!("no connection for session {}", out.session_id),
            }
        }
    }

    fn deliver(&mut self) {
        while let Some(event) = self.node.next_event() {
            let id = match &event {
                NodeEvent::Chunk { id, .. }
                | NodeEvent::SubscriptionEstablished { id, .. }
                | NodeEvent::WriteCompleted { id, .. }
                | NodeEvent::InvokeCompleted { id, .. }
                | NodeEvent::Failed { id, .. } => *id,
                NodeEvent::SubscriptionTerminated { .. } => {
                    _ = self.events.send(event);
                    continue;
                }
            };
            let delivered = self.routes.get(&id).map(|tx| tx.send(event).is_ok());
            if delivered == Some(false) {
                self.routes.remove(&id);
            }
        }
    }
}
