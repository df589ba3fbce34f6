//! The connection controller.
//!
//! A single task owns the registry of connected clients and is the only code
//! that mutates the store on behalf of clients. Requests from every [`Link`]
//! are multiplexed into one stream and handled strictly one at a time, so a
//! mutation and the broadcasts describing it are never interleaved with
//! another client's request.
//!
//! Other tasks talk to the controller through a [`ControllerHandle`].

use super::link::{ConnectionId, LINK_CAPACITY, Link};
use super::protocol::{Command, MessageType, Request, Response};
use crate::models::{ProjectId, TagId};
use crate::storage::Storage;
use crate::{Error, Result};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONTROL_CAPACITY: usize = 32;

/// Lifecycle of a connection as seen by the controller.
///
/// `Connecting → Registered → Streaming → Closing → Closed`. Only `Streaming`
/// connections receive broadcasts and replies. A connection stays `Closing`
/// in the registry until its request stream has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channels allocated, not yet in the registry
    Connecting,
    /// In the registry, initial state not yet delivered
    Registered,
    /// Receiving broadcasts
    Streaming,
    /// Close signalled, waiting for the request stream to end
    Closing,
    /// Removed from the registry
    Closed,
}

impl ConnectionState {
    /// Whether the connection counts as connected.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Registered | ConnectionState::Streaming)
    }
}

enum ControlMessage {
    Register { reply: oneshot::Sender<Link> },
    Connections { reply: oneshot::Sender<Vec<(ConnectionId, ConnectionState)>> },
    Shutdown,
}

enum Inbound {
    Request(ConnectionId, Request),
    Closed(ConnectionId),
}

struct Connection {
    outbound: mpsc::Sender<Response>,
    close: CancellationToken,
    state: ConnectionState,
}

impl Connection {
    /// Signal both pumps; the entry stays until the request stream ends.
    fn close(&mut self) {
        self.state = ConnectionState::Closing;
        self.close.cancel();
    }
}

/// Result of a successfully executed command.
#[derive(Debug, Default)]
struct Outcome {
    /// Messages for every connected client
    broadcasts: Vec<Response>,
    /// Payload of the `OK` reply
    payload: Value,
}

/// Cheap, cloneable access to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    control: mpsc::Sender<ControlMessage>,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::Register { .. } => f.write_str("Register"),
            ControlMessage::Connections { .. } => f.write_str("Connections"),
            ControlMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ControllerHandle {
    /// Register a new client and obtain its link.
    ///
    /// The link's outbound queue already holds the initial `TAG_LIST` and
    /// `SUMMARY_LIST` messages.
    pub async fn connect(&self) -> Result<Link> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::Register { reply })
            .await
            .map_err(|_| Error::ControllerStopped)?;
        rx.await.map_err(|_| Error::ControllerStopped)
    }

    /// Every connection in the registry with its state, ordered by id.
    pub async fn connections(&self) -> Result<Vec<(ConnectionId, ConnectionState)>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::Connections { reply })
            .await
            .map_err(|_| Error::ControllerStopped)?;
        rx.await.map_err(|_| Error::ControllerStopped)
    }

    /// Number of live connections. Connections that are closing are not
    /// counted.
    pub async fn connection_count(&self) -> Result<usize> {
        let connections = self.connections().await?;
        Ok(connections.iter().filter(|(_, state)| state.is_live()).count())
    }

    /// Ask the controller to close every connection and stop.
    pub async fn shutdown(&self) {
        let _ = self.control.send(ControlMessage::Shutdown).await;
    }
}

/// Start a controller task over `storage`.
///
/// The task resolves when the controller is shut down, with an error if a
/// fatal storage failure stopped it.
pub fn spawn_controller(storage: Arc<Storage>) -> (ControllerHandle, JoinHandle<Result<()>>) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    let controller = Controller::new(storage, control_rx);
    let task = tokio::spawn(controller.run());
    (ControllerHandle { control: control_tx }, task)
}

struct Controller {
    storage: Arc<Storage>,
    control: mpsc::Receiver<ControlMessage>,
    connections: HashMap<ConnectionId, Connection>,
    inbound: SelectAll<BoxStream<'static, Inbound>>,
    next_id: ConnectionId,
}

impl Controller {
    fn new(storage: Arc<Storage>, control: mpsc::Receiver<ControlMessage>) -> Self {
        Self {
            storage,
            control,
            connections: HashMap::new(),
            inbound: SelectAll::new(),
            next_id: 1,
        }
    }

    async fn run(mut self) -> Result<()> {
        info!("controller started");

        let result = loop {
            tokio::select! {
                message = self.control.recv() => match message {
                    Some(ControlMessage::Register { reply }) => {
                        if let Err(e) = self.register(reply) {
                            if e.is_fatal() {
                                break Err(e);
                            }
                            warn!(error = %e, "unable to register connection");
                        }
                    }
                    Some(ControlMessage::Connections { reply }) => {
                        let _ = reply.send(self.states());
                    }
                    Some(ControlMessage::Shutdown) | None => break Ok(()),
                },
                Some(event) = self.inbound.next(), if !self.inbound.is_empty() => match event {
                    Inbound::Request(id, request) => {
                        if let Err(e) = self.handle_request(id, request) {
                            error!(error = %e, "fatal storage failure, stopping controller");
                            break Err(e);
                        }
                    }
                    Inbound::Closed(id) => self.deregister(id),
                },
            }
        };

        for (_, mut connection) in self.connections.drain() {
            connection.close();
            connection.state = ConnectionState::Closed;
        }
        info!("controller stopped");
        result
    }

    fn register(&mut self, reply: oneshot::Sender<Link>) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let (request_tx, request_rx) = mpsc::channel(LINK_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(LINK_CAPACITY);
        let close = CancellationToken::new();
        let mut connection = Connection {
            outbound: response_tx,
            close: close.clone(),
            state: ConnectionState::Connecting,
        };

        let tags = Response::backend(MessageType::TagList, self.storage.get_tag_list()?)?;
        let summaries =
            Response::backend(MessageType::SummaryList, self.storage.get_summary_list()?)?;

        connection.state = ConnectionState::Registered;
        // A fresh queue always has room for the initial state.
        for message in [tags, summaries] {
            if connection.outbound.try_send(message).is_err() {
                return Err(Error::Other(format!(
                    "unable to deliver initial state to connection {}",
                    id
                )));
            }
        }
        connection.state = ConnectionState::Streaming;
        self.connections.insert(id, connection);

        // The stream ends when the transport drops its half or either side
        // signals close; its final item removes the connection.
        let requests = stream::unfold(request_rx, |mut rx| async move {
            rx.recv().await.map(|request| (request, rx))
        })
        .take_until(close.clone().cancelled_owned())
        .map(move |request| Inbound::Request(id, request))
        .chain(stream::once(async move { Inbound::Closed(id) }));
        self.inbound.push(requests.boxed());

        if reply
            .send(Link::new(id, request_tx, response_rx, close))
            .is_err()
        {
            self.deregister(id);
            return Ok(());
        }

        info!(connection = id, "client connected");
        Ok(())
    }

    fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .get(&id)
            .map_or(ConnectionState::Closed, |c| c.state)
    }

    fn states(&self) -> Vec<(ConnectionId, ConnectionState)> {
        let mut states: Vec<_> = self
            .connections
            .iter()
            .map(|(&id, connection)| (id, connection.state))
            .collect();
        states.sort_unstable_by_key(|&(id, _)| id);
        states
    }

    /// Remove a connection whose request stream has ended.
    fn deregister(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.connections.remove(&id) {
            connection.close();
            connection.state = ConnectionState::Closed;
            info!(connection = id, "client disconnected");
        }
    }

    /// Handle one request. Only fatal errors are returned; everything else is
    /// reported to the requester.
    fn handle_request(&mut self, id: ConnectionId, request: Request) -> Result<()> {
        if self.state(id) != ConnectionState::Streaming {
            debug!(connection = id, "dropping request from closing connection");
            return Ok(());
        }

        let command = match Command::decode(&request) {
            Ok(command) => command,
            Err(e) => {
                debug!(connection = id, action = %request.action, error = %e, "rejected request");
                self.reply(id, Response::error(request.id, e.to_string()));
                return Ok(());
            }
        };

        let action = command.action();
        match self.execute(command) {
            Ok(outcome) => {
                debug!(connection = id, %action, broadcasts = outcome.broadcasts.len(), "executed");
                for message in outcome.broadcasts {
                    self.broadcast(message);
                }
                self.reply(id, Response::ok(request.id, outcome.payload));
                Ok(())
            }
            Err(e) => {
                self.reply(id, Response::error(request.id, e.to_string()));
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(connection = id, %action, error = %e, "action failed");
                Ok(())
            }
        }
    }

    fn execute(&self, command: Command) -> Result<Outcome> {
        let storage = &self.storage;
        let mut outcome = Outcome::default();

        match command {
            Command::TagNew(params) => {
                let tag = storage.create_tag(&params.name, &params.color)?;
                outcome.broadcasts.push(self.tag_update(tag)?);
            }
            Command::TagEdit(params) => {
                storage.edit_tag(params.id, &params.new_name, &params.new_color)?;
                outcome.broadcasts.push(self.tag_update(params.id)?);
            }
            Command::TagDelete(tag) => {
                let projects = storage.delete_tag(tag)?;
                outcome
                    .broadcasts
                    .push(Response::backend(MessageType::TagDelete, tag)?);
                for project in projects {
                    outcome.broadcasts.push(self.summary_update(project)?);
                    outcome.broadcasts.push(self.project_update(project)?);
                }
            }
            Command::ProjectNew(params) => {
                let project =
                    storage.create_project(&params.name, &params.description, &params.tags)?;
                outcome.broadcasts.push(self.summary_update(project)?);
                let tags = storage.get_tag_ids_by_project(project)?;
                self.push_tag_updates(&mut outcome, &tags)?;
            }
            Command::ProjectGet(project) => {
                outcome.payload = serde_json::to_value(storage.get_project_by_id(project)?)?;
            }
            Command::ProjectDelete(project) => {
                let tags = storage.delete_project(project)?;
                outcome
                    .broadcasts
                    .push(Response::backend(MessageType::ProjectDelete, project)?);
                self.push_tag_updates(&mut outcome, &tags)?;
            }
            Command::ProjectEdit(params) => {
                let changed = storage.edit_project(
                    params.id,
                    &params.title,
                    &params.description,
                    &params.tags,
                )?;
                outcome.broadcasts.push(self.summary_update(params.id)?);
                outcome.broadcasts.push(self.project_update(params.id)?);
                self.push_tag_updates(&mut outcome, &changed)?;
            }
            Command::TaskNew(params) => {
                let project = storage.add_task(
                    params.project_id,
                    &params.title,
                    &params.description,
                    params.priority,
                )?;
                self.push_task_updates(&mut outcome, project)?;
            }
            Command::TaskDelete(task) => {
                let project = storage.delete_task(task)?;
                self.push_task_updates(&mut outcome, project)?;
            }
            Command::TaskToggle(task) => {
                let project = storage.toggle_task(task)?;
                self.push_task_updates(&mut outcome, project)?;
            }
            Command::TaskEdit(params) => {
                let project = storage.edit_task(
                    params.task_id,
                    &params.title,
                    &params.description,
                    params.priority,
                )?;
                self.push_task_updates(&mut outcome, project)?;
            }
            Command::SessionNew(params) => {
                let project =
                    storage.add_session(params.project_id, params.duration, params.date)?;
                self.push_session_updates(&mut outcome, project)?;
            }
            Command::SessionDelete(session) => {
                let project = storage.delete_session(session)?;
                self.push_session_updates(&mut outcome, project)?;
            }
        }

        Ok(outcome)
    }

    fn tag_update(&self, id: TagId) -> Result<Response> {
        Response::backend(MessageType::TagUpdate, self.storage.get_tag_by_id(id)?)
    }

    fn summary_update(&self, id: ProjectId) -> Result<Response> {
        Response::backend(MessageType::SummaryUpdate, self.storage.get_summary_by_id(id)?)
    }

    fn project_update(&self, id: ProjectId) -> Result<Response> {
        Response::backend(MessageType::ProjectUpdate, self.storage.get_project_by_id(id)?)
    }

    fn push_tag_updates(&self, outcome: &mut Outcome, tags: &[TagId]) -> Result<()> {
        for &tag in tags {
            outcome.broadcasts.push(self.tag_update(tag)?);
        }
        Ok(())
    }

    fn push_task_updates(&self, outcome: &mut Outcome, project: ProjectId) -> Result<()> {
        outcome.broadcasts.push(self.project_update(project)?);
        outcome.broadcasts.push(self.summary_update(project)?);
        Ok(())
    }

    /// Session time feeds the durations of the project and of its tags.
    fn push_session_updates(&self, outcome: &mut Outcome, project: ProjectId) -> Result<()> {
        outcome.broadcasts.push(self.project_update(project)?);
        let tags = self.storage.get_tag_ids_by_project(project)?;
        self.push_tag_updates(outcome, &tags)
    }

    /// Send to every streaming connection without waiting.
    ///
    /// A connection whose queue is full is disconnected; one whose queue is
    /// closed is removed.
    fn broadcast(&mut self, message: Response) {
        let mut dropped = Vec::new();
        for (&id, connection) in &self.connections {
            if connection.state != ConnectionState::Streaming {
                continue;
            }
            if let Err(e) = connection.outbound.try_send(message.clone()) {
                dropped.push((id, matches!(e, TrySendError::Full(_))));
            }
        }
        for (id, full) in dropped {
            self.drop_connection(id, full);
        }
    }

    fn reply(&mut self, id: ConnectionId, message: Response) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        if connection.state != ConnectionState::Streaming {
            return;
        }
        if let Err(e) = connection.outbound.try_send(message) {
            self.drop_connection(id, matches!(e, TrySendError::Full(_)));
        }
    }

    /// Stop serving a connection. It is removed once its request stream
    /// reports the close.
    fn drop_connection(&mut self, id: ConnectionId, slow: bool) {
        if slow {
            warn!(connection = id, "outbound queue full, disconnecting slow client");
        }
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.close();
        }
    }
}
