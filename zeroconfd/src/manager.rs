use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::{trim_trailing_dot, ServiceEntry};
use crate::cache::hash;
use crate::engine::Engine;
use crate::error::ZeroconfError;
use crate::mdns::publisher::RegistrationRequest;
use crate::mdns::resolve::LookupId;
use crate::reactor::NotifyReactor;
use crate::zeroconf::{BrowserId, Zeroconf};
pub use crate::mdns::browser::BrowserEvent;

pub type LookupCompletion = (LookupId, io::Result<Vec<IpAddr>>);

/// Commands sent to the driver task
pub enum Command {
    Browse(String, oneshot::Sender<Result<BrowserId, ZeroconfError>>),
    StopBrowse(BrowserId, oneshot::Sender<bool>),
    Register(RegistrationRequest, oneshot::Sender<Result<String, ZeroconfError>>),
    Unregister(String, oneshot::Sender<bool>),
    /// Optionally filtered by service type
    Entries(Option<String>, oneshot::Sender<Vec<ServiceEntry>>),
    Published(oneshot::Sender<Vec<(String, String)>>),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Zeroconf(#[from] ZeroconfError),

    #[error("Zeroconf driver has stopped")]
    Stopped,
}

/// Handle to interact with the driver task
#[derive(Clone)]
pub struct ZeroconfHandle {
    tx: mpsc::Sender<Command>,
}

/// Everything [`spawn`] hands back.
pub struct Driver {
    pub handle: ZeroconfHandle,
    pub events: mpsc::Receiver<BrowserEvent>,
    /// Digest of the current entry set
    pub digest: watch::Receiver<String>,
    pub task: JoinHandle<()>,
}

const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;

/// Move the core onto its own task. The task stops on cancellation, on
/// [`ZeroconfHandle::shutdown`], or once every handle is dropped, and
/// releases all browsers and registrations on the way out.
pub fn spawn<E>(
    core: Zeroconf<E, NotifyReactor>,
    lookups: mpsc::UnboundedReceiver<LookupCompletion>,
    cancel: CancellationToken,
) -> Driver
where
    E: Engine<Descriptor = Arc<Notify>> + Send + 'static,
{
    spawn_with_event_queue(core, lookups, cancel, EVENT_QUEUE)
}

pub(crate) fn spawn_with_event_queue<E>(
    core: Zeroconf<E, NotifyReactor>,
    lookups: mpsc::UnboundedReceiver<LookupCompletion>,
    cancel: CancellationToken,
    event_queue: usize,
) -> Driver
where
    E: Engine<Descriptor = Arc<Notify>> + Send + 'static,
{
    let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (events_tx, events) = mpsc::channel(event_queue);
    let (digest_tx, digest) = watch::channel(hash::compute_hash(&core.service_entries()));

    let task = tokio::spawn(run(core, commands, lookups, events_tx, digest_tx, cancel));

    Driver {
        handle: ZeroconfHandle { tx },
        events,
        digest,
        task,
    }
}

async fn run<E>(
    mut core: Zeroconf<E, NotifyReactor>,
    mut commands: mpsc::Receiver<Command>,
    mut lookups: mpsc::UnboundedReceiver<LookupCompletion>,
    events: mpsc::Sender<BrowserEvent>,
    digest: watch::Sender<String>,
    cancel: CancellationToken,
) where
    E: Engine<Descriptor = Arc<Notify>>,
{
    loop {
        tokio::select! {
            token = core.reactor_mut().ready() => core.on_ready(token),
            Some((id, result)) = lookups.recv() => core.lookup_finished(id, result),
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => {
                    tracing::info!("Zeroconf driver shutting down");
                    break;
                }
                Some(command) => execute(&mut core, command),
            },
            _ = cancel.cancelled() => {
                tracing::info!("Zeroconf driver cancelled");
                break;
            }
        }
        flush(&mut core, &events, &digest).await;
    }

    core.shutdown();
    flush(&mut core, &events, &digest).await;
}

fn execute<E>(core: &mut Zeroconf<E, NotifyReactor>, command: Command)
where
    E: Engine<Descriptor = Arc<Notify>>,
{
    match command {
        Command::Browse(service_type, reply) => {
            let _ = reply.send(core.browse(&service_type));
        }
        Command::StopBrowse(id, reply) => {
            let _ = reply.send(core.stop_browser(id));
        }
        Command::Register(request, reply) => {
            let _ = reply.send(core.register_service(&request));
        }
        Command::Unregister(name, reply) => {
            let _ = reply.send(core.unregister_service(&name));
        }
        Command::Entries(service_type, reply) => {
            let mut entries = core.service_entries();
            if let Some(service_type) = service_type {
                let wanted = trim_trailing_dot(&service_type);
                entries.retain(|entry| entry.service_type == wanted);
            }
            let _ = reply.send(entries);
        }
        Command::Published(reply) => {
            let _ = reply.send(core.published());
        }
        Command::Shutdown => {}
    }
}

/// Publish what the last step produced. The digest is only recomputed when
/// the entry set changed, and is updated before the events go out. A full
/// event queue holds the driver back until the listener catches up.
async fn flush<E>(core: &mut Zeroconf<E, NotifyReactor>, events: &mpsc::Sender<BrowserEvent>, digest: &watch::Sender<String>)
where
    E: Engine<Descriptor = Arc<Notify>>,
{
    let pending = core.take_events();
    if pending.is_empty() {
        return;
    }

    let new_digest = hash::compute_hash(&core.service_entries());
    digest.send_if_modified(|current| {
        if *current == new_digest {
            return false;
        }
        tracing::debug!("Entry digest now {}", new_digest);
        *current = new_digest;
        true
    });

    for event in pending {
        if events.send(event).await.is_err() {
            // Nobody listens
            break;
        }
    }
}

impl ZeroconfHandle {
    /// A handle whose driver is already gone.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await.map_err(|_| RequestError::Stopped)?;
        rx.await.map_err(|_| RequestError::Stopped)
    }

    /// Start browsing a service type
    pub async fn browse(&self, service_type: &str) -> Result<BrowserId, RequestError> {
        let service_type = service_type.to_string();
        Ok(self.request(|reply| Command::Browse(service_type, reply)).await??)
    }

    /// Stop a browser. Returns false if it was not running
    pub async fn stop_browse(&self, id: BrowserId) -> Result<bool, RequestError> {
        self.request(|reply| Command::StopBrowse(id, reply)).await
    }

    /// Publish a service. Returns the name it was registered under
    pub async fn register(&self, request: RegistrationRequest) -> Result<String, RequestError> {
        Ok(self.request(|reply| Command::Register(request, reply)).await??)
    }

    /// Withdraw a published service
    pub async fn unregister(&self, name: &str) -> Result<bool, RequestError> {
        let name = name.to_string();
        self.request(|reply| Command::Unregister(name, reply)).await
    }

    /// Discovered entries, optionally of one service type
    pub async fn entries(&self, service_type: Option<String>) -> Result<Vec<ServiceEntry>, RequestError> {
        self.request(|reply| Command::Entries(service_type, reply)).await
    }

    /// Published services as (logical, effective) names
    pub async fn published(&self) -> Result<Vec<(String, String)>, RequestError> {
        self.request(Command::Published).await
    }

    /// Stop the driver task
    pub async fn shutdown(&self) -> Result<(), RequestError> {
        self.tx.send(Command::Shutdown).await.map_err(|_| RequestError::Stopped)
    }
}
