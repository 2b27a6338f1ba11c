//! [`Engine`] over the `mdns-sd` daemon.
//!
//! The daemon hands out a flume receiver per browse. A forwarding task turns
//! its events into replies on the handle's queue and pings the handle's
//! `Notify`, which is what the reactor waits on. mdns-sd resolves instances
//! itself, so resolve and address queries are answered from what the browse
//! tasks have seen; the data still comes from multicast.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use shared::protocol::{ALL_INTERFACES, DEFAULT_DOMAIN};
use shared::txt;
use shared::types::{trim_trailing_dot, NetworkPort};
use crate::engine::{
    AddressReply, BrowseReply, Engine, EngineHandle, ErrorCode, InstanceRef, RegisterReply,
    RegisterRequest, Reply, ResolveReply,
};

type Resolved = Arc<Mutex<HashMap<String, ServiceInfo>>>;

enum HandleKind {
    Browse { ty_domain: String, task: JoinHandle<()> },
    Register { fullname: String },
    OneShot,
}

struct HandleState {
    kind: HandleKind,
    notify: Arc<Notify>,
    replies: flume::Receiver<Reply>,
    /// Keeps the queue open for handles without a forwarding task
    _sender: Option<flume::Sender<Reply>>,
}

pub struct MdnsEngine {
    daemon: ServiceDaemon,
    /// "<host>.local."
    hostname: String,
    next_handle: u64,
    handles: HashMap<EngineHandle, HandleState>,
    /// Resolved instances by fullname, filled by the browse tasks
    resolved: Resolved,
}

impl MdnsEngine {
    pub fn new(daemon: ServiceDaemon) -> Result<Self> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        Ok(Self::with_hostname(daemon, &hostname))
    }

    pub fn with_hostname(daemon: ServiceDaemon, hostname: &str) -> Self {
        let host = trim_trailing_dot(hostname);
        let hostname = if host.ends_with(".local") {
            format!("{}.", host)
        } else {
            format!("{}.{}", host, DEFAULT_DOMAIN)
        };

        Self {
            daemon,
            hostname,
            next_handle: 0,
            handles: HashMap::new(),
            resolved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allocate(&mut self) -> EngineHandle {
        self.next_handle += 1;
        EngineHandle(self.next_handle)
    }

    /// A handle whose only reply is already known.
    fn answered(&mut self, reply: Reply) -> EngineHandle {
        let handle = self.allocate();
        let (tx, rx) = flume::unbounded();
        let notify = Arc::new(Notify::new());
        let _ = tx.send(reply);
        notify.notify_one();

        self.handles.insert(
            handle,
            HandleState {
                kind: HandleKind::OneShot,
                notify,
                replies: rx,
                _sender: Some(tx),
            },
        );
        handle
    }

    fn resolved(&self) -> MutexGuard<'_, HashMap<String, ServiceInfo>> {
        lock(&self.resolved)
    }

    fn is_registered(&self, fullname: &str) -> bool {
        self.handles.values().any(|state| {
            matches!(&state.kind, HandleKind::Register { fullname: f } if f == fullname)
        })
    }
}

fn lock(resolved: &Resolved) -> MutexGuard<'_, HashMap<String, ServiceInfo>> {
    // The map stays consistent even if a holder panicked
    resolved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// "_http._tcp" → "_http._tcp.local."
fn ty_domain(service_type: &str, domain: Option<&str>) -> String {
    let domain = domain.map(trim_trailing_dot).unwrap_or(trim_trailing_dot(DEFAULT_DOMAIN));
    format!("{}.{}.", trim_trailing_dot(service_type), domain)
}

/// Split "My Printer._ipp._tcp.local." under type "_ipp._tcp.local." into
/// the instance reference a browse event carries.
fn instance_ref(fullname: &str, ty_domain: &str) -> Option<InstanceRef> {
    let name = fullname.strip_suffix(ty_domain)?.strip_suffix('.')?;
    if name.is_empty() {
        return None;
    }

    // The type is the first two labels, the rest is the domain
    let mut labels = ty_domain.splitn(3, '.');
    let (service, proto, domain) = (labels.next()?, labels.next()?, labels.next()?);
    let domain = if domain.is_empty() { DEFAULT_DOMAIN.to_string() } else { domain.to_string() };

    Some(InstanceRef {
        name: name.to_string(),
        reg_type: format!("{}.{}.", service, proto),
        domain,
        interface_index: ALL_INTERFACES,
    })
}

fn browse_reply(added: bool, fullname: &str, ty_domain: &str) -> Option<Reply> {
    let instance = instance_ref(fullname, ty_domain)?;
    Some(Reply::Browse(Ok(BrowseReply { added, instance })))
}

/// TXT wire bytes for the daemon's parsed properties.
fn txt_bytes(info: &ServiceInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    for property in info.get_properties().iter() {
        let mut record = property.key().as_bytes().to_vec();
        if let Some(value) = property.val() {
            record.push(b'=');
            record.extend_from_slice(value);
        }
        if let Err(len) = txt::push_record(&mut buf, &record) {
            tracing::warn!("Skipping {} byte TXT record '{}' of {}", len, property.key(), info.get_fullname());
        }
    }
    buf
}

fn resolve_reply(info: &ServiceInfo, interface_index: u32) -> ResolveReply {
    ResolveReply {
        host_target: info.get_hostname().to_string(),
        port: NetworkPort::from_host(info.get_port()),
        txt: txt_bytes(info),
        interface_index,
    }
}

/// Prefer IPv4, like the address query it stands in for.
fn pick_address(info: &ServiceInfo) -> Option<IpAddr> {
    let addresses = info.get_addresses();
    let mut sorted: Vec<IpAddr> = addresses.iter().copied().collect();
    sorted.sort();
    sorted
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| sorted.first())
        .copied()
}

async fn forward_browse(
    events: flume::Receiver<ServiceEvent>,
    replies: flume::Sender<Reply>,
    notify: Arc<Notify>,
    resolved: Resolved,
) {
    while let Ok(event) = events.recv_async().await {
        let reply = match event {
            ServiceEvent::ServiceResolved(info) => {
                let reply = browse_reply(true, info.get_fullname(), info.get_type());
                lock(&resolved).insert(info.get_fullname().to_string(), info);
                reply
            }
            ServiceEvent::ServiceRemoved(ty_domain, fullname) => {
                lock(&resolved).remove(&fullname);
                browse_reply(false, &fullname, &ty_domain)
            }
            ServiceEvent::SearchStopped(ty_domain) => {
                tracing::debug!("Search stopped for {}", ty_domain);
                break;
            }
            _ => None,
        };

        if let Some(reply) = reply {
            if replies.send(reply).is_err() {
                return;
            }
            notify.notify_one();
        }
    }

    // Closing the queue tells the next readiness pump the browse is dead
    drop(replies);
    notify.notify_one();
}

impl Engine for MdnsEngine {
    type Descriptor = Arc<Notify>;

    fn browse(&mut self, service_type: &str) -> Result<EngineHandle, ErrorCode> {
        let ty_domain = ty_domain(service_type, None);
        let events = self
            .daemon
            .browse(&ty_domain)
            .map_err(|e| ErrorCode::Other(e.to_string()))?;

        let handle = self.allocate();
        let (tx, rx) = flume::unbounded();
        let notify = Arc::new(Notify::new());
        let task = tokio::spawn(forward_browse(events, tx, notify.clone(), self.resolved.clone()));

        self.handles.insert(
            handle,
            HandleState {
                kind: HandleKind::Browse { ty_domain, task },
                notify,
                replies: rx,
                _sender: None,
            },
        );
        Ok(handle)
    }

    fn resolve(&mut self, instance: &InstanceRef) -> Result<EngineHandle, ErrorCode> {
        let fullname = format!(
            "{}.{}",
            instance.name,
            ty_domain(&instance.reg_type, Some(&instance.domain))
        );
        let reply = match self.resolved().get(&fullname) {
            Some(info) => Ok(resolve_reply(info, instance.interface_index)),
            None => Err(ErrorCode::NoSuchRecord),
        };
        Ok(self.answered(Reply::Resolve(reply)))
    }

    fn address_query(
        &mut self,
        host: &str,
        interface_index: u32,
        _force_multicast: bool,
    ) -> Result<EngineHandle, ErrorCode> {
        let wanted = trim_trailing_dot(host);
        let address = self
            .resolved()
            .values()
            .filter(|info| trim_trailing_dot(info.get_hostname()) == wanted)
            .find_map(pick_address);

        let reply = match address {
            Some(address) => Ok(AddressReply {
                hostname: host.to_string(),
                address,
                interface_index,
            }),
            None => Err(ErrorCode::NoSuchRecord),
        };
        Ok(self.answered(Reply::Address(reply)))
    }

    fn register(&mut self, request: &RegisterRequest) -> Result<EngineHandle, ErrorCode> {
        let ty_domain = ty_domain(&request.service_type, request.domain.as_deref());
        let fullname = format!("{}.{}", request.name, ty_domain);
        if self.is_registered(&fullname) {
            return Err(ErrorCode::NameConflict);
        }

        let tokens = txt::decode(&request.txt).map_err(|e| ErrorCode::Other(e.to_string()))?;
        let properties: HashMap<String, String> = txt::to_pairs(&tokens).into_iter().collect();

        if request.interface_index != ALL_INTERFACES {
            tracing::debug!(
                "mdns-sd announces on every enabled interface, ignoring interface {} for {}",
                request.interface_index,
                fullname
            );
        }

        let info = ServiceInfo::new(
            &ty_domain,
            &request.name,
            &self.hostname,
            "",
            request.port.to_host(),
            properties,
        )
        .map_err(|e| ErrorCode::Other(e.to_string()))?
        .enable_addr_auto();

        self.daemon
            .register(info)
            .map_err(|e| ErrorCode::Other(e.to_string()))?;

        let handle = self.answered(Reply::Register(Ok(RegisterReply { name: request.name.clone() })));
        if let Some(state) = self.handles.get_mut(&handle) {
            state.kind = HandleKind::Register { fullname };
        }
        Ok(handle)
    }

    fn descriptor(&self, handle: EngineHandle) -> Option<Arc<Notify>> {
        self.handles.get(&handle).map(|state| state.notify.clone())
    }

    fn process_readiness(&mut self, handle: EngineHandle) -> Result<Vec<Reply>, ErrorCode> {
        let state = self
            .handles
            .get(&handle)
            .ok_or_else(|| ErrorCode::Other(format!("unknown handle {}", handle)))?;

        let mut replies = Vec::new();
        loop {
            match state.replies.try_recv() {
                Ok(reply) => replies.push(reply),
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    if replies.is_empty() {
                        return Err(ErrorCode::Other("mDNS daemon stopped".to_string()));
                    }
                    break;
                }
            }
        }
        Ok(replies)
    }

    fn deallocate(&mut self, handle: EngineHandle) {
        let Some(state) = self.handles.remove(&handle) else {
            tracing::warn!("Deallocating unknown handle {}", handle);
            return;
        };

        match state.kind {
            HandleKind::Browse { ty_domain, task } => {
                task.abort();
                if let Err(e) = self.daemon.stop_browse(&ty_domain) {
                    tracing::debug!("Failed to stop browsing {}: {}", ty_domain, e);
                }
            }
            HandleKind::Register { fullname } => {
                if let Err(e) = self.daemon.unregister(&fullname) {
                    tracing::warn!("Failed to unregister {}: {}", fullname, e);
                }
            }
            HandleKind::OneShot => {}
        }
    }
}
