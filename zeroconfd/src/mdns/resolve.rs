//! Per-instance pipeline: resolve (host, port, TXT), then address resolution,
//! then entry construction.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use shared::txt;
use shared::types::{trim_trailing_dot, AddressFamily, DedupKey, DedupMode, EntryFlags, ServiceEntry};
use crate::engine::{AddressReply, Engine, ErrorCode, InstanceRef, ResolveReply};
use crate::error::ZeroconfError;
use crate::mdns::browser::BrowserEvent;
use crate::reactor::Reactor;
use crate::registry::Token;
use crate::zeroconf::{BrowserId, Stage, Zeroconf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupId(pub u64);

/// Hostname resolution outside the engine. Completions are fed back through
/// [`Zeroconf::lookup_finished`].
pub trait HostLookup {
    fn lookup(&mut self, host: &str) -> LookupId;

    /// The completion for `id` is no longer wanted.
    fn cancel(&mut self, id: LookupId);
}

/// How a resolved host target becomes an address.
pub enum AddressStrategy {
    /// Interface-scoped engine query that bypasses the unicast cache.
    MulticastQuery,
    /// System resolver. Cannot be scoped to an interface, so an instance seen
    /// on two interfaces resolves identically on both.
    HostLookup(Box<dyn HostLookup + Send>),
}

impl AddressStrategy {
    pub fn is_interface_scoped(&self) -> bool {
        matches!(self, AddressStrategy::MulticastQuery)
    }
}

/// Everything known about an instance once its resolve succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInstance {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub hostname: String,
    pub port: u16,
    pub txt: Vec<String>,
    pub interface_index: u32,
}

impl ResolvedInstance {
    fn new(instance: InstanceRef, reply: ResolveReply) -> Self {
        let txt = match txt::decode(&reply.txt) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Keeping partial TXT for {}: {}", instance.name, ZeroconfError::from(e.clone()));
                e.partial
            }
        };

        Self {
            service_type: trim_trailing_dot(&instance.reg_type).to_string(),
            domain: trim_trailing_dot(&instance.domain).to_string(),
            name: instance.name,
            hostname: reply.host_target,
            port: reply.port.to_host(),
            txt,
            interface_index: reply.interface_index,
        }
    }

    /// Key of the instance as its resolve reply described it.
    pub fn key(&self, mode: DedupMode) -> DedupKey {
        DedupKey::new(mode, &self.name, &self.service_type, self.interface_index)
    }

    pub fn entry(&self, address: IpAddr) -> ServiceEntry {
        ServiceEntry {
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            domain: self.domain.clone(),
            hostname: self.hostname.clone(),
            address,
            port: self.port,
            family: AddressFamily::of(&address),
            txt: self.txt.clone(),
            flags: EntryFlags::default(),
        }
    }
}

impl<E, R> Zeroconf<E, R>
where
    E: Engine,
    R: Reactor<E::Descriptor>,
{
    pub(crate) fn start_resolve(&mut self, browser: BrowserId, instance: InstanceRef) {
        let handle = match self.engine.resolve(&instance) {
            Ok(handle) => handle,
            Err(code) => {
                tracing::warn!("Failed to create service resolver for {}: {}", instance.name, code);
                return;
            }
        };

        let name = instance.name.clone();
        match self.track(handle, Stage::Resolve(instance), Some(browser)) {
            Ok(token) => self.adopt(browser, token),
            Err(e) => tracing::warn!("Not resolving {}: {}", name, e),
        }
    }

    pub(crate) fn on_resolve_reply(&mut self, token: Token, result: Result<ResolveReply, ErrorCode>) {
        // One-shot: released before looking at the outcome
        let Some(op) = self.release(token) else {
            return;
        };
        let (Stage::Resolve(instance), Some(browser)) = (op.stage, op.browser) else {
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(code) => {
                tracing::warn!("Failed to resolve service {}: {}", instance.name, code);
                return;
            }
        };

        let resolved = ResolvedInstance::new(instance, reply);
        tracing::debug!("Resolving host for {} at {}", resolved.name, resolved.hostname);
        self.start_address(browser, resolved);
    }

    fn start_address(&mut self, browser: BrowserId, resolved: ResolvedInstance) {
        if let AddressStrategy::HostLookup(lookup) = &mut self.strategy {
            let id = lookup.lookup(&resolved.hostname);
            if let Some(owner) = self.browsers.get_mut(browser) {
                owner.lookups.insert(id);
            }
            self.lookups.insert(id, (browser, resolved));
            return;
        }

        let handle = match self.engine.address_query(&resolved.hostname, resolved.interface_index, true) {
            Ok(handle) => handle,
            Err(code) => {
                tracing::warn!("Failed to get address info for {}: {}", resolved.hostname, code);
                return;
            }
        };
        let name = resolved.name.clone();
        match self.track(handle, Stage::Address(resolved), Some(browser)) {
            Ok(token) => self.adopt(browser, token),
            Err(e) => tracing::warn!("Not resolving {}: {}", name, e),
        }
    }

    pub(crate) fn on_address_reply(&mut self, token: Token, result: Result<AddressReply, ErrorCode>) {
        let Some(op) = self.release(token) else {
            return;
        };
        let (Stage::Address(resolved), Some(browser)) = (op.stage, op.browser) else {
            return;
        };

        match result {
            Ok(reply) => self.add_entry(browser, &resolved, reply.address, reply.interface_index),
            Err(code) => tracing::warn!("Failed to resolve address of {}: {}", resolved.hostname, code),
        }
    }

    /// Completion of a [`HostLookup`] request.
    pub fn lookup_finished(&mut self, id: LookupId, result: io::Result<Vec<IpAddr>>) {
        let Some((browser, resolved)) = self.lookups.remove(&id) else {
            tracing::debug!("Lookup {:?} finished but nothing is waiting for it", id);
            return;
        };
        if let Some(owner) = self.browsers.get_mut(browser) {
            owner.lookups.remove(&id);
        }

        match result {
            Ok(addresses) => {
                for address in addresses {
                    self.add_entry(browser, &resolved, address, resolved.interface_index);
                }
            }
            Err(e) => tracing::warn!(
                "Error resolving host address for {} {}: {}",
                resolved.service_type,
                resolved.hostname,
                e
            ),
        }
    }

    fn adopt(&mut self, browser: BrowserId, token: Token) {
        match self.browsers.get_mut(browser) {
            Some(owner) => {
                owner.spawned.insert(token);
            }
            None => {
                self.release(token);
            }
        }
    }

    fn add_entry(&mut self, browser: BrowserId, resolved: &ResolvedInstance, address: IpAddr, interface_index: u32) {
        let Some(owner) = self.browsers.get_mut(browser) else {
            return;
        };

        let key = DedupKey::new(self.dedup, &resolved.name, &resolved.service_type, interface_index);
        let entry = resolved.entry(address);
        if owner.entries_mut().insert_if_absent(key.clone(), entry.clone()) {
            tracing::debug!("Entry added {} ({})", key, address);
            self.events.push(BrowserEvent::Added(entry));
        } else {
            tracing::debug!("Discarding duplicate entry: {} ({})", key, address);
        }
    }
}

/// [`HostLookup`] over `tokio::net::lookup_host`. Completions are sent on the
/// channel given to [`TokioHostLookup::new`].
pub struct TokioHostLookup {
    tx: mpsc::UnboundedSender<(LookupId, io::Result<Vec<IpAddr>>)>,
    next_id: u64,
    tasks: HashMap<LookupId, JoinHandle<()>>,
}

impl TokioHostLookup {
    pub fn new(tx: mpsc::UnboundedSender<(LookupId, io::Result<Vec<IpAddr>>)>) -> Self {
        Self {
            tx,
            next_id: 0,
            tasks: HashMap::new(),
        }
    }
}

impl HostLookup for TokioHostLookup {
    fn lookup(&mut self, host: &str) -> LookupId {
        self.tasks.retain(|_, task| !task.is_finished());

        let id = LookupId(self.next_id);
        self.next_id += 1;

        let host = trim_trailing_dot(host).to_string();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let result = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>());
            let _ = tx.send((id, result));
        });
        self.tasks.insert(id, task);
        id
    }

    fn cancel(&mut self, id: LookupId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }
}
