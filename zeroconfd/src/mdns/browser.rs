use std::collections::HashSet;
use shared::types::{trim_trailing_dot, DedupKey, ServiceEntry};
use crate::cache::EntryTable;
use crate::engine::{BrowseReply, Engine, ErrorCode};
use crate::error::{Result, ZeroconfError};
use crate::mdns::resolve::{AddressStrategy, LookupId};
use crate::reactor::Reactor;
use crate::registry::Token;
use crate::zeroconf::{BrowserId, Stage, Zeroconf};

/// Notifications for the owner of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    Added(ServiceEntry),
    /// Carries the entry as it was stored, not as the remove event described it
    Removed(ServiceEntry),
}

impl BrowserEvent {
    pub fn entry(&self) -> &ServiceEntry {
        match self {
            BrowserEvent::Added(entry) | BrowserEvent::Removed(entry) => entry,
        }
    }
}

/// State of one browse subscription.
pub struct ServiceBrowser {
    service_type: String,
    /// `None` once the engine killed the subscription
    pub(crate) subscription: Option<Token>,
    /// Resolve and address operations still in flight
    pub(crate) spawned: HashSet<Token>,
    pub(crate) lookups: HashSet<LookupId>,
    entries: EntryTable,
}

impl ServiceBrowser {
    fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            subscription: None,
            spawned: HashSet::new(),
            lookups: HashSet::new(),
            entries: EntryTable::new(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Operations this browser would cancel on teardown.
    pub fn in_flight(&self) -> usize {
        self.spawned.len() + self.lookups.len()
    }

    pub fn entries(&self) -> &EntryTable {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut EntryTable {
        &mut self.entries
    }
}

impl<E, R> Zeroconf<E, R>
where
    E: Engine,
    R: Reactor<E::Descriptor>,
{
    /// Subscribe to instances of `service_type`, e.g. "_http._tcp".
    pub fn browse(&mut self, service_type: &str) -> Result<BrowserId> {
        if service_type.is_empty() {
            return Err(ZeroconfError::Configuration(
                "browsing all services is not supported, a service type is required".to_string(),
            ));
        }

        let handle = self
            .engine
            .browse(service_type)
            .map_err(|code| ZeroconfError::Engine { operation: "browse", code })?;

        let id = self.browsers.insert(ServiceBrowser::new(service_type));
        match self.track(handle, Stage::Browse, Some(id)) {
            Ok(token) => {
                if let Some(browser) = self.browsers.get_mut(id) {
                    browser.subscription = Some(token);
                }
            }
            Err(e) => {
                self.browsers.remove(id);
                return Err(e);
            }
        }

        tracing::info!(
            "Browsing {} ({} address resolution)",
            service_type,
            if self.strategy.is_interface_scoped() { "multicast" } else { "host lookup" }
        );
        Ok(id)
    }

    pub fn browser(&self, id: BrowserId) -> Option<&ServiceBrowser> {
        self.browsers.get(id)
    }

    pub fn browsers(&self) -> impl Iterator<Item = (BrowserId, &ServiceBrowser)> {
        self.browsers.iter()
    }

    pub fn browser_entries(&self, id: BrowserId) -> Option<Vec<ServiceEntry>> {
        self.browsers.get(id).map(|browser| browser.entries.snapshot())
    }

    pub(crate) fn on_browse_reply(&mut self, id: BrowserId, result: std::result::Result<BrowseReply, ErrorCode>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(code) => {
                tracing::warn!("Browse error ignored: {}", code);
                return;
            }
        };
        let instance = reply.instance;

        if reply.added {
            tracing::debug!(
                "Service appeared: {}.{} on interface {}",
                instance.name,
                instance.reg_type,
                instance.interface_index
            );
            self.start_resolve(id, instance);
            return;
        }

        let service_type = trim_trailing_dot(&instance.reg_type);
        let key = DedupKey::new(self.dedup, &instance.name, service_type, instance.interface_index);
        tracing::debug!("Service disappeared: {}", key);

        let Some(browser) = self.browsers.get(id) else {
            return;
        };
        // Work still in flight for this instance would re-add it later
        let stale_ops: Vec<Token> = browser
            .spawned
            .iter()
            .copied()
            .filter(|token| {
                self.ops
                    .get(*token)
                    .and_then(|op| op.stage.instance_key(self.dedup))
                    .is_some_and(|op_key| op_key == key)
            })
            .collect();
        let stale_lookups: Vec<LookupId> = browser
            .lookups
            .iter()
            .copied()
            .filter(|lookup| {
                self.lookups
                    .get(lookup)
                    .is_some_and(|(_, resolved)| resolved.key(self.dedup) == key)
            })
            .collect();
        if !stale_ops.is_empty() || !stale_lookups.is_empty() {
            tracing::debug!(
                "Cancelling {} pending operations for {}",
                stale_ops.len() + stale_lookups.len(),
                key
            );
        }
        for token in stale_ops {
            self.release(token);
        }
        for lookup in stale_lookups {
            if let Some(browser) = self.browsers.get_mut(id) {
                browser.lookups.remove(&lookup);
            }
            self.cancel_lookup(lookup);
        }

        let Some(browser) = self.browsers.get_mut(id) else {
            return;
        };
        if let Some(entry) = browser.entries.remove(&key) {
            tracing::debug!("Entry removed: {}", key);
            self.events.push(BrowserEvent::Removed(entry));
        }
    }

    fn cancel_lookup(&mut self, lookup: LookupId) {
        self.lookups.remove(&lookup);
        if let AddressStrategy::HostLookup(host_lookup) = &mut self.strategy {
            host_lookup.cancel(lookup);
        }
    }

    /// Tear the browser down: cancel everything it spawned, release the
    /// subscription, and report every entry it held as removed.
    pub fn stop_browser(&mut self, id: BrowserId) -> bool {
        let Some(mut browser) = self.browsers.remove(id) else {
            return false;
        };

        let cancelled = browser.in_flight();
        for token in browser.spawned.drain() {
            self.release(token);
        }
        for lookup in browser.lookups.drain() {
            self.cancel_lookup(lookup);
        }
        if let Some(token) = browser.subscription.take() {
            self.release(token);
        }

        for entry in browser.entries.drain() {
            self.events.push(BrowserEvent::Removed(entry));
        }

        tracing::info!(
            "Stopped browsing {} ({} operations cancelled)",
            browser.service_type,
            cancelled
        );
        true
    }
}
