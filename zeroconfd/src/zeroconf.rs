//! The discovery/publishing core.
//!
//! [`Zeroconf`] is a synchronous state machine. Every in-flight engine call
//! lives in a token-indexed [`Registry`]; the reactor reports readiness by
//! token and [`Zeroconf::on_ready`] dispatches it. Every terminal path goes
//! through [`Zeroconf::release`], which unwatches the descriptor, deallocates
//! the engine handle and frees the slot in one step.
//!
//! The core must be driven from a single task; see [`crate::manager`].

use shared::protocol::DEFAULT_MAX_COLLISION_RETRIES;
use shared::types::{trim_trailing_dot, DedupKey, DedupMode, ServiceEntry};
use std::collections::HashMap;
use crate::engine::{Engine, EngineHandle, ErrorCode, InstanceRef, Reply};
use crate::error::{Result, ZeroconfError};
use crate::interfaces::{InterfaceSource, SystemInterfaces};
use crate::mdns::browser::{BrowserEvent, ServiceBrowser};
use crate::mdns::publisher::ServicePublisher;
use crate::mdns::resolve::{AddressStrategy, LookupId, ResolvedInstance};
use crate::reactor::Reactor;
use crate::registry::{Registry, Token};

pub type BrowserId = Token;

pub struct Options {
    pub dedup: DedupMode,
    pub address_strategy: AddressStrategy,
    pub max_collision_retries: u32,
    pub interfaces: Box<dyn InterfaceSource + Send>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dedup: DedupMode::default(),
            address_strategy: AddressStrategy::MulticastQuery,
            max_collision_retries: DEFAULT_MAX_COLLISION_RETRIES,
            interfaces: Box::new(SystemInterfaces),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Stage {
    Browse,
    Resolve(InstanceRef),
    Address(ResolvedInstance),
    /// Keyed by logical name
    Register(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Browse,
    Resolve,
    Address,
    Register,
}

impl Stage {
    fn kind(&self) -> StageKind {
        match self {
            Stage::Browse => StageKind::Browse,
            Stage::Resolve(_) => StageKind::Resolve,
            Stage::Address(_) => StageKind::Address,
            Stage::Register(_) => StageKind::Register,
        }
    }

    /// Instance a resolve or address stage is working on.
    pub(crate) fn instance_key(&self, mode: DedupMode) -> Option<DedupKey> {
        match self {
            Stage::Resolve(instance) => Some(DedupKey::new(
                mode,
                &instance.name,
                trim_trailing_dot(&instance.reg_type),
                instance.interface_index,
            )),
            Stage::Address(resolved) => Some(resolved.key(mode)),
            Stage::Browse | Stage::Register(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Stage::Browse => "browse",
            Stage::Resolve(_) => "resolve",
            Stage::Address(_) => "address query",
            Stage::Register(_) => "register",
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub(crate) handle: EngineHandle,
    pub(crate) stage: Stage,
    /// Browser that spawned this operation, if any
    pub(crate) browser: Option<BrowserId>,
}

pub struct Zeroconf<E, R> {
    pub(crate) engine: E,
    pub(crate) reactor: R,
    pub(crate) ops: Registry<PendingOperation>,
    pub(crate) browsers: Registry<ServiceBrowser>,
    pub(crate) publisher: ServicePublisher,
    pub(crate) strategy: AddressStrategy,
    pub(crate) lookups: HashMap<LookupId, (BrowserId, ResolvedInstance)>,
    pub(crate) dedup: DedupMode,
    pub(crate) events: Vec<BrowserEvent>,
}

impl<E, R> Zeroconf<E, R>
where
    E: Engine,
    R: Reactor<E::Descriptor>,
{
    pub fn new(engine: E, reactor: R, options: Options) -> Self {
        Self {
            engine,
            reactor,
            ops: Registry::new(),
            browsers: Registry::new(),
            publisher: ServicePublisher::new(options.max_collision_retries, options.interfaces),
            strategy: options.address_strategy,
            lookups: HashMap::new(),
            dedup: options.dedup,
            events: Vec::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    /// Engine calls currently in flight.
    pub fn pending_operations(&self) -> usize {
        self.ops.len()
    }

    /// Entry notifications produced since the last call.
    pub fn take_events(&mut self) -> Vec<BrowserEvent> {
        std::mem::take(&mut self.events)
    }

    /// Snapshot of every browser's entries.
    pub fn service_entries(&self) -> Vec<ServiceEntry> {
        self.browsers
            .iter()
            .flat_map(|(_, browser)| browser.entries().snapshot())
            .collect()
    }

    /// The descriptor watched under `token` became readable.
    pub fn on_ready(&mut self, token: Token) {
        let handle = match self.ops.get(token) {
            Some(op) => op.handle,
            None => {
                tracing::trace!("Readiness for released operation {}", token);
                return;
            }
        };

        let replies = match self.engine.process_readiness(handle) {
            Ok(replies) => replies,
            Err(code) => {
                self.operation_failed(token, code);
                return;
            }
        };

        for reply in replies {
            // A one-shot reply may have torn the operation down
            if !self.ops.contains(token) {
                tracing::debug!("Dropping reply for finished operation {}", token);
                break;
            }
            self.dispatch(token, reply);
        }
    }

    fn dispatch(&mut self, token: Token, reply: Reply) {
        let Some(op) = self.ops.get(token) else {
            return;
        };
        let (kind, browser) = (op.stage.kind(), op.browser);

        match (kind, reply, browser) {
            (StageKind::Browse, Reply::Browse(result), Some(id)) => self.on_browse_reply(id, result),
            (StageKind::Resolve, Reply::Resolve(result), Some(_)) => {
                self.on_resolve_reply(token, result)
            }
            (StageKind::Address, Reply::Address(result), Some(_)) => {
                self.on_address_reply(token, result)
            }
            (StageKind::Register, Reply::Register(result), None) => {
                self.on_register_reply(token, result)
            }
            (kind, reply, _) => {
                tracing::warn!("Ignoring unexpected {:?} for {:?} operation {}", reply, kind, token);
            }
        }
    }

    /// The engine declared the handle dead.
    fn operation_failed(&mut self, token: Token, code: ErrorCode) {
        let Some(op) = self.release(token) else {
            return;
        };
        let err = ZeroconfError::Protocol { operation: op.stage.label(), code };

        match op.stage {
            Stage::Browse => {
                if let Some(browser) = op.browser.and_then(|id| self.browsers.get_mut(id)) {
                    tracing::warn!("Browse for {} stopped: {}", browser.service_type(), err);
                    browser.subscription = None;
                }
            }
            Stage::Resolve(instance) => {
                tracing::warn!("Dropping {}: {}", instance.name, err);
            }
            Stage::Address(resolved) => {
                tracing::warn!("Dropping {}: {}", resolved.name, err);
            }
            Stage::Register(name) => self.retract(&name, &err),
        }
    }

    /// Watch a freshly issued engine call. Without a descriptor the handle is
    /// deallocated here and nothing is tracked.
    pub(crate) fn track(
        &mut self,
        handle: EngineHandle,
        stage: Stage,
        browser: Option<BrowserId>,
    ) -> Result<Token> {
        let Some(descriptor) = self.engine.descriptor(handle) else {
            let label = stage.label();
            self.engine.deallocate(handle);
            return Err(ZeroconfError::Descriptor(label));
        };

        let token = self.ops.insert(PendingOperation { handle, stage, browser });
        self.reactor.watch(token, descriptor);
        Ok(token)
    }

    /// The only teardown path for a pending operation.
    pub(crate) fn release(&mut self, token: Token) -> Option<PendingOperation> {
        let op = self.ops.remove(token)?;
        self.reactor.unwatch(token);
        self.engine.deallocate(op.handle);
        if let Some(browser) = op.browser.and_then(|id| self.browsers.get_mut(id)) {
            browser.spawned.remove(&token);
        }
        Some(op)
    }

    /// Stop every browser and withdraw every registration.
    pub fn shutdown(&mut self) {
        for id in self.browsers.tokens() {
            self.stop_browser(id);
        }
        for name in self.publisher.names() {
            self.unregister_service(&name);
        }
        debug_assert!(self.ops.is_empty());
    }
}
