//! Engine and reactor doubles for exercising the core without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use shared::types::{trim_trailing_dot, NetworkPort};
use crate::engine::{
    AddressReply, BrowseReply, Engine, EngineHandle, ErrorCode, InstanceRef, RegisterRequest, Reply,
    ResolveReply,
};
use crate::interfaces::lan_interfaces;
use crate::mdns::publisher::RegistrationRequest;
use crate::reactor::Reactor;
use crate::registry::Token;
use crate::zeroconf::{Options, Zeroconf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Browse(String),
    /// name, type, domain, interface
    Resolve(String, String, String, u32),
    /// host, interface, force multicast
    Address(String, u32, bool),
    Register(RegisterRequest),
}

/// Scripted engine. Replies are queued per handle with [`FakeEngine::push`]
/// and handed out on the next `process_readiness`.
#[derive(Default)]
pub(crate) struct FakeEngine {
    pub calls: Vec<Call>,
    issued: Vec<(Call, EngineHandle)>,
    pub live: HashSet<EngineHandle>,
    pub processed: Vec<EngineHandle>,
    pub deallocated: Vec<EngineHandle>,
    queued: HashMap<EngineHandle, VecDeque<Reply>>,
    /// Fails the next call of any kind
    pub fail_next: Option<ErrorCode>,
    /// Consumed one per register call
    pub register_failures: VecDeque<ErrorCode>,
    /// Handles whose readiness reports a dead connection
    pub invalid: HashSet<EngineHandle>,
    pub withhold_descriptors: bool,
    next_handle: u64,
}

impl FakeEngine {
    fn issue(&mut self, call: Call) -> Result<EngineHandle, ErrorCode> {
        self.calls.push(call.clone());
        if let Some(code) = self.fail_next.take() {
            return Err(code);
        }
        if matches!(call, Call::Register(_)) {
            if let Some(code) = self.register_failures.pop_front() {
                return Err(code);
            }
        }

        self.next_handle += 1;
        let handle = EngineHandle(self.next_handle);
        self.live.insert(handle);
        self.issued.push((call, handle));
        Ok(handle)
    }

    pub fn push(&mut self, handle: EngineHandle, reply: Reply) {
        self.queued.entry(handle).or_default().push_back(reply);
    }

    pub fn last_handle(&self) -> EngineHandle {
        self.issued.last().map(|(_, handle)| *handle).unwrap()
    }

    pub fn handles_for(&self, pred: impl Fn(&Call) -> bool) -> Vec<EngineHandle> {
        self.issued
            .iter()
            .filter(|(call, _)| pred(call))
            .map(|(_, handle)| *handle)
            .collect()
    }
}

impl Engine for FakeEngine {
    type Descriptor = u64;

    fn browse(&mut self, service_type: &str) -> Result<EngineHandle, ErrorCode> {
        self.issue(Call::Browse(service_type.to_string()))
    }

    fn resolve(&mut self, instance: &InstanceRef) -> Result<EngineHandle, ErrorCode> {
        self.issue(Call::Resolve(
            instance.name.clone(),
            instance.reg_type.clone(),
            instance.domain.clone(),
            instance.interface_index,
        ))
    }

    fn address_query(
        &mut self,
        host: &str,
        interface_index: u32,
        force_multicast: bool,
    ) -> Result<EngineHandle, ErrorCode> {
        self.issue(Call::Address(host.to_string(), interface_index, force_multicast))
    }

    fn register(&mut self, request: &RegisterRequest) -> Result<EngineHandle, ErrorCode> {
        self.issue(Call::Register(request.clone()))
    }

    fn descriptor(&self, handle: EngineHandle) -> Option<u64> {
        if self.withhold_descriptors || !self.live.contains(&handle) {
            return None;
        }
        Some(handle.0)
    }

    fn process_readiness(&mut self, handle: EngineHandle) -> Result<Vec<Reply>, ErrorCode> {
        self.processed.push(handle);
        if self.invalid.contains(&handle) {
            return Err(ErrorCode::Unknown(-65563));
        }
        Ok(self.queued.remove(&handle).map(Vec::from).unwrap_or_default())
    }

    fn deallocate(&mut self, handle: EngineHandle) {
        assert!(self.live.remove(&handle), "{} deallocated twice", handle);
        self.deallocated.push(handle);
    }
}

#[derive(Default)]
pub(crate) struct RecordingReactor {
    pub watched: HashMap<Token, u64>,
    pub unwatched: Vec<Token>,
}

impl Reactor<u64> for RecordingReactor {
    fn watch(&mut self, token: Token, descriptor: u64) {
        assert!(self.watched.insert(token, descriptor).is_none(), "{} watched twice", token);
    }

    fn unwatch(&mut self, token: Token) {
        assert!(self.watched.remove(&token).is_some(), "{} not watched", token);
        self.unwatched.push(token);
    }
}

pub(crate) type TestCore = Zeroconf<FakeEngine, RecordingReactor>;

pub(crate) fn options() -> Options {
    Options {
        interfaces: Box::new(lan_interfaces()),
        ..Options::default()
    }
}

pub(crate) fn harness() -> TestCore {
    harness_with(options())
}

pub(crate) fn harness_with(options: Options) -> TestCore {
    Zeroconf::new(FakeEngine::default(), RecordingReactor::default(), options)
}

pub(crate) fn request(name: &str) -> RegistrationRequest {
    RegistrationRequest {
        name: name.to_string(),
        bind_address: "0.0.0.0".parse().unwrap(),
        port: 631,
        service_type: "_ipp._tcp".to_string(),
        txt: vec![("rp".to_string(), "printers/1".to_string())],
    }
}

fn browse_event(added: bool, name: &str, reg_type: &str, interface_index: u32) -> Reply {
    Reply::Browse(Ok(BrowseReply {
        added,
        instance: InstanceRef {
            name: name.to_string(),
            reg_type: reg_type.to_string(),
            domain: "local.".to_string(),
            interface_index,
        },
    }))
}

pub(crate) fn added(name: &str, interface_index: u32) -> Reply {
    browse_event(true, name, "_http._tcp.", interface_index)
}

pub(crate) fn removed(name: &str, interface_index: u32) -> Reply {
    browse_event(false, name, "_http._tcp.", interface_index)
}

pub(crate) fn resolve_ok(host: &str, port: u16, txt: &[u8], interface_index: u32) -> Reply {
    Reply::Resolve(Ok(ResolveReply {
        host_target: host.to_string(),
        port: NetworkPort::from_host(port),
        txt: txt.to_vec(),
        interface_index,
    }))
}

pub(crate) fn address_ok(host: &str, address: &str, interface_index: u32) -> Reply {
    Reply::Address(Ok(AddressReply {
        hostname: host.to_string(),
        address: address.parse().unwrap(),
        interface_index,
    }))
}

impl TestCore {
    /// Report readiness for the operation holding `handle`, if any.
    pub(crate) fn fire(&mut self, handle: EngineHandle) {
        let token = self
            .ops
            .iter()
            .find(|(_, op)| op.handle == handle)
            .map(|(token, _)| token);
        if let Some(token) = token {
            self.on_ready(token);
        }
    }

    /// Drive one instance from browse event to address reply on the browser
    /// for `reg_type`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn discover(
        &mut self,
        name: &str,
        reg_type: &str,
        interface_index: u32,
        host: &str,
        port: u16,
        txt: &[u8],
        address: &str,
    ) {
        let service_type = trim_trailing_dot(reg_type);
        let subscription = self
            .browsers
            .iter()
            .find(|(_, browser)| browser.service_type() == service_type)
            .and_then(|(_, browser)| browser.subscription)
            .unwrap();
        let sub = self.ops.get(subscription).unwrap().handle;

        self.engine.push(sub, browse_event(true, name, reg_type, interface_index));
        self.fire(sub);
        let resolve = self.engine.last_handle();
        self.engine.push(resolve, resolve_ok(host, port, txt, interface_index));
        self.fire(resolve);
        let query = self.engine.last_handle();
        self.engine.push(query, address_ok(host, address, interface_index));
        self.fire(query);
    }
}
