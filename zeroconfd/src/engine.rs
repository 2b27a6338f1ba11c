//! The seam to the mDNS/DNS-SD engine.
//!
//! An engine call returns a handle at once; the outcome arrives later. When
//! the engine's descriptor for that handle becomes readable, the caller pumps
//! [`Engine::process_readiness`], which yields whatever replies are pending.
//! A handle must be passed to [`Engine::deallocate`] exactly once.

use std::fmt;
use std::net::IpAddr;
use shared::types::NetworkPort;

/// Opaque engine-side identity of an in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle(pub u64);

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Engine status codes other than success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("name conflict")]
    NameConflict,
    #[error("no such record")]
    NoSuchRecord,
    #[error("timed out")]
    Timeout,
    #[error("engine error code {0}")]
    Unknown(i32),
    #[error("{0}")]
    Other(String),
}

/// An instance as named by a browse event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub name: String,
    /// Raw type as delivered, trailing dot included: "_http._tcp."
    pub reg_type: String,
    pub domain: String,
    pub interface_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseReply {
    pub added: bool,
    pub instance: InstanceRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveReply {
    pub host_target: String,
    pub port: NetworkPort,
    pub txt: Vec<u8>,
    pub interface_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressReply {
    pub hostname: String,
    pub address: IpAddr,
    pub interface_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReply {
    /// Name the engine finally announced
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Browse(Result<BrowseReply, ErrorCode>),
    Resolve(Result<ResolveReply, ErrorCode>),
    Address(Result<AddressReply, ErrorCode>),
    Register(Result<RegisterReply, ErrorCode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub name: String,
    pub service_type: String,
    /// `None` registers in the engine's default domain
    pub domain: Option<String>,
    pub interface_index: u32,
    pub port: NetworkPort,
    pub txt: Vec<u8>,
}

pub trait Engine {
    /// What the host loop waits on for readiness.
    type Descriptor;

    /// Persistent subscription to instances of `service_type`.
    fn browse(&mut self, service_type: &str) -> Result<EngineHandle, ErrorCode>;

    /// One-shot SRV/TXT lookup for an instance.
    fn resolve(&mut self, instance: &InstanceRef) -> Result<EngineHandle, ErrorCode>;

    /// One-shot address lookup for `host` on `interface_index`.
    fn address_query(
        &mut self,
        host: &str,
        interface_index: u32,
        force_multicast: bool,
    ) -> Result<EngineHandle, ErrorCode>;

    fn register(&mut self, request: &RegisterRequest) -> Result<EngineHandle, ErrorCode>;

    /// `None` if the handle has no usable readiness descriptor.
    fn descriptor(&self, handle: EngineHandle) -> Option<Self::Descriptor>;

    /// Pump pending replies. An `Err` means the handle is dead and must be
    /// deallocated; nothing more will arrive for it.
    fn process_readiness(&mut self, handle: EngineHandle) -> Result<Vec<Reply>, ErrorCode>;

    fn deallocate(&mut self, handle: EngineHandle);
}
