use std::collections::HashMap;
use std::net::IpAddr;
use serde::{Deserialize, Serialize};
use shared::protocol::COLLISION_SEPARATOR;
use shared::txt;
use shared::types::NetworkPort;
use crate::engine::{Engine, ErrorCode, RegisterReply, RegisterRequest};
use crate::error::{Result, ZeroconfError};
use crate::interfaces::{interface_for, InterfaceSource};
use crate::reactor::Reactor;
use crate::registry::Token;
use crate::zeroconf::{Stage, Zeroconf};

/// A service to announce on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub name: String,
    /// Address the service listens on; picks the interface to announce on
    pub bind_address: IpAddr,
    pub port: u16,
    pub service_type: String,
    /// Written to the TXT record in this order
    #[serde(default, with = "txt_pairs")]
    pub txt: Vec<(String, String)>,
}

/// TXT pairs as a map in config and API bodies, kept in document order.
mod txt_pairs {
    use std::fmt;
    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pairs: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(pairs.iter().map(|(key, value)| (key, value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, String)>, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of TXT keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(pair) = map.next_entry::<String, String>()? {
                    pairs.push(pair);
                }
                Ok(pairs)
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

#[derive(Debug)]
pub struct ServiceRegistration {
    effective_name: String,
    collisions: u32,
    token: Token,
    /// Engine request without the collision suffix, kept for re-registration
    request: RegisterRequest,
}

impl ServiceRegistration {
    pub fn effective_name(&self) -> &str {
        &self.effective_name
    }

    pub fn collisions(&self) -> u32 {
        self.collisions
    }
}

pub struct ServicePublisher {
    registrations: HashMap<String, ServiceRegistration>,
    max_collision_retries: u32,
    interfaces: Box<dyn InterfaceSource + Send>,
}

impl ServicePublisher {
    pub fn new(max_collision_retries: u32, interfaces: Box<dyn InterfaceSource + Send>) -> Self {
        Self {
            registrations: HashMap::new(),
            max_collision_retries,
            interfaces,
        }
    }

    /// Logical names currently published.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRegistration> {
        self.registrations.get(name)
    }
}

/// `name` for the first attempt, `name #N` after N collisions.
pub fn effective_name(name: &str, collisions: u32) -> String {
    if collisions == 0 {
        name.to_string()
    } else {
        format!("{}{}{}", name, COLLISION_SEPARATOR, collisions)
    }
}

struct Registered {
    token: Token,
    effective_name: String,
    collisions: u32,
}

impl<E, R> Zeroconf<E, R>
where
    E: Engine,
    R: Reactor<E::Descriptor>,
{
    /// Announce a service. Returns the name it was finally registered under.
    pub fn register_service(&mut self, request: &RegistrationRequest) -> Result<String> {
        if request.name.is_empty() || request.service_type.is_empty() {
            return Err(ZeroconfError::Configuration(
                "a service needs a name and a service type".to_string(),
            ));
        }
        if self.publisher.registrations.contains_key(&request.name) {
            return Err(ZeroconfError::Configuration(format!(
                "a service named '{}' is already published",
                request.name
            )));
        }

        let interface_index = interface_for(self.publisher.interfaces.as_ref(), &request.bind_address);
        let engine_request = RegisterRequest {
            name: request.name.clone(),
            service_type: request.service_type.clone(),
            domain: None,
            interface_index,
            port: NetworkPort::from_host(request.port),
            txt: txt::encode(request.txt.iter().map(|(key, value)| (key, value)))?,
        };

        let registered = self.register_with_retries(&request.name, &engine_request, 0)?;
        tracing::info!(
            "Registered {} as '{}' on port {} (interface {})",
            request.service_type,
            registered.effective_name,
            request.port,
            interface_index
        );

        let effective_name = registered.effective_name.clone();
        self.publisher.registrations.insert(
            request.name.clone(),
            ServiceRegistration {
                effective_name: registered.effective_name,
                collisions: registered.collisions,
                token: registered.token,
                request: engine_request,
            },
        );
        Ok(effective_name)
    }

    fn register_with_retries(
        &mut self,
        name: &str,
        request: &RegisterRequest,
        mut collisions: u32,
    ) -> Result<Registered> {
        loop {
            if collisions > self.publisher.max_collision_retries {
                return Err(ZeroconfError::RegistrationFailed {
                    name: name.to_string(),
                    attempts: collisions,
                });
            }

            let effective_name = effective_name(name, collisions);
            let attempt = RegisterRequest {
                name: effective_name.clone(),
                ..request.clone()
            };

            match self.engine.register(&attempt) {
                Ok(handle) => {
                    let token = self.track(handle, Stage::Register(name.to_string()), None)?;
                    return Ok(Registered {
                        token,
                        effective_name,
                        collisions,
                    });
                }
                Err(ErrorCode::NameConflict) => {
                    tracing::debug!("Name '{}' is taken, retrying", effective_name);
                    collisions += 1;
                }
                Err(code) => return Err(ZeroconfError::Engine { operation: "register", code }),
            }
        }
    }

    /// Withdraw a registration. Returns false if `name` is not published.
    pub fn unregister_service(&mut self, name: &str) -> bool {
        let Some(registration) = self.publisher.registrations.remove(name) else {
            tracing::info!("Not unregistering '{}': not published", name);
            return false;
        };

        self.release(registration.token);
        tracing::info!("Unregistered '{}'", registration.effective_name);
        true
    }

    /// `(logical, effective)` name pairs, ordered by logical name.
    pub fn published(&self) -> Vec<(String, String)> {
        self.publisher
            .names()
            .into_iter()
            .filter_map(|name| {
                let effective = self.publisher.registrations.get(&name)?.effective_name.clone();
                Some((name, effective))
            })
            .collect()
    }

    pub(crate) fn on_register_reply(&mut self, token: Token, result: std::result::Result<RegisterReply, ErrorCode>) {
        let name = match self.ops.get(token).map(|op| &op.stage) {
            Some(Stage::Register(name)) => name.clone(),
            _ => return,
        };

        match result {
            Ok(reply) => {
                if let Some(registration) = self.publisher.registrations.get_mut(&name) {
                    if registration.effective_name != reply.name {
                        tracing::info!("'{}' announced as '{}'", registration.effective_name, reply.name);
                        registration.effective_name = reply.name;
                    }
                }
            }
            Err(ErrorCode::NameConflict) => self.reregister(&name),
            Err(code) => {
                let err = ZeroconfError::Protocol { operation: "register", code };
                self.retract(&name, &err);
            }
        }
    }

    /// Another host claimed the name after it was announced.
    fn reregister(&mut self, name: &str) {
        let Some(registration) = self.publisher.registrations.remove(name) else {
            return;
        };
        self.release(registration.token);
        tracing::info!("Name '{}' lost to another host, re-registering", registration.effective_name);

        match self.register_with_retries(name, &registration.request, registration.collisions + 1) {
            Ok(registered) => {
                tracing::info!("Re-registered '{}' as '{}'", name, registered.effective_name);
                self.publisher.registrations.insert(
                    name.to_string(),
                    ServiceRegistration {
                        effective_name: registered.effective_name,
                        collisions: registered.collisions,
                        token: registered.token,
                        request: registration.request,
                    },
                );
            }
            Err(e) => tracing::warn!("Withdrawing '{}': {}", name, e),
        }
    }

    /// Drop a registration the engine gave up on.
    pub(crate) fn retract(&mut self, name: &str, err: &ZeroconfError) {
        if let Some(registration) = self.publisher.registrations.remove(name) {
            self.release(registration.token);
            tracing::warn!("Registration of '{}' withdrawn: {}", registration.effective_name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reply;
    use crate::testing::{harness, harness_with, options, request, Call};
    use crate::zeroconf::Options;

    fn register_names(core: &Zeroconf<crate::testing::FakeEngine, crate::testing::RecordingReactor>) -> Vec<String> {
        core.engine()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Register(request) => Some(request.name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_effective_name() {
        assert_eq!(effective_name("printer", 0), "printer");
        assert_eq!(effective_name("printer", 1), "printer #1");
        assert_eq!(effective_name("printer", 12), "printer #12");
    }

    #[test]
    fn test_register_issues_engine_request() {
        let mut core = harness();
        let name = core.register_service(&request("printer")).unwrap();
        assert_eq!(name, "printer");

        let expected = RegisterRequest {
            name: "printer".to_string(),
            service_type: "_ipp._tcp".to_string(),
            domain: None,
            interface_index: 0,
            port: NetworkPort::from_host(631),
            txt: b"\x0drp=printers/1".to_vec(),
        };
        assert_eq!(core.engine().calls, vec![Call::Register(expected)]);
        assert_eq!(core.published(), vec![("printer".to_string(), "printer".to_string())]);
        assert_eq!(core.pending_operations(), 1);
    }

    #[test]
    fn test_duplicate_logical_name_rejected() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();

        let err = core.register_service(&request("X")).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(register_names(&core), vec!["X"], "Engine untouched by the duplicate");
    }

    #[test]
    fn test_collision_appends_counter() {
        let mut core = harness();
        core.engine_mut().register_failures.push_back(ErrorCode::NameConflict);

        let name = core.register_service(&request("X")).unwrap();
        assert_eq!(name, "X #1");
        assert_eq!(register_names(&core), vec!["X", "X #1"]);
        assert_eq!(core.publisher.get("X").unwrap().collisions(), 1);
        assert_eq!(core.published(), vec![("X".to_string(), "X #1".to_string())]);
        assert!(core.unregister_service("X"), "Tracked under the logical name");
    }

    #[test]
    fn test_collision_retries_are_bounded() {
        let mut core = harness_with(Options {
            max_collision_retries: 2,
            ..options()
        });
        for _ in 0..3 {
            core.engine_mut().register_failures.push_back(ErrorCode::NameConflict);
        }

        let err = core.register_service(&request("X")).unwrap_err();
        assert!(matches!(err, ZeroconfError::RegistrationFailed { attempts: 3, .. }));
        assert_eq!(register_names(&core), vec!["X", "X #1", "X #2"]);
        assert!(core.published().is_empty());
        assert_eq!(core.pending_operations(), 0);
    }

    #[test]
    fn test_other_engine_error_is_not_retried() {
        let mut core = harness();
        core.engine_mut().register_failures.push_back(ErrorCode::Unknown(-65540));

        let err = core.register_service(&request("X")).unwrap_err();
        assert!(matches!(err, ZeroconfError::Engine { operation: "register", .. }));
        assert_eq!(register_names(&core).len(), 1);
        assert!(core.published().is_empty());
    }

    #[test]
    fn test_oversized_txt_fails_before_engine() {
        let mut core = harness();
        let mut req = request("X");
        req.txt.push(("blob".to_string(), "x".repeat(300)));

        let err = core.register_service(&req).unwrap_err();
        assert!(matches!(err, ZeroconfError::TxtEncode(_)));
        assert!(core.engine().calls.is_empty());
    }

    #[test]
    fn test_empty_type_rejected() {
        let mut core = harness();
        let mut req = request("X");
        req.service_type.clear();

        assert!(core.register_service(&req).unwrap_err().is_configuration());
        assert!(core.engine().calls.is_empty());
    }

    #[test]
    fn test_bind_address_selects_interface() {
        let mut core = harness();
        let mut req = request("lan");
        req.bind_address = "192.168.1.77".parse().unwrap();
        core.register_service(&req).unwrap();

        let mut other = request("elsewhere");
        other.bind_address = "172.16.0.1".parse().unwrap();
        core.register_service(&other).unwrap();

        let interfaces: Vec<u32> = core
            .engine()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Register(request) => Some(request.interface_index),
                _ => None,
            })
            .collect();
        assert_eq!(interfaces, vec![2, 0]);
    }

    #[test]
    fn test_missing_descriptor_tracks_nothing() {
        let mut core = harness();
        core.engine_mut().withhold_descriptors = true;

        let err = core.register_service(&request("X")).unwrap_err();
        assert!(matches!(err, ZeroconfError::Descriptor("register")));
        assert_eq!(core.engine().deallocated.len(), 1);
        assert!(core.published().is_empty());
    }

    #[test]
    fn test_unregister_releases_once() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();
        let handle = core.engine().last_handle();

        assert!(core.unregister_service("X"));
        assert_eq!(core.engine().deallocated, vec![handle]);
        assert!(core.reactor().watched.is_empty());

        assert!(!core.unregister_service("X"));
        assert_eq!(core.engine().deallocated.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut core = harness();
        assert!(!core.unregister_service("never"));
        assert!(core.engine().deallocated.is_empty());
    }

    #[test]
    fn test_async_error_retracts_silently() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();
        let handle = core.engine().last_handle();

        core.engine_mut().push(handle, Reply::Register(Err(ErrorCode::Unknown(-65537))));
        core.fire(handle);

        assert!(core.published().is_empty());
        assert!(core.engine().deallocated.contains(&handle));
        assert!(!core.unregister_service("X"), "Already gone");
        assert_eq!(register_names(&core).len(), 1, "No retry");
    }

    #[test]
    fn test_invalid_readiness_retracts() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();
        let handle = core.engine().last_handle();
        core.engine_mut().invalid.insert(handle);

        core.fire(handle);
        assert!(core.published().is_empty());
        assert_eq!(core.pending_operations(), 0);
    }

    #[test]
    fn test_async_conflict_reregisters() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();
        let first = core.engine().last_handle();

        core.engine_mut().push(first, Reply::Register(Err(ErrorCode::NameConflict)));
        core.fire(first);

        assert_eq!(register_names(&core), vec!["X", "X #1"]);
        assert_eq!(core.published(), vec![("X".to_string(), "X #1".to_string())]);
        assert!(core.engine().deallocated.contains(&first));
        assert_eq!(core.pending_operations(), 1);
    }

    #[test]
    fn test_async_conflict_past_bound_withdraws() {
        let mut core = harness_with(Options {
            max_collision_retries: 0,
            ..options()
        });
        core.register_service(&request("X")).unwrap();
        let first = core.engine().last_handle();

        core.engine_mut().push(first, Reply::Register(Err(ErrorCode::NameConflict)));
        core.fire(first);

        assert!(core.published().is_empty());
        assert_eq!(core.pending_operations(), 0);
    }

    #[test]
    fn test_success_reply_updates_effective_name() {
        let mut core = harness();
        core.register_service(&request("X")).unwrap();
        let handle = core.engine().last_handle();

        core.engine_mut().push(handle, Reply::Register(Ok(RegisterReply { name: "X (2)".to_string() })));
        core.fire(handle);

        assert_eq!(core.published(), vec![("X".to_string(), "X (2)".to_string())]);
        assert_eq!(core.pending_operations(), 1, "Registration stays live");
    }

    #[test]
    fn test_request_from_toml() {
        let req: RegistrationRequest = toml::from_str(
            r#"
            name = "web"
            bind_address = "0.0.0.0"
            port = 8080
            service_type = "_http._tcp"
            txt = { path = "/api" }
            "#,
        )
        .unwrap();
        assert_eq!(req.txt, vec![("path".to_string(), "/api".to_string())]);
    }

    #[test]
    fn test_txt_order_reaches_engine() {
        let req: RegistrationRequest = serde_json::from_str(
            r#"{
                "name": "web",
                "bind_address": "0.0.0.0",
                "port": 8080,
                "service_type": "_http._tcp",
                "txt": { "z": "1", "a": "2", "m": "" }
            }"#,
        )
        .unwrap();
        let keys: Vec<_> = req.txt.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);

        let mut core = harness();
        core.register_service(&req).unwrap();
        match core.engine().calls.last().unwrap() {
            Call::Register(sent) => assert_eq!(sent.txt, b"\x03z=1\x03a=2\x01m".to_vec()),
            other => panic!("unexpected {:?}", other),
        }

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""txt":{"z":"1","a":"2","m":""}"#));
    }
}
