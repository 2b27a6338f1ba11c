use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::ServiceEntry;

/// Fields that identify what a consumer can reach. Flags are reserved and
/// left out so enabling them later does not churn every digest.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    service_type: &'a str,
    domain: &'a str,
    hostname: &'a str,
    address: &'a IpAddr,
    port: u16,
    txt: &'a [String],
}

/// SHA-256 over the entry set, independent of input order.
pub fn compute_hash(entries: &[ServiceEntry]) -> String {
    let mut indices: Vec<usize> = (0..entries.len()).collect();
    indices.sort_by(|&a, &b| {
        let (a, b) = (&entries[a], &entries[b]);
        (&a.service_type, &a.name, &a.address).cmp(&(&b.service_type, &b.name, &b.address))
    });

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let e = &entries[i];
            HashView {
                name: &e.name,
                service_type: &e.service_type,
                domain: &e.domain,
                hostname: &e.hostname,
                address: &e.address,
                port: e.port,
                txt: &e.txt,
            }
        })
        .collect();

    let mut hasher = Sha256::new();
    for view in &views {
        // Serializing plain strings and numbers cannot fail
        if let Ok(json) = serde_json::to_vec(view) {
            hasher.update(&json);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
