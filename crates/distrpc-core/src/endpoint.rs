//! Endpoint parsing, serialization and server ranking (component C1).
//!
//! An endpoint string has the form
//! `<protocol>/<address>[/@<routingid>@<blessing>,<blessing>,...@]`.
//! The routing-id segment is optional; endpoints without one compare
//! equal on `(protocol, address)` alone with a zeroed routing id.

use std::fmt;
use std::net::IpAddr;

use crate::error::{CoreError, Result};

/// Stable 128-bit identifier of a server-side listening process,
/// distinct from its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RoutingId(pub u128);

impl RoutingId {
    /// The zero routing id, used by endpoints that never advertised one.
    pub const NIL: RoutingId = RoutingId(0);

    fn parse(s: &str) -> Result<Self> {
        u128::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(RoutingId)
            .map_err(|e| CoreError::BadArg(format!("invalid routing id {s:?}: {e}")))
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// An immutable identifier of a reachable server instance: protocol,
/// address, routing id and the set of blessing names the server
/// advertises.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    protocol: String,
    address: String,
    routing_id: RoutingId,
    blessing_names: Vec<String>,
    serves_mount_table: bool,
}

impl Endpoint {
    /// Builds an endpoint directly from parts, without going through
    /// string parsing.
    pub fn new(
        protocol: impl Into<String>,
        address: impl Into<String>,
        routing_id: RoutingId,
        blessing_names: Vec<String>,
    ) -> Self {
        Endpoint {
            protocol: protocol.into(),
            address: address.into(),
            routing_id,
            blessing_names,
            serves_mount_table: false,
        }
    }

    /// Parses an endpoint from its wire string form.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        let protocol = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::BadArg(format!("empty protocol in endpoint {s:?}")))?;
        let address = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CoreError::BadArg(format!("missing address in endpoint {s:?}")))?;

        let (routing_id, blessing_names) = match parts.next() {
            None => (RoutingId::NIL, Vec::new()),
            Some(rest) => {
                let rest = rest
                    .strip_prefix('@')
                    .and_then(|r| r.strip_suffix('@'))
                    .ok_or_else(|| {
                        CoreError::BadArg(format!("malformed routing segment in {s:?}"))
                    })?;
                let mut segs = rest.split('@');
                let rid = segs
                    .next()
                    .filter(|r| !r.is_empty())
                    .map(RoutingId::parse)
                    .transpose()?
                    .unwrap_or(RoutingId::NIL);
                let blessings: Vec<String> = segs
                    .flat_map(|seg| seg.split(',').filter(|b| !b.is_empty()))
                    .map(String::from)
                    .collect();
                (rid, blessings)
            }
        };

        Ok(Endpoint {
            protocol: protocol.to_string(),
            address: address.to_string(),
            routing_id,
            blessing_names,
            serves_mount_table: false,
        })
    }

    /// Renders the endpoint back to its wire string form.
    pub fn render(&self) -> String {
        if self.routing_id == RoutingId::NIL && self.blessing_names.is_empty() {
            return format!("{}/{}", self.protocol, self.address);
        }
        format!(
            "{}/{}/@{}@{}@",
            self.protocol,
            self.address,
            self.routing_id,
            self.blessing_names.join(",")
        )
    }

    /// The endpoint's protocol name, e.g. `"tcp"`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The endpoint's address, `host:port` or an opaque transport address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The endpoint's routing id.
    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    /// The blessing names the server advertises.
    pub fn blessing_names(&self) -> &[String] {
        &self.blessing_names
    }

    /// Whether this endpoint serves as a mount table.
    pub fn serves_mount_table(&self) -> bool {
        self.serves_mount_table
    }

    /// Sets the serves-mount-table flag, returning the updated endpoint.
    pub fn with_serves_mount_table(mut self, v: bool) -> Self {
        self.serves_mount_table = v;
        self
    }

    /// Two endpoints are the "same destination" iff their
    /// `(protocol, address, routing_id)` triple matches. Blessing-name
    /// match is a separate predicate, see [`Endpoint::blessings_match`].
    pub fn same_destination(&self, other: &Endpoint) -> bool {
        self.protocol == other.protocol
            && self.address == other.address
            && self.routing_id == other.routing_id
    }

    /// True if `wanted` is a subset of this endpoint's blessing names.
    pub fn blessings_match(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|w| self.blessing_names.contains(w))
    }
}

/// A candidate server address as produced by name resolution, prior to
/// being parsed into a full [`Endpoint`].
#[derive(Debug, Clone)]
pub struct ServerCandidate {
    /// The raw address string, e.g. `"tcp/10.0.0.1:1234"`.
    pub address: String,
}

fn ip_rank(addr: &str, local_networks: &[IpAddr]) -> u8 {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) if local_networks.contains(&ip) => 0,
        Ok(IpAddr::V4(v4)) if is_public_unicast_v4(v4) => 1,
        Ok(IpAddr::V6(v6)) if is_public_unicast_v6(v6) => 2,
        Ok(_) => 3,
        Err(_) => 4,
    }
}

fn is_public_unicast_v4(ip: std::net::Ipv4Addr) -> bool {
    !(ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_broadcast() || ip.is_multicast())
}

fn is_public_unicast_v6(ip: std::net::Ipv6Addr) -> bool {
    !(ip.is_loopback() || ip.is_multicast() || ip.is_unicast_link_local())
}

/// Partitions `servers` by protocol, drops protocols that are neither in
/// `preferred_protocols` nor the universally-accepted set
/// `{tcp, ws, wsh}`, ranks addresses within each bucket by local-network
/// proximity, then concatenates buckets in `preferred_protocols` order
/// (an empty list accepts all protocols, in resolver order).
///
/// Fails with [`CoreError::BadProtocol`] if the result is empty.
pub fn filter_and_order_servers(
    servers: &[ServerCandidate],
    preferred_protocols: &[String],
    local_networks: &[IpAddr],
) -> Result<Vec<ServerCandidate>> {
    const UNIVERSAL: [&str; 3] = ["tcp", "ws", "wsh"];

    let proto_of = |addr: &str| -> &str { addr.split('/').next().unwrap_or("") };

    let accepted: Vec<&ServerCandidate> = servers
        .iter()
        .filter(|s| {
            let proto = proto_of(&s.address);
            preferred_protocols.iter().any(|p| p == proto) || UNIVERSAL.contains(&proto)
        })
        .collect();

    let mut buckets: Vec<(String, Vec<&ServerCandidate>)> = Vec::new();
    for s in &accepted {
        let proto = proto_of(&s.address).to_string();
        match buckets.iter_mut().find(|(p, _)| *p == proto) {
            Some((_, v)) => v.push(s),
            None => buckets.push((proto, vec![s])),
        }
    }
    for (_, bucket) in buckets.iter_mut() {
        bucket.sort_by_key(|s| ip_rank(&s.address, local_networks));
    }

    let mut ordered: Vec<ServerCandidate> = Vec::new();
    if preferred_protocols.is_empty() {
        for (_, bucket) in buckets {
            ordered.extend(bucket.into_iter().cloned());
        }
    } else {
        for proto in preferred_protocols {
            if let Some((_, bucket)) = buckets.iter().find(|(p, _)| p == proto) {
                ordered.extend(bucket.iter().map(|s| (*s).clone()));
            }
        }
    }

    if ordered.is_empty() {
        return Err(CoreError::BadProtocol(
            "no server addresses survived protocol filtering".into(),
        ));
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_routing_id() {
        let ep = Endpoint::parse("tcp/127.0.0.1:1111").unwrap();
        assert_eq!(ep.protocol(), "tcp");
        assert_eq!(ep.address(), "127.0.0.1:1111");
        assert_eq!(ep.routing_id(), RoutingId::NIL);
        assert_eq!(ep.render(), "tcp/127.0.0.1:1111");
    }

    #[test]
    fn roundtrip_with_routing_id_and_blessings() {
        let ep = Endpoint::parse("tcp/127.0.0.1:1111/@5555@A,B,C@").unwrap();
        assert_eq!(ep.routing_id(), RoutingId(0x5555));
        assert_eq!(ep.blessing_names(), &["A".to_string(), "B".to_string(), "C".to_string()]);
        let rendered = ep.render();
        let reparsed = Endpoint::parse(&rendered).unwrap();
        assert_eq!(ep, reparsed);
    }

    #[test]
    fn same_destination_ignores_blessings() {
        let a = Endpoint::parse("tcp/h:1/@1@A@").unwrap();
        let b = Endpoint::parse("tcp/h:1/@1@Z@").unwrap();
        assert!(a.same_destination(&b));
        let c = Endpoint::parse("tcp/h:2/@1@A@").unwrap();
        assert!(!a.same_destination(&c));
    }

    #[test]
    fn blessings_match_is_subset_test() {
        let ep = Endpoint::parse("tcp/h:1/@1@A,B,C@").unwrap();
        assert!(ep.blessings_match(&["A".to_string(), "B".to_string()]));
        assert!(!ep.blessings_match(&["Z".to_string()]));
    }

    #[test]
    fn filter_drops_unaccepted_protocol() {
        let servers = vec![
            ServerCandidate { address: "tcp/10.0.0.1:1".into() },
            ServerCandidate { address: "rdma/10.0.0.2:1".into() },
        ];
        let out = filter_and_order_servers(&servers, &[], &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, "tcp/10.0.0.1:1");
    }

    #[test]
    fn filter_empty_result_is_bad_protocol() {
        let servers = vec![ServerCandidate { address: "rdma/10.0.0.2:1".into() }];
        let err = filter_and_order_servers(&servers, &[], &[]).unwrap_err();
        assert!(matches!(err, CoreError::BadProtocol(_)));
    }

    #[test]
    fn filter_ranks_local_networks_first() {
        let local: IpAddr = "10.0.0.5".parse().unwrap();
        let servers = vec![
            ServerCandidate { address: "tcp/8.8.8.8:1".into() },
            ServerCandidate { address: "tcp/10.0.0.5:1".into() },
        ];
        let out = filter_and_order_servers(&servers, &[], &[local]).unwrap();
        assert_eq!(out[0].address, "tcp/10.0.0.5:1");
    }

    #[test]
    fn filter_concatenates_by_preferred_protocol_order() {
        let servers = vec![
            ServerCandidate { address: "ws/h:1".into() },
            ServerCandidate { address: "tcp/h:2".into() },
        ];
        let preferred = vec!["tcp".to_string(), "ws".to_string()];
        let out = filter_and_order_servers(&servers, &preferred, &[]).unwrap();
        assert_eq!(out[0].address, "tcp/h:2");
        assert_eq!(out[1].address, "ws/h:1");
    }
}
