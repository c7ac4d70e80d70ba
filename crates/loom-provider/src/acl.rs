//! Security-group rule diffing.
//!
//! Clouds express firewall state as flat per-protocol rules while the rest
//! of the system thinks in CIDR + port range. `expand` lowers an ACL set to
//! wire rules (tcp and udp for the port range, plus one icmp allowance per
//! distinct CIDR so pings work); `sync` diffs that against the observed rule
//! set into the authorize/revoke calls a binding must issue.

use std::collections::HashSet;

use loom_join::hash_join;

use crate::Acl;

/// A single cloud-side firewall rule. `protocol` is the wire spelling
/// ("tcp", "udp", "icmp", or "-1" for all); icmp and all-protocol rules use
/// port -1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireRule {
    pub cidr_ip: String,
    pub protocol: String,
    pub min_port: i32,
    pub max_port: i32,
}

impl WireRule {
    fn tcp(cidr_ip: &str, min: u16, max: u16) -> WireRule {
        WireRule {
            cidr_ip: cidr_ip.to_string(),
            protocol: "tcp".to_string(),
            min_port: i32::from(min),
            max_port: i32::from(max),
        }
    }

    fn udp(cidr_ip: &str, min: u16, max: u16) -> WireRule {
        WireRule { protocol: "udp".to_string(), ..WireRule::tcp(cidr_ip, min, max) }
    }

    fn icmp(cidr_ip: &str) -> WireRule {
        WireRule {
            cidr_ip: cidr_ip.to_string(),
            protocol: "icmp".to_string(),
            min_port: -1,
            max_port: -1,
        }
    }
}

/// Lower an ACL set to the wire rules that realize it.
pub fn expand(acls: &[Acl]) -> Vec<WireRule> {
    let mut rules = Vec::new();
    let mut cidrs_seen = HashSet::new();
    for acl in acls {
        rules.push(WireRule::tcp(&acl.cidr_ip, acl.min_port, acl.max_port));
        rules.push(WireRule::udp(&acl.cidr_ip, acl.min_port, acl.max_port));
        if cidrs_seen.insert(acl.cidr_ip.clone()) {
            rules.push(WireRule::icmp(&acl.cidr_ip));
        }
    }
    rules
}

/// Diff desired ACLs against observed wire rules.
///
/// Returns `(authorize, revoke)`: the rules to add and the rules to delete.
/// Rules present on both sides are left untouched, making repeated syncs
/// no-ops once the cloud has converged.
pub fn sync(current: Vec<WireRule>, desired: &[Acl]) -> (Vec<WireRule>, Vec<WireRule>) {
    let target = expand(desired);
    let (_, authorize, revoke) =
        hash_join(target, current, |r| r.clone(), |r| r.clone());
    (authorize, revoke)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(cidr: &str, min: u16, max: u16) -> Acl {
        Acl { cidr_ip: cidr.to_string(), min_port: min, max_port: max }
    }

    #[test]
    fn expand_emits_tcp_udp_and_one_icmp_per_cidr() {
        let rules = expand(&[acl("10.0.0.0/8", 1, 65535), acl("10.0.0.0/8", 80, 80)]);
        let icmp: Vec<_> = rules.iter().filter(|r| r.protocol == "icmp").collect();
        assert_eq!(rules.len(), 5);
        assert_eq!(icmp.len(), 1);
    }

    #[test]
    fn sync_from_scratch_authorizes_everything() {
        let (authorize, revoke) = sync(Vec::new(), &[acl("foo", 80, 80)]);
        assert_eq!(authorize.len(), 3);
        assert!(revoke.is_empty());
    }

    #[test]
    fn sync_converged_state_is_a_noop() {
        let desired = [acl("foo", 1, 65535)];
        let current = expand(&desired);
        let (authorize, revoke) = sync(current, &desired);
        assert!(authorize.is_empty());
        assert!(revoke.is_empty());
    }

    #[test]
    fn sync_revokes_stale_and_authorizes_missing() {
        // Observed: foo's tcp+udp full range, plus a leftover rule that
        // should no longer exist.
        let current = vec![
            WireRule::tcp("foo", 1, 65535),
            WireRule::udp("foo", 1, 65535),
            WireRule {
                cidr_ip: "deleteMe".to_string(),
                protocol: "-1".to_string(),
                min_port: -1,
                max_port: -1,
            },
        ];
        let desired = [acl("foo", 1, 65535), acl("bar", 80, 80)];

        let (authorize, revoke) = sync(current, &desired);

        assert_eq!(revoke.len(), 1);
        assert_eq!(revoke[0].cidr_ip, "deleteMe");

        let expected: HashSet<WireRule> = [
            WireRule::tcp("bar", 80, 80),
            WireRule::udp("bar", 80, 80),
            WireRule::icmp("bar"),
            WireRule::icmp("foo"),
        ]
        .into_iter()
        .collect();
        let got: HashSet<WireRule> = authorize.into_iter().collect();
        assert_eq!(got, expected);
    }
}
