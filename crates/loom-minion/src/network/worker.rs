//! The worker dataplane reconcilers.
//!
//! Ten passes over one container set, all with the same shape: build the
//! target collection, observe the live one, join on the natural key, apply
//! adds, removals, and modifications. Observation happens fresh on every
//! pass, so a failure in any step heals on the next tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;
use std::path::PathBuf;

use tracing::{error, warn};

use loom_consensus::ipdef;
use loom_db::{Conn, Connection, Container, Label, Role, Table};
use loom_join::hash_join;

use crate::docker::Docker;
use crate::network::shell::{ip_exec, Shell};
use crate::network::OVN_BRIDGE;
use crate::supervisor::{INTEGRATION_BRIDGE, OVS_VSWITCHD};

const INNER_VETH: &str = "eth0";

/// Host filesystem locations, overridable for tests.
pub struct Paths {
    /// Where namespace symlinks live.
    pub netns_dir: PathBuf,
    /// The host's proc mount as seen from this process.
    pub proc_dir: PathBuf,
    /// The host resolver configuration mirrored into containers.
    pub resolv_conf: PathBuf,
}

impl Default for Paths {
    fn default() -> Paths {
        Paths {
            netns_dir: PathBuf::from("/var/run/netns"),
            proc_dir: PathBuf::from("/hostproc"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

// ── Naming ─────────────────────────────────────────────────────────

fn prefix(id: &str, len: usize) -> &str {
    &id[..len.min(id.len())]
}

/// Namespace symlink name for a container.
pub fn network_ns(id: &str) -> String {
    format!("{}_ns", prefix(id, 13))
}

/// Outer (host-side) veth name.
pub fn veth_outer(id: &str) -> String {
    format!("{}_c", prefix(id, 13))
}

/// Temporary inner veth name, before it becomes `eth0` in the namespace.
pub fn veth_inner(id: &str) -> String {
    format!("{}_i", prefix(id, 13))
}

/// Patch-port pair names: (OVN-bridge side, integration-bridge side).
pub fn patch_ports(id: &str) -> (String, String) {
    (format!("{}_br", prefix(id, 12)), format!("{}_in", prefix(id, 12)))
}

fn short_id(id: &str) -> &str {
    prefix(id, 12)
}

// ── Orchestration ──────────────────────────────────────────────────

/// One worker reconciliation pass.
pub async fn run_once(conn: &Conn, docker: &dyn Docker, shell: &dyn Shell, paths: &Paths) {
    if !conn.minion_self().is_some_and(|m| m.role == Role::Worker) {
        return;
    }

    let (containers, labels, connections) = conn
        .txn(&[Table::Container, Table::Label, Table::Connection])
        .run(|view| {
            Ok::<_, Infallible>((
                view.select(|c: &Container| {
                    !c.docker_id.is_empty() && !c.ip.is_empty() && !c.mac.is_empty()
                }),
                view.select(|l: &Label| !l.ip.is_empty()),
                view.all::<Connection>(),
            ))
        })
        .unwrap_or_else(|e| match e {});

    update_namespaces(paths, &containers);
    update_veths(shell, &containers).await;
    update_nat(shell).await;
    if vswitch_running(docker).await {
        update_ports(docker, &containers).await;
    }
    if link_exists(shell, INTEGRATION_BRIDGE).await {
        update_default_gw(shell).await;
        update_openflow(docker, &containers, &labels).await;
    }
    update_nameservers(docker, paths, &containers).await;
    update_container_ips(shell, &containers, &labels).await;
    update_routes(shell, &containers).await;
    update_etc_hosts(docker, &containers, &labels, &connections).await;
}

async fn vswitch_running(docker: &dyn Docker) -> bool {
    match docker.list(&[]).await {
        Ok(list) => list.iter().any(|c| c.name == OVS_VSWITCHD),
        Err(err) => {
            error!(%err, "failed to list system containers");
            false
        }
    }
}

async fn link_exists(shell: &dyn Shell, name: &str) -> bool {
    ip_exec(shell, "", &["link", "show", name]).await.is_ok()
}

// ── 1. Namespaces ──────────────────────────────────────────────────

/// A namespace symlink in the netns directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NsInfo {
    ns: String,
    pid: u32,
}

fn update_namespaces(paths: &Paths, containers: &[Container]) {
    let target: Vec<NsInfo> = containers
        .iter()
        .map(|c| NsInfo { ns: network_ns(&c.docker_id), pid: c.pid })
        .collect();

    let current = match current_namespaces(paths) {
        Ok(current) => current,
        Err(err) => {
            error!(%err, "failed to list namespaces");
            return;
        }
    };

    let (_, stale, missing) =
        hash_join(current, target, |l| l.ns.clone(), |r| r.ns.clone());

    for info in stale {
        if let Err(err) = std::fs::remove_file(paths.netns_dir.join(&info.ns)) {
            error!(ns = %info.ns, %err, "failed to remove namespace");
        }
    }
    for info in missing {
        if let Err(err) = add_namespace(paths, &info) {
            error!(ns = %info.ns, %err, "failed to add namespace");
        }
    }
}

fn current_namespaces(paths: &Paths) -> std::io::Result<Vec<NsInfo>> {
    let mut infos = Vec::new();
    for entry in std::fs::read_dir(&paths.netns_dir)? {
        let entry = entry?;
        if entry.path().symlink_metadata()?.file_type().is_symlink() {
            infos.push(NsInfo { ns: entry.file_name().to_string_lossy().into_owned(), pid: 0 });
        }
    }
    Ok(infos)
}

fn add_namespace(paths: &Paths, info: &NsInfo) -> std::io::Result<()> {
    let src = paths.proc_dir.join(info.pid.to_string()).join("ns/net");
    let dst = paths.netns_dir.join(&info.ns);
    // Replace anything half-created at the destination.
    match std::fs::remove_file(&dst) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::os::unix::fs::symlink(src, dst)
}

// ── 2. Veths ───────────────────────────────────────────────────────

async fn update_veths(shell: &dyn Shell, containers: &[Container]) {
    let target: Vec<String> =
        containers.iter().map(|c| veth_outer(&c.docker_id)).collect();
    let by_outer: HashMap<String, &Container> = containers
        .iter()
        .map(|c| (veth_outer(&c.docker_id), c))
        .collect();

    let current = match current_veths(shell).await {
        Ok(names) => names,
        Err(err) => {
            error!(%err, "failed to list veths");
            return;
        }
    };

    let (pairs, stale, missing) =
        hash_join(current, target, |l| l.clone(), |r| r.clone());

    for name in stale {
        if let Err(err) = ip_exec(shell, "", &["link", "delete", &name]).await {
            error!(veth = %name, %err, "failed to delete veth");
        }
    }
    for name in missing {
        let container = by_outer[&name];
        if let Err(err) = add_veth(shell, container).await {
            error!(veth = %name, %err, "failed to add veth");
        }
    }
    for pair in pairs {
        // Cheap idempotent re-assert; the kernel keeps the rest.
        let _ = ip_exec(shell, "", &["link", "set", &pair.l, "up"]).await;
    }
}

async fn current_veths(shell: &dyn Shell) -> Result<Vec<String>, crate::network::shell::ShellError> {
    let out = ip_exec(shell, "", &["-o", "link", "show", "type", "veth"]).await?;
    Ok(parse_link_names(&out))
}

/// Pull device names out of `ip -o link show` output.
fn parse_link_names(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let name = line.split_whitespace().nth(1)?;
            Some(name.trim_end_matches(':').split('@').next()?.to_string())
        })
        .collect()
}

async fn add_veth(
    shell: &dyn Shell,
    container: &Container,
) -> Result<(), crate::network::shell::ShellError> {
    let outer = veth_outer(&container.docker_id);
    let inner = veth_inner(&container.docker_id);
    let ns = network_ns(&container.docker_id);
    let mtu = ipdef::INNER_MTU.to_string();

    ip_exec(shell, "", &["link", "add", &outer, "type", "veth", "peer", "name", &inner]).await?;
    ip_exec(shell, "", &["link", "set", &outer, "up"]).await?;
    ip_exec(shell, "", &["link", "set", &inner, "netns", &ns]).await?;
    ip_exec(shell, &ns, &["link", "set", &inner, "name", INNER_VETH]).await?;
    ip_exec(shell, &ns, &["link", "set", INNER_VETH, "mtu", &mtu]).await?;
    ip_exec(shell, &ns, &["link", "set", INNER_VETH, "up"]).await?;
    Ok(())
}

// ── 3. NAT ─────────────────────────────────────────────────────────

/// An iptables rule in `-S` form, options sorted for stable comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IpRule {
    cmd: String,
    chain: String,
    opts: String,
}

async fn update_nat(shell: &dyn Shell) {
    let current = match current_nat_rules(shell).await {
        Ok(rules) => rules,
        Err(err) => {
            error!(%err, "failed to read NAT rules");
            return;
        }
    };

    let (_, stale, missing) =
        hash_join(current, target_nat_rules(), |l| l.clone(), |r| r.clone());

    for rule in stale {
        if let Err(err) = delete_nat_rule(shell, &rule).await {
            error!(?rule, %err, "failed to delete NAT rule");
        }
    }
    for rule in missing {
        if rule.cmd != "-A" {
            continue;
        }
        let mut argv: Vec<String> =
            ["iptables", "-t", "nat", "-A", &rule.chain].map(str::to_string).to_vec();
        argv.extend(rule.opts.split_whitespace().map(str::to_string));
        if let Err(err) = shell.run(&argv).await {
            error!(?rule, %err, "failed to add NAT rule");
        }
    }
}

async fn current_nat_rules(
    shell: &dyn Shell,
) -> Result<Vec<IpRule>, crate::network::shell::ShellError> {
    let out = shell
        .run(&["iptables", "-t", "nat", "-S"].map(str::to_string))
        .await?;
    Ok(out.lines().filter_map(make_ip_rule).collect())
}

fn target_nat_rules() -> Vec<IpRule> {
    [
        "-P PREROUTING ACCEPT",
        "-P INPUT ACCEPT",
        "-P OUTPUT ACCEPT",
        "-P POSTROUTING ACCEPT",
        "-A POSTROUTING -s 10.0.0.0/8 -o eth0 -j MASQUERADE",
    ]
    .iter()
    .filter_map(|line| make_ip_rule(line))
    .collect()
}

/// Parse one `iptables -S` line into a comparable rule: command, chain
/// words, then sorted `flag value` options (comma lists sorted too).
fn make_ip_rule(line: &str) -> Option<IpRule> {
    let mut tokens = line.split_whitespace().peekable();
    let cmd = tokens.next()?;
    if !cmd.starts_with('-') {
        return None;
    }

    let mut chain_words = Vec::new();
    while let Some(tok) = tokens.peek() {
        if tok.starts_with('-') || *tok == "!" {
            break;
        }
        chain_words.push(tokens.next()?.to_string());
    }
    if chain_words.is_empty() {
        return None;
    }

    let mut opts = Vec::new();
    while let Some(tok) = tokens.next() {
        let flag = if tok == "!" {
            format!("! {}", tokens.next()?)
        } else {
            tok.to_string()
        };
        let mut values = Vec::new();
        while let Some(next) = tokens.peek() {
            if next.starts_with('-') || *next == "!" {
                break;
            }
            let mut parts: Vec<&str> = tokens.next()?.split(',').collect();
            parts.sort_unstable();
            values.push(parts.join(","));
        }
        opts.push(format!("{flag} {}", values.join(" ")).trim_end().to_string());
    }
    opts.sort();

    Some(IpRule { cmd: cmd.to_string(), chain: chain_words.join(" "), opts: opts.join(" ") })
}

async fn delete_nat_rule(
    shell: &dyn Shell,
    rule: &IpRule,
) -> Result<(), crate::network::shell::ShellError> {
    match rule.cmd.as_str() {
        "-A" => {
            let mut argv: Vec<String> =
                ["iptables", "-t", "nat", "-D", &rule.chain].map(str::to_string).to_vec();
            argv.extend(rule.opts.split_whitespace().map(str::to_string));
            shell.run(&argv).await?;
        }
        "-N" => {
            shell
                .run(&["iptables", "-t", "nat", "-X", &rule.chain].map(str::to_string))
                .await?;
        }
        _ => {}
    }
    Ok(())
}

// ── 4. OVS ports ───────────────────────────────────────────────────

/// An OVS port and its interface configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OvsPort {
    bridge: String,
    name: String,
    patch_peer: String,
    attached_mac: String,
    iface_id: String,
}

async fn update_ports(docker: &dyn Docker, containers: &[Container]) {
    let target = target_ports(containers);

    let mut current: Vec<OvsPort> = Vec::new();
    for bridge in [INTEGRATION_BRIDGE, OVN_BRIDGE] {
        match ovs_vsctl(docker, &["list-ports", bridge]).await {
            Ok(out) => current.extend(out.lines().map(|name| OvsPort {
                bridge: bridge.to_string(),
                name: name.to_string(),
                ..Default::default()
            })),
            Err(err) => {
                error!(bridge, %err, "failed to list ports");
                return;
            }
        }
    }

    let key = |p: &OvsPort| (p.bridge.clone(), p.name.clone());
    let (pairs, stale, missing) = hash_join(current, target, key, key);

    for port in stale {
        if port.name == port.bridge {
            continue;
        }
        if let Err(err) = ovs_vsctl(docker, &["del-port", &port.bridge, &port.name]).await {
            error!(port = %port.name, %err, "failed to delete port");
        }
    }
    for port in missing {
        if let Err(err) = ovs_vsctl(docker, &["add-port", &port.bridge, &port.name]).await {
            error!(port = %port.name, %err, "failed to add port");
            continue;
        }
        apply_port_config(docker, &port).await;
    }
    for pair in pairs {
        apply_port_config(docker, &pair.r).await;
    }
}

fn target_ports(containers: &[Container]) -> Vec<OvsPort> {
    let mut ports = Vec::new();
    for c in containers {
        let outer = veth_outer(&c.docker_id);
        let (peer_br, peer_in) = patch_ports(&c.docker_id);
        ports.push(OvsPort {
            bridge: INTEGRATION_BRIDGE.to_string(),
            name: outer,
            ..Default::default()
        });
        ports.push(OvsPort {
            bridge: INTEGRATION_BRIDGE.to_string(),
            name: peer_in.clone(),
            patch_peer: peer_br.clone(),
            ..Default::default()
        });
        ports.push(OvsPort {
            bridge: OVN_BRIDGE.to_string(),
            name: peer_br,
            patch_peer: peer_in,
            attached_mac: c.mac.clone(),
            iface_id: c.stitch_id.clone(),
        });
    }
    ports
}

/// Idempotently assert a port's interface settings.
async fn apply_port_config(docker: &dyn Docker, port: &OvsPort) {
    if !port.patch_peer.is_empty() {
        let result = ovs_vsctl(
            docker,
            &[
                "set",
                "Interface",
                &port.name,
                "type=patch",
                &format!("options:peer={}", port.patch_peer),
            ],
        )
        .await;
        if let Err(err) = result {
            error!(port = %port.name, %err, "failed to set patch options");
        }
    }
    if !port.attached_mac.is_empty() {
        let result = ovs_vsctl(
            docker,
            &[
                "set",
                "Interface",
                &port.name,
                &format!("external-ids:attached-mac={}", port.attached_mac),
            ],
        )
        .await;
        if let Err(err) = result {
            error!(port = %port.name, %err, "failed to set attached mac");
        }
    }
    if !port.iface_id.is_empty() {
        let result = ovs_vsctl(
            docker,
            &[
                "set",
                "Interface",
                &port.name,
                &format!("external-ids:iface-id={}", port.iface_id),
            ],
        )
        .await;
        if let Err(err) = result {
            error!(port = %port.name, %err, "failed to set iface id");
        }
    }
}

async fn ovs_vsctl(
    docker: &dyn Docker,
    args: &[&str],
) -> Result<String, crate::docker::DockerError> {
    let mut argv = vec!["ovs-vsctl"];
    argv.extend(args);
    docker.exec(OVS_VSWITCHD, &argv).await
}

async fn ovs_ofctl(docker: &dyn Docker, args: &[&str]) {
    let mut argv = vec!["ovs-ofctl"];
    argv.extend(args);
    if let Err(err) = docker.exec(OVS_VSWITCHD, &argv).await {
        error!(%err, "ovs-ofctl failed");
    }
}

// ── 5. Default gateway ─────────────────────────────────────────────

async fn update_default_gw(shell: &dyn Shell) {
    match get_mac(shell, "", INTEGRATION_BRIDGE).await {
        Ok(mac) if mac != ipdef::GATEWAY_MAC => {
            if let Err(err) = ip_exec(
                shell,
                "",
                &["link", "set", "dev", INTEGRATION_BRIDGE, "address", ipdef::GATEWAY_MAC],
            )
            .await
            {
                error!(%err, "failed to set gateway MAC");
            }
        }
        Ok(_) => {}
        Err(err) => {
            error!(%err, "failed to read gateway MAC");
            return;
        }
    }

    if let Err(err) = ip_exec(shell, "", &["link", "set", INTEGRATION_BRIDGE, "up"]).await {
        error!(%err, "failed to bring up the integration bridge");
    }

    let current = match list_ips(shell, "", INTEGRATION_BRIDGE).await {
        Ok(ips) => ips,
        Err(err) => {
            error!(%err, "failed to list gateway addresses");
            return;
        }
    };
    let target = vec![format!("{}/8", ipdef::GATEWAY_IP)];
    update_ips(shell, "", INTEGRATION_BRIDGE, current, target).await;
}

async fn get_mac(
    shell: &dyn Shell,
    ns: &str,
    dev: &str,
) -> Result<String, crate::network::shell::ShellError> {
    let out = ip_exec(shell, ns, &["-o", "link", "show", dev]).await?;
    Ok(parse_mac(&out))
}

fn parse_mac(out: &str) -> String {
    let mut tokens = out.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "link/ether" {
            return tokens.next().unwrap_or_default().to_string();
        }
    }
    String::new()
}

async fn list_ips(
    shell: &dyn Shell,
    ns: &str,
    dev: &str,
) -> Result<Vec<String>, crate::network::shell::ShellError> {
    let out = ip_exec(shell, ns, &["-o", "-4", "addr", "show", "dev", dev]).await?;
    Ok(parse_inet_addrs(&out))
}

fn parse_inet_addrs(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            while let Some(tok) = tokens.next() {
                if tok == "inet" {
                    return tokens.next().map(str::to_string);
                }
            }
            None
        })
        .collect()
}

/// Make `dev`'s address set exactly `target`.
async fn update_ips(
    shell: &dyn Shell,
    ns: &str,
    dev: &str,
    current: Vec<String>,
    target: Vec<String>,
) {
    let (_, stale, missing) = hash_join(current, target, |l| l.clone(), |r| r.clone());
    for ip in stale {
        if let Err(err) = ip_exec(shell, ns, &["addr", "del", &ip, "dev", dev]).await {
            error!(%ip, dev, %err, "failed to delete address");
        }
    }
    for ip in missing {
        if let Err(err) = ip_exec(shell, ns, &["addr", "add", &ip, "dev", dev]).await {
            error!(%ip, dev, %err, "failed to add address");
        }
    }
}

// ── 6. Container addresses ─────────────────────────────────────────

async fn update_container_ips(shell: &dyn Shell, containers: &[Container], labels: &[Label]) {
    let label_ips: HashMap<&str, &str> =
        labels.iter().map(|l| (l.name.as_str(), l.ip.as_str())).collect();

    for c in containers {
        let ns = network_ns(&c.docker_id);

        let current = match list_ips(shell, &ns, INNER_VETH).await {
            Ok(ips) => ips,
            Err(err) => {
                error!(container = %short_id(&c.docker_id), %err, "failed to list addresses");
                continue;
            }
        };

        // The container's own address plus one alias per label it carries,
        // for label-local addressing.
        let mut target: BTreeSet<String> = BTreeSet::new();
        target.insert(format!("{}/8", c.ip));
        for name in &c.labels {
            if let Some(ip) = label_ips.get(name.as_str()) {
                if !ip.is_empty() {
                    target.insert(format!("{ip}/8"));
                }
            }
        }
        update_ips(shell, &ns, INNER_VETH, current, target.into_iter().collect()).await;

        match get_mac(shell, &ns, INNER_VETH).await {
            Ok(mac) if mac != c.mac => {
                if let Err(err) = ip_exec(
                    shell,
                    &ns,
                    &["link", "set", INNER_VETH, "address", &c.mac],
                )
                .await
                {
                    error!(container = %short_id(&c.docker_id), %err, "failed to set MAC");
                }
            }
            Ok(_) => {}
            Err(err) => error!(container = %short_id(&c.docker_id), %err, "failed to read MAC"),
        }
    }
}

// ── 7. Routes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Route {
    dest: String,
    via: String,
    dev: String,
}

async fn update_routes(shell: &dyn Shell, containers: &[Container]) {
    let target = vec![
        Route { dest: ipdef::SUBNET.to_string(), via: String::new(), dev: INNER_VETH.to_string() },
        Route {
            dest: "default".to_string(),
            via: ipdef::GATEWAY_IP.to_string(),
            dev: INNER_VETH.to_string(),
        },
    ];

    for c in containers {
        let ns = network_ns(&c.docker_id);
        let current = match ip_exec(shell, &ns, &["route", "show"]).await {
            Ok(out) => parse_routes(&out),
            Err(err) => {
                error!(container = %short_id(&c.docker_id), %err, "failed to list routes");
                continue;
            }
        };

        let (_, stale, missing) =
            hash_join(current, target.clone(), |l| l.clone(), |r| r.clone());

        for route in stale {
            if let Err(err) = route_cmd(shell, &ns, "del", &route).await {
                error!(?route, %err, "failed to delete route");
            }
        }
        for route in missing {
            if let Err(err) = route_cmd(shell, &ns, "add", &route).await {
                error!(?route, %err, "failed to add route");
            }
        }
    }
}

fn parse_routes(out: &str) -> Vec<Route> {
    out.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let dest = (*tokens.first()?).to_string();
            let mut via = String::new();
            let mut dev = String::new();
            for pair in tokens.windows(2) {
                match pair[0] {
                    "via" => via = pair[1].to_string(),
                    "dev" => dev = pair[1].to_string(),
                    _ => {}
                }
            }
            Some(Route { dest, via, dev })
        })
        .collect()
}

async fn route_cmd(
    shell: &dyn Shell,
    ns: &str,
    verb: &str,
    route: &Route,
) -> Result<(), crate::network::shell::ShellError> {
    if route.via.is_empty() {
        ip_exec(shell, ns, &["route", verb, &route.dest, "dev", &route.dev]).await?;
    } else {
        ip_exec(shell, ns, &["route", verb, &route.dest, "via", &route.via]).await?;
    }
    Ok(())
}

// ── 8. OpenFlow ────────────────────────────────────────────────────

async fn update_openflow(docker: &dyn Docker, containers: &[Container], labels: &[Label]) {
    for c in containers {
        let outer = veth_outer(&c.docker_id);
        let (_, peer_in) = patch_ports(&c.docker_id);

        let of_veth = match of_port(docker, &outer).await {
            Some(n) => n,
            None => continue,
        };
        let of_patch = match of_port(docker, &peer_in).await {
            Some(n) => n,
            None => continue,
        };

        for flow in container_flows(of_veth, of_patch, &c.mac, ipdef::GATEWAY_MAC) {
            ovs_ofctl(docker, &["add-flow", INTEGRATION_BRIDGE, &flow]).await;
        }
    }

    // MACs of local members per label.
    let mut label_macs: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for c in containers {
        for name in &c.labels {
            label_macs.entry(name.as_str()).or_default().insert(c.mac.as_str());
        }
    }

    for label in labels {
        if !label.multi_host {
            continue;
        }
        let Some(macs) = label_macs.get(label.name.as_str()) else {
            continue;
        };
        if macs.is_empty() {
            continue;
        }

        let macs: Vec<&str> = macs.iter().copied().collect();
        let (match_str, flow0, flow1s) = label_flows(&label.ip, &macs);

        // Multipath rules are regenerated wholesale when membership moves.
        ovs_ofctl(docker, &["del-flows", INTEGRATION_BRIDGE, &match_str]).await;
        ovs_ofctl(docker, &["add-flow", INTEGRATION_BRIDGE, &flow0]).await;
        for flow in flow1s {
            ovs_ofctl(docker, &["add-flow", INTEGRATION_BRIDGE, &flow]).await;
        }
    }
}

async fn of_port(docker: &dyn Docker, name: &str) -> Option<i64> {
    let out = ovs_vsctl(docker, &["get", "Interface", name, "ofport"]).await.ok()?;
    let port: i64 = out.trim().parse().ok()?;
    if port < 0 {
        warn!(port = name, "interface has no OpenFlow port yet");
        return None;
    }
    Some(port)
}

/// The per-container forwarding rules on the integration bridge.
///
/// Table 0 bridges the container's veth and patch port, hands gateway-bound
/// frames to LOCAL, floods ARP to both OVN and LOCAL, and catches all else
/// toward OVN; table 2 is the return path used by the label rules.
pub fn container_flows(of_veth: i64, of_patch: i64, mac: &str, gateway_mac: &str) -> Vec<String> {
    vec![
        format!("priority=5000,table=0,in_port={of_patch},actions=output:{of_veth}"),
        format!("priority=5000,table=2,in_port={of_veth},actions=output:{of_patch}"),
        format!("priority=5000,table=0,in_port={of_veth},dl_dst={gateway_mac},actions=output:LOCAL"),
        format!("priority=5000,table=0,in_port=LOCAL,dl_dst={mac},actions=output:{of_veth}"),
        format!("priority=4500,table=0,arp,in_port={of_veth},actions=output:LOCAL,{of_patch}"),
        format!("priority=0,table=0,in_port={of_veth},actions=output:{of_patch}"),
    ]
}

/// The load-balancing rules for one multi-host label: a table-0 multipath
/// hash over `n` backends into REG0, and one table-1 rule per backend
/// rewriting the destination MAC.
pub fn label_flows(label_ip: &str, macs: &[&str]) -> (String, String, Vec<String>) {
    let n = macs.len();
    let lg2n = usize::BITS - n.next_power_of_two().leading_zeros() - 1;

    let match_str = format!("table=0,dl_dst={},nw_dst={}", ipdef::LABEL_MAC, label_ip);
    let multipath =
        format!("multipath(symmetric_l3l4, 0, modulo_n, {n}, 0, NXM_NX_REG0[0..{lg2n}])");
    let flow0 = format!("priority=4000,{match_str},actions={multipath},resubmit(,1)");

    let flow1s = macs
        .iter()
        .enumerate()
        .map(|(i, mac)| {
            format!(
                "priority=5000,table=1,nw_dst={label_ip},reg0={i},actions=mod_dl_dst:{mac},resubmit(,2)"
            )
        })
        .collect();

    (match_str, flow0, flow1s)
}

// ── 9. Nameservers ─────────────────────────────────────────────────

async fn update_nameservers(docker: &dyn Docker, paths: &Paths, containers: &[Container]) {
    let host_resolv = match std::fs::read_to_string(&paths.resolv_conf) {
        Ok(content) => content,
        Err(err) => {
            error!(%err, "failed to read the host resolver config");
            return;
        }
    };
    let nameservers = filter_nameservers(&host_resolv);

    for c in containers {
        let current = match docker.read_file(&c.docker_id, "/etc/resolv.conf").await {
            Ok(content) => content,
            Err(err) => {
                error!(container = %short_id(&c.docker_id), %err, "failed to read resolv.conf");
                continue;
            }
        };
        if current != nameservers {
            if let Err(err) =
                docker.write_file(&c.docker_id, "/etc/resolv.conf", &nameservers).await
            {
                error!(container = %short_id(&c.docker_id), %err, "failed to write resolv.conf");
            }
        }
    }
}

fn filter_nameservers(resolv: &str) -> String {
    resolv
        .lines()
        .filter(|line| line.trim_start().starts_with("nameserver"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── 10. /etc/hosts ─────────────────────────────────────────────────

async fn update_etc_hosts(
    docker: &dyn Docker,
    containers: &[Container],
    labels: &[Label],
    connections: &[Connection],
) {
    let label_ips: HashMap<&str, &str> =
        labels.iter().map(|l| (l.name.as_str(), l.ip.as_str())).collect();
    let mut conns: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in connections {
        conns.entry(conn.from.as_str()).or_default().push(conn.to.as_str());
    }

    for c in containers {
        let target = generate_etc_hosts(c, &label_ips, &conns);
        let current = match docker.read_file(&c.docker_id, "/etc/hosts").await {
            Ok(content) => content,
            Err(err) => {
                error!(container = %short_id(&c.docker_id), %err, "failed to read hosts");
                continue;
            }
        };
        if current != target {
            if let Err(err) = docker.write_file(&c.docker_id, "/etc/hosts", &target).await {
                error!(container = %short_id(&c.docker_id), %err, "failed to write hosts");
            }
        }
    }
}

/// The hosts file a container should carry: the standard localhost set, its
/// own short name, and one `<label>.q` entry per label it may reach.
pub fn generate_etc_hosts(
    container: &Container,
    label_ips: &HashMap<&str, &str>,
    conns: &HashMap<&str, Vec<&str>>,
) -> String {
    let mut entries: BTreeSet<(String, String)> = [
        ("127.0.0.1", "localhost"),
        ("::1", "localhost ip6-localhost ip6-loopback"),
        ("fe00::0", "ip6-localnet"),
        ("ff00::0", "ip6-mcastprefix"),
        ("ff02::1", "ip6-allnodes"),
        ("ff02::2", "ip6-allrouters"),
    ]
    .into_iter()
    .map(|(ip, host)| (ip.to_string(), host.to_string()))
    .collect();

    if !container.ip.is_empty() && !container.docker_id.is_empty() {
        entries.insert((container.ip.clone(), short_id(&container.docker_id).to_string()));
    }

    for label in &container.labels {
        for to in conns.get(label.as_str()).into_iter().flatten() {
            if let Some(ip) = label_ips.get(to) {
                if !ip.is_empty() {
                    entries.insert((ip.to_string(), format!("{to}.q")));
                }
            }
        }
    }

    let mut lines: Vec<String> = entries
        .into_iter()
        .map(|(ip, host)| format!("{ip:<15} {host}"))
        .collect();
    lines.sort();
    lines.join("\n") + "\n"
}
