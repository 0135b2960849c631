//! Host plumbing installed when the first config arrives: the TUN
//! address and link state, NAT masquerade for the client CIDR, and the
//! kernel tunables a busy gateway wants. Everything here is
//! best-effort; a container without CAP_NET_ADMIN still serves traffic
//! that does not need NAT.

use std::net::Ipv4Addr;
use std::process::Command;

use ipnet::Ipv4Net;
use tracing::{info, warn};

const NAT_TABLE: &str = "zerogate_nat";

/// The gateway claims the first host address of the client CIDR.
pub fn gateway_address(cidr: Ipv4Net) -> Ipv4Net {
    let base = u32::from(cidr.network());
    let gw = Ipv4Addr::from(base + 1);
    Ipv4Net::new(gw, cidr.prefix_len()).expect("prefix came from a valid Ipv4Net")
}

fn run(program: &str, args: &[&str]) -> bool {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!(
                program,
                ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "command failed"
            );
            false
        }
        Err(err) => {
            warn!(program, ?args, %err, "command could not run");
            false
        }
    }
}

/// rmem/wmem, conntrack, forwarding, fq + BBR. Recommended, not
/// required; failures only warn.
pub fn tune_system() {
    let params = [
        ("net.core.rmem_max", "67108864"),
        ("net.core.wmem_max", "67108864"),
        ("net.core.rmem_default", "33554432"),
        ("net.core.wmem_default", "33554432"),
        ("net.netfilter.nf_conntrack_max", "1048576"),
        ("net.ipv4.ip_forward", "1"),
        ("net.core.default_qdisc", "fq"),
        ("net.ipv4.tcp_congestion_control", "bbr"),
    ];
    for (key, value) in params {
        run("sysctl", &["-w", &format!("{key}={value}")]);
    }
}

/// Assigns the gateway address to the TUN and brings the link up at the
/// tunnel MTU.
pub fn configure_interface(name: &str, gateway: Ipv4Net, mtu: u16) {
    run("ip", &["addr", "add", &gateway.to_string(), "dev", name]);
    run(
        "ip",
        &["link", "set", "dev", name, "up", "mtu", &mtu.to_string()],
    );
}

/// nftables masquerade for traffic leaving the client CIDR.
pub fn install_masquerade(cidr: Ipv4Net) {
    run("nft", &["add", "table", "ip", NAT_TABLE]);
    run(
        "nft",
        &[
            "add",
            "chain",
            "ip",
            NAT_TABLE,
            "postrouting",
            "{ type nat hook postrouting priority 100 ; }",
        ],
    );
    run(
        "nft",
        &[
            "add",
            "rule",
            "ip",
            NAT_TABLE,
            "postrouting",
            "ip",
            "saddr",
            &cidr.to_string(),
            "masquerade",
        ],
    );
}

/// Full first-config bring-up.
pub fn setup_network(tun_name: &str, cidr: Ipv4Net, mtu: u16) {
    info!(%cidr, tun = tun_name, "configuring network");
    tune_system();
    configure_interface(tun_name, gateway_address(cidr), mtu);
    install_masquerade(cidr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_the_first_host() {
        let cidr: Ipv4Net = "10.8.0.0/24".parse().unwrap();
        assert_eq!(gateway_address(cidr).to_string(), "10.8.0.1/24");

        let wide: Ipv4Net = "10.8.0.0/16".parse().unwrap();
        assert_eq!(gateway_address(wide).to_string(), "10.8.0.1/16");
    }
}
