//! Bridge networking: host-side bridge/NAT setup and per-session veth pairs.
//!
//! Link and address manipulation shells out to `ip`(8)/`iptables`(8) rather
//! than talking netlink directly — the daemon already treats external
//! binaries as the boundary for mount/process setup (`pivot_root`, overlay
//! mounts), and the same approach keeps this surface in plain `ip`-command
//! terms (interface names, CIDR, default routes).

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

use crate::error::{Result, SandkastenError};

pub const BRIDGE_NAME: &str = "sk0";
pub const BRIDGE_ADDR: Ipv4Addr = Ipv4Addr::new(10, 55, 0, 1);
pub const POOL_PREFIX_LEN: u8 = 16;

/// Tracks which host octets of `10.55.0.0/16` are leased to sessions.
/// `10.55.0.1` (the bridge address) and `.0`/`.255` broadcast-ish addresses
/// per /24 are never handed out; in practice we only exhaust this under
/// pathological leaks, so a linear scan over a bitset is plenty fast.
pub struct IpPool {
    leased: Mutex<Vec<bool>>,
}

impl IpPool {
    const CAPACITY: usize = 65536;

    pub fn new() -> Self {
        let mut leased = vec![false; Self::CAPACITY];
        leased[1] = true; // 10.55.0.1 is the bridge itself
        IpPool {
            leased: Mutex::new(leased),
        }
    }

    /// Leases the next free address, returning it as `10.55.x.y`.
    pub fn acquire(&self) -> Result<Ipv4Addr> {
        let mut leased = self.leased.lock().unwrap();
        for (offset, taken) in leased.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Ok(offset_to_addr(offset));
            }
        }
        Err(SandkastenError::Internal(
            "bridge IP pool (10.55.0.0/16) exhausted".to_string(),
        ))
    }

    pub fn release(&self, addr: Ipv4Addr) {
        let offset = addr_to_offset(addr);
        if let Some(slot) = self.leased.lock().unwrap().get_mut(offset) {
            *slot = false;
        }
    }
}

impl Default for IpPool {
    fn default() -> Self {
        Self::new()
    }
}

fn offset_to_addr(offset: usize) -> Ipv4Addr {
    let hi = (offset >> 8) as u8;
    let lo = (offset & 0xff) as u8;
    Ipv4Addr::new(10, 55, hi, lo)
}

fn addr_to_offset(addr: Ipv4Addr) -> usize {
    let octets = addr.octets();
    (octets[2] as usize) << 8 | octets[3] as usize
}

/// Ensures the `sk0` bridge, its address, forwarding and MASQUERADE rule
/// exist. Idempotent: safe to call on every daemon start.
#[cfg(target_os = "linux")]
pub fn ensure_bridge_ready() -> Result<()> {
    if !bridge_exists() {
        run_ok(&["link", "add", "name", BRIDGE_NAME, "type", "bridge"])?;
        run_ok(&[
            "addr",
            "add",
            &format!("{BRIDGE_ADDR}/{POOL_PREFIX_LEN}"),
            "dev",
            BRIDGE_NAME,
        ])?;
    }
    run_ok(&["link", "set", BRIDGE_NAME, "up"])?;

    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")?;

    if !masquerade_rule_exists() {
        run_cmd(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                "10.55.0.0/16",
                "!",
                "-o",
                BRIDGE_NAME,
                "-j",
                "MASQUERADE",
            ],
        )?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn bridge_exists() -> bool {
    Command::new("ip")
        .args(["link", "show", BRIDGE_NAME])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn masquerade_rule_exists() -> bool {
    Command::new("iptables")
        .args([
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            "10.55.0.0/16",
            "!",
            "-o",
            BRIDGE_NAME,
            "-j",
            "MASQUERADE",
        ])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Creates the per-session veth pair, attaches the host end to `sk0`, moves
/// the peer into the sandbox's network namespace (identified by `init_pid`),
/// and configures the in-sandbox side: rename to `eth0`, assign `addr`,
/// bring up `eth0`/`lo`, default route via the bridge.
#[cfg(target_os = "linux")]
pub fn setup_session_network(session_id8: &str, init_pid: i32, addr: Ipv4Addr) -> Result<()> {
    let host_if = format!("skv_{session_id8}");
    let peer_if = format!("skc_{session_id8}");

    run_ok(&[
        "link", "add", &host_if, "type", "veth", "peer", "name", &peer_if,
    ])?;
    run_ok(&["link", "set", &host_if, "master", BRIDGE_NAME])?;
    run_ok(&["link", "set", &host_if, "up"])?;
    run_ok(&["link", "set", &peer_if, "netns", &init_pid.to_string()])?;

    // `ip netns exec <pid>` expects a named netns, not a pid; modern
    // iproute2's `ip -n <pid>` form targets a namespace by pid directly.
    let pid_str = init_pid.to_string();
    run_ok(&["-n", &pid_str, "link", "set", &peer_if, "name", "eth0"])?;
    run_ok(&[
        "-n",
        &pid_str,
        "addr",
        "add",
        &format!("{addr}/{POOL_PREFIX_LEN}"),
        "dev",
        "eth0",
    ])?;
    run_ok(&["-n", &pid_str, "link", "set", "eth0", "up"])?;
    run_ok(&["-n", &pid_str, "link", "set", "lo", "up"])?;
    run_ok(&[
        "-n",
        &pid_str,
        "route",
        "add",
        "default",
        "via",
        &BRIDGE_ADDR.to_string(),
    ])?;

    Ok(())
}

/// Removes the host-side veth end; the peer end disappears with the
/// sandbox's network namespace when `init_pid` exits.
#[cfg(target_os = "linux")]
pub fn teardown_session_network(session_id8: &str) {
    let host_if = format!("skv_{session_id8}");
    let _ = Command::new("ip").args(["link", "del", &host_if]).status();
}

#[cfg(target_os = "linux")]
fn run_ok(args: &[&str]) -> Result<()> {
    run_cmd("ip", args)
}

#[cfg(target_os = "linux")]
fn run_cmd(bin: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .map_err(|e| SandkastenError::Internal(format!("spawning {bin}: {e}")))?;
    if !output.status.success() {
        return Err(SandkastenError::Internal(format!(
            "{bin} {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_never_hands_out_bridge_address() {
        let pool = IpPool::new();
        for _ in 0..10 {
            let addr = pool.acquire().unwrap();
            assert_ne!(addr, BRIDGE_ADDR);
        }
    }

    #[test]
    fn release_allows_reacquire() {
        let pool = IpPool::new();
        let addr = pool.acquire().unwrap();
        pool.release(addr);
        let reacquired = pool.acquire().unwrap();
        assert_eq!(addr, reacquired);
    }

    #[test]
    fn offset_round_trips_through_addr() {
        for offset in [0usize, 1, 256, 65535] {
            let addr = offset_to_addr(offset);
            assert_eq!(addr_to_offset(addr), offset);
        }
    }
}
