//! Platform listener probes.
//!
//! Finds which process owns the listening socket on a TCP port.
//!
//! # Platform Support
//!
//! - **Linux** (strict): parses `/proc/net/tcp{,6}` for a `LISTEN` entry on
//!   the port, maps its socket inode to a pid by scanning `/proc/<pid>/fd`,
//!   and reads `/proc/<pid>/exe` (falling back to `/proc/<pid>/comm`). A
//!   listener whose owner cannot be read is reported as pid 0 with an
//!   [`UNKNOWN_EXECUTABLE`] path, never as a free port.
//! - **macOS** (strict): `lsof -nP -iTCP:<port> -sTCP:LISTEN -Fpc`, with the
//!   executable path from `ps -o comm= -p <pid>`.
//! - **Other** (best-effort): always approves. Attaching to the wrong
//!   process is possible there; nothing is inspected.

use std::path::PathBuf;

use super::ProcessIdentity;

/// Executable reported for a listener whose owner is not visible to us.
pub const UNKNOWN_EXECUTABLE: &str = "<unknown>";

/// Capability to look up the owner of a listening TCP port.
pub trait ListenerProbe: Send + Sync {
    /// Identity of the process listening on `port`, if any.
    fn find_listener_owner(&self, port: u16) -> Option<ProcessIdentity>;

    /// Whether results are authoritative. Non-strict probes are skipped.
    fn is_strict(&self) -> bool {
        true
    }
}

/// Probe for the current platform.
#[must_use]
pub fn platform_probe() -> Box<dyn ListenerProbe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcNetProbe)
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(LsofProbe)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Box::new(PermissiveProbe)
    }
}

/// Probe that approves every port without inspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveProbe;

impl ListenerProbe for PermissiveProbe {
    fn find_listener_owner(&self, _port: u16) -> Option<ProcessIdentity> {
        None
    }

    fn is_strict(&self) -> bool {
        false
    }
}

/// Linux probe over procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcNetProbe;

impl ListenerProbe for ProcNetProbe {
    fn find_listener_owner(&self, port: u16) -> Option<ProcessIdentity> {
        let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .find_map(|table| find_listen_inode(&table, port))?;

        Some(socket_owner(inode, find_pid_for_socket_inode))
    }
}

/// Identity of the process holding socket `inode`.
///
/// A listener exists at this point, so an unreadable owner (another user's
/// process, a hidden `/proc/<pid>/fd`) still yields an identity that no
/// expected executable matches.
pub(crate) fn socket_owner(inode: u64, find_pid: impl FnOnce(u64) -> Option<u32>) -> ProcessIdentity {
    let Some(pid) = find_pid(inode) else {
        log::warn!("[Endpoint] Listening socket {inode} has no visible owner");
        return ProcessIdentity {
            pid: 0,
            executable: PathBuf::from(UNKNOWN_EXECUTABLE),
        };
    };

    let executable = std::fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string(format!("/proc/{pid}/comm"))
                .ok()
                .map(|comm| PathBuf::from(comm.trim()))
        })
        .unwrap_or_else(|| PathBuf::from(UNKNOWN_EXECUTABLE));

    ProcessIdentity { pid, executable }
}

/// Linux `TCP_LISTEN` state code in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Find the socket inode of a `LISTEN` entry bound to `port`.
///
/// `table` is the content of `/proc/net/tcp` or `/proc/net/tcp6`. The
/// local address column is `ADDR:PORT` in hex; the state column is hex.
pub(crate) fn find_listen_inode(table: &str, port: u16) -> Option<u64> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }

        let local_port = fields[1]
            .rsplit_once(':')
            .and_then(|(_, p)| u16::from_str_radix(p, 16).ok())?;

        if local_port != port || !fields[3].eq_ignore_ascii_case(TCP_LISTEN) {
            return None;
        }

        fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
    })
}

/// Scan `/proc/<pid>/fd` links for `socket:[inode]`.
fn find_pid_for_socket_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{inode}]");

    std::fs::read_dir("/proc").ok()?.flatten().find_map(|entry| {
        let pid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
        let fds = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;

        fds.flatten()
            .filter_map(|fd| std::fs::read_link(fd.path()).ok())
            .any(|target| target.to_string_lossy() == needle)
            .then_some(pid)
    })
}

/// macOS probe using `lsof`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofProbe;

impl ListenerProbe for LsofProbe {
    fn find_listener_owner(&self, port: u16) -> Option<ProcessIdentity> {
        let output = std::process::Command::new("lsof")
            .arg("-nP")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .arg("-Fpc")
            .output()
            .ok()?;

        let (pid, command) = parse_lsof_fields(&String::from_utf8_lossy(&output.stdout))?;

        let executable = std::process::Command::new("ps")
            .args(["-o", "comm=", "-p", &pid.to_string()])
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
            .map_or_else(|| PathBuf::from(command), PathBuf::from);

        Some(ProcessIdentity { pid, executable })
    }
}

/// Parse the first process out of `lsof -F pc` output.
///
/// Format: `p<pid>` followed by `c<command>` lines.
pub(crate) fn parse_lsof_fields(output: &str) -> Option<(u32, String)> {
    let mut pid = None;
    for line in output.lines() {
        if let Some(p) = line.strip_prefix('p') {
            pid = p.parse::<u32>().ok();
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(pid) = pid {
                return Some((pid, command.to_string()));
            }
        }
    }
    pid.map(|p| (p, String::new()))
}
