//! Debugger endpoint resolution and connection-safety check.
//!
//! The host application exposes its DevTools endpoint on a TCP port chosen
//! by a launch parameter (`-devtools-port=<int>`). Before attaching we make
//! sure the process listening on that port really is the host: attaching
//! to an unrelated process that happens to hold the port would hand our
//! plugins to the wrong program.
//!
//! # Platform Support
//!
//! The ownership check goes through the [`ListenerProbe`] capability. See
//! [`probe`] for which platforms are strict and which approve blindly.

// Rust guideline compliant 2026-02

pub mod probe;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub use probe::{platform_probe, ListenerProbe};

/// Port used when no `-devtools-port` parameter is present or it is invalid.
pub const DEFAULT_DEBUGGER_PORT: u16 = 8080;

/// Launch parameter key carrying the debugger port.
pub const PORT_PARAMETER: &str = "-devtools-port";

/// DevTools discovery path served by the debugger.
pub const VERSION_PATH: &str = "/json/version";

/// Network location of the host debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name, usually `localhost`.
    pub host: String,
    /// TCP port of the DevTools HTTP server.
    pub port: u16,
    /// Discovery path.
    pub path: String,
}

impl Endpoint {
    /// Base HTTP URL (`http://host:port`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Full discovery URL (`http://host:port/json/version`).
    #[must_use]
    pub fn discovery_url(&self) -> String {
        format!("{}{}", self.base_url(), self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of a process owning a listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    /// Process id.
    pub pid: u32,
    /// Executable path (or bare command name when the path is unavailable).
    pub executable: PathBuf,
}

impl ProcessIdentity {
    /// Whether this process's executable matches `expected`.
    ///
    /// Compares both the file name and the file stem, ignoring ASCII case,
    /// so `steamwebhelper` matches `steamwebhelper.exe` and vice versa.
    #[must_use]
    pub fn matches_executable(&self, expected: &str) -> bool {
        let expected_stem = Path::new(expected)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(expected);

        let name = self.executable.file_name().and_then(|s| s.to_str());
        let stem = self.executable.file_stem().and_then(|s| s.to_str());

        name.is_some_and(|n| n.eq_ignore_ascii_case(expected))
            || stem.is_some_and(|s| s.eq_ignore_ascii_case(expected_stem))
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.executable.display(), self.pid)
    }
}

/// Result of a successful safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// The listener belongs to the expected host.
    Verified(ProcessIdentity),
    /// The probe is best-effort on this platform; nothing was inspected.
    Unchecked,
}

/// Endpoint resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Nothing listens on the port yet. The host may still be starting.
    #[error("nothing is listening on debugger port {port} yet")]
    NotAvailable {
        /// Port that was probed.
        port: u16,
    },
    /// Another program holds the port. Attaching would target the wrong process.
    #[error(
        "debugger port {port} is held by '{found}', not '{expected}'. \
         Close the conflicting application or change the port it uses"
    )]
    WrongOwner {
        /// Port that was probed.
        port: u16,
        /// Process found on the port.
        found: ProcessIdentity,
        /// Configured host executable name.
        expected: String,
    },
}

impl ResolveError {
    /// Whether the caller should abort instead of retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WrongOwner { .. })
    }
}

/// Parse the debugger port out of launch parameters.
///
/// Looks for `-devtools-port=<value>`. Missing, unparsable, zero, or
/// out-of-range values fall back to [`DEFAULT_DEBUGGER_PORT`]. The first
/// valid occurrence wins; invalid ones are logged and skipped.
pub fn parse_port_parameter<I, S>(params: I) -> u16
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for param in params {
        let Some((key, value)) = param.as_ref().split_once('=') else {
            continue;
        };
        if key != PORT_PARAMETER {
            continue;
        }

        match value.trim().parse::<u16>() {
            Ok(p) if p > 0 => return p,
            Ok(_) => log::error!("[Endpoint] Ignoring {PORT_PARAMETER}=0"),
            Err(e) => {
                log::error!("[Endpoint] Failed to parse {PORT_PARAMETER} value '{value}': {e}");
            }
        }
    }

    DEFAULT_DEBUGGER_PORT
}

/// Resolves and verifies the host debugger endpoint.
///
/// Resolution is cached for the resolver's lifetime; the bootstrap owns a
/// single resolver, making it effectively process-wide.
pub struct EndpointResolver {
    params: Vec<String>,
    host: String,
    expected_executable: String,
    probe: Box<dyn ListenerProbe>,
    resolved: OnceLock<Endpoint>,
}

impl fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("host", &self.host)
            .field("expected_executable", &self.expected_executable)
            .field("strict", &self.probe.is_strict())
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    /// Create a resolver over the given launch parameters.
    pub fn new(
        params: Vec<String>,
        host: impl Into<String>,
        expected_executable: impl Into<String>,
        probe: Box<dyn ListenerProbe>,
    ) -> Self {
        Self {
            params,
            host: host.into(),
            expected_executable: expected_executable.into(),
            probe,
            resolved: OnceLock::new(),
        }
    }

    /// The debugger endpoint, parsed on first call and cached afterwards.
    pub fn resolve(&self) -> Endpoint {
        self.resolved
            .get_or_init(|| {
                let port = parse_port_parameter(&self.params);
                log::info!("[Endpoint] Using port {} for the host debugger", port);
                Endpoint {
                    host: self.host.clone(),
                    port,
                    path: VERSION_PATH.to_string(),
                }
            })
            .clone()
    }

    /// Run the connection-safety check against the resolved port.
    pub fn verify(&self) -> Result<SafetyVerdict, ResolveError> {
        let port = self.resolve().port;

        if !self.probe.is_strict() {
            log::debug!("[Endpoint] Listener probe is best-effort here, skipping owner check");
            return Ok(SafetyVerdict::Unchecked);
        }

        let Some(owner) = self.probe.find_listener_owner(port) else {
            return Err(ResolveError::NotAvailable { port });
        };

        if owner.matches_executable(&self.expected_executable) {
            log::debug!("[Endpoint] Port {} owned by {}", port, owner);
            Ok(SafetyVerdict::Verified(owner))
        } else {
            Err(ResolveError::WrongOwner {
                port,
                found: owner,
                expected: self.expected_executable.clone(),
            })
        }
    }

    /// Verify ownership, then return the endpoint.
    pub fn resolve_verified(&self) -> Result<Endpoint, ResolveError> {
        self.verify()?;
        Ok(self.resolve())
    }

    /// Retry [`Self::resolve_verified`] until the host is listening.
    ///
    /// Returns immediately on a fatal verdict; returns the last
    /// `NotAvailable` once `timeout` elapses.
    pub fn wait_until_available(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Endpoint, ResolveError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.resolve_verified() {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    log::debug!("[Endpoint] {e}; retrying");
                    std::thread::sleep(poll);
                }
            }
        }
    }
}
