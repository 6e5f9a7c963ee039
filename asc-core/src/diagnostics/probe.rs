//! Liveness probes used by diagnostics and the process supervisor

use async_trait::async_trait;
use std::time::Duration;

/// Answers whether a process id belongs to a live process
pub trait PidProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Answers whether a service URL is reachable
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// Probes processes with the null signal.
///
/// `EPERM` means the process exists but belongs to another user, so it counts
/// as alive. Only `ESRCH` means the process is gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl PidProbe for SignalProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        // 0 and negative values address process groups
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return false,
        };

        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Probes `<url>/health` over HTTP
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        let url = format!("{}/health", url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }
}
