use std::{
    sync::Arc,
    time::Duration,
};

/// Process-wide configuration for a [`Kernel`].
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Upper bound on queued outbound bytes per socket.
    ///
    /// A write that would push a socket's pending bytes above this threshold
    /// force-closes the socket instead of overshooting.
    pub socket_max_pending_write_bytes: usize,
    /// Upper bound on the resolution of a connect attempt.
    pub connect_timeout: Duration,
    /// Upper bound on HELLO-to-WELCOME latency when joining a realm.
    pub session_open_timeout: Duration,
    /// Whether connect targets may be hostnames.
    ///
    /// When false, connecting requires a numeric socket address.
    pub use_hostname_resolution: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            socket_max_pending_write_bytes: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            session_open_timeout: Duration::from_secs(10),
            use_hostname_resolution: true,
        }
    }
}

/// The process-wide context shared by every peer and router in the process.
///
/// A kernel is immutable after construction. Peers and routers hold it for as
/// long as they live; the application creates it once and hands out clones of
/// the [`Arc`].
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
}

impl Kernel {
    /// Creates a new kernel with the given configuration.
    pub fn new(config: KernelConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// The kernel configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self {
            config: KernelConfig::default(),
        }
    }
}
