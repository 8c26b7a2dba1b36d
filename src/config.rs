//! Configuration types for the RPC runtime.

use crate::error::{Error, Result};

/// Highest NUMA node id accepted by [`RpcConfig::validate`].
const MAX_NUMA_NODE: u8 = 7;

/// Endpoint configuration.
///
/// Controls request multiplexing, flow control, reliability parameters and
/// the background handler pool.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (concurrent exchanges per session), 1..=8.
    /// Default: 8
    pub req_window: usize,
    /// Request/response payload ceiling in bytes.
    /// Default: 1 MiB
    pub max_msg_size: usize,
    /// Transport inline-copy threshold in bytes.
    /// Default: 64
    pub inline_size: usize,
    /// Retransmission timeout in microseconds.
    /// Default: 5000 (5ms)
    pub rto_us: u64,
    /// Maximum number of datapath retransmission attempts.
    /// Default: 5
    pub max_retries: u32,
    /// Interval between session-management retries, in microseconds.
    /// Default: 20_000 (20ms)
    pub sm_retry_interval_us: u64,
    /// Session-management retry budget.
    /// Default: 25
    pub sm_max_retries: u32,
    /// Retry the connect handshake after a negative ACK carrying
    /// `InvalidRemoteRpcId`, instead of failing the session.
    /// Default: false
    pub retry_connect_on_invalid_remote_id: bool,
    /// Enable creator-thread and reentrancy assertions on the datapath.
    /// Default: true
    pub datapath_checks: bool,
    /// Maximum number of sessions in the table.
    /// Default: 64
    pub max_sessions: usize,
    /// Number of MTU-sized packet buffers in the pool.
    /// Default: 512
    pub num_pkt_buffers: usize,
    /// Maximum number of outstanding user message buffers.
    /// Default: 256
    pub max_msg_buffers: usize,
    /// Responses held back until this many are pending or an idle iteration
    /// is observed.
    /// Default: 1 (no batching)
    pub resp_batch_size: usize,
    /// Number of background handler threads. 0 runs every handler inline.
    /// Default: 0
    pub num_bg_threads: usize,
    /// NUMA node the endpoint claims to run on. Checked for range only;
    /// pinning is the caller's concern.
    /// Default: None
    pub numa_node: Option<u8>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            max_msg_size: 1 << 20,
            inline_size: 64,
            rto_us: 5000,
            max_retries: 5,
            sm_retry_interval_us: 20_000,
            sm_max_retries: 25,
            retry_connect_on_invalid_remote_id: false,
            datapath_checks: true,
            max_sessions: 64,
            num_pkt_buffers: 512,
            max_msg_buffers: 256,
            resp_batch_size: 1,
            num_bg_threads: 0,
            numa_node: None,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    /// Set the message size ceiling.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the inline-copy threshold.
    pub fn with_inline_size(mut self, inline_size: usize) -> Self {
        self.inline_size = inline_size;
        self
    }

    /// Set the retransmission timeout.
    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    /// Set the maximum datapath retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the session-management retry interval.
    pub fn with_sm_retry_interval_us(mut self, us: u64) -> Self {
        self.sm_retry_interval_us = us;
        self
    }

    /// Set the session-management retry budget.
    pub fn with_sm_max_retries(mut self, n: u32) -> Self {
        self.sm_max_retries = n;
        self
    }

    /// Retry connects rejected with an invalid remote endpoint id.
    pub fn with_retry_connect_on_invalid_remote_id(mut self, retry: bool) -> Self {
        self.retry_connect_on_invalid_remote_id = retry;
        self
    }

    /// Enable or disable datapath misuse assertions.
    pub fn with_datapath_checks(mut self, on: bool) -> Self {
        self.datapath_checks = on;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the packet buffer pool size.
    pub fn with_num_pkt_buffers(mut self, n: usize) -> Self {
        self.num_pkt_buffers = n;
        self
    }

    /// Set the response batch size.
    pub fn with_resp_batch_size(mut self, n: usize) -> Self {
        self.resp_batch_size = n;
        self
    }

    /// Set the number of background handler threads.
    pub fn with_bg_threads(mut self, n: usize) -> Self {
        self.num_bg_threads = n;
        self
    }

    /// Set the NUMA node.
    pub fn with_numa_node(mut self, node: u8) -> Self {
        self.numa_node = Some(node);
        self
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.req_window == 0 || self.req_window > 8 {
            return Err(Error::InvalidConfig(format!(
                "req_window must be in 1..=8, got {}",
                self.req_window
            )));
        }
        if self.max_msg_size == 0 {
            return Err(Error::InvalidConfig("max_msg_size cannot be 0".into()));
        }
        if self.max_sessions == 0 || self.max_sessions > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in 1..={}, got {}",
                u16::MAX,
                self.max_sessions
            )));
        }
        if self.num_pkt_buffers == 0 {
            return Err(Error::InvalidConfig("num_pkt_buffers cannot be 0".into()));
        }
        if self.resp_batch_size == 0 {
            return Err(Error::InvalidConfig("resp_batch_size cannot be 0".into()));
        }
        if let Some(node) = self.numa_node {
            if node > MAX_NUMA_NODE {
                return Err(Error::InvalidConfig(format!(
                    "numa_node must be <= {}, got {}",
                    MAX_NUMA_NODE, node
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_req_window(4)
            .with_rto_us(10_000)
            .with_max_retries(3)
            .with_bg_threads(2);

        assert_eq!(config.req_window, 4);
        assert_eq!(config.rto_us, 10_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.num_bg_threads, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_window() {
        assert!(RpcConfig::default().with_req_window(0).validate().is_err());
        assert!(RpcConfig::default().with_req_window(9).validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_numa_node() {
        assert!(RpcConfig::default().with_numa_node(42).validate().is_err());
        assert!(RpcConfig::default().with_numa_node(0).validate().is_ok());
    }
}
