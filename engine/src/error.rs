//! Error types for engine configuration, engine runs, and network error classification.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Boxed error returned by driver factories and workers.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Cloneable error stored inside work results.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Errors in the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The engine needs at least one peer worker.
    ZeroWorkers,
    /// The engine needs at least one result writer.
    ZeroWriters,
    /// The status log interval must be positive.
    ZeroStatusInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroWorkers => write!(f, "Worker count must not be zero"),
            ConfigError::ZeroWriters => write!(f, "Writer count must not be zero"),
            ConfigError::ZeroStatusInterval => write!(f, "Status interval must not be zero"),
        }
    }
}

impl Error for ConfigError {}

/// Errors that can occur while constructing an [`Engine`](crate::Engine).
#[derive(Debug)]
pub enum EngineError {
    /// The supplied configuration violates an invariant.
    InvalidConfig(ConfigError),
    /// The driver failed to create a peer worker.
    NewWorker(BoxError),
    /// The driver failed to create a result writer.
    NewWriter(BoxError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfig(err) => write!(f, "Invalid engine configuration: {err}"),
            EngineError::NewWorker(err) => write!(f, "Failed to create peer worker: {err}"),
            EngineError::NewWriter(err) => write!(f, "Failed to create writer: {err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::InvalidConfig(err) => Some(err),
            EngineError::NewWorker(err) => Some(err.as_ref()),
            EngineError::NewWriter(err) => Some(err.as_ref()),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::InvalidConfig(err)
    }
}

/// Returned by [`Engine::run`](crate::Engine::run) when the run was cancelled.
///
/// Carries the peers that were still queued at the time of cancellation.
#[derive(Debug)]
pub struct Cancelled<I> {
    /// Peers that were queued but never handed to a worker, by key.
    pub remaining: HashMap<String, I>,
}

impl<I> fmt::Display for Cancelled<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Engine run cancelled with {} peers remaining",
            self.remaining.len()
        )
    }
}

impl<I: fmt::Debug> Error for Cancelled<I> {}

/// A peer had no address left after address type filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoPublicAddrs;

impl fmt::Display for NoPublicAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipping node as it has no public IP address")
    }
}

impl Error for NoPublicAddrs {}

/// Known kinds of network errors.
///
/// Every peer level error is mapped onto one of these kinds before it is
/// aggregated or stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetError {
    IoTimeout,
    ConnectionRefused,
    ConnectionResetByPeer,
    ProtocolNotSupported,
    PeerIdMismatch,
    NoRouteToHost,
    NetworkUnreachable,
    NoGoodAddresses,
    DeadlineExceeded,
    NoPublicIp,
    MaxDialAttemptsExceeded,
    HostIsDown,
    StreamReset,
    NegotiateSecurityProtocol,
    NegotiateStreamMultiplexer,
    ResourceLimitExceeded,
    WriteOnStream,
    ConnectionGated,
    CantAssignRequestedAddress,
    CantConnectOverRelay,
    NoTransportForProtocol,
    Unknown,
}

/// Substrings mapped to error kinds, in matching order.
///
/// "peer id mismatch" must be checked before "failed to negotiate security
/// protocol" because the former is always part of the latter.
const KNOWN_ERRORS: &[(&str, NetError)] = &[
    ("i/o timeout", NetError::IoTimeout),
    ("rpc timeout", NetError::IoTimeout),
    ("no recent network activity", NetError::IoTimeout),
    ("timed out", NetError::IoTimeout),
    ("cannot assign requested address", NetError::CantAssignRequestedAddress),
    ("can't assign requested address", NetError::CantAssignRequestedAddress),
    ("connection gated", NetError::ConnectionGated),
    ("connection refused", NetError::ConnectionRefused),
    ("connection reset by peer", NetError::ConnectionResetByPeer),
    ("protocol not supported", NetError::ProtocolNotSupported),
    ("protocols not supported", NetError::ProtocolNotSupported),
    ("peer id mismatch", NetError::PeerIdMismatch),
    ("peer ids don't match", NetError::PeerIdMismatch),
    ("no route to host", NetError::NoRouteToHost),
    ("network is unreachable", NetError::NetworkUnreachable),
    ("no good addresses", NetError::NoGoodAddresses),
    ("deadline exceeded", NetError::DeadlineExceeded),
    ("no public ip address", NetError::NoPublicIp),
    ("max dial attempts exceeded", NetError::MaxDialAttemptsExceeded),
    ("host is down", NetError::HostIsDown),
    ("stream reset", NetError::StreamReset),
    ("stream closed", NetError::StreamReset),
    ("failed to negotiate stream multiplexer", NetError::NegotiateStreamMultiplexer),
    ("resource limit exceeded", NetError::ResourceLimitExceeded),
    ("write on stream", NetError::WriteOnStream),
    ("resource_limit_exceeded (201)", NetError::CantConnectOverRelay),
    ("no_reservation (204)", NetError::CantConnectOverRelay),
    ("relay failed with a protocol error", NetError::CantConnectOverRelay),
    ("opening relay circuit: connection_failed (203)", NetError::CantConnectOverRelay),
    ("no transport for protocol", NetError::NoTransportForProtocol),
    ("handshake did not complete in time", NetError::IoTimeout),
    ("failed to negotiate security protocol", NetError::NegotiateSecurityProtocol),
];

impl NetError {
    /// Maps an error onto a known kind.
    ///
    /// The `source()` chain is walked from the innermost cause outwards and
    /// the first cause that maps onto a known kind wins.
    pub fn classify(err: &(dyn Error + 'static)) -> NetError {
        let mut chain = vec![err];
        let mut current = err;
        while let Some(source) = current.source() {
            chain.push(source);
            current = source;
        }

        chain
            .into_iter()
            .rev()
            .map(Self::classify_single)
            .find(|kind| *kind != NetError::Unknown)
            .unwrap_or(NetError::Unknown)
    }

    fn classify_single(err: &(dyn Error + 'static)) -> NetError {
        let message = err.to_string().to_lowercase();
        if let Some((_, kind)) = KNOWN_ERRORS
            .iter()
            .find(|(needle, _)| message.contains(needle))
        {
            return *kind;
        }

        match err.downcast_ref::<io::Error>().map(io::Error::kind) {
            Some(io::ErrorKind::TimedOut) => NetError::IoTimeout,
            Some(io::ErrorKind::ConnectionRefused) => NetError::ConnectionRefused,
            Some(io::ErrorKind::ConnectionReset) => NetError::ConnectionResetByPeer,
            Some(io::ErrorKind::AddrNotAvailable) => NetError::CantAssignRequestedAddress,
            _ => NetError::Unknown,
        }
    }

    /// Returns the stable string stored alongside visits.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetError::IoTimeout => "io_timeout",
            NetError::ConnectionRefused => "connection_refused",
            NetError::ConnectionResetByPeer => "connection_reset_by_peer",
            NetError::ProtocolNotSupported => "protocol_not_supported",
            NetError::PeerIdMismatch => "peer_id_mismatch",
            NetError::NoRouteToHost => "no_route_to_host",
            NetError::NetworkUnreachable => "network_unreachable",
            NetError::NoGoodAddresses => "no_good_addresses",
            NetError::DeadlineExceeded => "context_deadline_exceeded",
            NetError::NoPublicIp => "no_public_ip",
            NetError::MaxDialAttemptsExceeded => "max_dial_attempts_exceeded",
            NetError::HostIsDown => "host_is_down",
            NetError::StreamReset => "stream_reset",
            NetError::NegotiateSecurityProtocol => "negotiate_security_protocol",
            NetError::NegotiateStreamMultiplexer => "negotiate_stream_multiplexer",
            NetError::ResourceLimitExceeded => "resource_limit_exceeded",
            NetError::WriteOnStream => "write_on_stream",
            NetError::ConnectionGated => "connection_gated",
            NetError::CantAssignRequestedAddress => "cant_assign_requested_address",
            NetError::CantConnectOverRelay => "cant_connect_over_relay",
            NetError::NoTransportForProtocol => "no_transport_for_protocol",
            NetError::Unknown => "unknown",
        }
    }

    /// Checks if a failed connection attempt with this kind is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionRefused
                | NetError::ConnectionGated
                | NetError::CantAssignRequestedAddress
                | NetError::CantConnectOverRelay
        )
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped {
        message: &'static str,
        source: Option<Box<dyn Error + 'static>>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.source.as_deref()
        }
    }

    fn plain(message: &'static str) -> Wrapped {
        Wrapped {
            message,
            source: None,
        }
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(NetError::classify(&plain("dial tcp: i/o timeout")), NetError::IoTimeout);
        assert_eq!(
            NetError::classify(&plain("dial backoff: connection refused")),
            NetError::ConnectionRefused
        );
        assert_eq!(
            NetError::classify(&plain("RPC timeout")),
            NetError::IoTimeout
        );
        assert_eq!(
            NetError::classify(&plain("something unexpected")),
            NetError::Unknown
        );
        assert_eq!(
            NetError::classify(&NoPublicAddrs),
            NetError::NoPublicIp
        );
    }

    #[test]
    fn test_classify_precedence() {
        let err = plain("failed to negotiate security protocol: peer id mismatch: expected Qm");
        assert_eq!(NetError::classify(&err), NetError::PeerIdMismatch);

        let err = plain("failed to negotiate security protocol: EOF");
        assert_eq!(NetError::classify(&err), NetError::NegotiateSecurityProtocol);
    }

    #[test]
    fn test_classify_prefers_inner_cause() {
        let err = Wrapped {
            message: "stream reset while crawling",
            source: Some(Box::new(plain("connection reset by peer"))),
        };
        assert_eq!(NetError::classify(&err), NetError::ConnectionResetByPeer);

        let err = Wrapped {
            message: "stream reset while crawling",
            source: Some(Box::new(plain("opaque inner failure"))),
        };
        assert_eq!(NetError::classify(&err), NetError::StreamReset);
    }

    #[test]
    fn test_classify_io_kinds() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "read");
        assert_eq!(NetError::classify(&err), NetError::IoTimeout);

        let err = plain("context deadline exceeded");
        assert_eq!(NetError::classify(&err), NetError::DeadlineExceeded);

        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(NetError::classify(&err), NetError::ConnectionRefused);

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "boom");
        assert_eq!(NetError::classify(&err), NetError::ConnectionResetByPeer);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(NetError::ConnectionRefused.is_transient());
        assert!(NetError::ConnectionGated.is_transient());
        assert!(!NetError::IoTimeout.is_transient());
        assert!(!NetError::Unknown.is_transient());
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            EngineError::from(ConfigError::ZeroWorkers).to_string(),
            "Invalid engine configuration: Worker count must not be zero"
        );
    }
}
