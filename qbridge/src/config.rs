use derive_builder::Builder;
use getset::CopyGetters;
use qbuf::ReceivePolicy;

/// Tuning of an [`Acceptor`](crate::acceptor::Acceptor).
///
/// ``` rust
/// # use qbridge::config::AcceptorConfig;
/// let config = AcceptorConfig::builder()
///     .max_datagrams_per_event(16usize)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_datagrams_per_event(), 16);
/// assert_eq!(config.drain_batch(), 16);
/// ```
#[derive(Builder, CopyGetters, Debug, Clone, Copy, PartialEq, Eq)]
#[builder(default, setter(into), build_fn(validate = "Self::validate"))]
#[getset(get_copy = "pub")]
pub struct AcceptorConfig {
    /// How many datagrams one readable event receives at most.
    max_datagrams_per_event: usize,
    /// Bytes reserved for one received datagram.
    recv_buffer_size: usize,
    /// Datagrams requested from the engine per drain call.
    drain_batch: usize,
    /// Drain calls per pump of one connection.
    max_drain_rounds: usize,
    /// Initiation packets in smaller datagrams are dropped, RFC 9000 §14.1.
    min_initial_datagram_size: usize,
    /// The receive policy of a newly created stream.
    default_receive_policy: ReceivePolicy,
    /// Answer unsupported versions with a version negotiation packet.
    version_negotiation: bool,
    /// Answer stray short header packets with a stateless reset.
    stateless_reset: bool,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            max_datagrams_per_event: 64,
            recv_buffer_size: qsock::MAX_DATAGRAM_SIZE,
            drain_batch: 16,
            max_drain_rounds: 8,
            min_initial_datagram_size: 1200,
            default_receive_policy: ReceivePolicy::at_most(1024),
            version_negotiation: true,
            stateless_reset: true,
        }
    }
}

impl AcceptorConfig {
    pub fn builder() -> AcceptorConfigBuilder {
        AcceptorConfigBuilder::default()
    }
}

impl AcceptorConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_datagrams_per_event == Some(0) {
            return Err("max_datagrams_per_event must be positive".into());
        }
        if self.drain_batch == Some(0) || self.max_drain_rounds == Some(0) {
            return Err("drain_batch and max_drain_rounds must be positive".into());
        }
        let min_initial = self.min_initial_datagram_size.unwrap_or(1200);
        match self.recv_buffer_size {
            Some(size) if size < min_initial => Err(format!(
                "recv_buffer_size {size} cannot hold a minimal initial datagram"
            )),
            _ => Ok(()),
        }
    }
}
