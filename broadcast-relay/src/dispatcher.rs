//! Broadcast dispatcher: fans each inbound message out to the registry.
//!
//! A broadcast is snapshot-then-iterate. The membership is copied once, the
//! message is formatted once, and every recipient gets its own non-blocking
//! enqueue. Recipients that vanished or fell behind are dealt with one by one
//! and never interrupt delivery to the rest.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    config::{RelayConfig, SlowConsumerPolicy},
    connection::ConnectionId,
    error::RelayError,
    message::{Formatter, Message},
    registry::Registry,
    stats::RelayStats,
};

/// How a broadcast picks and treats recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastPolicy {
    /// Leave the sender out of its own broadcast.
    pub exclude_originator: bool,
    pub slow_consumer: SlowConsumerPolicy,
}

impl BroadcastPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            exclude_originator: config.exclude_originator,
            slow_consumer: config.slow_consumer,
        }
    }
}

/// A recipient that did not get a frame.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub recipient: ConnectionId,
    pub error: RelayError,
}

/// Outcome of one broadcast, for logs, stats and tests. Never sent to clients.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Members targeted after applying the originator policy.
    pub recipients: usize,
    /// Frames successfully queued.
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_recipients(&self) -> Vec<ConnectionId> {
        self.failures.iter().map(|failure| failure.recipient).collect()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    policy: BroadcastPolicy,
    formatter: Formatter,
    stats: Arc<RelayStats>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        policy: BroadcastPolicy,
        formatter: Formatter,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            registry,
            policy,
            formatter,
            stats,
        }
    }

    pub fn from_config(
        registry: Arc<Registry>,
        config: &RelayConfig,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self::new(
            registry,
            BroadcastPolicy::from_config(config),
            config.formatter(),
            stats,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Broadcasts `message` to every member open at the moment of the call.
    pub fn on_message(&self, message: &Message) -> DispatchReport {
        self.stats.record_message();

        let frame = (self.formatter)(message);
        let originator = message.originator();
        let mut report = DispatchReport::default();

        for recipient in self.registry.snapshot() {
            if self.policy.exclude_originator && recipient == originator {
                continue;
            }
            report.recipients += 1;

            match self.registry.send(recipient, frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    self.handle_failure(originator, recipient, &error);
                    report.failures.push(DeliveryFailure { recipient, error });
                }
            }
        }

        self.stats.record_delivered(report.delivered as u64);
        report
    }

    /// Removes a connection that closed. Safe while a broadcast that already
    /// snapshotted `id` is still running; its send to `id` reports `NotFound`.
    pub fn on_disconnect(&self, id: ConnectionId) -> bool {
        self.registry.evict(id)
    }

    /// A write to `id` failed. Treated exactly like a disconnect.
    pub fn on_transport_error(&self, id: ConnectionId, error: &RelayError) -> bool {
        warn!(connection = %id, %error, "write failed; dropping connection");
        self.on_disconnect(id)
    }

    fn handle_failure(
        &self,
        originator: ConnectionId,
        recipient: ConnectionId,
        error: &RelayError,
    ) {
        match error {
            RelayError::QueueFull(_) => {
                self.stats.record_dropped();
                match self.policy.slow_consumer {
                    SlowConsumerPolicy::Drop => {
                        warn!(
                            connection = %recipient,
                            from = %originator,
                            "outbound queue full; dropping frame"
                        );
                    }
                    SlowConsumerPolicy::Disconnect => {
                        if self.on_disconnect(recipient) {
                            self.stats.record_slow_consumer_disconnected();
                            info!(connection = %recipient, "disconnected slow consumer");
                        }
                    }
                }
            }
            RelayError::NotFound(_) => {
                debug!(connection = %recipient, "recipient left before delivery");
            }
            other => {
                warn!(connection = %recipient, error = %other, "delivery failed");
            }
        }
    }
}
