//! Topology-validated mail delivery.
//!
//! The router is the only component that consults [`Topology::can_send`].
//! It never raises to its caller: a rejected mail becomes a bounce, an
//! undeliverable bounce goes to the dead-letter directory, and every
//! outcome is announced on the event bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use apiary_core::{HiveError, HiveEvent, HiveResult, Mail, MailStatus, NodeId, Topology};
use apiary_store::{mail_store, DataRoot, HumanStore};
use tokio::sync::RwLock;

use crate::bus::EventBus;

/// Write-retry schedule for inbox delivery.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Terminal disposition of one `route()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to an agent or mailbox inbox.
    Delivered,
    /// Appended to the human inbox store.
    DeliveredToHuman,
    /// Rejected or failed; a bounce reached the sender.
    Bounced,
    /// A bounce that could not be delivered; parked in `deadletter/`.
    DeadLettered,
    /// The mail file itself was unusable and was poisoned.
    Poisoned,
}

pub struct MailRouter {
    root: DataRoot,
    topology: RwLock<Arc<Topology>>,
    human_inbox: Arc<HumanStore>,
    bus: Arc<EventBus>,
}

impl MailRouter {
    pub fn new(
        root: DataRoot,
        topology: Arc<Topology>,
        human_inbox: Arc<HumanStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            root,
            topology: RwLock::new(topology),
            human_inbox,
            bus,
        }
    }

    /// Swap in a new topology snapshot. In-flight routes keep the snapshot
    /// they observed at entry.
    pub async fn set_topology(&self, topology: Arc<Topology>) {
        *self.topology.write().await = topology;
    }

    pub async fn topology(&self) -> Arc<Topology> {
        self.topology.read().await.clone()
    }

    /// Synchronous route check for gateway sends.
    pub async fn check_route(&self, from: &NodeId, to: &NodeId) -> HiveResult<()> {
        if self.topology().await.can_send(from, to) {
            Ok(())
        } else {
            Err(HiveError::NoRoute {
                from: from.clone(),
                to: to.clone(),
            })
        }
    }

    /// Route one mail to its destination. Never raises: every failure mode
    /// ends in a bounce, a dead-letter, or an event.
    pub async fn route(&self, mail: Mail) -> RouteOutcome {
        let mail = match mail.status {
            MailStatus::Queued => mail,
            _ => mail.with_status(MailStatus::Queued),
        };

        let topology = self.topology().await;
        if !topology.can_send(&mail.from, &mail.to) {
            let reason = format!("no route from '{}' to '{}'", mail.from, mail.to);
            return self.bounce(mail, reason).await;
        }

        match self.deliver(mail.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = format!("delivery to '{}' failed: {err}", mail.to);
                self.bus.publish(HiveEvent::MailFailed {
                    mail_id: Some(mail.id),
                    reason: reason.clone(),
                });
                self.bounce(mail, reason).await
            }
        }
    }

    /// Consume one file from a source outbox: spool it into `inflight/`,
    /// route it, and clear the spool entry once routing has run to
    /// completion. Corrupt files are quarantined where they were found.
    pub async fn consume_outbox_file(&self, path: &Path) -> RouteOutcome {
        let mail = match mail_store::read_mail(path).await {
            Ok(mail) => mail,
            Err(err) => return self.quarantine(path, err).await,
        };

        // The spool rename is the at-least-once handoff point: after it, a
        // crash leaves the mail recoverable from inflight/.
        let spooled = match mail_store::move_into(path, &self.root.inflight_dir()).await {
            Ok(spooled) => spooled,
            Err(err) => {
                self.bus.publish(HiveEvent::MailFailed {
                    mail_id: Some(mail.id),
                    reason: format!("inflight spool failed: {err}"),
                });
                return RouteOutcome::Poisoned;
            }
        };

        self.bus.publish(HiveEvent::MailSent {
            mail: Box::new(mail.clone()),
        });

        let outcome = self.route(mail).await;
        if let Err(err) = tokio::fs::remove_file(&spooled).await {
            tracing::warn!(file = %spooled.display(), error = %err, "failed to clear inflight entry");
        }
        outcome
    }

    /// Re-route everything left in the spool by a previous process. Each
    /// entry is evaluated against the current topology, exactly as if it
    /// had just been taken from its source outbox.
    pub async fn recover_inflight(&self) -> HiveResult<usize> {
        let inflight = self.root.inflight_dir();
        let files = mail_store::list_queue(&inflight).await?;
        let mut recovered = 0;
        for path in files {
            let mail = match mail_store::read_mail(&path).await {
                Ok(mail) => mail,
                Err(err) => {
                    self.quarantine(&path, err).await;
                    continue;
                }
            };
            let outcome = self.route(mail).await;
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(file = %path.display(), error = %err, "failed to clear inflight entry");
            }
            tracing::info!(file = %path.display(), ?outcome, "recovered inflight mail");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Deliver to the destination queue without topology validation.
    async fn deliver(&self, mail: Mail) -> HiveResult<RouteOutcome> {
        if mail.to.is_human() {
            let delivered = mail.with_status(MailStatus::Delivered);
            self.human_inbox.append(delivered.clone()).await?;
            self.bus.publish(HiveEvent::MailReceived {
                mail: Box::new(delivered),
            });
            return Ok(RouteOutcome::DeliveredToHuman);
        }

        let inbox = self.root.inbox_for(&mail.to)?;
        let routed = mail.with_status(MailStatus::Routed);
        self.write_with_retry(&inbox, &routed).await?;
        self.bus.publish(HiveEvent::MailRouted {
            mail: Box::new(routed),
        });
        Ok(RouteOutcome::Delivered)
    }

    async fn write_with_retry(&self, dir: &Path, mail: &Mail) -> HiveResult<()> {
        let mut last_err = None;
        for (attempt, backoff) in std::iter::once(Duration::ZERO)
            .chain(RETRY_BACKOFF)
            .enumerate()
        {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            match mail_store::write_mail(dir, mail).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        dir = %dir.display(),
                        error = %err,
                        "inbox write failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HiveError::Validation("retry loop underflow".into())))
    }

    /// Produce and deliver a bounce for `mail`. One-shot: a bounce that
    /// cannot itself be delivered is dead-lettered, never re-bounced.
    async fn bounce(&self, mail: Mail, reason: String) -> RouteOutcome {
        if mail.is_bounce() {
            // A failing bounce must not generate another bounce.
            return self.deadletter(mail, &reason).await;
        }

        let bounce = mail.bounce(&reason);
        match self.deliver(bounce.clone()).await {
            Ok(_) => {
                self.bus.publish(HiveEvent::MailBounced {
                    mail: Box::new(bounce),
                    bounce_reason: reason,
                });
                RouteOutcome::Bounced
            }
            Err(err) => {
                let detail = format!("{reason}; bounce undeliverable: {err}");
                self.deadletter(bounce, &detail).await
            }
        }
    }

    async fn deadletter(&self, mail: Mail, reason: &str) -> RouteOutcome {
        let parked = mail.with_status(MailStatus::Failed);
        match mail_store::write_mail(&self.root.deadletter_dir(), &parked).await {
            Ok(path) => {
                tracing::warn!(file = %path.display(), reason, "mail dead-lettered");
            }
            Err(err) => {
                tracing::error!(mail_id = %parked.id, error = %err, "dead-letter write failed");
            }
        }
        RouteOutcome::DeadLettered
    }

    async fn quarantine(&self, path: &Path, err: HiveError) -> RouteOutcome {
        let reason = err.to_string();
        if let Err(poison_err) = mail_store::poison(path, &reason).await {
            tracing::error!(
                file = %path.display(),
                error = %poison_err,
                "failed to quarantine corrupt mail"
            );
        }
        self.bus.publish(HiveEvent::MailFailed {
            mail_id: None,
            reason,
        });
        RouteOutcome::Poisoned
    }
}
