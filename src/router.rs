//! Bridge routing and fan-out.
//!
//! For every ingress envelope the router resolves the source channel's
//! bridge, checks that the bridge is live, and enqueues one outbound copy
//! per member channel. Two guards keep overlapping bridges from producing
//! broadcast storms: split horizon (never send back out the source channel)
//! and the trace path (skip any destination the envelope already transited).
//! A routing failure never propagates; the envelope is logged and dropped.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::dedup::DedupFilter;
use crate::envelope::{endpoint_token, DestRef, Envelope};
use crate::queue::QueueManager;
use crate::repository::{BridgeStatus, Repository};

/// What happened to one ingress envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub enqueued: usize,
    pub skipped: usize,
}

pub struct Router {
    repository: Arc<Repository>,
    queues: Arc<QueueManager>,
    dedup: Arc<DedupFilter>,
}

impl Router {
    pub fn new(
        repository: Arc<Repository>,
        queues: Arc<QueueManager>,
        dedup: Arc<DedupFilter>,
    ) -> Self {
        Self {
            repository,
            queues,
            dedup,
        }
    }

    /// Full ingress pipeline: schema validation, duplicate suppression, then
    /// fan-out. Called for every `message.ingress` bus delivery.
    pub fn handle_ingress(&self, envelope: Envelope) -> RouteOutcome {
        if !envelope.validate() {
            warn!(envelope_id = %envelope.head.id, "Dropping schema-invalid envelope");
            return RouteOutcome::default();
        }
        if self.dedup.observe(&envelope) {
            return RouteOutcome::default();
        }
        self.route(envelope)
    }

    /// Resolve topology and enqueue per-destination copies. Assumes the
    /// envelope already passed validation and dedup.
    pub fn route(&self, mut envelope: Envelope) -> RouteOutcome {
        let source = &envelope.head.source;
        let link = match self
            .repository
            .channel_link(&source.platform, &source.channel_id)
        {
            Ok(Some(link)) => link,
            Ok(None) => {
                trace!(
                    envelope_id = %envelope.head.id,
                    source = %envelope.source_token(),
                    "Source channel not bridged"
                );
                return RouteOutcome::default();
            }
            Err(err) => {
                error!(
                    envelope_id = %envelope.head.id,
                    error = %err,
                    "Topology lookup failed, dropping envelope"
                );
                return RouteOutcome::default();
            }
        };

        if link.status != BridgeStatus::On {
            debug!(
                envelope_id = %envelope.head.id,
                bridge_id = %link.bridge_id,
                status = link.status.as_str(),
                "Bridge not active, dropping envelope"
            );
            return RouteOutcome::default();
        }

        let targets = match self.repository.bridge_topology(&link.bridge_id) {
            Ok(targets) => targets,
            Err(err) => {
                // Treat a failed topology read as an empty target set.
                error!(
                    envelope_id = %envelope.head.id,
                    bridge_id = %link.bridge_id,
                    error = %err,
                    "Topology read failed, dropping envelope"
                );
                return RouteOutcome::default();
            }
        };

        let source_token = envelope.source_token();
        if envelope.head.trace_path.is_empty() {
            envelope.head.trace_path.push(source_token.clone());
        } else if !envelope.head.trace_path.contains(&source_token) {
            envelope.head.trace_path.push(source_token.clone());
        }

        let mut outcome = RouteOutcome::default();
        for target in &targets {
            let target_token = endpoint_token(&target.platform, &target.native_id);

            // Split horizon: never back out the channel it came in on.
            if target_token == source_token {
                outcome.skipped += 1;
                continue;
            }
            // Loop guard: skip any hop the envelope already transited.
            if envelope.head.trace_path.contains(&target_token) {
                trace!(
                    envelope_id = %envelope.head.id,
                    target = %target_token,
                    "Target already in trace path, skipping"
                );
                outcome.skipped += 1;
                continue;
            }

            let mut outbound = envelope.clone();
            outbound.head.dest = Some(DestRef {
                platform: target.platform.clone(),
                channel_id: target.native_id.clone(),
            });
            outbound.head.trace_path.push(target_token.clone());

            let job_id = format!(
                "{}-{}-{}",
                envelope.head.id, target.platform, target.native_id
            );
            let accepted = self.queues.enqueue(&target.platform, job_id, outbound);
            if accepted {
                outcome.enqueued += 1;
            } else {
                // Per-target failure must not abort the fan-out for peers.
                debug!(
                    envelope_id = %envelope.head.id,
                    target = %target_token,
                    "Enqueue skipped (duplicate job id)"
                );
                outcome.skipped += 1;
            }
        }

        debug!(
            envelope_id = %envelope.head.id,
            bridge_id = %link.bridge_id,
            enqueued = outcome.enqueued,
            skipped = outcome.skipped,
            "Envelope routed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeParams, SourceRef};
    use crate::queue::queue_name;
    use crate::repository::LinkRequest;

    struct Fixture {
        repository: Arc<Repository>,
        queues: Arc<QueueManager>,
        router: Router,
        bridge_id: String,
    }

    fn fixture(channels: &[(&str, &str)]) -> Fixture {
        let repository = Arc::new(Repository::open_in_memory().unwrap());
        let bridge_id = repository.create_bridge("general").unwrap();
        for (platform, native_id) in channels {
            repository
                .link_channel(&LinkRequest {
                    bridge_id: bridge_id.clone(),
                    platform: platform.to_string(),
                    native_id: native_id.to_string(),
                    config: serde_json::json!({}),
                })
                .unwrap();
        }
        let queues = Arc::new(QueueManager::default());
        let router = Router::new(
            Arc::clone(&repository),
            Arc::clone(&queues),
            Arc::new(DedupFilter::default()),
        );
        Fixture {
            repository,
            queues,
            router,
            bridge_id,
        }
    }

    fn ingress(platform: &str, channel: &str, text: &str) -> Envelope {
        let mut source = SourceRef::new(platform, channel);
        source.user_id = "u1".to_string();
        Envelope::new(EnvelopeParams {
            source,
            text: text.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn pending(fixture: &Fixture, platform: &str) -> usize {
        fixture
            .queues
            .get(&queue_name(platform))
            .map(|q| q.stats().pending)
            .unwrap_or(0)
    }

    #[test]
    fn simple_fan_out_excludes_source() {
        // S1: three-channel bridge, ingress from discord.
        let fixture = fixture(&[
            ("discord", "c1"),
            ("telegram", "t1"),
            ("whatsapp", "w1"),
        ]);

        let outcome = fixture.router.handle_ingress(ingress("discord", "c1", "hi"));
        assert_eq!(outcome.enqueued, 2);
        assert_eq!(pending(&fixture, "telegram"), 1);
        assert_eq!(pending(&fixture, "whatsapp"), 1);
        assert_eq!(pending(&fixture, "discord"), 0);
    }

    #[test]
    fn trace_path_guard_stops_loops() {
        // S2: envelope already transited both member channels.
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);

        let mut env = ingress("telegram", "t1", "hi");
        env.head.trace_path = vec!["discord:c1".to_string(), "telegram:t1".to_string()];

        let outcome = fixture.router.handle_ingress(env);
        assert_eq!(outcome.enqueued, 0);
        assert_eq!(pending(&fixture, "discord"), 0);
    }

    #[test]
    fn paused_bridge_produces_no_enqueues() {
        // S3
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);
        fixture
            .repository
            .update_bridge_status(&fixture.bridge_id, BridgeStatus::Paused)
            .unwrap();

        let outcome = fixture.router.handle_ingress(ingress("discord", "c1", "hi"));
        assert_eq!(outcome.enqueued, 0);
    }

    #[test]
    fn off_bridge_produces_no_enqueues() {
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);
        fixture
            .repository
            .update_bridge_status(&fixture.bridge_id, BridgeStatus::Off)
            .unwrap();

        assert_eq!(
            fixture
                .router
                .handle_ingress(ingress("discord", "c1", "hi"))
                .enqueued,
            0
        );
    }

    #[test]
    fn unbridged_channel_drops_silently() {
        let fixture = fixture(&[("discord", "c1")]);
        let outcome = fixture
            .router
            .handle_ingress(ingress("stoat", "nowhere", "hi"));
        assert_eq!(outcome, RouteOutcome::default());
    }

    #[test]
    fn duplicate_ingress_is_suppressed() {
        // S5
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);

        let first = fixture.router.handle_ingress(ingress("discord", "c1", "ping"));
        assert_eq!(first.enqueued, 1);

        let second = fixture.router.handle_ingress(ingress("discord", "c1", "ping"));
        assert_eq!(second.enqueued, 0);
    }

    #[test]
    fn clones_have_independent_trace_paths() {
        let fixture = fixture(&[
            ("discord", "c1"),
            ("telegram", "t1"),
            ("whatsapp", "w1"),
        ]);
        fixture.router.handle_ingress(ingress("discord", "c1", "hi"));

        let telegram_job = &fixture
            .queues
            .get(&queue_name("telegram"))
            .unwrap()
            .pending_jobs()[0];
        let whatsapp_job = &fixture
            .queues
            .get(&queue_name("whatsapp"))
            .unwrap()
            .pending_jobs()[0];

        assert_eq!(
            telegram_job.envelope.head.trace_path,
            vec!["discord:c1".to_string(), "telegram:t1".to_string()]
        );
        assert_eq!(
            whatsapp_job.envelope.head.trace_path,
            vec!["discord:c1".to_string(), "whatsapp:w1".to_string()]
        );
    }

    #[test]
    fn outbound_copy_carries_dest_and_job_id() {
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);
        let env = ingress("discord", "c1", "hi");
        let env_id = env.head.id.clone();
        fixture.router.handle_ingress(env);

        let jobs = fixture
            .queues
            .get(&queue_name("telegram"))
            .unwrap()
            .pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, format!("{env_id}-telegram-t1"));

        let dest = jobs[0].envelope.head.dest.as_ref().unwrap();
        assert_eq!(dest.platform, "telegram");
        assert_eq!(dest.channel_id, "t1");
        assert_eq!(jobs[0].envelope.body.text, "hi");
    }

    #[test]
    fn trace_path_never_gains_duplicates() {
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);

        let mut env = ingress("discord", "c1", "hi");
        // Source token already present; the router must not append it again.
        env.head.trace_path = vec!["discord:c1".to_string()];
        fixture.router.route(env);

        let jobs = fixture
            .queues
            .get(&queue_name("telegram"))
            .unwrap()
            .pending_jobs();
        let trace = &jobs[0].envelope.head.trace_path;
        let unique: std::collections::HashSet<&String> = trace.iter().collect();
        assert_eq!(unique.len(), trace.len(), "duplicate tokens in {trace:?}");
        assert_eq!(trace[0], "discord:c1");
    }

    #[test]
    fn invalid_envelope_is_dropped() {
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);
        let mut env = ingress("discord", "c1", "hi");
        env.head.id = String::new();
        assert_eq!(fixture.router.handle_ingress(env).enqueued, 0);
    }

    #[test]
    fn channel_migration_reroutes() {
        // S6: moving (discord,c1) from B1 to B2.
        let fixture = fixture(&[("discord", "c1"), ("telegram", "t1")]);
        let b2 = fixture.repository.create_bridge("second").unwrap();
        fixture
            .repository
            .link_channel(&LinkRequest {
                bridge_id: b2.clone(),
                platform: "discord".to_string(),
                native_id: "c1".to_string(),
                config: serde_json::json!({}),
            })
            .unwrap();
        fixture
            .repository
            .link_channel(&LinkRequest {
                bridge_id: b2.clone(),
                platform: "stoat".to_string(),
                native_id: "s1".to_string(),
                config: serde_json::json!({}),
            })
            .unwrap();

        let link = fixture
            .repository
            .channel_link("discord", "c1")
            .unwrap()
            .unwrap();
        assert_eq!(link.bridge_id, b2);
        assert!(fixture
            .repository
            .bridge_topology(&fixture.bridge_id)
            .unwrap()
            .iter()
            .all(|t| t.platform != "discord"));

        let outcome = fixture.router.handle_ingress(ingress("discord", "c1", "hi"));
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(pending(&fixture, "stoat"), 1);
        assert_eq!(pending(&fixture, "telegram"), 0);
    }
}
