//! Collective-side processor logic: ingress from the local fleet, egress
//! toward the federation.

use super::{ProcessContext, ProcessorLogic, QueueSpec};
use crate::config::BrokerConfig;
use crate::{BrokerError, BrokerResult};
use protocol::{Envelope, RoutingInstruction};

/// Messages arriving on the collective side carry the federation reply
/// address stashed by the federation processor on the way in. The rewrite
/// pops that address back out: the instruction targets exactly the one
/// reply subject, and `federation.reply-to` is removed from the envelope.
pub struct CollectiveLogic;

impl ProcessorLogic for CollectiveLogic {
    fn side(&self) -> &'static str {
        "collective"
    }

    fn servers(&self, config: &BrokerConfig) -> BrokerResult<Vec<String>> {
        if config.collective.servers.is_empty() {
            return Err(BrokerError::Config(
                "no collective servers configured".into(),
            ));
        }
        Ok(config.collective.servers.clone())
    }

    fn queue_spec(&self, cluster: &str) -> QueueSpec {
        QueueSpec {
            subject: protocol::collective_subject(cluster),
            queue_group: Some(protocol::collective_queue_group(cluster)),
        }
    }

    fn should_process(&self, envelope: &Envelope) -> bool {
        envelope.is_federated()
    }

    fn process(
        &self,
        mut envelope: Envelope,
        ctx: &ProcessContext,
    ) -> BrokerResult<RoutingInstruction> {
        let federation = envelope.federation_mut()?;
        let reply_to = federation.reply_to.take();
        let req = federation.req.clone();

        envelope.headers_mut()?.record_seen(ctx.hop());

        let data = envelope.to_json()?;
        Ok(RoutingInstruction::new(
            reply_to.into_iter().collect(),
            req,
            data,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ProtocolError;

    fn ctx() -> ProcessContext {
        ProcessContext {
            instance_id: "prod:fed1".to_string(),
            inbound_server: "collective-nats:4222".to_string(),
            outbound_server: "federation-nats:4222".to_string(),
            collective_subject: protocol::collective_subject("prod"),
        }
    }

    #[test]
    fn test_rewrite_targets_the_stashed_reply_address() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","reply-to":"fed.reply.1"}},"agent":"rpcutil"}"#,
        )
        .unwrap();

        let instruction = CollectiveLogic.process(envelope, &ctx()).unwrap();

        assert_eq!(instruction.targets, vec!["fed.reply.1"]);
        assert_eq!(instruction.req, "r1");

        // federation.reply-to is removed, opaque fields survive
        let forwarded = Envelope::from_slice(instruction.data.as_bytes()).unwrap();
        assert!(forwarded.federation().unwrap().reply_to.is_none());
        assert_eq!(forwarded.body["agent"], "rpcutil");
    }

    #[test]
    fn test_missing_federation_block_is_an_error() {
        let envelope = Envelope::from_slice(br#"{"headers":{}}"#).unwrap();
        assert!(!CollectiveLogic.should_process(&envelope));

        let result = CollectiveLogic.process(envelope, &ctx());
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::MissingFederation))
        ));
    }

    #[test]
    fn test_missing_reply_address_cannot_be_routed() {
        let envelope =
            Envelope::from_slice(br#"{"headers":{"federation":{"req":"r1"}}}"#).unwrap();

        let result = CollectiveLogic.process(envelope, &ctx());
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::EmptyTargets))
        ));
    }

    #[test]
    fn test_traceable_replies_gain_a_hop_record() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","reply-to":"fed.reply.1"},"seen-by":[["x","y","z"]]}}"#,
        )
        .unwrap();

        let instruction = CollectiveLogic.process(envelope, &ctx()).unwrap();
        let forwarded = Envelope::from_slice(instruction.data.as_bytes()).unwrap();
        let seen = forwarded.headers().unwrap().seen_by.clone().unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "x");
        assert_eq!(seen[1].0, "collective-nats:4222");
        assert_eq!(seen[1].1, "prod:fed1");
        assert_eq!(seen[1].2, "federation-nats:4222");
    }

    #[test]
    fn test_queue_spec_is_cluster_scoped() {
        let spec = CollectiveLogic.queue_spec("prod");
        assert_eq!(spec.subject, "choria.federation.prod.collective");
        assert_eq!(spec.queue_group.as_deref(), Some("prod_collective"));
    }

    #[test]
    fn test_servers_require_configuration() {
        let config: BrokerConfig = toml::from_str(r#"cluster = "prod""#).unwrap();
        assert!(matches!(
            CollectiveLogic.servers(&config),
            Err(BrokerError::Config(_))
        ));
    }
}
