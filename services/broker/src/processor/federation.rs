//! Federation-side processor logic: ingress from the wider federation,
//! egress into the local collective.

use super::{ProcessContext, ProcessorLogic, QueueSpec};
use crate::config::BrokerConfig;
use crate::{BrokerError, BrokerResult};
use protocol::{Envelope, ProtocolError, RoutingInstruction};

/// Requests arriving from the federation fan out to every target subject in
/// the local collective. The rewrite stashes the requester's reply address in
/// `federation.reply-to` and points `headers.reply-to` at this broker's own
/// collective-facing subject, so replies from the fleet are addressed back
/// into the bridge.
pub struct FederationLogic;

impl ProcessorLogic for FederationLogic {
    fn side(&self) -> &'static str {
        "federation"
    }

    fn servers(&self, config: &BrokerConfig) -> BrokerResult<Vec<String>> {
        if config.federation.servers.is_empty() {
            return Err(BrokerError::Config(
                "no federation servers configured, cannot join the federation".into(),
            ));
        }
        Ok(config.federation.servers.clone())
    }

    fn queue_spec(&self, cluster: &str) -> QueueSpec {
        QueueSpec {
            subject: protocol::federation_subject(cluster),
            queue_group: Some(protocol::federation_queue_group(cluster)),
        }
    }

    fn should_process(&self, envelope: &Envelope) -> bool {
        envelope
            .federation()
            .map(|f| f.target.as_ref().map(|t| !t.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn process(
        &self,
        mut envelope: Envelope,
        ctx: &ProcessContext,
    ) -> BrokerResult<RoutingInstruction> {
        let headers = envelope.headers_mut()?;

        let stashed = headers.reply_to.replace(ctx.collective_subject.clone());
        let (targets, req) = {
            let federation = headers
                .federation
                .as_mut()
                .ok_or(ProtocolError::MissingFederation)?;
            federation.reply_to = stashed;
            (
                federation.target.clone().unwrap_or_default(),
                federation.req.clone(),
            )
        };

        headers.record_seen(ctx.hop());

        let data = envelope.to_json()?;
        Ok(RoutingInstruction::new(targets, req, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ProcessContext {
        ProcessContext {
            instance_id: "prod:fed1".to_string(),
            inbound_server: "federation-nats:4222".to_string(),
            outbound_server: "collective-nats:4222".to_string(),
            collective_subject: protocol::collective_subject("prod"),
        }
    }

    #[test]
    fn test_rewrite_fans_out_and_redirects_replies() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","reply-to":"x","target":["t1","t2"]},"reply-to":"fed.reply.9"}}"#,
        )
        .unwrap();

        let instruction = FederationLogic.process(envelope, &ctx()).unwrap();

        assert_eq!(instruction.targets, vec!["t1", "t2"]);
        assert_eq!(instruction.req, "r1");

        let forwarded = Envelope::from_slice(instruction.data.as_bytes()).unwrap();
        let headers = forwarded.headers().unwrap();

        // the requester's reply address is stashed for the trip back,
        // replacing whatever the federation block held before
        assert_eq!(
            headers.federation.as_ref().unwrap().reply_to.as_deref(),
            Some("fed.reply.9")
        );
        // local replies are addressed back into this bridge
        assert_eq!(
            headers.reply_to.as_deref(),
            Some("choria.federation.prod.collective")
        );
    }

    #[test]
    fn test_request_without_reply_address_clears_the_stash() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","reply-to":"stale","target":["t1"]}}}"#,
        )
        .unwrap();

        let instruction = FederationLogic.process(envelope, &ctx()).unwrap();
        let forwarded = Envelope::from_slice(instruction.data.as_bytes()).unwrap();

        assert!(forwarded
            .federation()
            .unwrap()
            .reply_to
            .is_none());
    }

    #[test]
    fn test_gate_requires_targets() {
        let no_target =
            Envelope::from_slice(br#"{"headers":{"federation":{"req":"r1"}}}"#).unwrap();
        assert!(!FederationLogic.should_process(&no_target));

        let empty_target = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","target":[]}}}"#,
        )
        .unwrap();
        assert!(!FederationLogic.should_process(&empty_target));

        let no_headers = Envelope::from_slice(br#"{"agent":"x"}"#).unwrap();
        assert!(!FederationLogic.should_process(&no_headers));
    }

    #[test]
    fn test_seen_by_grows_by_exactly_one_hop() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","target":["t1"]},"seen-by":[["a","b","c"],["d","e","f"]]}}"#,
        )
        .unwrap();

        let instruction = FederationLogic.process(envelope, &ctx()).unwrap();
        let forwarded = Envelope::from_slice(instruction.data.as_bytes()).unwrap();
        let seen = forwarded.headers().unwrap().seen_by.clone().unwrap();

        assert_eq!(seen.len(), 3);
        // existing entries untouched
        assert_eq!(seen[0].0, "a");
        assert_eq!(seen[1].2, "f");
        assert_eq!(seen[2].0, "federation-nats:4222");
        assert_eq!(seen[2].1, "prod:fed1");
        assert_eq!(seen[2].2, "collective-nats:4222");
    }

    #[test]
    fn test_untraceable_messages_stay_untraceable() {
        let envelope = Envelope::from_slice(
            br#"{"headers":{"federation":{"req":"r1","target":["t1"]}}}"#,
        )
        .unwrap();

        let instruction = FederationLogic.process(envelope, &ctx()).unwrap();
        assert!(!instruction.data.contains("seen-by"));
    }

    #[test]
    fn test_queue_spec_is_cluster_scoped() {
        let spec = FederationLogic.queue_spec("prod");
        assert_eq!(spec.subject, "choria.federation.prod.federation");
        assert_eq!(spec.queue_group.as_deref(), Some("prod_federation"));
    }
}
