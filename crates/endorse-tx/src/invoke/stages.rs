//! Built-in pipeline stages.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::seq::SliceRandom;

use super::{Handler, InvokeError, Next, RequestContext, TargetFailure};
use crate::{config::TimeoutKind, proposal::Envelope};

/// Stage name of [`ResolveTargets`].
pub const RESOLVE_TARGETS: &str = "resolve_targets";
/// Stage name of [`SendProposal`].
pub const SEND_PROPOSAL: &str = "send_proposal";
/// Stage name of [`ValidateResponses`].
pub const VALIDATE_RESPONSES: &str = "validate_responses";
/// Stage name of [`SubmitToOrderer`].
pub const SUBMIT_TO_ORDERER: &str = "submit_to_orderer";
/// Stage name of [`AwaitCommit`].
pub const AWAIT_COMMIT: &str = "await_commit";

/// Uses explicit targets verbatim, or discovery plus endorser selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveTargets;

#[async_trait]
impl Handler for ResolveTargets {
    fn name(&self) -> &str {
        RESOLVE_TARGETS
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError> {
        if ctx.options().cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        if let Some(targets) = ctx.options().targets.clone() {
            if targets.is_empty() {
                return Err(InvokeError::Configuration {
                    message: "explicit target list is empty".to_owned(),
                });
            }
            tracing::debug!(
                tx_id = %ctx.tx_id(),
                targets = targets.len(),
                "using explicit targets"
            );
            ctx.targets = targets;
            return next.run(ctx).await;
        }

        let channel = ctx.channel().clone();
        let snapshot = channel
            .discovery()
            .snapshot_within(ctx.timeout(TimeoutKind::Discovery), &ctx.options().cancel)
            .await?;
        let live = snapshot.orgs_with_role(ctx.endorser_role);
        let calls = ctx.request().calls();
        let targets = channel
            .selection()
            .select_endorsers(channel.channel_id(), &calls, &live, &ctx.options().selection)
            .await?;
        tracing::debug!(
            tx_id = %ctx.tx_id(),
            role = ?ctx.endorser_role,
            peers = ?targets.iter().map(|peer| peer.url.as_str()).collect::<Vec<_>>(),
            "resolved endorsement targets"
        );
        ctx.targets = targets;
        next.run(ctx).await
    }
}

/// Sends the signed proposal to every target concurrently.
///
/// Per-target failures are recorded in [`RequestContext::failures`]; the stage fails only when
/// no target answered or, for selected targets, the answering organizations no longer satisfy
/// the endorsement policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendProposal;

#[async_trait]
impl Handler for SendProposal {
    fn name(&self) -> &str {
        SEND_PROPOSAL
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError> {
        let channel = ctx.channel().clone();
        let transport = channel.endorser_transport()?;
        let timeout = ctx.timeout(TimeoutKind::Proposal);
        let cancel = ctx.options().cancel.clone();
        if ctx.targets.is_empty() {
            return Err(InvokeError::Configuration {
                message: "no endorsement targets resolved".to_owned(),
            });
        }

        let outcomes = {
            let proposal = ctx.proposal();
            let sends = ctx.targets.iter().map(|peer| async move {
                let sent =
                    tokio::time::timeout(timeout, transport.send_proposal(peer, proposal)).await;
                match sent {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(error)) => Err(TargetFailure {
                        peer_url: peer.url.clone(),
                        reason: error.to_string(),
                    }),
                    Err(_elapsed) => Err(TargetFailure {
                        peer_url: peer.url.clone(),
                        reason: format!("no response within {timeout:?}"),
                    }),
                }
            });
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(InvokeError::Cancelled),
                outcomes = join_all(sends) => outcomes,
            }
        };

        for outcome in outcomes {
            match outcome {
                Ok(response) => ctx.responses.push(response),
                Err(failure) => {
                    tracing::warn!(
                        tx_id = %ctx.tx_id(),
                        peer = %failure.peer_url,
                        reason = %failure.reason,
                        "endorser did not respond"
                    );
                    ctx.failures.push(failure);
                }
            }
        }
        if ctx.responses.is_empty() {
            return Err(InvokeError::TransientNetwork {
                message: format!(
                    "none of {} endorsement targets responded",
                    ctx.failures.len()
                ),
            });
        }
        if ctx.options().targets.is_none() && !ctx.failures.is_empty() {
            let calls = ctx.request().calls();
            let policy = channel
                .selection()
                .combined_policy(channel.channel_id(), &calls)
                .await?;
            let orgs = ctx
                .responses
                .iter()
                .map(|response| response.endorsement.endorser.msp_id.clone())
                .collect::<BTreeSet<_>>();
            if !policy.satisfied_by(&orgs) {
                return Err(InvokeError::TransientNetwork {
                    message: format!(
                        "responses from {orgs:?} no longer satisfy the endorsement policy"
                    ),
                });
            }
        }
        tracing::debug!(
            tx_id = %ctx.tx_id(),
            responses = ctx.responses.len(),
            failures = ctx.failures.len(),
            "collected endorsement responses"
        );
        next.run(ctx).await
    }
}

/// Checks binding, status, signatures, and payload agreement, then de-duplicates by peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateResponses;

impl ValidateResponses {
    fn check(ctx: &RequestContext) -> Result<(), InvokeError> {
        let suite = ctx.channel().signer().suite();
        let Some(first) = ctx.responses.first() else {
            return Err(InvokeError::EndorsementMismatch {
                message: "no successful endorsement responses".to_owned(),
            });
        };
        let expected_hash = ctx.proposal().proposal_hash;
        let expected_digest = first.payload_digest(suite);
        for response in &ctx.responses {
            if response.proposal_hash != expected_hash {
                return Err(InvokeError::EndorsementMismatch {
                    message: format!(
                        "peer `{}` endorsed a different proposal",
                        response.peer_url
                    ),
                });
            }
            if !response.response.is_success() {
                return Err(InvokeError::ChaincodeStatus {
                    peer_url: response.peer_url.clone(),
                    status: response.response.status,
                    message: response.response.message.clone(),
                });
            }
            if !response.verify_endorsement(suite) {
                return Err(InvokeError::InvalidEndorsement {
                    peer_url: response.peer_url.clone(),
                });
            }
            if response.payload_digest(suite) != expected_digest {
                tracing::warn!(
                    tx_id = %ctx.tx_id(),
                    peer = %response.peer_url,
                    reference = %first.peer_url,
                    "endorsement payload mismatch"
                );
                return Err(InvokeError::EndorsementMismatch {
                    message: format!(
                        "payload from `{}` differs from `{}`",
                        response.peer_url, first.peer_url
                    ),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for ValidateResponses {
    fn name(&self) -> &str {
        VALIDATE_RESPONSES
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError> {
        Self::check(ctx)?;
        let mut seen = HashSet::new();
        ctx.responses
            .retain(|response| seen.insert(response.peer_url.clone()));
        next.run(ctx).await
    }
}

/// Registers the commit wait, then broadcasts the envelope to one orderer.
///
/// Orderers are tried in random order; unreachable ones fall through to the next, an explicit
/// rejection fails the attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitToOrderer;

#[async_trait]
impl Handler for SubmitToOrderer {
    fn name(&self) -> &str {
        SUBMIT_TO_ORDERER
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError> {
        let channel = ctx.channel().clone();
        let transport = channel.orderer_transport()?;
        if channel.orderers().is_empty() {
            return Err(InvokeError::Configuration {
                message: "no orderers configured".to_owned(),
            });
        }
        let cancel = ctx.options().cancel.clone();
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let envelope = Envelope::assemble(ctx.proposal(), &ctx.responses, channel.signer())?;
        let pending = channel.commits().register(ctx.tx_id())?;

        let mut orderers = channel.orderers().to_vec();
        orderers.shuffle(&mut rand::thread_rng());
        let timeout = ctx.timeout(TimeoutKind::Orderer);
        let mut accepted = None;
        for orderer in &orderers {
            let broadcast = tokio::time::timeout(timeout, transport.broadcast(orderer, &envelope));
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(InvokeError::Cancelled),
                sent = broadcast => sent,
            };
            match sent {
                Ok(Ok(ack)) if ack.is_success() => {
                    accepted = Some(orderer.url.clone());
                    break;
                }
                Ok(Ok(ack)) => {
                    tracing::warn!(
                        tx_id = %ctx.tx_id(),
                        orderer = %orderer.url,
                        status = ack.status,
                        info = %ack.info,
                        "orderer rejected transaction"
                    );
                    return Err(InvokeError::OrdererRejected {
                        orderer_url: orderer.url.clone(),
                        status: ack.status,
                        info: ack.info,
                    });
                }
                Ok(Err(error)) => tracing::warn!(
                    tx_id = %ctx.tx_id(),
                    orderer = %orderer.url,
                    %error,
                    "orderer unreachable, trying next"
                ),
                Err(_elapsed) => tracing::warn!(
                    tx_id = %ctx.tx_id(),
                    orderer = %orderer.url,
                    ?timeout,
                    "orderer timed out, trying next"
                ),
            }
        }
        let Some(orderer_url) = accepted else {
            return Err(InvokeError::TransientNetwork {
                message: format!("all {} orderers failed", orderers.len()),
            });
        };

        tracing::debug!(tx_id = %ctx.tx_id(), orderer = %orderer_url, "envelope accepted");
        ctx.envelope = Some(envelope);
        ctx.pending_commit = Some(pending);
        next.run(ctx).await
    }
}

/// Waits for the ledger status registered by [`SubmitToOrderer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaitCommit;

#[async_trait]
impl Handler for AwaitCommit {
    fn name(&self) -> &str {
        AWAIT_COMMIT
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError> {
        let Some(pending) = ctx.pending_commit.take() else {
            return Err(InvokeError::Configuration {
                message: "no commit subscription; the orderer stage must run first".to_owned(),
            });
        };
        let timeout = ctx.timeout(TimeoutKind::Commit);
        let cancel = ctx.options().cancel.clone();
        let event = pending.wait(timeout, &cancel).await?;
        if !event.validation_code.is_valid() {
            tracing::warn!(
                tx_id = %event.tx_id,
                code = %event.validation_code,
                block = event.block_number,
                "transaction committed as invalid"
            );
            return Err(InvokeError::TxInvalidated {
                tx_id: event.tx_id,
                code: event.validation_code,
                block_number: event.block_number,
            });
        }
        tracing::info!(
            tx_id = %event.tx_id,
            block = event.block_number,
            source = %event.source_url,
            code = %event.validation_code,
            "transaction committed"
        );
        ctx.commit = Some(event);
        next.run(ctx).await
    }
}
