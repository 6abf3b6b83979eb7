//! Finality.
//!
//! The initiator submits the fully signed update to the notary with a
//! bounded wait. Only after the notary endorses it is anything persisted:
//! first locally, then by every other participant, each of which re-checks
//! the contract and every signature (the notary's included) before storing.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinSet;

use super::{Deadline, FlowContext, FlowError};
use crate::identity::PartyId;
use crate::network::{Message, TransportError};
use crate::notary::NotaryError;
use crate::transaction::SignedUpdate;

/// Notarise `signed`, store it, and deliver it to the other participants.
pub async fn finalize(ctx: &FlowContext, signed: SignedUpdate) -> Result<SignedUpdate, FlowError> {
    let update_id = signed.id();
    let notary_id = ctx.notary.identity();
    if signed.update.notary != notary_id {
        return Err(NotaryError::WrongNotary(signed.update.notary).into());
    }
    signed.verify_signatures_except(&[notary_id], ctx.resolver.as_ref())?;

    let consumed = signed.update.input_refs();
    let decision = tokio::time::timeout(
        ctx.config.notary_timeout(),
        ctx.notary.finalize(&consumed, &signed),
    )
    .await;
    let endorsement = match decision {
        Ok(result) => result?,
        Err(_) => {
            tracing::warn!(update = %update_id, "notary did not answer in time");
            return Err(FlowError::NotaryTimeout(Box::new(signed)));
        }
    };

    if endorsement.by != notary_id {
        return Err(FlowError::Notary(NotaryError::Unavailable(format!(
            "endorsement signed by {} instead of the notary",
            endorsement.by
        ))));
    }
    let notarised = signed.with_signature(endorsement);
    notarised.verify_required_signatures(ctx.resolver.as_ref())?;
    tracing::info!(update = %update_id, "update notarised");

    ctx.vault.persist(&notarised)?;

    let recipients: Vec<PartyId> = recipients(&notarised)
        .into_iter()
        .filter(|p| *p != ctx.me)
        .collect();
    distribute(ctx, &notarised, &recipients).await?;

    tracing::info!(update = %update_id, recipients = recipients.len(), "update finalised");
    Ok(notarised)
}

/// Everyone who must hold the finalised update.
fn recipients(signed: &SignedUpdate) -> BTreeSet<PartyId> {
    let mut parties = signed.update.participants();
    parties.extend(signed.update.command_signers());
    parties
}

async fn distribute(
    ctx: &FlowContext,
    notarised: &SignedUpdate,
    recipients: &[PartyId],
) -> Result<(), FlowError> {
    let update_id = notarised.id();
    let timeout = ctx.config.delivery_timeout();
    let shared = Arc::new(notarised.clone());

    let mut deliveries = JoinSet::new();
    for &party in recipients {
        let transport = Arc::clone(&ctx.transport);
        let shared = Arc::clone(&shared);
        deliveries.spawn(async move {
            let msg = Message::FinalizedUpdate(Box::new(shared.as_ref().clone()));
            let result = match transport.send(&party, msg, timeout).await {
                Ok(Message::Acknowledged(id)) if id == update_id => Ok(()),
                Ok(Message::Error(reason)) | Ok(Message::UpdateRejected { reason }) => {
                    Err(FlowError::CounterpartyRejection { party, reason })
                }
                Ok(other) => Err(FlowError::UnexpectedReply {
                    party,
                    got: other.kind(),
                }),
                Err(TransportError::Timeout(p)) => Err(FlowError::Timeout(Deadline::Delivery(p))),
                Err(e) => Err(FlowError::Transport(e)),
            };
            (party, result)
        });
    }

    // Every delivery is attempted; the update is already final either way.
    let mut delivered = BTreeSet::new();
    while let Some(joined) = deliveries.join_next().await {
        match joined {
            Ok((party, Ok(()))) => {
                delivered.insert(party);
            }
            Ok((party, Err(e))) => {
                tracing::warn!(update = %update_id, recipient = %party, error = %e, "delivery failed");
            }
            Err(e) => {
                tracing::error!(update = %update_id, error = %e, "delivery task failed");
            }
        }
    }
    let undelivered: Vec<PartyId> = recipients
        .iter()
        .filter(|p| !delivered.contains(*p))
        .copied()
        .collect();
    if !undelivered.is_empty() {
        return Err(FlowError::Distribution {
            update: update_id,
            undelivered,
        });
    }
    Ok(())
}

/// Receiver side: check a notarised update and store it.
pub fn handle_finalized(ctx: &FlowContext, from: PartyId, signed: &SignedUpdate) -> Message {
    let update_id = signed.id();
    match accept_finalized(ctx, signed) {
        Ok(stored) => {
            ctx.fulfil(&signed.update);
            tracing::info!(
                update = %update_id,
                from = %ctx.name_of(&from),
                new = stored,
                "stored finalised update"
            );
            Message::Acknowledged(update_id)
        }
        Err(reason) => {
            tracing::warn!(update = %update_id, from = %ctx.name_of(&from), %reason, "refused finalised update");
            Message::Error(reason)
        }
    }
}

fn accept_finalized(ctx: &FlowContext, signed: &SignedUpdate) -> Result<bool, String> {
    let update_id = signed.id();
    let update = &signed.update;

    match ctx.vault.get_update(&update_id) {
        Ok(Some(_)) => return Ok(false),
        Ok(None) => {}
        Err(e) => return Err(format!("vault lookup failed: {e}")),
    }

    if update.notary != ctx.notary.identity() {
        return Err(format!("update is notarised by unknown notary {}", update.notary));
    }
    update.verify().map_err(|e| e.to_string())?;
    signed
        .verify_required_signatures(ctx.resolver.as_ref())
        .map_err(|e| e.to_string())?;

    if update.command_signers().contains(&ctx.me) && !ctx.is_expected(&update_id) {
        return Err("finalised update was never signed by this party".into());
    }

    ctx.vault.persist(signed).map_err(|e| e.to_string())
}
