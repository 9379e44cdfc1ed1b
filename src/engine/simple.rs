//! Simple value transfer: coin selection and invitation on the sending
//! side, confirmation on the receiving side, kernel signing, registration
//! and proof-driven settlement. Each `update_impl` call performs one round
//! and reports how it is blocked.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::db::schema::WalletParam;
use crate::engine::{fault_from_keykeeper, TxError, TxFault, TxLogic, TxStateMachine, UpdateOutcome};
use crate::gateway::Gateway;
use crate::keykeeper::KeyUsage;
use crate::params::{TxParameterId, TxParamsMessage};
use crate::types::{
    Amount, Coin, CoinId, CoinKind, CoinStatus, Height, KernelId, TxFailureReason, TxStatus,
    TxType, MAX_HEIGHT,
};

pub struct SimpleTransfer;

impl TxLogic for SimpleTransfer {
    fn tx_type(&self) -> TxType {
        TxType::Simple
    }

    fn update_impl(
        &self,
        tx: &TxStateMachine,
        gateway: &dyn Gateway,
    ) -> Result<UpdateOutcome, TxError> {
        ensure_heights(tx, gateway)?;

        // A proof may land at any point, including into a round that was
        // blocked on something else entirely.
        if let Some(proof_height) =
            tx.get_parameter::<Height>(TxParameterId::KernelProofHeight)?
        {
            if proof_height > 0 {
                return settle(tx, gateway, proof_height);
            }
        }

        if tx.get_mandatory::<bool>(TxParameterId::IsSender)? {
            update_sender(tx, gateway)
        } else {
            update_receiver(tx, gateway)
        }
    }
}

fn ensure_heights(tx: &TxStateMachine, gateway: &dyn Gateway) -> Result<(), TxError> {
    if tx.get_parameter::<Height>(TxParameterId::MinHeight)?.is_none() {
        if let Some(tip) = gateway.get_tip() {
            tx.set_parameter(TxParameterId::MinHeight, &tip.height)?;
        }
    }
    let min_height = match tx.get_parameter::<Height>(TxParameterId::MinHeight)? {
        Some(height) => height,
        None => return Ok(()),
    };
    if tx.get_parameter::<Height>(TxParameterId::MaxHeight)?.is_none() {
        if let Some(lifetime) = tx.get_parameter::<Height>(TxParameterId::Lifetime)? {
            tx.set_parameter(TxParameterId::MaxHeight, &(min_height + lifetime))?;
        }
    }
    if tx
        .get_parameter::<Height>(TxParameterId::PeerResponseHeight)?
        .is_none()
    {
        if let Some(response_time) =
            tx.get_parameter::<Height>(TxParameterId::PeerResponseTime)?
        {
            tx.set_parameter(
                TxParameterId::PeerResponseHeight,
                &(min_height + response_time),
            )?;
        }
    }
    Ok(())
}

fn update_sender(tx: &TxStateMachine, gateway: &dyn Gateway) -> Result<UpdateOutcome, TxError> {
    let status = tx.status()?.unwrap_or(TxStatus::Pending);

    if status == TxStatus::Pending {
        reserve_inputs(tx, gateway)?;
        tx.set_status(TxStatus::InProgress)?;
        return Ok(UpdateOutcome::Progressed);
    }

    if !tx
        .get_parameter::<bool>(TxParameterId::InvitationSent)?
        .unwrap_or(false)
    {
        let mut msg = TxParamsMessage::new();
        msg.add(TxParameterId::IsSender, &false)
            .add(
                TxParameterId::Amount,
                &tx.get_mandatory::<Amount>(TxParameterId::Amount)?,
            )
            .add(
                TxParameterId::Fee,
                &tx.get_mandatory::<Amount>(TxParameterId::Fee)?,
            );
        if let Some(min_height) = tx.get_parameter::<Height>(TxParameterId::MinHeight)? {
            msg.add(TxParameterId::MinHeight, &min_height);
        }
        if let Some(max_height) = tx.get_parameter::<Height>(TxParameterId::MaxHeight)? {
            msg.add(TxParameterId::MaxHeight, &max_height);
        }
        if let Some(response_time) = tx.get_parameter::<Height>(TxParameterId::PeerResponseTime)? {
            msg.add(TxParameterId::PeerResponseTime, &response_time);
        }
        if !tx.send_tx_params(gateway, msg)? {
            return Err(TxFault::new(TxFailureReason::MissingMandatoryParameter, false).into());
        }
        tx.set_parameter(TxParameterId::InvitationSent, &true)?;
        return Ok(UpdateOutcome::BlockedOnPeer);
    }

    let peer_signature = match tx.get_parameter::<Vec<u8>>(TxParameterId::PeerSignature)? {
        Some(signature) => signature,
        None => return Ok(UpdateOutcome::BlockedOnPeer),
    };
    if peer_signature.is_empty() {
        return Err(TxFault::new(TxFailureReason::PeerSignatureInvalid, true).into());
    }

    if tx.get_parameter::<KernelId>(TxParameterId::KernelId)?.is_none() {
        let slot = tx.slot(true)?;
        let keeper = tx.keykeeper_strict()?;
        let body = kernel_body(tx)?;
        let signature = keeper
            .sign(u64::from(slot.0), KeyUsage::Kernel, &body)
            .map_err(fault_from_keykeeper)?;
        let kernel_id = derive_kernel_id(&body, &signature);

        tx.set_parameter_public(TxParameterId::KernelId, &kernel_id)?;
        tx.set_parameter(TxParameterId::TransactionRegistered, &true)?;

        let mut msg = TxParamsMessage::new();
        msg.add(TxParameterId::KernelId, &kernel_id);
        tx.send_tx_params(gateway, msg)?;

        tx.confirm_kernel(gateway, kernel_id)?;
        return Ok(UpdateOutcome::BlockedOnProof);
    }

    // Registered; a proof request is in flight. Re-check on the next tip.
    gateway.update_on_next_tip(tx.id());
    Ok(UpdateOutcome::BlockedOnProof)
}

fn update_receiver(tx: &TxStateMachine, gateway: &dyn Gateway) -> Result<UpdateOutcome, TxError> {
    let status = tx.status()?.unwrap_or(TxStatus::Pending);

    if status == TxStatus::Pending {
        create_incoming_coin(tx)?;
        tx.set_status(TxStatus::InProgress)?;
        return Ok(UpdateOutcome::Progressed);
    }

    if !tx
        .get_parameter::<bool>(TxParameterId::InvitationSent)?
        .unwrap_or(false)
    {
        let slot = tx.slot(true)?;
        let keeper = tx.keykeeper_strict()?;
        let body = kernel_body(tx)?;
        let signature = keeper
            .sign(u64::from(slot.0), KeyUsage::Kernel, &body)
            .map_err(fault_from_keykeeper)?;

        let mut msg = TxParamsMessage::new();
        msg.add(TxParameterId::PeerSignature, &signature.to_vec());
        if !tx.send_tx_params(gateway, msg)? {
            return Err(TxFault::new(TxFailureReason::MissingMandatoryParameter, false).into());
        }
        tx.set_parameter(TxParameterId::InvitationSent, &true)?;
        return Ok(UpdateOutcome::BlockedOnPeer);
    }

    // The sender registers the kernel; once its id is known, chase the
    // proof independently so completion does not hinge on peer liveness.
    match tx.get_parameter::<KernelId>(TxParameterId::KernelId)? {
        Some(kernel_id) if status != TxStatus::Registering => {
            tx.confirm_kernel(gateway, kernel_id)?;
            Ok(UpdateOutcome::BlockedOnProof)
        }
        Some(_) => {
            gateway.update_on_next_tip(tx.id());
            Ok(UpdateOutcome::BlockedOnProof)
        }
        None => Ok(UpdateOutcome::BlockedOnPeer),
    }
}

fn reserve_inputs(tx: &TxStateMachine, gateway: &dyn Gateway) -> Result<(), TxError> {
    let amount = tx.get_mandatory::<Amount>(TxParameterId::Amount)?;
    let fee = tx.get_mandatory::<Amount>(TxParameterId::Fee)?;
    if tx
        .get_parameter::<Vec<CoinId>>(TxParameterId::InputCoins)?
        .is_some()
    {
        return Ok(());
    }

    let tip_height = gateway.get_tip().map(|tip| tip.height).unwrap_or(MAX_HEIGHT);
    let mut candidates: Vec<Coin> = tx
        .store()
        .coins()?
        .into_iter()
        .filter(|coin| coin.is_available(tip_height))
        .collect();
    // Largest-first keeps input counts small.
    candidates.sort_by(|a, b| b.id.value.cmp(&a.id.value));

    let target = amount + fee;
    let mut selected = Vec::new();
    let mut total: Amount = 0;
    for coin in candidates {
        if total >= target {
            break;
        }
        total += coin.id.value;
        selected.push(coin);
    }
    if selected.is_empty() {
        return Err(TxFault::new(TxFailureReason::NoInputs, false).into());
    }
    if total < target {
        return Err(TxFault::new(TxFailureReason::NotEnoughFunds, false).into());
    }

    for coin in &mut selected {
        coin.status = CoinStatus::Outgoing;
        coin.spent_tx_id = Some(tx.id());
    }
    let input_ids: Vec<CoinId> = selected.iter().map(|coin| coin.id).collect();
    tx.store().save_coins(&selected)?;
    tx.set_parameter(TxParameterId::InputCoins, &input_ids)?;

    let change = total - target;
    tx.set_parameter_public(TxParameterId::Change, &change)?;
    if change > 0 {
        let change_id = CoinId::new(
            tx.store().next_counter(WalletParam::NextCoinIdx)?,
            CoinKind::Change,
            0,
            change,
        );
        let mut change_coin = Coin::new(change_id);
        change_coin.status = CoinStatus::Incoming;
        change_coin.create_tx_id = Some(tx.id());
        tx.store().save_coins(&[change_coin])?;
        tx.set_parameter(TxParameterId::OutputCoins, &vec![change_id])?;
    }
    debug!(tx = %tx.id(), inputs = input_ids.len(), change, "inputs reserved");
    Ok(())
}

fn create_incoming_coin(tx: &TxStateMachine) -> Result<(), TxError> {
    let amount = tx.get_mandatory::<Amount>(TxParameterId::Amount)?;
    let coin_id = CoinId::new(
        tx.store().next_counter(WalletParam::NextCoinIdx)?,
        CoinKind::Regular,
        0,
        amount,
    );
    let mut coin = Coin::new(coin_id);
    coin.status = CoinStatus::Incoming;
    coin.create_tx_id = Some(tx.id());
    tx.store().save_coins(&[coin])?;
    tx.set_parameter(TxParameterId::OutputCoins, &vec![coin_id])?;
    Ok(())
}

/// Deterministic kernel pre-image shared by both sides.
fn kernel_body(tx: &TxStateMachine) -> Result<[u8; 32], TxError> {
    let amount = tx.get_mandatory::<Amount>(TxParameterId::Amount)?;
    let fee = tx.get_mandatory::<Amount>(TxParameterId::Fee)?;
    let min_height = tx
        .get_parameter::<Height>(TxParameterId::MinHeight)?
        .unwrap_or_default();
    let max_height = tx
        .get_parameter::<Height>(TxParameterId::MaxHeight)?
        .unwrap_or(MAX_HEIGHT);

    let mut hasher = Sha256::new();
    hasher.update(b"mirage.kernel.v1");
    hasher.update(tx.id().as_bytes());
    hasher.update(amount.to_le_bytes());
    hasher.update(fee.to_le_bytes());
    hasher.update(min_height.to_le_bytes());
    hasher.update(max_height.to_le_bytes());
    Ok(hasher.finalize().into())
}

fn derive_kernel_id(body: &[u8; 32], signature: &[u8; 64]) -> KernelId {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(signature);
    KernelId::from_bytes(hasher.finalize().into())
}

fn settle(
    tx: &TxStateMachine,
    gateway: &dyn Gateway,
    proof_height: Height,
) -> Result<UpdateOutcome, TxError> {
    tx.set_completed_tx_coin_statuses(proof_height)?;

    let mut coins = tx.store().coins_by_tx(&tx.id())?;
    for coin in &mut coins {
        if coin.create_tx_id == Some(tx.id()) && coin.status == CoinStatus::Incoming {
            coin.status = CoinStatus::Available;
        }
        if coin.spent_tx_id == Some(tx.id()) && coin.status == CoinStatus::Outgoing {
            coin.status = CoinStatus::Spent;
        }
    }
    tx.store().save_coins(&coins)?;

    tx.complete_tx(gateway)?;
    Ok(UpdateOutcome::Finished)
}
