//! Capability names checked by the engine.

use stockflow_auth::Permission;
use stockflow_inventory::TransferAction;

pub static LEDGER_APPEND: Permission = Permission::from_static("inventory.ledger.append");
/// Rebuilding a snapshot from its ledger.
pub static LEDGER_REPAIR: Permission = Permission::from_static("inventory.ledger.repair");

pub static TRANSFER_CREATE: Permission = Permission::from_static("inventory.transfer.create");
pub static TRANSFER_APPROVE: Permission = Permission::from_static("inventory.transfer.approve");
pub static TRANSFER_SEND: Permission = Permission::from_static("inventory.transfer.send");
pub static TRANSFER_RECEIVE: Permission = Permission::from_static("inventory.transfer.receive");
pub static TRANSFER_VERIFY: Permission = Permission::from_static("inventory.transfer.verify");
pub static TRANSFER_COMPLETE: Permission = Permission::from_static("inventory.transfer.complete");
pub static TRANSFER_CANCEL: Permission = Permission::from_static("inventory.transfer.cancel");

pub static CORRECTION_CREATE: Permission = Permission::from_static("inventory.correction.create");
pub static CORRECTION_APPROVE: Permission = Permission::from_static("inventory.correction.approve");

/// Capability an actor needs to perform `action` on a transfer.
pub fn for_transfer_action(action: &TransferAction) -> &'static Permission {
    match action {
        TransferAction::Submit => &TRANSFER_CREATE,
        TransferAction::Approve | TransferAction::Reject { .. } => &TRANSFER_APPROVE,
        TransferAction::Send => &TRANSFER_SEND,
        TransferAction::MarkArrived => &TRANSFER_RECEIVE,
        TransferAction::StartVerification | TransferAction::Verify { .. } => &TRANSFER_VERIFY,
        TransferAction::Complete => &TRANSFER_COMPLETE,
        TransferAction::Cancel { .. } => &TRANSFER_CANCEL,
    }
}
