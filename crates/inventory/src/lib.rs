//! Inventory domain module.
//!
//! Business rules for the stock ledger, document numbering, inter-location
//! transfers and count corrections, implemented purely as deterministic
//! domain logic (no IO, no storage, no locking).

pub mod correction;
pub mod dimension;
pub mod ledger;
pub mod sequence;
pub mod transfer;

pub use correction::{
    ApprovalOutcome, Correction, CorrectionEvent, CorrectionSource, CorrectionStatus,
    NewCorrection,
};
pub use dimension::Dimension;
pub use ledger::{
    DeltaSign, EntryTypeRule, HistoryRange, LedgerDraft, LedgerEntry, LedgerEntryType,
    LedgerEvent, Reference, ReferenceType, Replay, Snapshot, StockPolicy, replay,
};
pub use sequence::{DocumentKind, DocumentNumber, GapReport, SequenceScope, find_gaps};
pub use transfer::{
    NewTransfer, NewTransferItem, Transfer, TransferAction, TransferCommand, TransferEvent,
    TransferItem, TransferStatus, TransitionRecord, VerifiedCount,
};
