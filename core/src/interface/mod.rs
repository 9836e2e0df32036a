pub mod bin;
pub mod message;

pub use bin::{BinKey, BinScope, CellId, Field, FieldSummary, MessageRef, SealReason, SealedBin};
pub use message::{Bds, CprParity, DroppedField, Icao, Message, MsgHash, RawMessage};
