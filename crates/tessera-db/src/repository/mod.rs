//! Repository layer: query functions organized by table.
//!
//! Functions are generic over the executor so callers can pass the pool or a
//! transaction (`&mut *tx`) when several statements must apply together.

pub mod blacklist;
pub mod notary;
pub mod queue_edus;
pub mod queue_json;
pub mod queue_pdus;
