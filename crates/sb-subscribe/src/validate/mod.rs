//! Raw-stage and record-stage validation.
//!
//! Mode dependent behaviour lives in one place, [`RepairPolicy`]; the checks
//! themselves only report what is wrong.

mod policy;
mod raw;
mod record;

pub use policy::{RepairPolicy, RepairRule};
pub use raw::validate_raw;
pub use record::{check_protocol, check_required, RecordValidator, ValidationReport};
