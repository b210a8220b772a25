pub mod hop;
pub mod snapshot;
pub mod table;

pub use hop::{AddressChange, HopRecord, HopStats};
pub use snapshot::{HopReport, Snapshot};
pub use table::HopTable;
