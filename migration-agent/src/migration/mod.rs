//! Source-side live migration orchestration: the driver that carries a
//! single VM through handshake, transfer, and finalization, plus its two
//! background workers (the downtime ramp and the progress monitor) and the
//! process-wide slot that bounds how many run concurrently.

pub mod collaborators;
pub mod downtime_ramp;
pub mod driver;
pub mod legacy;
pub mod mock;
pub mod progress_monitor;
pub mod slot;

pub use driver::MigrationDriver;
pub use slot::MigrationSlot;
