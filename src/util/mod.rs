pub mod dup;
pub mod events;
pub mod uid;
pub mod watchdog;
