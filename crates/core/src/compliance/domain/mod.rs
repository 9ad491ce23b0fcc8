pub mod compliance_engine;
pub mod records;
pub mod track_state;
pub mod vehicle_ledger;
