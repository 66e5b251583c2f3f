pub mod delivery;
pub mod errors;
pub mod message;
pub mod persistence;
pub mod transaction;
pub mod wait;
