//! Price, rent, and combined analysis over the cleaned tables.
//!
//! Each analyzer owns exactly one in-memory table, loaded lazily on first
//! access and cached for the instance's lifetime. All statistics are
//! recomputed per query; only exported report tables are ever persisted.

pub mod combined;
pub mod price;
pub mod rent;
pub mod utility;
