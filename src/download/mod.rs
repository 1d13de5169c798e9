//! Downloaders for the two external datasets: DVF sale records (per
//! department, gzip CSV) and the commune rent indicators ("Carte des
//! loyers", plain CSV in a legacy encoding).

pub mod dvf;
pub mod rent;
