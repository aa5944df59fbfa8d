pub mod motion;
pub mod collision;
pub mod mass_transfer;
pub mod pellets;
