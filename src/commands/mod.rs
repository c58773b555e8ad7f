pub mod aggregate;
pub mod extract;
pub mod filter;
pub mod guide;
pub mod inventory;
pub mod label;
pub mod run;
pub mod status;
