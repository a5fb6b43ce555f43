pub mod health;
pub mod revocation;
