//! Token lifecycle: generation, issuance and device-bound validation.

pub mod expiration;
pub mod generator;
pub mod issuance;
pub mod validator;
