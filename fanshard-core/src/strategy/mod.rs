pub mod access;
pub mod exit;
