pub mod admin;
pub mod inference;
pub mod status;
