pub mod elementwise;
pub mod reduction;
