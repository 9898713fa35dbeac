pub mod differ;
pub mod screenshot;
pub mod types;
