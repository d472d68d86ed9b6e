pub mod envelope;
pub mod registry;
pub mod wire;
