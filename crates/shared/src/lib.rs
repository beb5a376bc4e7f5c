pub mod config;
pub mod ids;
pub mod states;

pub use ids::*;
pub use states::*;
