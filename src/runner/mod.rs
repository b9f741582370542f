mod agent;
mod languages;
mod models;

pub use agent::*;
pub use languages::*;
pub use models::*;
