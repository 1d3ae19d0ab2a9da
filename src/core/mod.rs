// Core request scheduling and execution seams

pub mod events;
pub mod executor;
pub mod queue;

pub use events::*;
pub use executor::*;
pub use queue::*;
