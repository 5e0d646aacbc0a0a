pub mod analyze;
pub mod artifact;
pub mod describe;
pub mod model;

pub use analyze::*;
pub use artifact::*;
pub use describe::*;
pub use model::*;
