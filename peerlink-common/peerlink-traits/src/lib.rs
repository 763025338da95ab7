pub mod lifecycle;

pub use lifecycle::{HealthStatus, Lifecycle, Named};
