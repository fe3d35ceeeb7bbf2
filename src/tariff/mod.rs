pub mod builder;
pub mod modifiers;
pub mod wire;

pub use builder::{build, TransformError, TransformInput};
pub use modifiers::ModifierConfig;
