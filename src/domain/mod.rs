pub mod live;
pub mod price;
pub mod tariff;

pub use live::*;
pub use price::*;
pub use tariff::*;
