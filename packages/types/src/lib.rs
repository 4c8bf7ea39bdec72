mod call;
mod chain;
mod endpoint;
mod trigger;

pub use call::*;
pub use chain::*;
pub use endpoint::*;
pub use trigger::*;
