pub mod candle;
pub mod order;
pub mod position;
pub mod signal;

pub use candle::*;
pub use order::*;
pub use position::*;
pub use signal::*;
