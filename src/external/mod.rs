pub mod paypal;
pub mod stripe;

pub use paypal::*;
pub use stripe::*;
