pub mod jwt;
pub mod money;
pub mod password;

pub use jwt::*;
pub use money::*;
pub use password::*;
