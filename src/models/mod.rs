pub mod common;
pub mod course;
pub mod enrollment;
pub mod pagination;
pub mod payment;
pub mod subscription;
pub mod user;

pub use common::*;
pub use course::*;
pub use enrollment::*;
pub use pagination::*;
pub use payment::*;
pub use subscription::*;
pub use user::*;
