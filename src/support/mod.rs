pub mod clock;
pub mod validate;
