pub mod encrypt;
pub mod inspect;
pub mod sweep;
