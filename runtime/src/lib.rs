#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;

pub use self::{admission::Admission, args::Args};
