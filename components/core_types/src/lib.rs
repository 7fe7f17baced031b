//! Core heap word types shared by the collector components.
//!
//! This crate provides the value-level vocabulary of the managed heap:
//!
//! - [`Address`] - An aligned address inside the heap
//! - [`Tagged`] - A tagged heap word (Smi, strong/weak reference, oddball)
//! - [`Oddball`] - Immortal sentinel values
//!
//! # Examples
//!
//! ```
//! use core_types::{Address, Oddball, Tagged};
//!
//! let word = Tagged::strong(Address::new(0x4_0100));
//! assert!(word.is_strong());
//! assert_eq!(Tagged::UNDEFINED.as_oddball(), Some(Oddball::Undefined));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod address;
mod tagged;

pub use address::{Address, OBJECT_ALIGNMENT, TAGGED_SIZE};
pub use tagged::{Oddball, Tagged};
