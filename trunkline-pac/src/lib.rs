#![no_std]

//! Register map of the quad/octal-span T1/E1 PCI card.
//!
//! `register` holds the typed bitfield layouts, `device` the access traits
//! and the address arithmetic that ties a layout to a location in the
//! card's register window.

pub mod device;
pub mod register;
