//! Map transitions that keep network peers connected

pub mod seamless;

pub use seamless::SeamlessTravelHandler;
