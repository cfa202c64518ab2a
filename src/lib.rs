//! `ledmap` is the Rust crate implementing the core features of the LED wall
//! mapping daemon: it discovers the screen-space position of every LED in a
//! strip or wall by lighting them one at a time over a serial link and
//! locating the resulting bright spot in camera frames.

#[macro_use]
extern crate tracing;

pub mod camera;
pub mod detect;
pub mod global;
pub mod mapper;
pub mod models;
pub mod serial;
pub mod session;
pub mod web;
