//! mote - dynamic code management for wireless sensor nodes
//!
//! Lets independently built binary modules be stored in flash, linked to
//! one another through typed indirect call tables, relocated in place at
//! load time, and transported onto a node over a lossy radio link.
//!
//! Design principles:
//! - Single-threaded and cooperative: slow work is split-phase, results
//!   arrive as queued messages
//! - Bounded RAM: one cached flash page, fixed tables, no staging buffers
//! - Handles, not pointers: every allocation reference is salted so stale
//!   ones are caught
//!
//! Platform support:
//! - Native hosts and tests, through the simulated devices in `platform::sim`
//! - Browser (wasm32-unknown-unknown): logging goes to the console

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod kernel;
pub mod platform;

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
